use super::{l2_distance, KnnIndex};

const NO_CHILD: i32 = -1;

struct Node {
    item: u32,
    axis: usize,
    left: i32,
    right: i32,
}

/// Exact k-d tree with a true radius query; the reference the approximate
/// backends are judged against.
pub struct KdTreeIndex {
    items: Vec<Vec<f32>>,
    nodes: Vec<Node>,
    root: i32,
    dim: usize,
}

impl KdTreeIndex {
    pub fn build(items: Vec<Vec<f32>>, dim: usize) -> Self {
        let mut nodes = Vec::with_capacity(items.len());
        let mut indices: Vec<u32> = (0..items.len() as u32).collect();
        let root = grow(&items, dim, &mut indices, 0, &mut nodes);
        Self {
            items,
            nodes,
            root,
            dim,
        }
    }

    fn search(&self, at: i32, query: &[f32], radius: f32, hits: &mut Vec<usize>) {
        if at == NO_CHILD {
            return;
        }
        let node = &self.nodes[at as usize];
        let point = &self.items[node.item as usize];

        if l2_distance(query, point) < radius {
            hits.push(node.item as usize);
        }

        let delta = query[node.axis] - point[node.axis];
        let (near, far) = if delta < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        self.search(near, query, radius, hits);
        if delta.abs() <= radius {
            self.search(far, query, radius, hits);
        }
    }
}

impl KnnIndex for KdTreeIndex {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn query(&self, n: usize, radius: f32) -> Vec<usize> {
        let mut hits = Vec::new();
        self.search(self.root, &self.items[n], radius, &mut hits);
        hits.sort_unstable();
        hits
    }

    fn row(&self, n: usize) -> Vec<f32> {
        self.items[n].clone()
    }
}

/// Median split on the depth-cycled axis; ties broken by item index so the
/// tree shape is deterministic.
fn grow(
    items: &[Vec<f32>],
    dim: usize,
    indices: &mut [u32],
    depth: usize,
    nodes: &mut Vec<Node>,
) -> i32 {
    if indices.is_empty() {
        return NO_CHILD;
    }
    let axis = depth % dim;
    indices.sort_by(|&a, &b| {
        items[a as usize][axis]
            .total_cmp(&items[b as usize][axis])
            .then(a.cmp(&b))
    });
    let mid = indices.len() / 2;
    let item = indices[mid];

    let (lo, rest) = indices.split_at_mut(mid);
    let hi = &mut rest[1..];
    let left = grow(items, dim, lo, depth + 1, nodes);
    let right = grow(items, dim, hi, depth + 1, nodes);

    nodes.push(Node {
        item,
        axis,
        left,
        right,
    });
    nodes.len() as i32 - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_items(count: usize) -> Vec<Vec<f32>> {
        (0..count).map(|i| vec![i as f32, 0.0]).collect()
    }

    fn brute_force(items: &[Vec<f32>], n: usize, radius: f32) -> Vec<usize> {
        (0..items.len())
            .filter(|&m| l2_distance(&items[n], &items[m]) < radius)
            .collect()
    }

    #[test]
    fn test_matches_brute_force() {
        let items: Vec<Vec<f32>> = (0..64)
            .map(|i| {
                vec![
                    (i % 8) as f32,
                    (i / 8) as f32,
                    ((i * 7) % 5) as f32,
                ]
            })
            .collect();
        let idx = KdTreeIndex::build(items.clone(), 3);
        for n in 0..items.len() {
            assert_eq!(idx.query(n, 1.5), brute_force(&items, n, 1.5), "row {n}");
        }
    }

    #[test]
    fn test_radius_is_exclusive() {
        let idx = KdTreeIndex::build(line_items(5), 2);
        // Neighbors at exactly distance 1.0 are outside an r=1.0 ball.
        assert_eq!(idx.query(2, 1.0), vec![2]);
        assert_eq!(idx.query(2, 1.01), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_index() {
        let idx = KdTreeIndex::build(Vec::new(), 2);
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn test_single_item() {
        let idx = KdTreeIndex::build(vec![vec![3.0, 4.0]], 2);
        assert_eq!(idx.query(0, 0.1), vec![0]);
    }
}
