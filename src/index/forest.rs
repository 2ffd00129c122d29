use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{l2_distance, KnnIndex, KNN_CANDIDATES};

const N_TREES: usize = 20;
const LEAF_SIZE: usize = 16;
const MAX_DEPTH: usize = 32;
const BASE_SEED: u64 = 42;

enum Node {
    Split {
        normal: Vec<f32>,
        offset: f32,
        left: usize,
        right: usize,
    },
    Leaf(Vec<u32>),
}

struct Tree {
    nodes: Vec<Node>,
    root: usize,
}

/// Ensemble of random-hyperplane trees. Each query descends every tree to a
/// leaf, pools the candidates, keeps the 20 nearest, and filters them by
/// exact distance.
pub struct ForestIndex {
    items: Vec<Vec<f32>>,
    trees: Vec<Tree>,
}

impl ForestIndex {
    pub fn build(items: Vec<Vec<f32>>, dim: usize) -> Self {
        debug_assert!(items.iter().all(|w| w.len() == dim));
        let mut trees = Vec::with_capacity(N_TREES);
        if !items.is_empty() {
            for t in 0..N_TREES {
                let mut rng = StdRng::seed_from_u64(BASE_SEED + t as u64);
                let mut nodes = Vec::new();
                let indices: Vec<u32> = (0..items.len() as u32).collect();
                let root = grow(&items, indices, 0, &mut nodes, &mut rng);
                trees.push(Tree { nodes, root });
            }
        }
        Self { items, trees }
    }

    fn descend<'a>(&'a self, tree: &'a Tree, query: &[f32]) -> &'a [u32] {
        let mut at = tree.root;
        loop {
            match &tree.nodes[at] {
                Node::Leaf(members) => return members,
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    at = if dot(normal, query) < *offset {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

impl KnnIndex for ForestIndex {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn query(&self, n: usize, radius: f32) -> Vec<usize> {
        let query = &self.items[n];
        let mut candidates: Vec<u32> = self
            .trees
            .iter()
            .flat_map(|tree| self.descend(tree, query).iter().copied())
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let mut scored: Vec<(f32, usize)> = candidates
            .into_iter()
            .map(|c| (l2_distance(query, &self.items[c as usize]), c as usize))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(KNN_CANDIDATES);

        let mut hits: Vec<usize> = scored
            .into_iter()
            .filter(|(d, _)| *d < radius)
            .map(|(_, c)| c)
            .collect();
        hits.sort_unstable();
        hits
    }

    fn row(&self, n: usize) -> Vec<f32> {
        self.items[n].clone()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Recursively split `indices` by hyperplanes equidistant from two randomly
/// chosen members. A set that resists splitting (identical points) becomes
/// an oversized leaf rather than recursing forever.
fn grow(
    items: &[Vec<f32>],
    indices: Vec<u32>,
    depth: usize,
    nodes: &mut Vec<Node>,
    rng: &mut StdRng,
) -> usize {
    if indices.len() <= LEAF_SIZE || depth >= MAX_DEPTH {
        nodes.push(Node::Leaf(indices));
        return nodes.len() - 1;
    }

    for _attempt in 0..3 {
        let a = &items[indices[rng.gen_range(0..indices.len())] as usize];
        let b = &items[indices[rng.gen_range(0..indices.len())] as usize];

        let normal: Vec<f32> = a.iter().zip(b).map(|(x, y)| x - y).collect();
        if dot(&normal, &normal) == 0.0 {
            continue;
        }
        let midpoint: Vec<f32> = a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect();
        let offset = dot(&normal, &midpoint);
        let (lo, hi): (Vec<u32>, Vec<u32>) = indices
            .iter()
            .copied()
            .partition(|&i| dot(&normal, &items[i as usize]) < offset);
        if lo.is_empty() || hi.is_empty() {
            continue;
        }

        let left = grow(items, lo, depth + 1, nodes, rng);
        let right = grow(items, hi, depth + 1, nodes, rng);
        nodes.push(Node::Split {
            normal,
            offset,
            left,
            right,
        });
        return nodes.len() - 1;
    }

    nodes.push(Node::Leaf(indices));
    nodes.len() - 1
}
