use instant_distance::{Builder, HnswMap, Search};

use super::{l2_distance, KnnIndex, KNN_CANDIDATES};

const EF_CONSTRUCTION: usize = 100;
const EF_SEARCH: usize = 100;
const SEED: u64 = 42;

/// One window vector as an HNSW point under Euclidean distance.
#[derive(Clone)]
struct GapWindow(Vec<f32>);

impl instant_distance::Point for GapWindow {
    fn distance(&self, other: &Self) -> f32 {
        l2_distance(&self.0, &other.0)
    }
}

/// Graph-based approximate backend; highest recall at library scale.
/// Queries ask for 20 nearest and keep those inside the radius.
pub struct HnswIndex {
    map: Option<HnswMap<GapWindow, usize>>,
    items: Vec<Vec<f32>>,
}

impl HnswIndex {
    pub fn build(items: Vec<Vec<f32>>, dim: usize) -> Self {
        debug_assert!(items.iter().all(|w| w.len() == dim));
        let map = if items.is_empty() {
            None
        } else {
            let points: Vec<GapWindow> = items.iter().cloned().map(GapWindow).collect();
            let values: Vec<usize> = (0..items.len()).collect();
            Some(
                Builder::default()
                    .ef_construction(EF_CONSTRUCTION)
                    .ef_search(EF_SEARCH)
                    .seed(SEED)
                    .build(points, values),
            )
        };
        Self { map, items }
    }
}

impl KnnIndex for HnswIndex {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn query(&self, n: usize, radius: f32) -> Vec<usize> {
        let map = match &self.map {
            Some(map) => map,
            None => return Vec::new(),
        };
        let point = GapWindow(self.items[n].clone());
        let mut search = Search::default();
        let mut hits: Vec<usize> = map
            .search(&point, &mut search)
            .take(KNN_CANDIDATES)
            .filter(|item| item.distance < radius)
            .map(|item| *item.value)
            .collect();
        hits.sort_unstable();
        hits
    }

    fn row(&self, n: usize) -> Vec<f32> {
        self.items[n].clone()
    }
}
