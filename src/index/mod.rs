mod forest;
mod hnsw;
mod kdtree;

use std::str::FromStr;

use thiserror::Error;

pub use forest::ForestIndex;
pub use hnsw::HnswIndex;
pub use kdtree::KdTreeIndex;

/// Neighbor count requested from the approximate backends before the exact
/// radius filter is applied.
pub const KNN_CANDIDATES: usize = 20;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unknown knn backend '{0}', expected one of: forest, kdtree, hnsw")]
    UnknownBackend(String),
}

/// A vector index over the window table. Backends may be approximate; every
/// implementation applies an exact L2 filter before returning, so recall is
/// the only thing that varies.
pub trait KnnIndex {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of stored rows within `radius` (L2) of row `n`, ascending.
    /// Row `n` itself is always included.
    fn query(&self, n: usize, radius: f32) -> Vec<usize>;

    /// Stored vector read-back, for diagnostics.
    fn row(&self, n: usize) -> Vec<f32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Forest,
    KdTree,
    Hnsw,
}

impl FromStr for BackendKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forest" => Ok(Self::Forest),
            "kdtree" => Ok(Self::KdTree),
            "hnsw" => Ok(Self::Hnsw),
            other => Err(IndexError::UnknownBackend(other.to_string())),
        }
    }
}

/// The selected backend as a closed set of variants.
pub enum Backend {
    Forest(ForestIndex),
    KdTree(KdTreeIndex),
    Hnsw(HnswIndex),
}

impl Backend {
    pub fn build(kind: BackendKind, items: Vec<Vec<f32>>, dim: usize) -> Self {
        match kind {
            BackendKind::Forest => Self::Forest(ForestIndex::build(items, dim)),
            BackendKind::KdTree => Self::KdTree(KdTreeIndex::build(items, dim)),
            BackendKind::Hnsw => Self::Hnsw(HnswIndex::build(items, dim)),
        }
    }
}

impl KnnIndex for Backend {
    fn len(&self) -> usize {
        match self {
            Self::Forest(idx) => idx.len(),
            Self::KdTree(idx) => idx.len(),
            Self::Hnsw(idx) => idx.len(),
        }
    }

    fn query(&self, n: usize, radius: f32) -> Vec<usize> {
        match self {
            Self::Forest(idx) => idx.query(n, radius),
            Self::KdTree(idx) => idx.query(n, radius),
            Self::Hnsw(idx) => idx.query(n, radius),
        }
    }

    fn row(&self, n: usize) -> Vec<f32> {
        match self {
            Self::Forest(idx) => idx.row(n),
            Self::KdTree(idx) => idx.row(n),
            Self::Hnsw(idx) => idx.row(n),
        }
    }
}

pub(crate) fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
