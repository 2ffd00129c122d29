use serde::{Deserialize, Serialize};

/// One imported video file as the store knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub fid: i64,
    /// Absolute path at import time.
    pub name: String,
    pub fps: f64,
    /// Seconds.
    pub duration: f64,
}

/// One extremum row: the frame it sits on and the seconds elapsed since the
/// previous extremum (since frame zero for the first row).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashEntry {
    pub frame: u32,
    pub gap: f32,
}
