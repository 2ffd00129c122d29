use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;

use crate::core::windows::WindowParams;
use crate::index::{BackendKind, IndexError};

/// Scenedup hashes the temporal rhythm of brightness peaks in each video
/// and reports files sharing one or more similar scenes.
#[derive(Parser, Debug)]
#[command(name = "scenedup", version, about)]
pub struct Args {
    /// Import all videos beneath this directory (recursive)
    #[arg(long, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Import files matching a glob pattern
    #[arg(long, value_name = "GLOB")]
    pub file: Option<String>,

    /// Re-import paths the store already knows, preserving whitelists
    #[arg(long)]
    pub refresh: bool,

    /// Remux files with missing or implausible duration before hashing
    #[arg(long)]
    pub repair: bool,

    /// Run the duplicate search
    #[arg(long)]
    pub search: bool,

    /// Open the external review program on the result set
    #[arg(long)]
    pub ui: bool,

    /// Write search results here; without --search, read and report them
    #[arg(long, value_name = "FILE")]
    pub searchres: Option<PathBuf>,

    /// Report files that are gone from disk
    #[arg(long)]
    pub purge: bool,

    /// With --purge: actually delete their rows (cascading)
    #[arg(long)]
    pub delete: bool,

    /// Move a file on disk and update the store
    #[arg(long, num_args = 2, value_names = ["OLD", "NEW"])]
    pub rename: Option<Vec<String>>,

    /// Reconcile files that moved beneath --dir
    #[arg(long)]
    pub fixrenames: bool,

    /// Whitelist all pairs among these files
    #[arg(long, num_args = 2.., value_name = "FILE")]
    pub whitelist: Vec<String>,

    /// Rebuild missing extremum hashes from stored brightness
    #[arg(long)]
    pub migrate: bool,

    /// Window dimension for the scene index
    #[arg(long, default_value_t = 10)]
    pub indexlength: usize,

    /// Per-window scene budget in seconds
    #[arg(long, default_value_t = 300.0)]
    pub scenelength: f64,

    /// L2 distance cutoff for neighbor matches
    #[arg(long, default_value_t = 3.0)]
    pub radius: f32,

    /// Query stride over the window table
    #[arg(long, default_value_t = 1)]
    pub step: usize,

    /// Seconds to ignore at the start of every file
    #[arg(long = "ignore_start", default_value_t = 0.0)]
    pub ignore_start: f64,

    /// Seconds to ignore at the end of every file
    #[arg(long = "ignore_end", default_value_t = 0.0)]
    pub ignore_end: f64,

    /// Mean-normalize windows to match speed-changed copies
    #[arg(long)]
    pub fixspeed: bool,

    /// Nearest-neighbor backend: forest, kdtree, or hnsw
    #[arg(long, default_value = "hnsw", value_name = "NAME")]
    pub knnlib: String,

    /// Comma-separated video extensions to consider
    #[arg(long, default_value = "mp4,mkv,avi,ts,asf,wmv", value_name = "EXTS")]
    pub vidext: String,

    /// SQLite database file (default: ~/.scenedup.db)
    #[arg(long, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Process nice level, applied once at startup
    #[arg(long, default_value_t = 5)]
    pub nice: i32,
}

impl Args {
    pub fn extensions(&self) -> HashSet<String> {
        self.vidext
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn backend(&self) -> Result<BackendKind, IndexError> {
        self.knnlib.parse()
    }

    pub fn window_params(&self) -> WindowParams {
        WindowParams {
            index_length: self.indexlength,
            scene_length: self.scenelength,
            ignore_start: self.ignore_start,
            ignore_end: self.ignore_end,
            fix_speed: self.fixspeed,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".scenedup.db")
        })
    }
}
