use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::extrema;
use crate::core::frames::{self, FrameError, FrameStream, VideoMeta};
use crate::core::brightness;
use crate::database::models::{FileInfo, HashEntry};
use crate::database::{Store, StoreError};

/// Advisory lock TTL: an import abandoned by a crash frees itself after
/// this long.
pub const LOCK_TTL: Duration = Duration::from_secs(3600);

/// Files modified more recently than this are assumed to still be
/// downloading and are left for the next run.
pub const MIN_FILE_AGE: Duration = Duration::from_secs(36);

/// Cancellation token flipped by SIGHUP; checked between files so the
/// in-flight import always completes.
#[derive(Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

static SIGNAL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sighup(_sig: libc::c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wire SIGHUP to this token. Only the first token wins the hookup;
    /// the process has one signal disposition.
    pub fn install_sighup(&self) {
        if SIGNAL_FLAG.set(self.flag.clone()).is_ok() {
            let handler = on_sighup as extern "C" fn(libc::c_int);
            unsafe {
                libc::signal(libc::SIGHUP, handler as libc::sighandler_t);
            }
        }
    }
}

/// Lower the scheduling priority of this process, once, at startup.
pub fn set_process_nice(level: i32) {
    let got = unsafe { libc::nice(level) };
    debug!("process nice level now {got}");
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Re-import paths the store already knows.
    pub refresh: bool,
    /// Remux-and-retry files whose duration metadata looks broken.
    pub repair: bool,
}

#[derive(Debug)]
pub enum ImportOutcome {
    Imported(FileInfo),
    Skipped,
}

/// Videos beneath `dir`, recursive, filtered by extension and resting age,
/// in sorted order.
pub fn collect_dir(dir: &Path, extensions: &HashSet<String>, min_age: Duration) -> Vec<PathBuf> {
    let now = SystemTime::now();
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), extensions))
        .filter(|e| {
            let age = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|mtime| now.duration_since(mtime).ok());
            match age {
                Some(age) if age < min_age => {
                    info!("{} looks in-flight, skipping", e.path().display());
                    false
                }
                _ => true,
            }
        })
        .filter_map(|e| std::fs::canonicalize(e.path()).ok())
        .collect();
    files.sort();
    files
}

/// Videos matching a glob pattern, sorted. No resting-age guard: the user
/// named these explicitly.
pub fn collect_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("bad glob pattern {pattern}"))?
        .filter_map(|e| e.ok())
        .filter(|p| p.is_file())
        .filter_map(|p| std::fs::canonicalize(&p).ok())
        .collect();
    files.sort();
    if files.is_empty() {
        warn!("{pattern} matched nothing");
    }
    Ok(files)
}

fn has_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .map(|e| extensions.contains(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}

/// Import a batch of files, isolating per-file failures. Returns the number
/// of files actually imported.
pub fn import_files(
    store: &mut Store,
    paths: &[PathBuf],
    opts: &ImportOptions,
    token: &StopToken,
) -> Result<usize> {
    let mut imported = 0;
    for (n, path) in paths.iter().enumerate() {
        if token.is_stopped() {
            warn!("stop requested, {} file(s) left unimported", paths.len() - n);
            break;
        }
        match import_one(store, path, opts) {
            Ok(ImportOutcome::Imported(info)) => {
                info!("imported {} ({} s)", info.name, info.duration.round());
                imported += 1;
            }
            Ok(ImportOutcome::Skipped) => {}
            // The file keeps its lock until the TTL frees it.
            Err(e) => warn!("abandoning {}: {e:#}", path.display()),
        }
    }
    Ok(imported)
}

/// The whole pipeline for one file: lock, decode, reduce, detect, persist.
pub fn import_one(store: &mut Store, path: &Path, opts: &ImportOptions) -> Result<ImportOutcome> {
    let name = path.to_string_lossy().into_owned();

    if File::open(path).is_err() {
        anyhow::bail!("{name} is not readable");
    }
    if store.is_name_in_db(&name)? && !opts.refresh {
        debug!("{name} already imported");
        return Ok(ImportOutcome::Skipped);
    }
    match store.try_lock(&name, LOCK_TTL) {
        Ok(()) => {}
        Err(StoreError::AlreadyLocked(_)) => {
            warn!("{name} is locked by another import, skipping");
            return Ok(ImportOutcome::Skipped);
        }
        Err(e) => return Err(e.into()),
    }

    nudge_disk(path);

    let (meta, series, entries) = hash_video(path, opts.repair)?;
    let duration = meta
        .duration
        .filter(|d| *d > 0.0)
        .unwrap_or(series.len() as f64 / meta.fps);

    let info = store.import_file(&name, meta.fps, duration, &series, &entries)?;
    store.unlock(&name)?;
    Ok(ImportOutcome::Imported(info))
}

/// Read the first KiB to get a sleeping disk spinning before ffmpeg needs it.
fn nudge_disk(path: &Path) {
    if let Ok(mut file) = File::open(path) {
        let mut buf = [0u8; 1024];
        let _ = file.read(&mut buf);
    }
}

fn hash_video(path: &Path, repair: bool) -> Result<(VideoMeta, Vec<f32>, Vec<HashEntry>), FrameError> {
    let meta = frames::probe(path)?;
    if repair && meta.needs_repair() {
        info!("duration metadata of {} looks broken, remuxing", path.display());
        match frames::repair(path) {
            // Retry exactly once, against the remuxed copy, repair off.
            Ok(fixed) => return hash_decoded(fixed.path(), frames::probe(fixed.path())?),
            Err(e) => warn!("remux failed, continuing with the original: {e}"),
        }
    }
    hash_decoded(path, meta)
}

fn hash_decoded(
    path: &Path,
    meta: VideoMeta,
) -> Result<(VideoMeta, Vec<f32>, Vec<HashEntry>), FrameError> {
    let stream = FrameStream::open(path, &meta)?;

    let pb = ProgressBar::new(meta.nframes);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} {pos}/{len}") {
        pb.set_style(style);
    }
    pb.set_message(
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let series = brightness::collect_series(pb.wrap_iter(stream));
    pb.finish_and_clear();

    if series.len() as u64 != meta.nframes {
        debug!(
            "{}: decoded {} of {} declared frames",
            path.display(),
            series.len(),
            meta.nframes
        );
    }

    let mut work = series.clone();
    let entries = extrema::hash_series(&mut work, meta.fps);
    Ok((meta, series, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exts() -> HashSet<String> {
        ["mkv".to_string(), "mp4".to_string()].into_iter().collect()
    }

    #[test]
    fn test_collect_dir_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let files = collect_dir(dir.path(), &exts(), Duration::ZERO);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.mkv"]);
    }

    #[test]
    fn test_collect_dir_skips_fresh_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hot.mkv"), b"x").unwrap();
        // A just-written file is younger than any sane resting age.
        assert!(collect_dir(dir.path(), &exts(), MIN_FILE_AGE).is_empty());
    }

    #[test]
    fn test_collect_dir_recurses() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.mkv"), b"x").unwrap();
        assert_eq!(collect_dir(dir.path(), &exts(), Duration::ZERO).len(), 1);
    }

    #[test]
    fn test_stop_token() {
        let token = StopToken::new();
        assert!(!token.is_stopped());
        token.stop();
        assert!(token.is_stopped());
        assert!(token.clone().is_stopped());
    }

    #[test]
    fn test_import_skips_known_names_without_refresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, b"not really a video").unwrap();
        let name = path.to_string_lossy().into_owned();

        let mut store = Store::open_in_memory().unwrap();
        store.insert_file(&name, 25.0, 30.0).unwrap();

        let opts = ImportOptions {
            refresh: false,
            repair: false,
        };
        assert!(matches!(
            import_one(&mut store, &path, &opts).unwrap(),
            ImportOutcome::Skipped
        ));
    }

    #[test]
    fn test_import_skips_locked_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, b"not really a video").unwrap();
        let name = path.to_string_lossy().into_owned();

        let mut store = Store::open_in_memory().unwrap();
        store.try_lock(&name, LOCK_TTL).unwrap();

        let opts = ImportOptions {
            refresh: false,
            repair: false,
        };
        assert!(matches!(
            import_one(&mut store, &path, &opts).unwrap(),
            ImportOutcome::Skipped
        ));
    }

    #[test]
    fn test_import_rejects_unreadable_paths() {
        let mut store = Store::open_in_memory().unwrap();
        let opts = ImportOptions {
            refresh: false,
            repair: false,
        };
        assert!(import_one(&mut store, Path::new("/nope/missing.mkv"), &opts).is_err());
    }

    #[test]
    fn test_stopped_token_imports_nothing() {
        let mut store = Store::open_in_memory().unwrap();
        let token = StopToken::new();
        token.stop();
        let opts = ImportOptions {
            refresh: false,
            repair: false,
        };
        let n = import_files(
            &mut store,
            &[PathBuf::from("/nope/a.mkv")],
            &opts,
            &token,
        )
        .unwrap();
        assert_eq!(n, 0);
    }
}
