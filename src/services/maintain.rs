use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::core::extrema;
use crate::database::models::FileInfo;
use crate::database::Store;

fn is_readable(path: &str) -> bool {
    fs::File::open(path).is_ok()
}

/// Drop store rows whose file is gone from disk. With `delete` unset this
/// only reports what would go.
pub fn purge(store: &mut Store, delete: bool) -> Result<usize> {
    store.tidy()?;

    let infos = store.get_file_infos()?;
    let doomed: Vec<&FileInfo> = infos.iter().filter(|fi| !is_readable(&fi.name)).collect();
    warn!("need to delete {} of {} files", doomed.len(), infos.len());

    for fi in &doomed {
        if delete {
            info!("deleting {}", fi.name);
            store.del_file(fi.fid)?;
        } else {
            info!("{}", fi.name);
        }
    }
    Ok(doomed.len())
}

/// Move a file on disk and keep the store in step. An `old` path the store
/// has never seen is a warned no-op: nothing moves.
pub fn rename(store: &mut Store, old: &str, new: &str) -> Result<()> {
    if !is_readable(old) {
        bail!("{old} is not readable");
    }
    if Path::new(new).exists() {
        bail!("{new} already exists");
    }
    let fid = match store.get_id(old)? {
        Some(fid) => fid,
        None => {
            warn!("{old} is unknown to the store, nothing renamed");
            return Ok(());
        }
    };
    fs::rename(old, new).with_context(|| format!("cannot move {old} to {new}"))?;
    store.update_name(fid, new)?;
    info!("renamed {old} to {new}");
    Ok(())
}

/// Reconcile files that moved beneath `dir` without the store noticing.
/// Matching is by basename; basenames stored more than once are ambiguous
/// and left alone. Returns the number of rows updated.
pub fn fix_moved(store: &mut Store, dir: &Path, extensions: &HashSet<String>) -> Result<usize> {
    // None marks a basename seen in more than one stored row.
    let mut by_base: HashMap<String, Option<FileInfo>> = HashMap::new();
    for fi in store.get_file_infos()? {
        if let Some(base) = Path::new(&fi.name).file_name() {
            by_base
                .entry(base.to_string_lossy().into_owned())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(fi));
        }
    }

    let mut updated = 0;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !has_extension(entry.path(), extensions) {
            continue;
        }
        let base = entry.file_name().to_string_lossy().into_owned();
        let slot = match by_base.get_mut(&base) {
            Some(slot) => slot,
            None => continue,
        };
        let fi = match slot {
            Some(fi) => fi,
            None => {
                info!("skipping ambiguous basename {base}");
                continue;
            }
        };
        let on_disk = fs::canonicalize(entry.path())
            .with_context(|| format!("cannot resolve {}", entry.path().display()))?;
        let on_disk = on_disk.to_string_lossy().into_owned();
        if on_disk != fi.name {
            info!("fixing {} -> {}", fi.name, on_disk);
            store.update_name(fi.fid, &on_disk)?;
            updated += 1;
        }
        // Either way this row is settled; a second on-disk match would be
        // ambiguous too.
        *slot = None;
    }
    Ok(updated)
}

fn has_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .map(|e| extensions.contains(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}

/// Whitelist every pair among the given paths. Unknown paths are reported
/// and skipped; fewer than two resolvable paths leaves the store untouched.
pub fn whitelist_paths(store: &mut Store, paths: &[String]) -> Result<()> {
    let mut resolved: Vec<(String, i64)> = Vec::new();
    for path in paths {
        match store.get_id(path)? {
            Some(fid) => resolved.push((path.clone(), fid)),
            None => warn!("{path} not found in store"),
        }
    }
    if resolved.len() < 2 {
        warn!("need at least two known files to whitelist");
        return Ok(());
    }
    for (n, (name_a, fid_a)) in resolved.iter().enumerate() {
        for (name_b, fid_b) in &resolved[n + 1..] {
            store.whitelist(*fid_a, *fid_b)?;
            info!("whitelisted {name_a} and {name_b}");
        }
    }
    Ok(())
}

/// Recompute extremum hashes from stored brightness for every file that
/// lost (or never had) them. Returns the number of files rehashed.
pub fn migrate(store: &mut Store) -> Result<usize> {
    let mut rehashed = 0;
    for fi in store.get_file_infos()? {
        if store.has_hashes(fi.fid)? {
            continue;
        }
        let mut series = store.get_brightness(fi.fid)?;
        if series.is_empty() {
            continue;
        }
        let entries = extrema::hash_series(&mut series, fi.fps);
        store.insert_hashes(fi.fid, &entries)?;
        info!("rehashed {} ({} extrema)", fi.name, entries.len());
        rehashed += 1;
    }
    Ok(rehashed)
}
