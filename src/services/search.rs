use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::windows::{build_windows, WindowParams, WindowSet};
use crate::database::models::FileInfo;
use crate::database::{Store, StoreResult};
use crate::index::{Backend, BackendKind, KnnIndex};

/// External review program handed the serialized result file.
const REVIEW_PROGRAM: &str = "scenedup-review";

/// One file's appearance in a duplicate group: the file plus the offset in
/// seconds at which the shared scene starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub file: FileInfo,
    pub offset: f64,
}

pub type DuplicateGroup = Vec<SearchHit>;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub windows: WindowParams,
    pub backend: BackendKind,
    pub radius: f32,
    /// Query stride over the window table.
    pub step: usize,
}

/// Build the window tables and the index, then sweep for duplicate groups.
pub fn run(store: &Store, opts: &SearchOptions) -> anyhow::Result<Vec<DuplicateGroup>> {
    info!("loading hashes");
    let mut windows = build_windows(store, &opts.windows)?;
    if windows.is_empty() {
        info!("nothing to search: no indexable files");
        return Ok(Vec::new());
    }

    info!("building index over {} windows", windows.len());
    let items = std::mem::take(&mut windows.items);
    let index = Backend::build(opts.backend, items, opts.windows.index_length);

    info!("searching duplicates");
    let groups = find_duplicates(store, &windows, &index, opts.radius, opts.step)?;
    info!("found {} duplicate group(s)", groups.len());
    Ok(groups)
}

/// Sweep the window table with the configured stride, clustering each
/// neighborhood into a group of files, dropping pairs already reported or
/// whitelisted. Deterministic for fixed store contents and configuration.
pub fn find_duplicates<I: KnnIndex>(
    store: &Store,
    windows: &WindowSet,
    index: &I,
    radius: f32,
    step: usize,
) -> StoreResult<Vec<DuplicateGroup>> {
    let step = step.max(1);
    let mut known_pairs: HashSet<(i64, i64)> = HashSet::new();
    let mut groups = Vec::new();

    let pb = ProgressBar::new(index.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} Searching {pos}/{len}") {
        pb.set_style(style);
    }

    let mut i = 0;
    while i < index.len() {
        match group_for_window(store, windows, index, i, radius, &mut known_pairs) {
            Ok(Some(group)) => groups.push(group),
            Ok(None) => {}
            // One bad neighborhood must not sink the whole sweep.
            Err(e) => warn!("skipping window {i}: {e}"),
        }
        pb.inc(step.min(index.len() - i) as u64);
        i += step;
    }
    pb.finish_and_clear();

    Ok(groups)
}

fn group_for_window<I: KnnIndex>(
    store: &Store,
    windows: &WindowSet,
    index: &I,
    i: usize,
    radius: f32,
    known_pairs: &mut HashSet<(i64, i64)>,
) -> StoreResult<Option<DuplicateGroup>> {
    let neighbors = index.query(i, radius);
    if neighbors.len() <= 1 {
        return Ok(None);
    }

    let fids: Vec<i64> = neighbors
        .iter()
        .map(|&m| windows.file_ref[m].fid)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut fresh_pairs = Vec::new();
    for (n, &a) in fids.iter().enumerate() {
        for &b in &fids[n + 1..] {
            if known_pairs.contains(&(a, b)) || store.is_whitelisted(a, b)? {
                continue;
            }
            fresh_pairs.push((a, b));
        }
    }
    if fresh_pairs.is_empty() {
        return Ok(None);
    }
    known_pairs.extend(fresh_pairs.iter().copied());

    let live: HashSet<i64> = fresh_pairs.iter().flat_map(|&(a, b)| [a, b]).collect();

    // Window order means each file is reported at its earliest occurrence.
    let mut seen: HashSet<i64> = HashSet::new();
    let mut details: DuplicateGroup = Vec::new();
    for &m in &neighbors {
        let file = &windows.file_ref[m];
        if !live.contains(&file.fid) || !seen.insert(file.fid) {
            continue;
        }
        debug!(
            "match {} {} at window {m}: {:?}",
            file.fid,
            file.name,
            index.row(m)
        );
        details.push(SearchHit {
            file: file.clone(),
            offset: windows.frame_ref[m] as f64 / file.fps,
        });
    }

    if details.len() > 1 {
        Ok(Some(details))
    } else {
        Ok(None)
    }
}

// ----------------------------------------------------------------------
// Result persistence and reporting
// ----------------------------------------------------------------------

pub fn save_results(path: &Path, groups: &[DuplicateGroup]) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot write search results to {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), groups)?;
    Ok(())
}

pub fn load_results(path: &Path) -> anyhow::Result<Vec<DuplicateGroup>> {
    let file = File::open(path)
        .with_context(|| format!("cannot read search results from {}", path.display()))?;
    let groups = serde_json::from_reader(BufReader::new(file))?;
    Ok(groups)
}

/// Re-apply the liveness rules to a stored result set: members whose file
/// went away are dropped, and groups whose surviving pairs are all
/// whitelisted by now are suppressed.
pub fn filter_stale(store: &Store, groups: Vec<DuplicateGroup>) -> StoreResult<Vec<DuplicateGroup>> {
    let mut kept = Vec::new();
    for group in groups {
        let group: DuplicateGroup = group
            .into_iter()
            .filter(|hit| File::open(&hit.file.name).is_ok())
            .collect();
        if group.len() < 2 {
            continue;
        }
        let mut all_whitelisted = true;
        'pairs: for (n, a) in group.iter().enumerate() {
            for b in &group[n + 1..] {
                if !store.is_whitelisted(a.file.fid, b.file.fid)? {
                    all_whitelisted = false;
                    break 'pairs;
                }
            }
        }
        if !all_whitelisted {
            kept.push(group);
        }
    }
    Ok(kept)
}

/// Seconds to `HH:MM:SS`, the form ffplay's `-ss` accepts.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Print each group as ready-to-paste ffplay invocations.
pub fn print_report(groups: &[DuplicateGroup]) {
    for (n, group) in groups.iter().enumerate() {
        if n > 0 {
            println!();
        }
        for hit in group {
            println!(
                "ffplay -ss {} '{}'",
                format_duration(hit.offset),
                hit.file.name
            );
        }
    }
}

/// Hand the result file to the external review program.
pub fn launch_review_ui(resfile: &Path) {
    let spawned = Command::new(REVIEW_PROGRAM)
        .arg(resfile)
        .stdin(Stdio::null())
        .spawn();
    match spawned {
        Ok(mut child) => {
            if let Err(e) = child.wait() {
                warn!("review UI exited abnormally: {e}");
            }
        }
        Err(e) => warn!("cannot launch {REVIEW_PROGRAM}: {e}"),
    }
}
