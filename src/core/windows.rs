use crate::database::models::{FileInfo, HashEntry};
use crate::database::{Store, StoreResult};

/// Files with fewer stored gaps than this carry too little signal to index.
const MIN_GAPS: usize = 5;

#[derive(Debug, Clone)]
pub struct WindowParams {
    /// Window dimension L.
    pub index_length: usize,
    /// Per-window time budget in seconds; gaps past it are zeroed.
    pub scene_length: f64,
    /// Seconds trimmed from the start of each file's considered region.
    pub ignore_start: f64,
    /// Seconds trimmed from the end.
    pub ignore_end: f64,
    /// Mean-normalize each window to compensate for playback-speed edits.
    pub fix_speed: bool,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            index_length: 10,
            scene_length: 300.0,
            ignore_start: 0.0,
            ignore_end: 0.0,
            fix_speed: false,
        }
    }
}

/// The in-memory window tables the search runs over. Row `n` of `items`
/// belongs to `file_ref[n]` and starts at frame `frame_ref[n]`.
#[derive(Debug, Default)]
pub struct WindowSet {
    pub items: Vec<Vec<f32>>,
    pub file_ref: Vec<FileInfo>,
    pub frame_ref: Vec<u32>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Slice every file's stored gap sequence into overlapping L-wide windows.
pub fn build_windows(store: &Store, params: &WindowParams) -> StoreResult<WindowSet> {
    let mut set = WindowSet::default();
    for info in store.get_file_infos()? {
        let min_frame = (params.ignore_start * info.fps) as i64;
        let max_frame = ((info.duration - params.ignore_end) * info.fps) as i64;
        let rows = store.get_hashes(info.fid, min_frame, max_frame)?;
        append_file_windows(&mut set, &info, &rows, params);
    }
    Ok(set)
}

fn append_file_windows(
    set: &mut WindowSet,
    info: &FileInfo,
    rows: &[HashEntry],
    params: &WindowParams,
) {
    if rows.len() < MIN_GAPS {
        return;
    }
    let item_count = rows.len().saturating_sub(params.index_length);
    for k in 0..item_count {
        let slice = &rows[k..k + params.index_length];
        let mut window = clamp_to_scene(slice, params.scene_length);
        if params.fix_speed && !speed_normalize(&mut window) {
            continue;
        }
        set.items.push(window);
        set.file_ref.push(info.clone());
        set.frame_ref.push(rows[k].frame);
    }
}

/// Copy the gap values, zeroing every position from the first one where the
/// running total of the *original* gaps has already exceeded the budget.
fn clamp_to_scene(slice: &[HashEntry], scene_length: f64) -> Vec<f32> {
    let mut window = Vec::with_capacity(slice.len());
    let mut total = 0.0f64;
    for entry in slice {
        if total > scene_length {
            window.push(0.0);
        } else {
            window.push(entry.gap);
        }
        total += entry.gap as f64;
    }
    window
}

/// Scale the window to a mean of 128. Returns false for an all-zero window,
/// which has no usable shape and is skipped by the caller.
fn speed_normalize(window: &mut [f32]) -> bool {
    let mean = window.iter().sum::<f32>() / window.len() as f32;
    if mean == 0.0 {
        return false;
    }
    for v in window.iter_mut() {
        *v = 128.0 * *v / mean;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(gaps: &[f32]) -> Vec<HashEntry> {
        // 25 fps, one extremum per gap second.
        let mut frame = 0u32;
        gaps.iter()
            .map(|&gap| {
                frame += (gap * 25.0) as u32;
                HashEntry { frame, gap }
            })
            .collect()
    }

    fn info() -> FileInfo {
        FileInfo {
            fid: 1,
            name: "/v/a.mkv".to_string(),
            fps: 25.0,
            duration: 600.0,
        }
    }

    fn params(index_length: usize, scene_length: f64, fix_speed: bool) -> WindowParams {
        WindowParams {
            index_length,
            scene_length,
            fix_speed,
            ..WindowParams::default()
        }
    }

    #[test]
    fn test_window_count_and_width() {
        let rows = rows(&[1.0; 16]);
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &rows, &params(10, 300.0, false));
        assert_eq!(set.len(), 6);
        assert!(set.items.iter().all(|w| w.len() == 10));
        assert_eq!(set.frame_ref[0], rows[0].frame);
        assert_eq!(set.frame_ref[5], rows[5].frame);
    }

    #[test]
    fn test_short_files_are_skipped() {
        let rows = rows(&[1.0; 4]);
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &rows, &params(2, 300.0, false));
        assert!(set.is_empty());
    }

    #[test]
    fn test_scene_clamp_zeroes_tail() {
        // Budget of 3 s over 1-s gaps: the running total exceeds 3 after
        // four gaps, so positions 4.. are zeroed.
        let rows = rows(&[1.0; 12]);
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &rows, &params(10, 3.0, false));
        let w = &set.items[0];
        assert_eq!(&w[..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&w[4..], &[0.0; 6]);
    }

    #[test]
    fn test_scene_clamp_accumulates_original_gaps() {
        // A huge first gap blows the budget on its own. If the clamp
        // accumulated the mutated values instead, later positions would
        // sneak back under the budget and survive.
        let entries = rows(&[500.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &entries, &params(5, 300.0, false));
        let w = &set.items[0];
        assert_eq!(w[0], 500.0);
        assert_eq!(&w[1..], &[0.0; 4]);
    }

    #[test]
    fn test_prefix_before_budget_is_untouched() {
        let entries = rows(&[100.0, 150.0, 100.0, 1.0, 1.0, 1.0, 1.0]);
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &entries, &params(5, 300.0, false));
        // Totals before each slot: 0, 100, 250, 350, 351 — the clamp kicks
        // in at slot 3.
        assert_eq!(set.items[0], vec![100.0, 150.0, 100.0, 0.0, 0.0]);
    }

    #[test]
    fn test_speed_normalization_sets_mean_128() {
        let entries = rows(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &entries, &params(5, 300.0, true));
        for w in &set.items {
            let mean = w.iter().sum::<f32>() / w.len() as f32;
            assert!((mean - 128.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_ignore_boundaries_trim_considered_region() {
        // 120 s file at 1 fps with an extremum every 5 s; trimming 30 s
        // from both ends leaves only frames in [30, 90).
        let mut store = Store::open_in_memory().unwrap();
        let fi = store.insert_file("/v/a.mkv", 1.0, 120.0).unwrap();
        let entries: Vec<HashEntry> = (1..=23)
            .map(|i| HashEntry {
                frame: i * 5,
                gap: 5.0,
            })
            .collect();
        store.insert_hashes(fi.fid, &entries).unwrap();

        let params = WindowParams {
            ignore_start: 30.0,
            ignore_end: 30.0,
            ..WindowParams::default()
        };
        let set = build_windows(&store, &params).unwrap();

        // Frames 30,35,..,85 survive the trim: 12 rows, two 10-wide windows.
        assert_eq!(set.len(), 2);
        assert_eq!(set.frame_ref, vec![30, 35]);
    }

    #[test]
    fn test_speed_normalization_skips_zero_mean_windows() {
        // All-zero gaps survive the clamp as all-zero windows; with
        // normalization on they must be dropped, not divided by zero.
        let entries: Vec<HashEntry> = (1..=8)
            .map(|i| HashEntry {
                frame: i * 10,
                gap: 0.0,
            })
            .collect();
        let mut set = WindowSet::default();
        append_file_windows(&mut set, &info(), &entries, &params(5, 300.0, true));
        assert!(set.is_empty());
    }
}
