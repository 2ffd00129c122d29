use rayon::prelude::*;

/// Frames below this size are summed inline; parallel chunking only pays
/// off for full-resolution video frames.
const PAR_THRESHOLD: usize = 64 * 1024;

/// Mean intensity of one grayscale frame. No smoothing, no gamma.
pub fn frame_brightness(frame: &[u8]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: u64 = if frame.len() >= PAR_THRESHOLD {
        frame
            .par_chunks(16 * 1024)
            .map(|chunk| chunk.iter().map(|&v| v as u64).sum::<u64>())
            .sum()
    } else {
        frame.iter().map(|&v| v as u64).sum()
    };
    sum as f32 / frame.len() as f32
}

/// Reduce a frame stream to its per-frame brightness series, in stream
/// order. A truncated stream yields a short series; decode errors after the
/// first frame are swallowed the same way.
pub fn collect_series<I>(frames: I) -> Vec<f32>
where
    I: IntoIterator<Item = Result<Vec<u8>, crate::core::frames::FrameError>>,
{
    let mut series = Vec::new();
    for frame in frames {
        match frame {
            Ok(frame) => series.push(frame_brightness(&frame)),
            Err(e) => {
                tracing::warn!("frame decode stopped early: {e}");
                break;
            }
        }
    }
    series
}
