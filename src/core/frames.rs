use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use serde::Deserialize;
use thiserror::Error;

/// Containers longer than this are suspected of carrying broken duration
/// metadata and become candidates for a remux repair.
pub const SUSPECT_DURATION_SECS: f64 = 3.0 * 3600.0;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("cannot open video source {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("ffmpeg/ffprobe binary not found: {0}")]
    ToolMissing(std::io::Error),

    #[error("remux of {path} failed: {reason}")]
    RepairFailed { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container metadata for one video file.
#[derive(Debug, Clone)]
pub struct VideoMeta {
    pub fps: f64,
    /// Seconds; `None` when neither the format nor the video stream knows.
    pub duration: Option<f64>,
    /// Declared frame count, estimated from duration when absent.
    pub nframes: u64,
    pub width: u32,
    pub height: u32,
}

impl VideoMeta {
    /// True when the declared duration is missing or implausibly long.
    pub fn needs_repair(&self) -> bool {
        match self.duration {
            None => true,
            Some(d) => d > SUSPECT_DURATION_SECS,
        }
    }
}

// ffprobe `-print_format json -show_format -show_streams` output.

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    /// Fraction such as "30/1" or "24000/1001".
    r_frame_rate: Option<String>,
    duration: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Run ffprobe on `path` and extract the metadata the import pipeline needs.
pub fn probe(path: &Path) -> Result<VideoMeta, FrameError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(FrameError::ToolMissing)?;

    if !output.status.success() {
        return Err(FrameError::Unreadable {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| FrameError::Unreadable {
            path: path.to_path_buf(),
            reason: format!("unparseable ffprobe output: {e}"),
        })?;

    meta_from_probe(path, &parsed)
}

fn meta_from_probe(path: &Path, parsed: &ProbeOutput) -> Result<VideoMeta, FrameError> {
    let stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| FrameError::Unreadable {
            path: path.to_path_buf(),
            reason: "no video stream".to_string(),
        })?;

    let fps = stream
        .r_frame_rate
        .as_deref()
        .map(parse_fraction)
        .unwrap_or(0.0);
    if fps <= 0.0 {
        return Err(FrameError::Unreadable {
            path: path.to_path_buf(),
            reason: "no usable frame rate".to_string(),
        });
    }

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(FrameError::Unreadable {
                path: path.to_path_buf(),
                reason: "no usable frame geometry".to_string(),
            })
        }
    };

    // Format-level duration first, video stream second.
    let duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0);

    let nframes = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| duration.map(|d| (d * fps).round() as u64))
        .unwrap_or(0);

    Ok(VideoMeta {
        fps,
        duration,
        nframes,
        width,
        height,
    })
}

/// Parse an ffprobe rate fraction ("30/1", "24000/1001", or a plain number).
fn parse_fraction(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        let num = num.parse::<f64>().unwrap_or(0.0);
        let den = den.parse::<f64>().unwrap_or(0.0);
        if den > 0.0 {
            return num / den;
        }
        return 0.0;
    }
    s.parse::<f64>().unwrap_or(0.0)
}

/// Lazy stream of decoded grayscale frames, one `width*height` byte buffer
/// per frame, read from a piped ffmpeg child.
pub struct FrameStream {
    child: Child,
    stdout: ChildStdout,
    frame_len: usize,
}

impl FrameStream {
    pub fn open(path: &Path, meta: &VideoMeta) -> Result<Self, FrameError> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "gray", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(FrameError::ToolMissing)?;

        let stdout = child.stdout.take().ok_or_else(|| FrameError::Unreadable {
            path: path.to_path_buf(),
            reason: "ffmpeg produced no output pipe".to_string(),
        })?;

        Ok(Self {
            child,
            stdout,
            frame_len: meta.width as usize * meta.height as usize,
        })
    }
}

impl Iterator for FrameStream {
    type Item = Result<Vec<u8>, FrameError>;

    /// A short read mid-frame means the container was truncated; the stream
    /// ends there and the caller keeps whatever it has collected so far.
    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0u8; self.frame_len];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => return None,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(FrameError::Io(e))),
            }
        }
        Some(Ok(buf))
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A remuxed copy of a video whose container metadata looked broken.
/// The copy lives next to the original and is removed on drop; the original
/// file is never touched.
pub struct RepairedVideo {
    path: PathBuf,
}

impl RepairedVideo {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepairedVideo {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Remux `path` into a fresh matroska container to rebuild its metadata.
pub fn repair(path: &Path) -> Result<RepairedVideo, FrameError> {
    let mut out = path.as_os_str().to_owned();
    out.push(".repair.mkv");
    let out = PathBuf::from(out);

    let output = Command::new("ffmpeg")
        .args(["-y", "-v", "error", "-i"])
        .arg(path)
        .args(["-c", "copy"])
        .arg(&out)
        .output()
        .map_err(FrameError::ToolMissing)?;

    if !output.status.success() {
        let _ = std::fs::remove_file(&out);
        return Err(FrameError::RepairFailed {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(RepairedVideo { path: out })
}
