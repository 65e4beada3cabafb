//! Snapshot writer: a vertical composite of the frames retained early in
//! the session, written under the snapshot directory with a UTC-stamped
//! name. Best-effort — a failed snapshot never changes the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;

use gaze_core::Frame;

/// How many early frames a session retains for the snapshot.
pub const SNAPSHOT_FRAMES: usize = 3;

pub fn write_snapshot(
    dir: &Path,
    outcome_tag: &str,
    frames: &[Arc<Frame>],
) -> std::io::Result<Option<PathBuf>> {
    if frames.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)?;

    let composite = compose(frames);
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("{stamp}_{outcome_tag}.png"));
    composite
        .save(&path)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(Some(path))
}

/// Stack frames top to bottom on a canvas wide enough for the widest.
fn compose(frames: &[Arc<Frame>]) -> RgbImage {
    let width = frames.iter().map(|f| f.width()).max().unwrap_or(1);
    let height: u32 = frames.iter().map(|f| f.height()).sum();
    let mut canvas = RgbImage::new(width.max(1), height.max(1));
    let mut offset = 0u32;
    for frame in frames {
        image::imageops::replace(&mut canvas, &frame.rgb, 0, i64::from(offset));
        offset += frame.height();
    }
    canvas
}
