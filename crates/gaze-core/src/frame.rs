use std::sync::Arc;
use std::time::Instant;

use image::imageops::FilterType;
use image::{GrayImage, RgbImage};

/// Number of histogram bins used for the darkness analysis. Bin 0 covers
/// luma 0..32, which is what the dark/black frame decisions key on.
const DARKNESS_BINS: usize = 8;

/// A captured camera frame: the color image plus the luma channel derived
/// at capture time. Both always share the same dimensions and are resized
/// together, so downstream code may index either interchangeably.
#[derive(Clone)]
pub struct Frame {
    pub rgb: RgbImage,
    pub luma: GrayImage,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl Frame {
    /// Build a frame from a color capture, deriving the luma channel.
    pub fn from_rgb(rgb: RgbImage, sequence: u64) -> Self {
        let luma = luma_of(&rgb);
        Self {
            rgb,
            luma,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Build a frame from pre-split channels (used by GREY-format cameras
    /// and by tests). Panics in debug builds if the dimensions disagree.
    pub fn from_parts(rgb: RgbImage, luma: GrayImage, sequence: u64) -> Self {
        debug_assert_eq!(rgb.dimensions(), luma.dimensions());
        Self {
            rgb,
            luma,
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// Fraction of pixels in the darkest histogram bin, in [0, 1].
    pub fn darkness_ratio(&self) -> f64 {
        let total = self.luma.as_raw().len();
        if total == 0 {
            return 1.0;
        }
        let bin_width = 256 / DARKNESS_BINS as u32;
        let dark = self
            .luma
            .as_raw()
            .iter()
            .filter(|&&p| (p as u32) < bin_width)
            .count();
        dark as f64 / total as f64
    }

    /// A frame is black when every pixel sits in the darkest bin. Black
    /// frames are discounted from the too-dark statistic: they indicate a
    /// camera that has not started delivering, not a lighting problem.
    pub fn is_black(&self) -> bool {
        self.darkness_ratio() >= 1.0
    }

    /// Mean and standard deviation of the luma channel.
    pub fn luma_stats(&self) -> (f64, f64) {
        let raw = self.luma.as_raw();
        if raw.is_empty() {
            return (0.0, 0.0);
        }
        let n = raw.len() as f64;
        let mean = raw.iter().map(|&p| p as f64).sum::<f64>() / n;
        let var = raw
            .iter()
            .map(|&p| {
                let d = p as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (mean, var.sqrt())
    }

    /// Cheap digest for near-duplicate detection: dimensions plus the luma
    /// mean and stddev quantized to hundredths.
    pub fn digest(&self) -> FrameDigest {
        let (mean, std) = self.luma_stats();
        FrameDigest {
            width: self.width(),
            height: self.height(),
            mean_c: (mean * 100.0).round() as u32,
            std_c: (std * 100.0).round() as u32,
        }
    }

    /// Downscale both channels by `factor` (0 < factor <= 1). A factor of
    /// 1.0 returns the frame unchanged.
    pub fn scaled(self: &Arc<Self>, factor: f64) -> Arc<Frame> {
        if (factor - 1.0).abs() < f64::EPSILON {
            return Arc::clone(self);
        }
        let w = ((self.width() as f64 * factor).round() as u32).max(1);
        let h = ((self.height() as f64 * factor).round() as u32).max(1);
        Arc::new(Frame {
            rgb: image::imageops::resize(&self.rgb, w, h, FilterType::Triangle),
            luma: image::imageops::resize(&self.luma, w, h, FilterType::Triangle),
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }
}

/// Key for the quality-score cache. Derived from summary statistics only,
/// so consecutive near-identical captures collapse onto one entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FrameDigest {
    pub width: u32,
    pub height: u32,
    mean_c: u32,
    std_c: u32,
}

/// BT.601 luma from an RGB image.
pub fn luma_of(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        let y601 = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        image::Luma([y601.round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(w: u32, h: u32, value: u8) -> Frame {
        let rgb = RgbImage::from_pixel(w, h, image::Rgb([value, value, value]));
        Frame::from_rgb(rgb, 0)
    }

    #[test]
    fn black_frame_is_fully_dark() {
        let f = flat_frame(16, 16, 0);
        assert!(f.is_black());
        assert!((f.darkness_ratio() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bright_frame_is_not_dark() {
        let f = flat_frame(16, 16, 200);
        assert!(!f.is_black());
        assert_eq!(f.darkness_ratio(), 0.0);
    }

    #[test]
    fn half_dark_frame_ratio() {
        let rgb = RgbImage::from_fn(16, 16, |x, _| {
            if x < 8 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([200, 200, 200])
            }
        });
        let f = Frame::from_rgb(rgb, 0);
        assert!((f.darkness_ratio() - 0.5).abs() < 1e-9);
        assert!(!f.is_black());
    }

    #[test]
    fn luma_matches_bt601_weights() {
        let rgb = RgbImage::from_pixel(1, 1, image::Rgb([255, 0, 0]));
        let luma = luma_of(&rgb);
        // 0.299 * 255 ≈ 76
        assert_eq!(luma.get_pixel(0, 0)[0], 76);
    }

    #[test]
    fn digest_stable_for_identical_frames() {
        let a = flat_frame(32, 24, 128);
        let b = flat_frame(32, 24, 128);
        assert_eq!(a.digest(), b.digest());
        let c = flat_frame(32, 24, 40);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn scaled_halves_both_channels() {
        let f = Arc::new(flat_frame(64, 48, 100));
        let s = f.scaled(0.5);
        assert_eq!(s.rgb.dimensions(), (32, 24));
        assert_eq!(s.luma.dimensions(), (32, 24));
        assert_eq!(s.sequence, f.sequence);
    }

    #[test]
    fn scaled_identity_is_shared() {
        let f = Arc::new(flat_frame(64, 48, 100));
        let s = f.scaled(1.0);
        assert!(Arc::ptr_eq(&f, &s));
    }
}
