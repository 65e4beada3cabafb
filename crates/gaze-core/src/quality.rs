use std::num::NonZeroUsize;

use image::GrayImage;
use lru::LruCache;

use crate::frame::Frame;

/// Pass thresholds for the per-frame quality checks.
#[derive(Clone, Copy, Debug)]
pub struct QualityThresholds {
    /// Minimum variance of the discrete Laplacian (sharpness).
    pub sharpness: f64,
    /// Acceptable mean-luma band.
    pub brightness: (f64, f64),
    /// Minimum luma standard deviation.
    pub contrast: f64,
    /// Maximum variance of the four quadrant means.
    pub uniformity: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            sharpness: 100.0,
            brightness: (50.0, 200.0),
            contrast: 30.0,
            uniformity: 500.0,
        }
    }
}

/// Outcome of the quality analysis for one frame.
#[derive(Clone, Copy, Debug)]
pub struct QualityReport {
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub quadrant_variance: f64,
    /// Weighted score of the four pass bits in [0, 1].
    pub score: f64,
}

impl QualityReport {
    /// The gate: only frames scoring above 0.7 are worth face work.
    /// Sharpness carries the largest weight, so a blurred frame can never
    /// pass regardless of lighting.
    pub fn passes(&self) -> bool {
        self.score > 0.7
    }
}

const CACHE_SIZE: usize = 100;

/// Per-frame quality filter with a small score cache keyed by the cheap
/// frame digest, so bursts of near-identical captures are analyzed once.
pub struct QualityGate {
    thresholds: QualityThresholds,
    cache: LruCache<crate::frame::FrameDigest, QualityReport>,
    hits: u64,
}

impl QualityGate {
    pub fn new() -> Self {
        Self::with_thresholds(QualityThresholds::default())
    }

    pub fn with_thresholds(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            cache: LruCache::new(NonZeroUsize::new(CACHE_SIZE).expect("nonzero cache size")),
            hits: 0,
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits
    }

    /// Analyze a frame, consulting the cache first.
    pub fn analyze(&mut self, frame: &Frame) -> QualityReport {
        let key = frame.digest();
        if let Some(report) = self.cache.get(&key) {
            self.hits += 1;
            return *report;
        }
        let report = self.compute(frame);
        self.cache.put(key, report);
        report
    }

    fn compute(&self, frame: &Frame) -> QualityReport {
        let sharpness = laplacian_variance(&frame.luma);
        let (brightness, contrast) = frame.luma_stats();
        let quadrant_variance = quadrant_mean_variance(&frame.luma);

        let t = &self.thresholds;
        let sharp_ok = sharpness > t.sharpness;
        let bright_ok = brightness >= t.brightness.0 && brightness <= t.brightness.1;
        let contrast_ok = contrast > t.contrast;
        let uniform_ok = quadrant_variance < t.uniformity;

        let score = 0.30 * f64::from(sharp_ok as u8)
            + 0.25 * f64::from(bright_ok as u8)
            + 0.25 * f64::from(contrast_ok as u8)
            + 0.20 * f64::from(uniform_ok as u8);

        QualityReport {
            sharpness,
            brightness,
            contrast,
            quadrant_variance,
            score,
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Variance of the 4-neighbour discrete Laplacian over the interior pixels.
fn laplacian_variance(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| luma.get_pixel(x, y)[0] as f64;

    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            values.push(lap);
        }
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// Variance of the mean luma across the four image quadrants. Uneven
/// lighting (one side blown out, the other in shadow) shows up here.
fn quadrant_mean_variance(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 2 || h < 2 {
        return 0.0;
    }
    let (hw, hh) = (w / 2, h / 2);
    let region_mean = |x0: u32, y0: u32, x1: u32, y1: u32| {
        let mut sum = 0.0;
        let mut count = 0u32;
        for y in y0..y1 {
            for x in x0..x1 {
                sum += luma.get_pixel(x, y)[0] as f64;
                count += 1;
            }
        }
        sum / count as f64
    };

    let means = [
        region_mean(0, 0, hw, hh),
        region_mean(hw, 0, w, hh),
        region_mean(0, hh, hw, h),
        region_mean(hw, hh, w, h),
    ];
    let mean = means.iter().sum::<f64>() / 4.0;
    means.iter().map(|m| (m - mean) * (m - mean)).sum::<f64>() / 4.0
}
