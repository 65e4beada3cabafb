//! Passive screen-replay detection via spectral analysis.
//!
//! A camera pointed at a display picks up moiré: aliasing between the
//! display's pixel grid and the sensor's. In the Fourier domain that shows
//! up as sharp peaks well outside the low-frequency disk where natural
//! face texture lives. The score here is the peak-to-mean ratio of the
//! log-magnitude spectrum outside that disk, squashed through a logistic.

use image::imageops::FilterType;
use image::GrayImage;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::face::FaceBox;

/// Fixed analysis size; resizing keeps the ratio comparable across cameras.
const SPECTRUM_SIZE: usize = 128;
/// Radius of the excluded low-frequency disk around the spectrum center.
const LOW_FREQ_RADIUS: f64 = 15.0;
/// Logistic mapping of the peak/mean ratio to [0, 1].
const RATIO_CENTER: f64 = 3.5;
const RATIO_SLOPE: f64 = 2.0;

pub struct FrequencyAnalyzer {
    planner: FftPlanner<f64>,
}

impl FrequencyAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Score a frame's face region for screen artifacts: 0.0 reads
    /// natural, 1.0 reads like a display. The region is cropped (when a
    /// box is given), resized to 128×128, and analyzed in the frequency
    /// domain.
    pub fn analyze(&mut self, luma: &GrayImage, bbox: Option<&FaceBox>) -> f64 {
        let region = match bbox {
            Some(b) => match b.crop_within(luma.width(), luma.height()) {
                Some((x, y, w, h)) => image::imageops::crop_imm(luma, x, y, w, h).to_image(),
                None => return 0.0,
            },
            None => luma.clone(),
        };

        let resized = image::imageops::resize(
            &region,
            SPECTRUM_SIZE as u32,
            SPECTRUM_SIZE as u32,
            FilterType::Triangle,
        );

        let spectrum = self.magnitude_spectrum(&resized);

        // Zero out the centered low-frequency disk; what remains is where
        // moiré spikes live. The mean is taken over the full grid, matching
        // the masked-array convention the thresholds were tuned against.
        let center = SPECTRUM_SIZE as f64 / 2.0;
        let mut sum = 0.0;
        let mut max = f64::MIN;
        for (i, row) in spectrum.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                let dy = i as f64 - center;
                let dx = j as f64 - center;
                let masked = if (dx * dx + dy * dy).sqrt() <= LOW_FREQ_RADIUS {
                    0.0
                } else {
                    value
                };
                sum += masked;
                if masked > max {
                    max = masked;
                }
            }
        }
        let mean = sum / (SPECTRUM_SIZE * SPECTRUM_SIZE) as f64;
        if mean == 0.0 {
            return 0.0;
        }

        let ratio = max / (mean + 1e-5);
        score_from_ratio(ratio)
    }

    /// Centered log-magnitude spectrum of a 128×128 luma tile.
    fn magnitude_spectrum(&mut self, tile: &GrayImage) -> Vec<Vec<f64>> {
        let n = SPECTRUM_SIZE;
        let fft = self.planner.plan_fft_forward(n);

        let mut rows: Vec<Vec<Complex<f64>>> = (0..n)
            .map(|y| {
                let mut row: Vec<Complex<f64>> = (0..n)
                    .map(|x| Complex {
                        re: tile.get_pixel(x as u32, y as u32)[0] as f64,
                        im: 0.0,
                    })
                    .collect();
                fft.process(&mut row);
                row
            })
            .collect();

        // Column pass completes the 2-D transform.
        for x in 0..n {
            let mut col: Vec<Complex<f64>> = (0..n).map(|y| rows[y][x]).collect();
            fft.process(&mut col);
            for (y, v) in col.into_iter().enumerate() {
                rows[y][x] = v;
            }
        }

        // fftshift + log magnitude.
        let half = n / 2;
        let mut out = vec![vec![0.0; n]; n];
        for (y, row) in rows.iter().enumerate() {
            for (x, v) in row.iter().enumerate() {
                let sy = (y + half) % n;
                let sx = (x + half) % n;
                out[sy][sx] = 20.0 * (v.norm() + 1e-10).ln();
            }
        }
        out
    }
}

impl Default for FrequencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Logistic squash of the peak/mean ratio. Natural spectra fall off
/// smoothly (ratio near 1); screens spike (ratio well above the center).
pub fn score_from_ratio(ratio: f64) -> f64 {
    let score = 1.0 / (1.0 + (-(ratio - RATIO_CENTER) * RATIO_SLOPE).exp());
    score.clamp(0.0, 1.0)
}
