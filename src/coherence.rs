//! Segmented cross-spectrum phase-coherence engine.
//!
//! Measures phase synchronization between two sky-map channels, localized in
//! space: both maps are cut into overlapping tapered windows, each window is
//! transformed to the frequency domain, and the per-bin normalized
//! cross-spectrum (unit phasor of A * conj(B)) is accumulated into radial
//! frequency bins across all windows. Coherence per bin is the magnitude of
//! the mean phasor: 1 when every segment agrees on the relative phase, ~0
//! when phases are random.
//!
//! Coherence values are not self-normalizing (their null distribution
//! depends on window count and geometry); calibrate them through the
//! Monte-Carlo engine with matched map nulls.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{PipelineError, Result};
use crate::protocol::{Taper, WindowConfig};
use crate::spectrum::SkyMap;

/// In-place 2D forward FFT (rows, then columns).
pub(crate) fn fft2d_forward(
    buffer: &mut [Complex<f64>],
    width: usize,
    height: usize,
    planner: &mut FftPlanner<f64>,
) {
    let row_fft = planner.plan_fft_forward(width);
    for row in buffer.chunks_exact_mut(width) {
        row_fft.process(row);
    }
    let col_fft = planner.plan_fft_forward(height);
    let mut col = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for y in 0..height {
            col[y] = buffer[y * width + x];
        }
        col_fft.process(&mut col);
        for y in 0..height {
            buffer[y * width + x] = col[y];
        }
    }
}

/// In-place 2D inverse FFT (unscaled; divide by width*height afterwards).
pub(crate) fn fft2d_inverse(
    buffer: &mut [Complex<f64>],
    width: usize,
    height: usize,
    planner: &mut FftPlanner<f64>,
) {
    let row_fft = planner.plan_fft_inverse(width);
    for row in buffer.chunks_exact_mut(width) {
        row_fft.process(row);
    }
    let col_fft = planner.plan_fft_inverse(height);
    let mut col = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for y in 0..height {
            col[y] = buffer[y * width + x];
        }
        col_fft.process(&mut col);
        for y in 0..height {
            buffer[y * width + x] = col[y];
        }
    }
}

/// Radial phase-coherence profile over all segments of a map pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceProfile {
    /// Radial frequency per bin, in cycles per pixel (bin index / window).
    pub frequencies: Vec<f64>,
    /// Mean-phasor magnitude per bin, each in [0, 1].
    pub coherence: Vec<f64>,
    /// Phasor count per bin.
    pub counts: Vec<usize>,
    /// Number of windows that contributed.
    pub segments: usize,
}

impl CoherenceProfile {
    /// Coherence at the radial bin nearest to `freq` (cycles per pixel).
    pub fn coherence_at(&self, freq: f64) -> Result<f64> {
        let mut best: Option<(f64, usize)> = None;
        for (i, &f) in self.frequencies.iter().enumerate() {
            if self.counts[i] == 0 {
                continue;
            }
            let d = (f - freq).abs();
            if best.map(|(bd, _)| d < bd).unwrap_or(true) {
                best = Some((d, i));
            }
        }
        best.map(|(_, i)| self.coherence[i]).ok_or_else(|| {
            PipelineError::Configuration(
                "coherence profile has no populated bins".to_string(),
            )
        })
    }
}

/// Segmented cross-spectrum engine with pre-registered window geometry.
#[derive(Debug, Clone)]
pub struct CoherenceEngine {
    pub window: WindowConfig,
}

impl CoherenceEngine {
    /// Compute the radial coherence profile between two channels.
    pub fn profile(&self, a: &SkyMap, b: &SkyMap) -> Result<CoherenceProfile> {
        let w = self.window.size;
        if a.width != b.width || a.height != b.height {
            return Err(PipelineError::Configuration(format!(
                "channel shapes differ: {}x{} vs {}x{}",
                a.width, a.height, b.width, b.height
            )));
        }
        if w < 2 || w > a.width || w > a.height {
            return Err(PipelineError::Configuration(format!(
                "window size {w} does not fit a {}x{} map",
                a.width, a.height
            )));
        }

        let taper = taper_weights(self.window.taper, w);
        let n_bins = w / 2 + 1;
        let mut phasor_sum = vec![Complex::new(0.0, 0.0); n_bins];
        let mut counts = vec![0usize; n_bins];
        let mut planner = FftPlanner::<f64>::new();
        let mut segments = 0usize;

        let mut oy = 0;
        while oy + w <= a.height {
            let mut ox = 0;
            while ox + w <= a.width {
                let mut fa = windowed_segment(a, ox, oy, w, &taper);
                let mut fb = windowed_segment(b, ox, oy, w, &taper);
                fft2d_forward(&mut fa, w, w, &mut planner);
                fft2d_forward(&mut fb, w, w, &mut planner);

                for y in 0..w {
                    for x in 0..w {
                        // Signed frequency components; radial distance from
                        // the zero-frequency origin.
                        let fx = if x <= w / 2 { x } else { w - x };
                        let fy = if y <= w / 2 { y } else { w - y };
                        let r = ((fx * fx + fy * fy) as f64).sqrt();
                        let bin = r.round() as usize;
                        if bin >= n_bins {
                            continue;
                        }
                        let cross = fa[y * w + x] * fb[y * w + x].conj();
                        let norm = cross.norm();
                        if norm > 0.0 {
                            phasor_sum[bin] += cross / norm;
                            counts[bin] += 1;
                        }
                    }
                }
                segments += 1;
                ox += self.window.stride;
            }
            oy += self.window.stride;
        }

        if segments == 0 {
            return Err(PipelineError::Configuration(
                "window geometry produced no segments".to_string(),
            ));
        }

        let coherence: Vec<f64> = phasor_sum
            .iter()
            .zip(counts.iter())
            .map(|(s, &c)| if c == 0 { 0.0 } else { s.norm() / c as f64 })
            .collect();
        let frequencies: Vec<f64> = (0..n_bins).map(|i| i as f64 / w as f64).collect();

        log::debug!(
            "coherence profile: {segments} segments, {n_bins} radial bins"
        );
        Ok(CoherenceProfile {
            frequencies,
            coherence,
            counts,
            segments,
        })
    }

    /// Scalar statistic: coherence at the radial frequency nearest `freq`.
    pub fn statistic(&self, a: &SkyMap, b: &SkyMap, freq: f64) -> Result<f64> {
        self.profile(a, b)?.coherence_at(freq)
    }
}

/// Per-axis taper weights for a window of side `w`.
fn taper_weights(taper: Taper, w: usize) -> Vec<f64> {
    match taper {
        Taper::None => vec![1.0; w],
        Taper::Hann => (0..w)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (w - 1) as f64).cos()))
            .collect(),
    }
}

/// Extract a w x w segment at (ox, oy) with the separable taper applied.
fn windowed_segment(
    map: &SkyMap,
    ox: usize,
    oy: usize,
    w: usize,
    taper: &[f64],
) -> Vec<Complex<f64>> {
    let mut out = Vec::with_capacity(w * w);
    for y in 0..w {
        for x in 0..w {
            let v = map.get(ox + x, oy + y) * taper[x] * taper[y];
            out.push(Complex::new(v, 0.0));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise_map(w: usize, h: usize, seed: u64) -> SkyMap {
        let mut rng = StdRng::seed_from_u64(seed);
        SkyMap::new(w, h, (0..w * h).map(|_| rng.gen_range(-1.0..1.0)).collect()).unwrap()
    }

    fn engine(size: usize, stride: usize) -> CoherenceEngine {
        CoherenceEngine {
            window: WindowConfig {
                size,
                stride,
                taper: Taper::Hann,
            },
        }
    }

    #[test]
    fn test_identical_channels_fully_coherent() {
        let map = noise_map(64, 64, 1);
        let profile = engine(16, 8).profile(&map, &map).unwrap();
        for (i, (&c, &count)) in profile.coherence.iter().zip(profile.counts.iter()).enumerate()
        {
            if count > 0 {
                assert!(
                    (c - 1.0).abs() < 1e-9,
                    "bin {i}: coherence {c} for identical channels"
                );
            }
        }
    }

    #[test]
    fn test_coherence_bounded() {
        let a = noise_map(64, 64, 2);
        let b = noise_map(64, 64, 3);
        let profile = engine(16, 8).profile(&a, &b).unwrap();
        for &c in &profile.coherence {
            assert!((0.0..=1.0).contains(&c), "coherence {c} out of bounds");
        }
    }

    #[test]
    fn test_independent_channels_weakly_coherent() {
        let a = noise_map(128, 128, 4);
        let b = noise_map(128, 128, 5);
        let profile = engine(16, 8).profile(&a, &b).unwrap();
        // With many segments, the mean phasor of random phases is small.
        // Check a mid-range bin with plenty of contributions.
        let mid = profile.coherence.len() / 2;
        assert!(profile.counts[mid] > 100);
        assert!(
            profile.coherence[mid] < 0.3,
            "independent channels coherence {} at bin {mid}",
            profile.coherence[mid]
        );
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let a = noise_map(64, 64, 6);
        let b = noise_map(32, 64, 7);
        assert!(engine(16, 8).profile(&a, &b).is_err());
    }

    #[test]
    fn test_oversized_window_rejected() {
        let a = noise_map(16, 16, 8);
        assert!(engine(32, 16).profile(&a, &a).is_err());
    }

    #[test]
    fn test_segment_count_half_overlap() {
        let a = noise_map(64, 64, 9);
        let profile = engine(16, 8).profile(&a, &a).unwrap();
        // Origins 0, 8, ..., 48 per axis: 7 positions, 49 segments.
        assert_eq!(profile.segments, 49);
    }

    #[test]
    fn test_coherence_at_nearest_bin() {
        let a = noise_map(64, 64, 10);
        let profile = engine(16, 8).profile(&a, &a).unwrap();
        let c = profile.coherence_at(0.25).unwrap();
        assert!((c - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_untapered_windows_supported() {
        let a = noise_map(64, 64, 11);
        let e = CoherenceEngine {
            window: WindowConfig {
                size: 16,
                stride: 16,
                taper: Taper::None,
            },
        };
        let profile = e.profile(&a, &a).unwrap();
        assert_eq!(profile.segments, 16);
    }
}
