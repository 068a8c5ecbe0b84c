//! Null-model generators: synthetic realizations under an explicit null.
//!
//! Three interchangeable spectrum strategies, selected by the protocol:
//!
//! - `PhaseShuffle` keeps the Fourier magnitude at every frequency and draws
//!   the phases uniformly, destroying phase-coherent structure while
//!   preserving the power spectrum exactly
//! - `BlockShuffle` permutes contiguous blocks, preserving local correlation
//!   structure while destroying long-range periodicity
//! - `Synthetic` draws Gaussian realizations around the template using its
//!   per-multipole uncertainties
//!
//! Same (template, strategy, seed) always yields a bit-identical realization.
//! A strategy that does not apply to the data (block-shuffle on too-short
//! input, synthetic without uncertainties) is a configuration error, never a
//! quiet substitution.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use crate::coherence::{fft2d_forward, fft2d_inverse};
use crate::error::{PipelineError, Result};
use crate::spectrum::{SkyMap, Spectrum};

/// Null-hypothesis strategy for spectrum realizations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NullModel {
    PhaseShuffle,
    BlockShuffle { block_len: usize },
    Synthetic,
}

impl NullModel {
    pub fn label(&self) -> String {
        match self {
            NullModel::PhaseShuffle => "phase-shuffle".to_string(),
            NullModel::BlockShuffle { block_len } => format!("block-shuffle/{block_len}"),
            NullModel::Synthetic => "synthetic".to_string(),
        }
    }

    /// Produce one realization on the template's grid.
    pub fn realize(&self, template: &Spectrum, seed: u64) -> Result<Spectrum> {
        let values = match self {
            NullModel::PhaseShuffle => phase_shuffle(template.values(), seed),
            NullModel::BlockShuffle { block_len } => {
                block_shuffle(template.values(), *block_len, seed)?
            }
            NullModel::Synthetic => {
                let sigmas = template.sigmas().ok_or_else(|| {
                    PipelineError::Configuration(
                        "synthetic null model requires per-multipole uncertainties".to_string(),
                    )
                })?;
                synthetic(template.values(), sigmas, seed)
            }
        };
        template.with_values(values)
    }
}

/// Standard normal draw via Box-Muller on two uniform variates.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Randomize Fourier phases while preserving every magnitude.
///
/// Hermitian symmetry is maintained explicitly: bin k and bin n-k get
/// conjugate phases, and the self-conjugate bins (DC, and Nyquist for even
/// n) are left untouched so the inverse transform stays real.
fn phase_shuffle(values: &[f64], seed: u64) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return values.to_vec();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut planner = FftPlanner::<f64>::new();

    let mut buffer: Vec<Complex<f64>> =
        values.iter().map(|&v| Complex::new(v, 0.0)).collect();
    planner.plan_fft_forward(n).process(&mut buffer);

    for k in 1..n.div_ceil(2) {
        let mag = buffer[k].norm();
        let phi = rng.gen_range(0.0..TAU);
        let rotated = Complex::from_polar(mag, phi);
        buffer[k] = rotated;
        buffer[n - k] = rotated.conj();
    }

    planner.plan_fft_inverse(n).process(&mut buffer);
    buffer.iter().map(|c| c.re / n as f64).collect()
}

/// Permute complete contiguous blocks; any tail shorter than a block stays
/// in place at the end.
fn block_shuffle(values: &[f64], block_len: usize, seed: u64) -> Result<Vec<f64>> {
    if block_len == 0 {
        return Err(PipelineError::Configuration(
            "block-shuffle block length must be positive".to_string(),
        ));
    }
    let n_blocks = values.len() / block_len;
    if n_blocks < 2 {
        return Err(PipelineError::Configuration(format!(
            "block-shuffle needs at least 2 complete blocks of {block_len}, \
             but input length {} fits {n_blocks}",
            values.len()
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n_blocks).collect();
    // Fisher-Yates.
    for i in (1..n_blocks).rev() {
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }
    let mut out = Vec::with_capacity(values.len());
    for &b in &order {
        out.extend_from_slice(&values[b * block_len..(b + 1) * block_len]);
    }
    out.extend_from_slice(&values[n_blocks * block_len..]);
    Ok(out)
}

/// Gaussian realization: template + sigma * N(0, 1) per multipole.
fn synthetic(values: &[f64], sigmas: &[f64], seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    values
        .iter()
        .zip(sigmas.iter())
        .map(|(&v, &s)| v + s * gaussian(&mut rng))
        .collect()
}

/// Null-hypothesis strategy for sky maps, matched to the coherence engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapNull {
    /// Randomize 2D Fourier phases, preserving the 2D power spectrum.
    PhaseShuffle,
    /// Circularly shift the map by a seeded random (dx, dy) offset,
    /// preserving all local structure but breaking cross-channel alignment.
    Roll,
}

impl MapNull {
    pub fn label(&self) -> &'static str {
        match self {
            MapNull::PhaseShuffle => "map-phase-shuffle",
            MapNull::Roll => "map-roll",
        }
    }

    pub fn realize(&self, template: &SkyMap, seed: u64) -> Result<SkyMap> {
        match self {
            MapNull::PhaseShuffle => map_phase_shuffle(template, seed),
            MapNull::Roll => map_roll(template, seed),
        }
    }
}

fn map_phase_shuffle(map: &SkyMap, seed: u64) -> Result<SkyMap> {
    let (w, h) = (map.width, map.height);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut planner = FftPlanner::<f64>::new();

    let mut buffer: Vec<Complex<f64>> =
        map.data.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft2d_forward(&mut buffer, w, h, &mut planner);

    // Walk each frequency pair once: (x, y) and its Hermitian partner
    // (-x mod w, -y mod h) receive conjugate phases. Self-conjugate bins
    // (DC and the Nyquist combinations) stay untouched so the inverse
    // transform stays real.
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let cx = (w - x) % w;
            let cy = (h - y) % h;
            let conj_idx = cy * w + cx;
            if idx >= conj_idx {
                continue;
            }
            let mag = buffer[idx].norm();
            let phi = rng.gen_range(0.0..TAU);
            let rotated = Complex::from_polar(mag, phi);
            buffer[idx] = rotated;
            buffer[conj_idx] = rotated.conj();
        }
    }

    fft2d_inverse(&mut buffer, w, h, &mut planner);
    let scale = (w * h) as f64;
    let data: Vec<f64> = buffer.iter().map(|c| c.re / scale).collect();
    SkyMap::new(w, h, data)
}

fn map_roll(map: &SkyMap, seed: u64) -> Result<SkyMap> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dx = rng.gen_range(0..map.width);
    let dy = rng.gen_range(0..map.height);
    let mut data = vec![0.0; map.data.len()];
    for y in 0..map.height {
        for x in 0..map.width {
            let sx = (x + dx) % map.width;
            let sy = (y + dy) % map.height;
            data[y * map.width + x] = map.get(sx, sy);
        }
    }
    SkyMap::new(map.width, map.height, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::Units;

    fn template(n: usize) -> Spectrum {
        let ells: Vec<u32> = (2..2 + n as u32).collect();
        let values: Vec<f64> = (0..n).map(|i| (i as f64 * 0.37).sin() + 2.0).collect();
        Spectrum::new(ells, values, None, Units::Dimensionless).unwrap()
    }

    #[test]
    fn test_phase_shuffle_deterministic() {
        let t = template(128);
        let a = NullModel::PhaseShuffle.realize(&t, 42).unwrap();
        let b = NullModel::PhaseShuffle.realize(&t, 42).unwrap();
        assert_eq!(a.values(), b.values());
        let c = NullModel::PhaseShuffle.realize(&t, 43).unwrap();
        assert_ne!(a.values(), c.values());
    }

    #[test]
    fn test_phase_shuffle_preserves_power() {
        let t = template(128);
        let shuffled = NullModel::PhaseShuffle.realize(&t, 7).unwrap();

        let power = |v: &[f64]| -> Vec<f64> {
            let n = v.len();
            let mut planner = FftPlanner::<f64>::new();
            let mut buf: Vec<Complex<f64>> =
                v.iter().map(|&x| Complex::new(x, 0.0)).collect();
            planner.plan_fft_forward(n).process(&mut buf);
            buf.iter().map(|c| c.norm()).collect()
        };

        let p0 = power(t.values());
        let p1 = power(shuffled.values());
        for (a, b) in p0.iter().zip(p1.iter()) {
            assert!((a - b).abs() < 1e-6 * (1.0 + a.abs()), "{a} vs {b}");
        }
    }

    #[test]
    fn test_phase_shuffle_changes_sequence() {
        let t = template(128);
        let shuffled = NullModel::PhaseShuffle.realize(&t, 7).unwrap();
        assert_ne!(t.values(), shuffled.values());
    }

    #[test]
    fn test_block_shuffle_preserves_multiset() {
        let t = template(100);
        let shuffled = NullModel::BlockShuffle { block_len: 10 }
            .realize(&t, 3)
            .unwrap();
        let mut a = t.values().to_vec();
        let mut b = shuffled.values().to_vec();
        a.sort_by(|x, y| x.partial_cmp(y).unwrap());
        b.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_block_shuffle_too_short_is_configuration_error() {
        let t = template(15);
        let r = NullModel::BlockShuffle { block_len: 10 }.realize(&t, 3);
        assert!(matches!(r, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_synthetic_requires_sigmas() {
        let t = template(32);
        let r = NullModel::Synthetic.realize(&t, 1);
        assert!(matches!(r, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_synthetic_deterministic_and_scaled() {
        let n = 512;
        let ells: Vec<u32> = (2..2 + n as u32).collect();
        let values = vec![10.0; n];
        let sigmas = vec![2.0; n];
        let t = Spectrum::new(ells, values, Some(sigmas), Units::Dimensionless).unwrap();

        let a = NullModel::Synthetic.realize(&t, 11).unwrap();
        let b = NullModel::Synthetic.realize(&t, 11).unwrap();
        assert_eq!(a.values(), b.values());

        let mean: f64 = a.values().iter().sum::<f64>() / n as f64;
        let var: f64 =
            a.values().iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - 10.0).abs() < 0.5, "mean {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.5, "std {}", var.sqrt());
    }

    #[test]
    fn test_map_roll_preserves_pixels() {
        let map = SkyMap::new(4, 3, (0..12).map(|i| i as f64).collect()).unwrap();
        let rolled = MapNull::Roll.realize(&map, 5).unwrap();
        let mut a = map.data.clone();
        let mut b = rolled.data.clone();
        a.sort_by(|x, y| x.partial_cmp(y).unwrap());
        b.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_map_phase_shuffle_preserves_total_power() {
        let map = SkyMap::new(
            16,
            16,
            (0..256).map(|i| ((i % 7) as f64 - 3.0) * 0.5).collect(),
        )
        .unwrap();
        let shuffled = MapNull::PhaseShuffle.realize(&map, 9).unwrap();
        // Parseval: total variance is preserved by a pure phase rotation.
        let e0: f64 = map.data.iter().map(|v| v * v).sum();
        let e1: f64 = shuffled.data.iter().map(|v| v * v).sum();
        assert!((e0 - e1).abs() < 1e-6 * (1.0 + e0), "{e0} vs {e1}");
    }
}
