//! Comb/periodicity detector.
//!
//! Reduces a spectrum to a scalar statistic for a candidate comb period
//! delta-ell: restrict to the registered multipole range, subtract a
//! centered moving-average baseline, whiten the residuals per the registered
//! mode, then fold the residuals modulo delta-ell and take the peak of the
//! folded profile. A comb stacks all of its harmonics coherently into one
//! phase bin, so the peak measures the coherent sum of residuals at
//! multiples of the period; randomizing Fourier phases spreads the same
//! power across the whole profile and destroys the peak. The same statistic
//! is applied identically to real and null data; significance calibration is
//! the Monte-Carlo engine's job.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::protocol::WhiteningMode;
use crate::spectrum::{CovarianceMatrix, Spectrum};

/// Scalar outcome of one detector evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CombStatistic {
    /// Period that produced the statistic (the best one when scanning).
    pub period: f64,
    /// Folded-profile peak in units of the per-bin standard error;
    /// ~sqrt(2 ln B) for white residuals over B phase bins, large for a comb.
    pub value: f64,
    /// Phase of the peak bin, in [0, tau).
    pub phase: f64,
    /// True when a documented lower-rigor whitening fallback was applied.
    pub reduced_rigor: bool,
}

/// Comb detector with pre-registered range, whitening, and baseline width.
#[derive(Debug, Clone)]
pub struct CombDetector {
    pub ell_range: (u32, u32),
    pub whitening: WhiteningMode,
    /// Half-width of the moving-average baseline.
    pub smoothing_halfwidth: usize,
    /// Strict mode refuses reduced-rigor fallbacks.
    pub strict: bool,
}

impl CombDetector {
    /// Evaluate the comb statistic at a single candidate period.
    pub fn statistic(
        &self,
        spectrum: &Spectrum,
        covariance: Option<&CovarianceMatrix>,
        period: f64,
    ) -> Result<CombStatistic> {
        let (lo, hi) = self.ell_range;
        let width = hi - lo;
        let needed = (2.0 * period).ceil() as u32;
        if width < needed {
            return Err(PipelineError::InsufficientRange {
                period,
                range_width: width,
                needed,
            });
        }

        let restricted = spectrum.restrict(lo, hi)?;
        let (residuals, reduced_rigor) = self.whitened_residuals(&restricted, covariance)?;

        let (value, phase) = folded_peak(restricted.ells(), &residuals, period)?;
        if !value.is_finite() {
            return Err(PipelineError::NonFinite {
                stage: "comb statistic",
                index: 0,
            });
        }
        Ok(CombStatistic {
            period,
            value,
            phase,
            reduced_rigor,
        })
    }

    /// Evaluate every candidate period and return the maximising one.
    ///
    /// The candidate set is pre-registered in the protocol; this is a fixed
    /// search window, not an adaptive one.
    pub fn scan(
        &self,
        spectrum: &Spectrum,
        covariance: Option<&CovarianceMatrix>,
        periods: &[f64],
    ) -> Result<CombStatistic> {
        if periods.is_empty() {
            return Err(PipelineError::Configuration(
                "comb scan needs at least one candidate period".to_string(),
            ));
        }
        let mut best: Option<CombStatistic> = None;
        for &period in periods {
            let stat = self.statistic(spectrum, covariance, period)?;
            if best.map(|b| stat.value > b.value).unwrap_or(true) {
                best = Some(stat);
            }
        }
        Ok(best.expect("non-empty period set"))
    }

    /// Baseline-subtract and whiten the restricted spectrum.
    ///
    /// Returns the residual sequence and whether a reduced-rigor fallback
    /// was applied. Fallbacks only exist in lenient mode and are always
    /// reported, never silent.
    fn whitened_residuals(
        &self,
        restricted: &Spectrum,
        covariance: Option<&CovarianceMatrix>,
    ) -> Result<(Vec<f64>, bool)> {
        let residuals = subtract_baseline(restricted.values(), self.smoothing_halfwidth);

        let (out, reduced) = match self.whitening {
            WhiteningMode::None => (residuals, false),
            WhiteningMode::Diagonal => self.diagonal_whiten(restricted, covariance, residuals)?,
            WhiteningMode::BlockDiagonal { block } => {
                match self.restricted_covariance(restricted, covariance)? {
                    Some(cov) => (block_whiten(&cov, &residuals, block)?, false),
                    // Lenient fallback: diagonal whitening, flagged.
                    None => {
                        let (v, _) = self.diagonal_whiten(restricted, None, residuals)?;
                        (v, true)
                    }
                }
            }
            WhiteningMode::FullCovariance => {
                match self.restricted_covariance(restricted, covariance)? {
                    Some(cov) => (cov.whiten(&residuals)?, false),
                    None => {
                        let (v, _) = self.diagonal_whiten(restricted, None, residuals)?;
                        (v, true)
                    }
                }
            }
        };

        for (i, v) in out.iter().enumerate() {
            if !v.is_finite() {
                return Err(PipelineError::NonFinite {
                    stage: "whitened residuals",
                    index: i,
                });
            }
        }
        Ok((out, reduced))
    }

    /// Covariance restricted to the detector range, or None (lenient) /
    /// Configuration error (strict) when absent.
    fn restricted_covariance(
        &self,
        restricted: &Spectrum,
        covariance: Option<&CovarianceMatrix>,
    ) -> Result<Option<CovarianceMatrix>> {
        match covariance {
            Some(cov) => {
                let sub = cov.restrict(self.ell_range.0, self.ell_range.1)?;
                if sub.ells() != restricted.ells() {
                    return Err(PipelineError::Configuration(
                        "covariance grid does not match the spectrum grid over the \
                         detector range"
                            .to_string(),
                    ));
                }
                Ok(Some(sub))
            }
            None if self.strict => Err(PipelineError::Configuration(format!(
                "whitening mode {} requires a covariance matrix (strict mode)",
                self.whitening.label()
            ))),
            None => {
                log::warn!(
                    "no covariance for {} whitening; falling back to diagonal (reduced rigor)",
                    self.whitening.label()
                );
                Ok(None)
            }
        }
    }

    fn diagonal_whiten(
        &self,
        restricted: &Spectrum,
        covariance: Option<&CovarianceMatrix>,
        residuals: Vec<f64>,
    ) -> Result<(Vec<f64>, bool)> {
        let sigmas: Option<Vec<f64>> = restricted
            .sigmas()
            .map(|s| s.to_vec())
            .or_else(|| {
                covariance.and_then(|cov| {
                    cov.restrict(self.ell_range.0, self.ell_range.1)
                        .ok()
                        .map(|c| c.diagonal_sigmas())
                })
            });
        match sigmas {
            Some(sigmas) => {
                for (i, s) in sigmas.iter().enumerate() {
                    if *s <= 0.0 {
                        return Err(PipelineError::NonFinite {
                            stage: "diagonal whitening sigmas",
                            index: i,
                        });
                    }
                }
                let out = residuals
                    .iter()
                    .zip(sigmas.iter())
                    .map(|(r, s)| r / s)
                    .collect();
                Ok((out, false))
            }
            None if self.strict => Err(PipelineError::Configuration(
                "diagonal whitening requires uncertainties or a covariance matrix \
                 (strict mode)"
                    .to_string(),
            )),
            None => {
                // Lenient fallback: scale by the global sample deviation.
                let n = residuals.len() as f64;
                let mean = residuals.iter().sum::<f64>() / n;
                let var = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
                if var <= 0.0 {
                    return Err(PipelineError::NonFinite {
                        stage: "global-std whitening",
                        index: 0,
                    });
                }
                let std = var.sqrt();
                log::warn!(
                    "no uncertainties available; whitening by global sample std (reduced rigor)"
                );
                Ok((residuals.iter().map(|r| r / std).collect(), true))
            }
        }
    }
}

/// Peak of the phase-folded residual profile for a candidate period.
///
/// Residuals are folded modulo `period` into round(period) phase bins and
/// averaged; each populated bin is scored as its mean over its standard
/// error (residual sample deviation over sqrt(count)), and the largest bin
/// score wins. Tolerant of grid gaps: empty bins are skipped, uneven bins
/// carry their own count. Returns the peak score and the phase of the peak
/// bin in [0, tau).
fn folded_peak(ells: &[u32], residuals: &[f64], period: f64) -> Result<(f64, f64)> {
    let bins = (period.round() as usize).max(2);
    let mut sum = vec![0.0f64; bins];
    let mut count = vec![0usize; bins];
    for (&ell, &r) in ells.iter().zip(residuals.iter()) {
        let frac = (ell as f64 % period) / period;
        let b = ((frac * bins as f64) as usize).min(bins - 1);
        sum[b] += r;
        count[b] += 1;
    }

    let n = residuals.len() as f64;
    let scale = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
    if !(scale > 0.0) {
        return Err(PipelineError::NonFinite {
            stage: "folded profile",
            index: 0,
        });
    }

    let mut best = f64::NEG_INFINITY;
    let mut best_bin = 0usize;
    for b in 0..bins {
        if count[b] == 0 {
            continue;
        }
        // mean / (scale / sqrt(count)) written as sum / sqrt(count) / scale
        let score = sum[b] / (count[b] as f64).sqrt() / scale;
        if score > best {
            best = score;
            best_bin = b;
        }
    }
    let phase = TAU * (best_bin as f64 + 0.5) / bins as f64;
    Ok((best, phase))
}

/// Residuals against a centered moving average of half-width `h`.
///
/// Near the edges the average shrinks to the available window. `h = 0`
/// subtracts only the global mean.
fn subtract_baseline(values: &[f64], halfwidth: usize) -> Vec<f64> {
    let n = values.len();
    if halfwidth == 0 {
        let mean = values.iter().sum::<f64>() / n as f64;
        return values.iter().map(|v| v - mean).collect();
    }
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(halfwidth);
            let hi = (i + halfwidth + 1).min(n);
            let window = &values[lo..hi];
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            values[i] - mean
        })
        .collect()
}

/// Whiten per contiguous block with each block's own Cholesky factor.
fn block_whiten(
    cov: &CovarianceMatrix,
    residuals: &[f64],
    block: usize,
) -> Result<Vec<f64>> {
    if block == 0 {
        return Err(PipelineError::Configuration(
            "block-diagonal whitening needs a positive block width".to_string(),
        ));
    }
    let ells = cov.ells();
    let mut out = Vec::with_capacity(residuals.len());
    let mut start = 0usize;
    while start < residuals.len() {
        let end = (start + block).min(residuals.len());
        let sub = cov.restrict(ells[start], ells[end - 1])?;
        out.extend(sub.whiten(&residuals[start..end])?);
        start = end;
    }
    Ok(out)
}
