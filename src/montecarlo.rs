//! Monte-Carlo significance engine.
//!
//! Converts an observed statistic into a calibrated p-value and z-score by
//! comparison against N null trials. Trial i derives its seed from the
//! master seed and i alone, so trial results are independent of execution
//! order; aggregation walks the collected statistics in index order, which
//! makes the parallel and sequential paths bit-identical.
//!
//! The p-value convention is the conservative one-sided estimator
//! p = (1 + #{null >= observed}) / (N + 1): ties count against the
//! candidate, and the smallest reportable value is 1 / (N + 1), never zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::protocol::{Protocol, Tier};

/// Cooperative cancellation flag, checked between trials (never mid-trial).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of the null reference distribution (full realizations are
/// discarded; only the scalar statistics feed these moments).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NullSummary {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
}

/// Per-test verdict under the pre-registered p-value threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestVerdict {
    Pass,
    Fail,
    /// Degenerate null distribution; the cell cannot discriminate.
    Inconclusive,
}

impl TestVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            TestVerdict::Pass => "PASS",
            TestVerdict::Fail => "FAIL",
            TestVerdict::Inconclusive => "INCONCLUSIVE",
        }
    }
}

/// Immutable outcome of one detector + Monte-Carlo pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub protocol_id: String,
    /// Manifest digests of every input file this result derives from.
    pub manifest_digests: Vec<String>,
    pub null_model: String,
    pub seed: u64,
    pub observed: f64,
    pub null: NullSummary,
    pub p_value: f64,
    pub z_score: f64,
    pub tier: Tier,
    pub verdict: TestVerdict,
    /// True when any stage applied a documented lower-rigor fallback.
    pub reduced_rigor: bool,
    pub strict_mode: bool,
}

/// Deterministic per-trial seed derivation (splitmix-style mixing of the
/// master seed and the trial index).
pub fn trial_seed(master: u64, index: u64) -> u64 {
    let mut z = master ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Monte-Carlo engine configuration.
#[derive(Debug, Clone)]
pub struct McEngine {
    pub trials: usize,
    pub seed: u64,
    /// Rayon worker pool when true; strictly sequential when false. Both
    /// paths produce bit-identical results.
    pub parallel: bool,
    pub cancel: Option<CancelToken>,
}

/// Metadata attached to a result beyond what the engine computes itself.
#[derive(Debug, Clone, Default)]
pub struct ResultContext {
    pub manifest_digests: Vec<String>,
    pub null_model: String,
    pub reduced_rigor: bool,
}

impl McEngine {
    pub fn from_protocol(protocol: &Protocol, parallel: bool) -> Self {
        McEngine {
            trials: protocol.trials(),
            seed: protocol.seed(),
            parallel,
            cancel: None,
        }
    }

    /// Run N null trials of `trial` and calibrate `observed` against them.
    ///
    /// `trial(seed)` must generate one null realization from that seed and
    /// return the identical detector's statistic for it. Trials share no
    /// mutable state; each sees only its derived seed.
    pub fn run<F>(
        &self,
        test_name: &str,
        observed: f64,
        trial: F,
        protocol: &Protocol,
        context: ResultContext,
    ) -> Result<TestResult>
    where
        F: Fn(u64) -> Result<f64> + Sync,
    {
        if !observed.is_finite() {
            return Err(PipelineError::NonFinite {
                stage: "observed statistic",
                index: 0,
            });
        }
        let n = self.trials;
        let stats = if self.parallel {
            self.run_parallel(&trial, n)?
        } else {
            self.run_sequential(&trial, n)?
        };

        // Reproducibility guard: trial 0 must replay bit-for-bit.
        let replay = trial(trial_seed(self.seed, 0))?;
        if replay.to_bits() != stats[0].to_bits() {
            return Err(PipelineError::Reproducibility {
                stage: "monte-carlo trial replay",
                expected: stats[0],
                actual: replay,
            });
        }

        // Commutative reduction, always walked in trial-index order.
        let mut count_ge = 0usize;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for &s in &stats {
            if s >= observed {
                count_ge += 1;
            }
            sum += s;
            sum_sq += s * s;
        }
        let mean = sum / n as f64;
        let var = (sum_sq / n as f64 - mean * mean).max(0.0);
        let std = var.sqrt();

        let p_value = (1 + count_ge) as f64 / (n + 1) as f64;
        let z_score = if std > 0.0 { (observed - mean) / std } else { 0.0 };
        let tier = protocol.tiers().classify(p_value);
        let verdict = if std == 0.0 {
            TestVerdict::Inconclusive
        } else if p_value < protocol.combination().p_threshold {
            TestVerdict::Pass
        } else {
            TestVerdict::Fail
        };

        log::info!(
            "{test_name}: observed={observed:.4} null={mean:.4}+/-{std:.4} \
             p={p_value:.5} z={z_score:.2} -> {}",
            verdict.label()
        );

        Ok(TestResult {
            test_name: test_name.to_string(),
            protocol_id: protocol.id(),
            manifest_digests: context.manifest_digests,
            null_model: context.null_model,
            seed: self.seed,
            observed,
            null: NullSummary {
                count: n,
                mean,
                std,
            },
            p_value,
            z_score,
            tier,
            verdict,
            reduced_rigor: context.reduced_rigor,
            strict_mode: protocol.strict(),
        })
    }

    fn run_sequential<F>(&self, trial: &F, n: usize) -> Result<Vec<f64>>
    where
        F: Fn(u64) -> Result<f64> + Sync,
    {
        let mut stats = Vec::with_capacity(n);
        for i in 0..n {
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(PipelineError::Cancelled {
                        completed_trials: i,
                        total_trials: n,
                    });
                }
            }
            stats.push(trial(trial_seed(self.seed, i as u64))?);
        }
        Ok(stats)
    }

    fn run_parallel<F>(&self, trial: &F, n: usize) -> Result<Vec<f64>>
    where
        F: Fn(u64) -> Result<f64> + Sync,
    {
        let cancel = self.cancel.clone();
        // Ordered collect: stats[i] is trial i regardless of completion
        // order, so downstream aggregation matches the sequential path.
        let stats: std::result::Result<Vec<f64>, PipelineError> = (0..n)
            .into_par_iter()
            .map(|i| {
                if let Some(token) = &cancel {
                    if token.is_cancelled() {
                        return Err(PipelineError::Cancelled {
                            completed_trials: 0,
                            total_trials: n,
                        });
                    }
                }
                trial(trial_seed(self.seed, i as u64))
            })
            .collect();
        stats
    }

    /// Null-calibration check: draw `repetitions` fake "observed" statistics
    /// from the null itself and report each one's p-value against a fresh
    /// reference distribution slice. Under a healthy pairing the returned
    /// p-values are approximately uniform on (0, 1].
    pub fn calibrate<F>(
        &self,
        trial: F,
        repetitions: usize,
    ) -> Result<Vec<f64>>
    where
        F: Fn(u64) -> Result<f64> + Sync,
    {
        let n = self.trials;
        let reference = if self.parallel {
            self.run_parallel(&trial, n)?
        } else {
            self.run_sequential(&trial, n)?
        };
        // Fake observations use a disjoint seed stream.
        let fake_master = trial_seed(self.seed, u64::MAX);
        let mut p_values = Vec::with_capacity(repetitions);
        for r in 0..repetitions {
            let fake = trial(trial_seed(fake_master, r as u64))?;
            let count_ge = reference.iter().filter(|&&s| s >= fake).count();
            p_values.push((1 + count_ge) as f64 / (n + 1) as f64);
        }
        Ok(p_values)
    }
}
