//! Stress-test orchestrator.
//!
//! Runs the same detector + Monte-Carlo pairing across a pre-registered
//! matrix of configuration variations, each a falsification attempt:
//! whitening mode, disjoint multipole ranges, channel, dataset, and null
//! model for the comb cells; map-null strategy for the coherence cells.
//! Every cell owns a fully specified configuration and its own derived
//! seed, so any single cell can be reproduced in isolation. A failing cell
//! is recorded as an error outcome and never aborts its siblings;
//! cooperative cancellation aborts the whole run with nothing reported.

use serde::{Deserialize, Serialize};

use crate::coherence::CoherenceEngine;
use crate::comb::CombDetector;
use crate::error::{PipelineError, Result};
use crate::montecarlo::{trial_seed, CancelToken, McEngine, ResultContext, TestResult};
use crate::nullmodel::{MapNull, NullModel};
use crate::protocol::{Protocol, WhiteningMode, WindowConfig};
use crate::spectrum::{CovarianceMatrix, SkyMap, Spectrum};

/// One spectrum channel of a dataset (e.g. TT, EE, TE).
pub struct ChannelInput {
    pub name: String,
    pub spectrum: Spectrum,
    pub covariance: Option<CovarianceMatrix>,
}

/// One dataset (e.g. one survey release) with its channels.
pub struct DatasetInput {
    pub name: String,
    pub channels: Vec<ChannelInput>,
}

/// A pair of sky-map channels for the coherence cells.
pub struct MapPairInput {
    pub name: String,
    pub channel_a: SkyMap,
    pub channel_b: SkyMap,
    /// Manifest digests of the two map files.
    pub digests: Vec<String>,
}

/// Axis parameters of one matrix cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CellKind {
    Comb {
        ell_range: (u32, u32),
        whitening: WhiteningMode,
        null_model: NullModel,
    },
    Coherence {
        window: WindowConfig,
        map_null: MapNull,
        /// Radial frequency under test, cycles per pixel.
        target_freq: f64,
    },
}

/// A fully specified cell of the stress matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressCell {
    pub name: String,
    pub dataset: String,
    pub channel: String,
    pub kind: CellKind,
}

/// Outcome of one cell: a test result, or the error that stopped it.
///
/// Errors are kept verbatim in the record; an unfavorable or failed cell is
/// never dropped from the matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellOutcome {
    pub cell: StressCell,
    pub result: std::result::Result<TestResult, String>,
}

/// Build the pre-registered matrix: the cross product of dataset, channel,
/// multipole range, whitening mode, and null model, plus one coherence cell
/// per map pair, map-null strategy, and target period.
pub fn build_plan(
    protocol: &Protocol,
    datasets: &[DatasetInput],
    map_pairs: &[MapPairInput],
) -> Vec<StressCell> {
    let mut cells = Vec::new();
    for ds in datasets {
        for ch in &ds.channels {
            for &ell_range in protocol.ell_ranges() {
                for &whitening in protocol.whitening_modes() {
                    for &null_model in protocol.null_models() {
                        cells.push(StressCell {
                            name: format!(
                                "{}/{}/ell{}-{}/{}/{}",
                                ds.name,
                                ch.name,
                                ell_range.0,
                                ell_range.1,
                                whitening.label(),
                                null_model.label()
                            ),
                            dataset: ds.name.clone(),
                            channel: ch.name.clone(),
                            kind: CellKind::Comb {
                                ell_range,
                                whitening,
                                null_model,
                            },
                        });
                    }
                }
            }
        }
    }
    for pair in map_pairs {
        for &map_null in protocol.map_nulls() {
            for &period in protocol.target_periods() {
                let target_freq = 1.0 / period;
                cells.push(StressCell {
                    name: format!(
                        "{}/coherence/f{:.4}/{}",
                        pair.name,
                        target_freq,
                        map_null.label()
                    ),
                    dataset: pair.name.clone(),
                    channel: "coherence".to_string(),
                    kind: CellKind::Coherence {
                        window: protocol.window(),
                        map_null,
                        target_freq,
                    },
                });
            }
        }
    }
    cells
}

/// Run the full matrix against a locked protocol.
///
/// The returned list has exactly one outcome per planned cell, in plan
/// order. Cancellation aborts the entire run; partial matrices are never
/// returned.
pub fn run_matrix(
    protocol: &Protocol,
    datasets: &[DatasetInput],
    map_pairs: &[MapPairInput],
    parallel: bool,
    cancel: Option<CancelToken>,
) -> Result<Vec<CellOutcome>> {
    if !protocol.is_locked() {
        return Err(PipelineError::Configuration(format!(
            "protocol {} must be locked before running against real data",
            protocol.id()
        )));
    }

    let plan = build_plan(protocol, datasets, map_pairs);
    log::info!(
        "stress matrix: {} cells under protocol {}",
        plan.len(),
        protocol.id()
    );

    let planned = plan.len();
    let mut outcomes = Vec::with_capacity(planned);
    for (cell_index, cell) in plan.into_iter().enumerate() {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    completed_trials: outcomes.len(),
                    total_trials: planned,
                });
            }
        }
        // Each cell derives its own master seed from the protocol seed and
        // its position in the pre-registered plan.
        let cell_seed = trial_seed(protocol.seed(), cell_index as u64);
        let result = run_cell(
            protocol,
            datasets,
            map_pairs,
            &cell,
            cell_seed,
            parallel,
            cancel.clone(),
        );
        match result {
            Ok(test_result) => outcomes.push(CellOutcome {
                cell,
                result: Ok(test_result),
            }),
            // Cancellation invalidates the whole matrix.
            Err(e @ PipelineError::Cancelled { .. }) => return Err(e),
            Err(e) => {
                log::error!("cell {} failed: {e}", cell.name);
                outcomes.push(CellOutcome {
                    cell,
                    result: Err(e.to_string()),
                });
            }
        }
    }
    Ok(outcomes)
}

/// Null-calibration for one comb cell: apply the cell's detector + null
/// pairing to the null's own realizations and return the resulting p-values
/// (roughly uniform when the pairing is healthy).
pub fn calibrate_cell(
    engine: &McEngine,
    protocol: &Protocol,
    dataset: &DatasetInput,
    cell: &StressCell,
    repetitions: usize,
) -> Result<Vec<f64>> {
    let (ell_range, whitening, null_model) = match &cell.kind {
        CellKind::Comb {
            ell_range,
            whitening,
            null_model,
        } => (*ell_range, *whitening, *null_model),
        CellKind::Coherence { .. } => {
            return Err(PipelineError::Configuration(
                "calibration is defined for comb cells only".to_string(),
            ))
        }
    };
    let channel = dataset
        .channels
        .iter()
        .find(|c| c.name == cell.channel)
        .ok_or_else(|| {
            PipelineError::Configuration(format!(
                "cell {} references unknown channel {}",
                cell.name, cell.channel
            ))
        })?;

    let detector = CombDetector {
        ell_range,
        whitening,
        smoothing_halfwidth: protocol.smoothing_halfwidth(),
        strict: protocol.strict(),
    };
    let periods = protocol.target_periods();
    let cov = channel.covariance.as_ref();
    let template = &channel.spectrum;
    let trial = |seed: u64| -> Result<f64> {
        let realization = null_model.realize(template, seed)?;
        Ok(detector.scan(&realization, cov, periods)?.value)
    };
    engine.calibrate(trial, repetitions)
}

fn run_cell(
    protocol: &Protocol,
    datasets: &[DatasetInput],
    map_pairs: &[MapPairInput],
    cell: &StressCell,
    cell_seed: u64,
    parallel: bool,
    cancel: Option<CancelToken>,
) -> Result<TestResult> {
    let engine = McEngine {
        trials: protocol.trials(),
        seed: cell_seed,
        parallel,
        cancel,
    };

    match &cell.kind {
        CellKind::Comb {
            ell_range,
            whitening,
            null_model,
        } => {
            let channel = datasets
                .iter()
                .find(|d| d.name == cell.dataset)
                .and_then(|d| d.channels.iter().find(|c| c.name == cell.channel))
                .ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "cell {} references unknown channel {}/{}",
                        cell.name, cell.dataset, cell.channel
                    ))
                })?;

            let detector = CombDetector {
                ell_range: *ell_range,
                whitening: *whitening,
                smoothing_halfwidth: protocol.smoothing_halfwidth(),
                strict: protocol.strict(),
            };
            let periods = protocol.target_periods();
            let cov = channel.covariance.as_ref();
            let observed = detector.scan(&channel.spectrum, cov, periods)?;

            let template = &channel.spectrum;
            let trial = |seed: u64| -> Result<f64> {
                let realization = null_model.realize(template, seed)?;
                Ok(detector.scan(&realization, cov, periods)?.value)
            };

            engine.run(
                &cell.name,
                observed.value,
                trial,
                protocol,
                ResultContext {
                    manifest_digests: template
                        .provenance()
                        .map(|d| vec![d.to_string()])
                        .unwrap_or_default(),
                    null_model: null_model.label(),
                    reduced_rigor: observed.reduced_rigor,
                },
            )
        }
        CellKind::Coherence {
            window,
            map_null,
            target_freq,
        } => {
            let pair = map_pairs
                .iter()
                .find(|p| p.name == cell.dataset)
                .ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "cell {} references unknown map pair {}",
                        cell.name, cell.dataset
                    ))
                })?;

            let coherence = CoherenceEngine { window: *window };
            let observed =
                coherence.statistic(&pair.channel_a, &pair.channel_b, *target_freq)?;

            // Matched null: channel B is replaced by its null realization,
            // channel A stays fixed, geometry unchanged.
            let trial = |seed: u64| -> Result<f64> {
                let null_b = map_null.realize(&pair.channel_b, seed)?;
                coherence.statistic(&pair.channel_a, &null_b, *target_freq)
            };

            engine.run(
                &cell.name,
                observed,
                trial,
                protocol,
                ResultContext {
                    manifest_digests: pair.digests.clone(),
                    null_model: map_null.label().to_string(),
                    reduced_rigor: false,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::Units;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise_channel(name: &str, n: usize, seed: u64) -> ChannelInput {
        let mut rng = StdRng::seed_from_u64(seed);
        let ells: Vec<u32> = (2..2 + n as u32).collect();
        let values: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        ChannelInput {
            name: name.to_string(),
            spectrum: Spectrum::new(ells, values, None, Units::Dimensionless).unwrap(),
            covariance: None,
        }
    }

    fn small_protocol() -> Protocol {
        Protocol::builder("stress-unit")
            .target_periods(vec![32.0])
            .ell_ranges(vec![(2, 129), (130, 257)])
            .whitening_modes(vec![WhiteningMode::None])
            .null_models(vec![
                NullModel::PhaseShuffle,
                NullModel::BlockShuffle { block_len: 16 },
            ])
            .trials(50)
            .seed(99)
            .build()
            .unwrap()
    }

    fn datasets() -> Vec<DatasetInput> {
        vec![DatasetInput {
            name: "sim".to_string(),
            channels: vec![noise_channel("TT", 256, 1), noise_channel("EE", 256, 2)],
        }]
    }

    #[test]
    fn test_plan_covers_cross_product() {
        let p = small_protocol();
        let plan = build_plan(&p, &datasets(), &[]);
        // 1 dataset x 2 channels x 2 ranges x 1 whitening x 2 nulls = 8.
        assert_eq!(plan.len(), 8);
        let names: std::collections::HashSet<_> =
            plan.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names.len(), 8, "cell names must be unique");
    }

    #[test]
    fn test_unlocked_protocol_refused() {
        let p = small_protocol();
        let r = run_matrix(&p, &datasets(), &[], false, None);
        assert!(matches!(r, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_matrix_preserves_every_cell() {
        let mut p = small_protocol();
        p.lock().unwrap();
        let outcomes = run_matrix(&p, &datasets(), &[], false, None).unwrap();
        assert_eq!(outcomes.len(), build_plan(&p, &datasets(), &[]).len());
    }

    #[test]
    fn test_failing_cell_does_not_abort_siblings() {
        // Block-shuffle with an oversized block fails on 256 multipoles
        // restricted to a 128-wide range; phase-shuffle cells still run.
        let mut p = Protocol::builder("stress-unit")
            .target_periods(vec![32.0])
            .ell_ranges(vec![(2, 129)])
            .whitening_modes(vec![WhiteningMode::None])
            .null_models(vec![
                NullModel::PhaseShuffle,
                NullModel::BlockShuffle { block_len: 500 },
            ])
            .trials(20)
            .seed(7)
            .build()
            .unwrap();
        p.lock().unwrap();
        let outcomes = run_matrix(&p, &datasets(), &[], false, None).unwrap();
        assert_eq!(outcomes.len(), 4);
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        assert_eq!(failed, 2, "both oversized block-shuffle cells fail");
        assert_eq!(succeeded, 2, "phase-shuffle cells unaffected");
    }

    #[test]
    fn test_cell_results_reproducible() {
        let mut p = small_protocol();
        p.lock().unwrap();
        let a = run_matrix(&p, &datasets(), &[], false, None).unwrap();
        let b = run_matrix(&p, &datasets(), &[], true, None).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            let (rx, ry) = (x.result.as_ref().unwrap(), y.result.as_ref().unwrap());
            assert_eq!(rx.p_value.to_bits(), ry.p_value.to_bits());
        }
    }

    #[test]
    fn test_coherence_cells_in_plan() {
        let p = small_protocol();
        let mut rng = StdRng::seed_from_u64(3);
        let map =
            SkyMap::new(64, 64, (0..4096).map(|_| rng.gen_range(-1.0..1.0)).collect())
                .unwrap();
        let pairs = vec![MapPairInput {
            name: "maps".to_string(),
            channel_a: map.clone(),
            channel_b: map,
            digests: vec![],
        }];
        let plan = build_plan(&p, &[], &pairs);
        // 1 pair x 2 map nulls (the default axis) x 1 period = 2 cells.
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|c| matches!(c.kind, CellKind::Coherence { .. })));

        // The map-null axis comes from the protocol, not a built-in list.
        let narrowed = small_protocol()
            .amend()
            .map_nulls(vec![MapNull::Roll])
            .build()
            .unwrap();
        let plan = build_plan(&narrowed, &[], &pairs);
        assert_eq!(plan.len(), 1);
        assert!(plan.iter().all(|c| matches!(
            c.kind,
            CellKind::Coherence {
                map_null: MapNull::Roll,
                ..
            }
        )));
    }

    #[test]
    fn test_cancellation_aborts_whole_matrix() {
        let mut p = small_protocol();
        p.lock().unwrap();
        let planned = build_plan(&p, &datasets(), &[]).len();
        let token = CancelToken::new();
        token.cancel();
        let r = run_matrix(&p, &datasets(), &[], false, Some(token));
        match r {
            Err(PipelineError::Cancelled {
                completed_trials,
                total_trials,
            }) => {
                assert_eq!(completed_trials, 0);
                assert_eq!(total_trials, planned);
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
