//! Verdict aggregation.
//!
//! Folds the full stress matrix into one headline verdict under the
//! pre-registered combination rule, without discarding anything: every cell
//! outcome (passing, failing, inconclusive, or errored) is retained in the
//! combined record exactly as the matrix produced it. A null result is a
//! first-class outcome, reported with the same detail as a candidate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::montecarlo::TestVerdict;
use crate::protocol::{CombinationRule, Protocol};
use crate::stress::CellOutcome;

/// Headline outcome of a full stress run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Enough independent cells passed under the pre-registered rule.
    Candidate,
    /// The pre-registered rule was not met. This is a result, not an error.
    Null,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Candidate => "CANDIDATE",
            Verdict::Null => "NULL",
        }
    }
}

/// The complete record of a stress run: rule, tallies, headline verdict, and
/// every cell outcome verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedVerdict {
    pub protocol_id: String,
    pub rule: CombinationRule,
    pub verdict: Verdict,
    pub passing: usize,
    pub failing: usize,
    pub inconclusive: usize,
    pub errored: usize,
    /// Smallest p-value across non-errored cells, if any ran.
    pub min_p_value: Option<f64>,
    pub generated_at: DateTime<Utc>,
    pub cells: Vec<CellOutcome>,
}

/// Apply the protocol's combination rule to a completed matrix.
///
/// Errored and inconclusive cells never count toward `min_passing`; they are
/// tallied and carried through so the record shows exactly what the rule was
/// applied to.
pub fn combine(protocol: &Protocol, cells: Vec<CellOutcome>) -> Result<CombinedVerdict> {
    if cells.is_empty() {
        return Err(PipelineError::Configuration(
            "cannot combine an empty stress matrix".to_string(),
        ));
    }
    let rule = protocol.combination();

    let mut passing = 0;
    let mut failing = 0;
    let mut inconclusive = 0;
    let mut errored = 0;
    let mut min_p_value: Option<f64> = None;
    for cell in &cells {
        match &cell.result {
            Ok(r) => {
                match r.verdict {
                    TestVerdict::Pass => passing += 1,
                    TestVerdict::Fail => failing += 1,
                    TestVerdict::Inconclusive => inconclusive += 1,
                }
                min_p_value = Some(match min_p_value {
                    Some(m) => m.min(r.p_value),
                    None => r.p_value,
                });
            }
            Err(_) => errored += 1,
        }
    }

    let verdict = if passing >= rule.min_passing {
        Verdict::Candidate
    } else {
        Verdict::Null
    };
    log::info!(
        "combined verdict {}: {passing} pass / {failing} fail / \
         {inconclusive} inconclusive / {errored} errored (rule: {} of {} at p<{})",
        verdict.label(),
        rule.min_passing,
        cells.len(),
        rule.p_threshold
    );

    Ok(CombinedVerdict {
        protocol_id: protocol.id(),
        rule,
        verdict,
        passing,
        failing,
        inconclusive,
        errored,
        min_p_value,
        generated_at: Utc::now(),
        cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::montecarlo::{NullSummary, TestResult};
    use crate::protocol::{CombinationRule, Tier};
    use crate::stress::{CellKind, StressCell};
    use crate::nullmodel::NullModel;
    use crate::protocol::WhiteningMode;

    fn cell(name: &str) -> StressCell {
        StressCell {
            name: name.to_string(),
            dataset: "sim".to_string(),
            channel: "TT".to_string(),
            kind: CellKind::Comb {
                ell_range: (2, 1024),
                whitening: WhiteningMode::None,
                null_model: NullModel::PhaseShuffle,
            },
        }
    }

    fn outcome(name: &str, p: f64, verdict: TestVerdict) -> CellOutcome {
        CellOutcome {
            cell: cell(name),
            result: Ok(TestResult {
                test_name: name.to_string(),
                protocol_id: "x-v1-0".to_string(),
                manifest_digests: vec![],
                null_model: "phase-shuffle".to_string(),
                seed: 0,
                observed: 5.0,
                null: NullSummary {
                    count: 100,
                    mean: 1.0,
                    std: 0.5,
                },
                p_value: p,
                z_score: 8.0,
                tier: Tier::Significant,
                verdict,
                reduced_rigor: false,
                strict_mode: false,
            }),
        }
    }

    fn errored(name: &str) -> CellOutcome {
        CellOutcome {
            cell: cell(name),
            result: Err("covariance not symmetric at (0, 1): 1 vs 2".to_string()),
        }
    }

    fn protocol(min_passing: usize) -> Protocol {
        Protocol::builder("verdict-unit")
            .combination(CombinationRule {
                min_passing,
                p_threshold: 0.01,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_candidate_when_rule_met() {
        let cells = vec![
            outcome("a", 0.002, TestVerdict::Pass),
            outcome("b", 0.005, TestVerdict::Pass),
            outcome("c", 0.4, TestVerdict::Fail),
        ];
        let v = combine(&protocol(2), cells).unwrap();
        assert_eq!(v.verdict, Verdict::Candidate);
        assert_eq!((v.passing, v.failing), (2, 1));
        assert_eq!(v.min_p_value, Some(0.002));
    }

    #[test]
    fn test_null_when_too_few_pass() {
        let cells = vec![
            outcome("a", 0.002, TestVerdict::Pass),
            outcome("b", 0.3, TestVerdict::Fail),
        ];
        let v = combine(&protocol(2), cells).unwrap();
        assert_eq!(v.verdict, Verdict::Null);
    }

    #[test]
    fn test_errored_cells_never_count_as_passing() {
        let cells = vec![
            outcome("a", 0.002, TestVerdict::Pass),
            errored("b"),
            errored("c"),
        ];
        let v = combine(&protocol(2), cells).unwrap();
        assert_eq!(v.verdict, Verdict::Null);
        assert_eq!(v.errored, 2);
    }

    #[test]
    fn test_inconclusive_never_counts_as_passing() {
        let cells = vec![
            outcome("a", 0.002, TestVerdict::Pass),
            outcome("b", 0.002, TestVerdict::Inconclusive),
        ];
        let v = combine(&protocol(2), cells).unwrap();
        assert_eq!(v.verdict, Verdict::Null);
        assert_eq!(v.inconclusive, 1);
    }

    #[test]
    fn test_every_cell_retained_verbatim() {
        let cells = vec![
            outcome("a", 0.002, TestVerdict::Pass),
            errored("b"),
            outcome("c", 0.9, TestVerdict::Fail),
        ];
        let v = combine(&protocol(1), cells).unwrap();
        assert_eq!(v.cells.len(), 3);
        assert_eq!(v.cells[1].cell.name, "b");
        assert!(v.cells[1].result.is_err());
    }

    #[test]
    fn test_empty_matrix_rejected() {
        assert!(combine(&protocol(1), vec![]).is_err());
    }
}
