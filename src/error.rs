//! Pipeline error taxonomy.
//!
//! Every failure the pipeline can produce is a named variant here. Input
//! errors fire before any statistic is computed; configuration errors are
//! never silently substituted; numerical and reproducibility errors carry
//! the stage that raised them.

use std::path::PathBuf;

/// Errors raised by any stage of the detection pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// File content does not parse as the expected columnar format.
    #[error("malformed input {path} (line {line}): {reason}")]
    MalformedInput {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// File header looks like markup, i.e. an accidental HTML download.
    #[error("{path} looks like an HTML/markup document, not numeric columns (leading bytes: {head:?})")]
    LikelyHtml { path: PathBuf, head: String },

    /// Declared units disagree with what the caller expected.
    #[error("{path}: declared units '{found}' but expected '{expected}'")]
    UnitMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Recomputed digest disagrees with a previously recorded one.
    #[error("{path}: sha256 {actual} does not match recorded {expected}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Multipole range too short for the requested comb period.
    #[error("multipole range width {range_width} cannot test period {period} (need >= {needed})")]
    InsufficientRange {
        period: f64,
        range_width: u32,
        needed: u32,
    },

    /// A requested configuration is inapplicable to the data at hand.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An edit was attempted on a locked protocol.
    #[error("protocol {id} is locked (since {locked_at}); amend into a new version instead")]
    ProtocolLocked { id: String, locked_at: String },

    /// Non-finite value entered a statistic.
    #[error("non-finite value at {stage} (index {index})")]
    NonFinite { stage: &'static str, index: usize },

    /// Covariance matrix failed the positive semi-definiteness check.
    #[error("covariance matrix is not positive semi-definite (pivot {pivot} = {value})")]
    CovarianceNotPsd { pivot: usize, value: f64 },

    /// A rerun with identical inputs produced a different result.
    #[error("reproducibility guard failed at {stage}: {expected} != {actual}")]
    Reproducibility {
        stage: &'static str,
        expected: f64,
        actual: f64,
    },

    /// Run cancelled cooperatively; partial results were discarded.
    #[error("cancelled after {completed_trials} of {total_trials} trials; partial results discarded")]
    Cancelled {
        completed_trials: usize,
        total_trials: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
