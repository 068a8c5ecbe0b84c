//! Pre-registered analysis protocols.
//!
//! A `Protocol` freezes every tunable parameter of a run: target periods,
//! multipole ranges, whitening mode, segmentation windows, null models,
//! trial count, master seed, significance tiers, and the combination rule.
//! Locking stamps the protocol exactly once; after that no field can be
//! edited — `amend()` is the only way forward, and it produces version+1
//! with its own identifier. This is the anti-p-hacking mechanism: results
//! are only accepted against a locked protocol, and the identifier pins the
//! exact parameter set that produced them.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::nullmodel::{MapNull, NullModel};

/// How residuals are whitened before the comb statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WhiteningMode {
    /// Raw residuals, no scaling.
    None,
    /// Divide by the per-ell sigma (diagonal covariance).
    Diagonal,
    /// Cholesky whitening applied per contiguous block of this width.
    BlockDiagonal { block: usize },
    /// Cholesky whitening with the full covariance matrix.
    FullCovariance,
}

impl WhiteningMode {
    pub fn label(&self) -> String {
        match self {
            WhiteningMode::None => "none".to_string(),
            WhiteningMode::Diagonal => "diagonal".to_string(),
            WhiteningMode::BlockDiagonal { block } => format!("block-diagonal/{block}"),
            WhiteningMode::FullCovariance => "full-covariance".to_string(),
        }
    }
}

/// Per-segment taper applied before the 2D transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Taper {
    None,
    Hann,
}

/// Segmentation geometry for the cross-spectrum engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window side length in pixels.
    pub size: usize,
    /// Step between window origins; `size / 2` gives 50% overlap.
    pub stride: usize,
    pub taper: Taper,
}

/// Significance tier thresholds (one-sided p-value boundaries).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignificanceTiers {
    pub highly_significant: f64,
    pub significant: f64,
    pub marginal: f64,
}

impl SignificanceTiers {
    /// Conventional 0.001 / 0.01 / 0.05 boundaries.
    pub fn conventional() -> Self {
        SignificanceTiers {
            highly_significant: 0.001,
            significant: 0.01,
            marginal: 0.05,
        }
    }

    pub fn classify(&self, p: f64) -> Tier {
        if p < self.highly_significant {
            Tier::HighlySignificant
        } else if p < self.significant {
            Tier::Significant
        } else if p < self.marginal {
            Tier::Marginal
        } else {
            Tier::NotSignificant
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    HighlySignificant,
    Significant,
    Marginal,
    NotSignificant,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::HighlySignificant => "highly-significant",
            Tier::Significant => "significant",
            Tier::Marginal => "marginal",
            Tier::NotSignificant => "not-significant",
        }
    }
}

/// Pre-registered rule combining stress-test cells into one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinationRule {
    /// Minimum number of cells that must pass.
    pub min_passing: usize,
    /// Per-cell one-sided p-value threshold for a PASS.
    pub p_threshold: f64,
}

/// An immutable, versioned record of all tunable run parameters.
///
/// Fields are private; construction goes through `ProtocolBuilder`, edits
/// through the checked setters (which refuse once locked), and new versions
/// through `amend()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    name: String,
    version: u32,
    target_periods: Vec<f64>,
    ell_ranges: Vec<(u32, u32)>,
    /// Whitening axis of the stress matrix; every mode listed here is a
    /// pre-registered falsification attempt.
    whitening_modes: Vec<WhiteningMode>,
    window: WindowConfig,
    null_models: Vec<NullModel>,
    /// Null models for the map-domain coherence cells; pre-registered like
    /// the spectrum-domain axis.
    map_nulls: Vec<MapNull>,
    trials: usize,
    seed: u64,
    tiers: SignificanceTiers,
    combination: CombinationRule,
    /// Half-width of the moving-average baseline subtracted before the comb
    /// statistic.
    smoothing_halfwidth: usize,
    /// Strict mode: missing optional inputs are errors, never fallbacks.
    strict: bool,
    /// Set exactly once; presence means the protocol is locked.
    locked_at: Option<DateTime<Utc>>,
}

impl Protocol {
    pub fn builder(name: impl Into<String>) -> ProtocolBuilder {
        ProtocolBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn target_periods(&self) -> &[f64] {
        &self.target_periods
    }

    pub fn ell_ranges(&self) -> &[(u32, u32)] {
        &self.ell_ranges
    }

    pub fn whitening_modes(&self) -> &[WhiteningMode] {
        &self.whitening_modes
    }

    pub fn window(&self) -> WindowConfig {
        self.window
    }

    pub fn null_models(&self) -> &[NullModel] {
        &self.null_models
    }

    pub fn map_nulls(&self) -> &[MapNull] {
        &self.map_nulls
    }

    pub fn trials(&self) -> usize {
        self.trials
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tiers(&self) -> SignificanceTiers {
        self.tiers
    }

    pub fn combination(&self) -> CombinationRule {
        self.combination
    }

    pub fn smoothing_halfwidth(&self) -> usize {
        self.smoothing_halfwidth
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
    }

    /// Identifier: name, version, and a digest of every parameter field.
    ///
    /// The lock timestamp is excluded so the identifier is stable across
    /// locking; any parameter change produces a different identifier.
    pub fn id(&self) -> String {
        let mut unlocked = self.clone();
        unlocked.locked_at = None;
        let canonical =
            serde_json::to_string(&unlocked).expect("protocol serialization cannot fail");
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{}-v{}-{}", self.name, self.version, &hex[..16])
    }

    /// Stamp the lock timestamp. Exactly once.
    pub fn lock(&mut self) -> Result<()> {
        if let Some(at) = self.locked_at {
            return Err(PipelineError::ProtocolLocked {
                id: self.id(),
                locked_at: at.to_rfc3339(),
            });
        }
        self.locked_at = Some(Utc::now());
        log::info!("protocol {} locked", self.id());
        Ok(())
    }

    fn ensure_unlocked(&self) -> Result<()> {
        match self.locked_at {
            Some(at) => Err(PipelineError::ProtocolLocked {
                id: self.id(),
                locked_at: at.to_rfc3339(),
            }),
            None => Ok(()),
        }
    }

    // Checked setters: each refuses once the protocol is locked.

    pub fn set_trials(&mut self, trials: usize) -> Result<()> {
        self.ensure_unlocked()?;
        self.trials = trials;
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) -> Result<()> {
        self.ensure_unlocked()?;
        self.seed = seed;
        Ok(())
    }

    pub fn set_target_periods(&mut self, periods: Vec<f64>) -> Result<()> {
        self.ensure_unlocked()?;
        self.target_periods = periods;
        Ok(())
    }

    pub fn set_ell_ranges(&mut self, ranges: Vec<(u32, u32)>) -> Result<()> {
        self.ensure_unlocked()?;
        self.ell_ranges = ranges;
        Ok(())
    }

    pub fn set_whitening_modes(&mut self, modes: Vec<WhiteningMode>) -> Result<()> {
        self.ensure_unlocked()?;
        self.whitening_modes = modes;
        Ok(())
    }

    pub fn set_strict(&mut self, strict: bool) -> Result<()> {
        self.ensure_unlocked()?;
        self.strict = strict;
        Ok(())
    }

    /// Start a new version from this protocol's parameters.
    ///
    /// The amended protocol is unlocked, carries version+1, and will have a
    /// distinct identifier once any field changes.
    pub fn amend(&self) -> ProtocolBuilder {
        ProtocolBuilder {
            inner: Protocol {
                version: self.version + 1,
                locked_at: None,
                ..self.clone()
            },
        }
    }

    /// Append this protocol to a JSONL store. Append-only: existing records
    /// are never rewritten.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(self)?)?;
        Ok(())
    }

    /// Read the most recent protocol record from a JSONL store.
    pub fn read_latest(path: &Path) -> Result<Protocol> {
        let file = File::open(path)?;
        let mut last: Option<Protocol> = None;
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let p: Protocol =
                serde_json::from_str(&line).map_err(|e| PipelineError::MalformedInput {
                    path: path.to_path_buf(),
                    line: i + 1,
                    reason: format!("bad protocol record: {e}"),
                })?;
            last = Some(p);
        }
        last.ok_or_else(|| PipelineError::MalformedInput {
            path: path.to_path_buf(),
            line: 0,
            reason: "empty protocol store".to_string(),
        })
    }
}

/// Builder for `Protocol`. Defaults are deliberately conservative and every
/// field can be overridden before `build()`.
pub struct ProtocolBuilder {
    inner: Protocol,
}

impl ProtocolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ProtocolBuilder {
            inner: Protocol {
                name: name.into(),
                version: 1,
                target_periods: vec![64.0],
                ell_ranges: vec![(2, 1024)],
                whitening_modes: vec![WhiteningMode::Diagonal],
                window: WindowConfig {
                    size: 32,
                    stride: 16,
                    taper: Taper::Hann,
                },
                null_models: vec![NullModel::PhaseShuffle],
                map_nulls: vec![MapNull::PhaseShuffle, MapNull::Roll],
                trials: 1000,
                seed: 0,
                tiers: SignificanceTiers::conventional(),
                combination: CombinationRule {
                    min_passing: 2,
                    p_threshold: 0.01,
                },
                smoothing_halfwidth: 15,
                strict: false,
                locked_at: None,
            },
        }
    }

    pub fn target_periods(mut self, periods: Vec<f64>) -> Self {
        self.inner.target_periods = periods;
        self
    }

    pub fn ell_ranges(mut self, ranges: Vec<(u32, u32)>) -> Self {
        self.inner.ell_ranges = ranges;
        self
    }

    pub fn whitening_modes(mut self, modes: Vec<WhiteningMode>) -> Self {
        self.inner.whitening_modes = modes;
        self
    }

    pub fn window(mut self, window: WindowConfig) -> Self {
        self.inner.window = window;
        self
    }

    pub fn null_models(mut self, models: Vec<NullModel>) -> Self {
        self.inner.null_models = models;
        self
    }

    pub fn map_nulls(mut self, nulls: Vec<MapNull>) -> Self {
        self.inner.map_nulls = nulls;
        self
    }

    pub fn trials(mut self, trials: usize) -> Self {
        self.inner.trials = trials;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.inner.seed = seed;
        self
    }

    pub fn tiers(mut self, tiers: SignificanceTiers) -> Self {
        self.inner.tiers = tiers;
        self
    }

    pub fn combination(mut self, rule: CombinationRule) -> Self {
        self.inner.combination = rule;
        self
    }

    pub fn smoothing_halfwidth(mut self, halfwidth: usize) -> Self {
        self.inner.smoothing_halfwidth = halfwidth;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.inner.strict = strict;
        self
    }

    pub fn build(self) -> Result<Protocol> {
        let p = self.inner;
        if p.target_periods.is_empty() {
            return Err(PipelineError::Configuration(
                "protocol needs at least one target period".to_string(),
            ));
        }
        if p.target_periods.iter().any(|&d| !d.is_finite() || d <= 0.0) {
            return Err(PipelineError::Configuration(
                "target periods must be finite and positive".to_string(),
            ));
        }
        if p.ell_ranges.iter().any(|&(lo, hi)| lo >= hi) {
            return Err(PipelineError::Configuration(
                "every ell range needs lo < hi".to_string(),
            ));
        }
        if p.whitening_modes.is_empty() {
            return Err(PipelineError::Configuration(
                "protocol needs at least one whitening mode".to_string(),
            ));
        }
        if p.null_models.is_empty() {
            return Err(PipelineError::Configuration(
                "protocol needs at least one null model".to_string(),
            ));
        }
        if p.map_nulls.is_empty() {
            return Err(PipelineError::Configuration(
                "protocol needs at least one map null model".to_string(),
            ));
        }
        if p.trials == 0 {
            return Err(PipelineError::Configuration(
                "trial count must be positive".to_string(),
            ));
        }
        if p.window.stride == 0 || p.window.stride > p.window.size {
            return Err(PipelineError::Configuration(format!(
                "window stride {} must be in 1..={}",
                p.window.stride, p.window.size
            )));
        }
        if p.combination.min_passing == 0 {
            return Err(PipelineError::Configuration(
                "combination rule needs min_passing >= 1".to_string(),
            ));
        }
        Ok(p)
    }
}
