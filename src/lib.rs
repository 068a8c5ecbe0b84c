//! comb-hunt: falsification-oriented search for periodic comb structure in
//! CMB angular power spectra.
//!
//! The pipeline takes a pre-registered protocol and a hashed dataset and
//! produces a reproducible significance verdict:
//!
//! 1. Loader validates and hashes input files into a manifest
//! 2. Null-model generators produce synthetic realizations under an explicit
//!    null hypothesis (phase-shuffle, block-shuffle, synthetic Gaussian)
//! 3. The comb detector and the segmented cross-spectrum coherence engine
//!    reduce a spectrum/map pair to a scalar statistic
//! 4. The Monte-Carlo engine calibrates the observed statistic against N
//!    null trials into a p-value and z-score
//! 5. The stress orchestrator repeats the pairing across whitening modes,
//!    disjoint multipole ranges, channels, datasets, and null models
//! 6. The verdict aggregator combines every cell outcome, favorable or not,
//!    under the pre-registered combination rule
//!
//! Every tunable parameter lives in a locked `Protocol`; a locked protocol
//! cannot be edited, only amended into a new version with its own identifier.

pub mod coherence;
pub mod comb;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod montecarlo;
pub mod nullmodel;
pub mod protocol;
pub mod report;
pub mod spectrum;
pub mod stress;
pub mod verdict;
