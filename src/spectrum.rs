//! Core data types: angular power spectra, covariance matrices, sky maps.
//!
//! A `Spectrum` is immutable once constructed: the strictly-increasing
//! multipole grid and finiteness of every value are enforced at the
//! constructor, and derived objects (`restrict`, whitened residuals) carry
//! the parent's provenance digest forward.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Units a spectrum's values can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    /// Thermodynamic microkelvin squared.
    MicroKelvinSquared,
    /// Dimensionless (already whitened or ratio-valued).
    Dimensionless,
}

impl Units {
    pub fn label(&self) -> &'static str {
        match self {
            Units::MicroKelvinSquared => "uK^2",
            Units::Dimensionless => "dimensionless",
        }
    }

    /// Parse a `# units=` header declaration.
    pub fn parse(s: &str) -> Option<Units> {
        match s.trim() {
            "uK^2" | "uK2" | "muK^2" => Some(Units::MicroKelvinSquared),
            "dimensionless" | "1" | "none" => Some(Units::Dimensionless),
            _ => None,
        }
    }
}

/// An angular power spectrum: ordered (ell, C_ell, optional sigma) triples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spectrum {
    ells: Vec<u32>,
    values: Vec<f64>,
    sigmas: Option<Vec<f64>>,
    units: Units,
    /// Manifest digest of the file this spectrum (or its parent) came from.
    provenance: Option<String>,
}

impl Spectrum {
    /// Construct a spectrum, enforcing the grid and finiteness invariants.
    pub fn new(
        ells: Vec<u32>,
        values: Vec<f64>,
        sigmas: Option<Vec<f64>>,
        units: Units,
    ) -> Result<Self> {
        if ells.len() != values.len() {
            return Err(PipelineError::Configuration(format!(
                "ell grid has {} entries but values has {}",
                ells.len(),
                values.len()
            )));
        }
        if let Some(s) = &sigmas {
            if s.len() != ells.len() {
                return Err(PipelineError::Configuration(format!(
                    "ell grid has {} entries but sigmas has {}",
                    ells.len(),
                    s.len()
                )));
            }
        }
        for i in 1..ells.len() {
            if ells[i] <= ells[i - 1] {
                return Err(PipelineError::Configuration(format!(
                    "multipole grid not strictly increasing at index {} ({} after {})",
                    i,
                    ells[i],
                    ells[i - 1]
                )));
            }
        }
        for (i, v) in values.iter().enumerate() {
            if !v.is_finite() {
                return Err(PipelineError::NonFinite {
                    stage: "spectrum values",
                    index: i,
                });
            }
        }
        if let Some(s) = &sigmas {
            for (i, v) in s.iter().enumerate() {
                if !v.is_finite() || *v < 0.0 {
                    return Err(PipelineError::NonFinite {
                        stage: "spectrum sigmas",
                        index: i,
                    });
                }
            }
        }
        Ok(Spectrum {
            ells,
            values,
            sigmas,
            units,
            provenance: None,
        })
    }

    /// Attach the manifest digest of the originating file.
    pub fn with_provenance(mut self, digest: impl Into<String>) -> Self {
        self.provenance = Some(digest.into());
        self
    }

    pub fn len(&self) -> usize {
        self.ells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ells.is_empty()
    }

    pub fn ells(&self) -> &[u32] {
        &self.ells
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn sigmas(&self) -> Option<&[f64]> {
        self.sigmas.as_deref()
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn provenance(&self) -> Option<&str> {
        self.provenance.as_deref()
    }

    /// New spectrum restricted to `lo <= ell <= hi`, keeping provenance.
    pub fn restrict(&self, lo: u32, hi: u32) -> Result<Spectrum> {
        let idx: Vec<usize> = self
            .ells
            .iter()
            .enumerate()
            .filter(|(_, &l)| l >= lo && l <= hi)
            .map(|(i, _)| i)
            .collect();
        if idx.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "restriction [{lo}, {hi}] leaves no multipoles (grid spans {}..={})",
                self.ells.first().copied().unwrap_or(0),
                self.ells.last().copied().unwrap_or(0)
            )));
        }
        Ok(Spectrum {
            ells: idx.iter().map(|&i| self.ells[i]).collect(),
            values: idx.iter().map(|&i| self.values[i]).collect(),
            sigmas: self
                .sigmas
                .as_ref()
                .map(|s| idx.iter().map(|&i| s[i]).collect()),
            units: self.units,
            provenance: self.provenance.clone(),
        })
    }

    /// Replace the value sequence, keeping grid, sigmas and provenance.
    ///
    /// Used by null-model generators: the realization lives on the same grid
    /// as its template. Finiteness is re-checked.
    pub fn with_values(&self, values: Vec<f64>) -> Result<Spectrum> {
        if values.len() != self.ells.len() {
            return Err(PipelineError::Configuration(format!(
                "replacement values length {} != grid length {}",
                values.len(),
                self.ells.len()
            )));
        }
        for (i, v) in values.iter().enumerate() {
            if !v.is_finite() {
                return Err(PipelineError::NonFinite {
                    stage: "null realization",
                    index: i,
                });
            }
        }
        Ok(Spectrum {
            ells: self.ells.clone(),
            values,
            sigmas: self.sigmas.clone(),
            units: self.units,
            provenance: self.provenance.clone(),
        })
    }
}

/// Symmetric positive semi-definite covariance on a spectrum's ell grid.
///
/// Symmetry and positive semi-definiteness are checked at construction, not
/// assumed: the PSD check is an attempted Cholesky factorization, whose
/// lower-triangular factor is kept for whitening solves.
#[derive(Debug, Clone)]
pub struct CovarianceMatrix {
    ells: Vec<u32>,
    /// Row-major n x n matrix.
    data: Vec<f64>,
    /// Cached Cholesky factor (lower triangular, row-major).
    chol: Vec<f64>,
}

impl CovarianceMatrix {
    /// Construct from a row-major square matrix on the given ell grid.
    pub fn new(ells: Vec<u32>, data: Vec<f64>) -> Result<Self> {
        let n = ells.len();
        if data.len() != n * n {
            return Err(PipelineError::Configuration(format!(
                "covariance has {} entries, expected {}x{}",
                data.len(),
                n,
                n
            )));
        }
        for (i, v) in data.iter().enumerate() {
            if !v.is_finite() {
                return Err(PipelineError::NonFinite {
                    stage: "covariance",
                    index: i,
                });
            }
        }
        // Symmetry to a relative tolerance.
        for i in 0..n {
            for j in (i + 1)..n {
                let a = data[i * n + j];
                let b = data[j * n + i];
                let scale = a.abs().max(b.abs()).max(1e-300);
                if (a - b).abs() / scale > 1e-8 {
                    return Err(PipelineError::Configuration(format!(
                        "covariance not symmetric at ({i}, {j}): {a} vs {b}"
                    )));
                }
            }
        }
        let chol = cholesky_lower(&data, n)?;
        Ok(CovarianceMatrix { ells, data, chol })
    }

    pub fn dim(&self) -> usize {
        self.ells.len()
    }

    pub fn ells(&self) -> &[u32] {
        &self.ells
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.dim() + j]
    }

    /// Whiten a residual vector: solve `L y = r` for the Cholesky factor L.
    ///
    /// The result has unit variance per element when the covariance model is
    /// correct.
    pub fn whiten(&self, residuals: &[f64]) -> Result<Vec<f64>> {
        let n = self.dim();
        if residuals.len() != n {
            return Err(PipelineError::Configuration(format!(
                "residual length {} != covariance dim {}",
                residuals.len(),
                n
            )));
        }
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut acc = residuals[i];
            for j in 0..i {
                acc -= self.chol[i * n + j] * y[j];
            }
            let d = self.chol[i * n + i];
            y[i] = acc / d;
        }
        Ok(y)
    }

    /// Extract the diagonal as per-ell sigmas.
    pub fn diagonal_sigmas(&self) -> Vec<f64> {
        (0..self.dim()).map(|i| self.get(i, i).sqrt()).collect()
    }

    /// Sub-matrix covering `lo <= ell <= hi`.
    pub fn restrict(&self, lo: u32, hi: u32) -> Result<CovarianceMatrix> {
        let idx: Vec<usize> = self
            .ells
            .iter()
            .enumerate()
            .filter(|(_, &l)| l >= lo && l <= hi)
            .map(|(i, _)| i)
            .collect();
        if idx.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "covariance restriction [{lo}, {hi}] is empty"
            )));
        }
        let n = self.dim();
        let m = idx.len();
        let mut data = vec![0.0; m * m];
        for (a, &i) in idx.iter().enumerate() {
            for (b, &j) in idx.iter().enumerate() {
                data[a * m + b] = self.data[i * n + j];
            }
        }
        CovarianceMatrix::new(idx.iter().map(|&i| self.ells[i]).collect(), data)
    }
}

/// Cholesky factorization with a small diagonal tolerance.
///
/// Fails with `CovarianceNotPsd` naming the offending pivot when the matrix
/// is not positive semi-definite (within tolerance).
fn cholesky_lower(data: &[f64], n: usize) -> Result<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    let max_diag = (0..n)
        .map(|i| data[i * n + i].abs())
        .fold(0.0f64, f64::max)
        .max(1e-300);
    let tol = max_diag * 1e-12;
    for i in 0..n {
        for j in 0..=i {
            let mut acc = data[i * n + j];
            for k in 0..j {
                acc -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if acc < -tol {
                    return Err(PipelineError::CovarianceNotPsd {
                        pivot: i,
                        value: acc,
                    });
                }
                // Clamp tiny negative pivots from rounding; keep strictly
                // positive so whitening solves stay finite.
                l[i * n + i] = acc.max(tol).sqrt();
            } else {
                l[i * n + j] = acc / l[j * n + j];
            }
        }
    }
    Ok(l)
}

/// A 2D pixelized sky map, row-major.
#[derive(Debug, Clone)]
pub struct SkyMap {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl SkyMap {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != width * height {
            return Err(PipelineError::Configuration(format!(
                "map data length {} != {}x{}",
                data.len(),
                width,
                height
            )));
        }
        for (i, v) in data.iter().enumerate() {
            if !v.is_finite() {
                return Err(PipelineError::NonFinite {
                    stage: "sky map",
                    index: i,
                });
            }
        }
        Ok(SkyMap {
            width,
            height,
            data,
        })
    }

    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ells: Vec<u32>, values: Vec<f64>) -> Spectrum {
        Spectrum::new(ells, values, None, Units::MicroKelvinSquared).unwrap()
    }

    #[test]
    fn test_spectrum_rejects_unsorted_ells() {
        let r = Spectrum::new(
            vec![2, 5, 4],
            vec![1.0, 2.0, 3.0],
            None,
            Units::MicroKelvinSquared,
        );
        assert!(matches!(r, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_spectrum_rejects_duplicate_ells() {
        let r = Spectrum::new(
            vec![2, 3, 3],
            vec![1.0, 2.0, 3.0],
            None,
            Units::MicroKelvinSquared,
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_spectrum_rejects_nan() {
        let r = Spectrum::new(
            vec![2, 3, 4],
            vec![1.0, f64::NAN, 3.0],
            None,
            Units::MicroKelvinSquared,
        );
        assert!(matches!(r, Err(PipelineError::NonFinite { .. })));
    }

    #[test]
    fn test_restrict_keeps_provenance() {
        let s = spec((2..50).collect(), (2..50).map(|x| x as f64).collect())
            .with_provenance("abc123");
        let r = s.restrict(10, 20).unwrap();
        assert_eq!(r.provenance(), Some("abc123"));
        assert_eq!(r.ells().first(), Some(&10));
        assert_eq!(r.ells().last(), Some(&20));
    }

    #[test]
    fn test_restrict_empty_is_error() {
        let s = spec(vec![2, 3, 4], vec![1.0, 2.0, 3.0]);
        assert!(s.restrict(100, 200).is_err());
    }

    #[test]
    fn test_covariance_rejects_asymmetry() {
        let r = CovarianceMatrix::new(vec![2, 3], vec![1.0, 0.5, 0.1, 1.0]);
        assert!(r.is_err());
    }

    #[test]
    fn test_covariance_rejects_non_psd() {
        // Symmetric but indefinite: eigenvalues 3 and -1.
        let r = CovarianceMatrix::new(vec![2, 3], vec![1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(r, Err(PipelineError::CovarianceNotPsd { .. })));
    }

    #[test]
    fn test_covariance_whiten_identity() {
        let n = 4;
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 4.0;
        }
        let cov = CovarianceMatrix::new(vec![2, 3, 4, 5], data).unwrap();
        let w = cov.whiten(&[2.0, 2.0, 2.0, 2.0]).unwrap();
        // sigma = 2 everywhere, so whitened residuals are all 1.
        for v in w {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_covariance_diagonal_sigmas() {
        let cov =
            CovarianceMatrix::new(vec![2, 3], vec![9.0, 0.0, 0.0, 16.0]).unwrap();
        assert_eq!(cov.diagonal_sigmas(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_sky_map_shape_check() {
        assert!(SkyMap::new(3, 3, vec![0.0; 8]).is_err());
        assert!(SkyMap::new(3, 3, vec![0.0; 9]).is_ok());
    }

    #[test]
    fn test_units_parse() {
        assert_eq!(Units::parse("uK^2"), Some(Units::MicroKelvinSquared));
        assert_eq!(Units::parse("dimensionless"), Some(Units::Dimensionless));
        assert_eq!(Units::parse("furlongs"), None);
    }
}
