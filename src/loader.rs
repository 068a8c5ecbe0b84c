//! Data provenance loader: raw file -> validated, hashed in-memory structure.
//!
//! Every load hashes the raw bytes into the manifest first, then validates
//! structure. Markup-looking files (accidental HTML downloads of a data URL)
//! are rejected with `LikelyHtml` before any numeric parsing; malformed rows
//! name the offending line. Nothing here ever best-effort-coerces: a file
//! either parses completely or the load fails.

use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::manifest::{Manifest, ManifestEntry};
use crate::spectrum::{CovarianceMatrix, SkyMap, Spectrum, Units};

/// Markup signatures checked against the leading non-whitespace bytes.
const MARKUP_SIGNATURES: &[&str] = &[
    "<!doctype", "<html", "<?xml", "<head", "<body", "<title", "<meta",
];

/// Reject files whose head looks like a markup document.
///
/// Checks the known signatures case-insensitively, plus the generic
/// "starts with `<letter`" tag shape that no columnar spectrum can have.
fn reject_markup(path: &Path, content: &str) -> Result<()> {
    let head = content.trim_start();
    let lower = head
        .chars()
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    let tag_like = {
        let mut chars = head.chars();
        chars.next() == Some('<')
            && chars.next().map(|c| c.is_ascii_alphabetic() || c == '!' || c == '?')
                == Some(true)
    };
    if tag_like || MARKUP_SIGNATURES.iter().any(|sig| lower.starts_with(sig)) {
        return Err(PipelineError::LikelyHtml {
            path: path.to_path_buf(),
            head: head.chars().take(32).collect(),
        });
    }
    Ok(())
}

/// Read a file as UTF-8 text, rejecting markup before any parsing.
fn read_validated_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let content = String::from_utf8(bytes).map_err(|e| PipelineError::MalformedInput {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("not valid UTF-8 text: {e}"),
    })?;
    reject_markup(path, &content)?;
    Ok(content)
}

/// Parse a `# key=value` header comment, returning the declared units if any.
fn declared_units(content: &str) -> Option<&str> {
    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with('#') {
            break;
        }
        if let Some(rest) = line.trim_start_matches('#').trim().strip_prefix("units=") {
            return Some(rest.trim());
        }
    }
    None
}

/// Load a columnar spectrum: `ell  C_ell  [sigma]`, `#` comments allowed.
///
/// The raw bytes are hashed into `manifest` before parsing; the returned
/// spectrum carries that digest as provenance. `expected_sha256` (from a
/// prior manifest) is enforced when given.
pub fn load_spectrum(
    path: &Path,
    expected_units: Units,
    expected_sha256: Option<&str>,
    manifest: &mut Manifest,
) -> Result<(Spectrum, ManifestEntry)> {
    let entry = manifest.ingest(path, expected_sha256)?;
    let content = read_validated_text(path)?;

    if let Some(found) = declared_units(&content) {
        let parsed = Units::parse(found);
        if parsed != Some(expected_units) {
            return Err(PipelineError::UnitMismatch {
                path: path.to_path_buf(),
                expected: expected_units.label().to_string(),
                found: found.to_string(),
            });
        }
    }

    let mut ells = Vec::new();
    let mut values = Vec::new();
    let mut sigmas: Vec<f64> = Vec::new();
    let mut columns: Option<usize> = None;

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match columns {
            None => {
                if fields.len() != 2 && fields.len() != 3 {
                    return Err(PipelineError::MalformedInput {
                        path: path.to_path_buf(),
                        line: lineno + 1,
                        reason: format!(
                            "expected 2 or 3 columns (ell, C_ell, [sigma]), found {}",
                            fields.len()
                        ),
                    });
                }
                columns = Some(fields.len());
            }
            Some(n) if fields.len() != n => {
                return Err(PipelineError::MalformedInput {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    reason: format!("expected {n} columns, found {}", fields.len()),
                });
            }
            _ => {}
        }

        let ell: u32 = fields[0].parse().map_err(|_| PipelineError::MalformedInput {
            path: path.to_path_buf(),
            line: lineno + 1,
            reason: format!("bad multipole '{}'", fields[0]),
        })?;
        let value: f64 = fields[1].parse().map_err(|_| PipelineError::MalformedInput {
            path: path.to_path_buf(),
            line: lineno + 1,
            reason: format!("bad C_ell '{}'", fields[1]),
        })?;
        if let Some(&last) = ells.last() {
            if ell <= last {
                return Err(PipelineError::MalformedInput {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    reason: format!("multipole {ell} not strictly increasing after {last}"),
                });
            }
        }
        ells.push(ell);
        values.push(value);
        if columns == Some(3) {
            let sigma: f64 =
                fields[2].parse().map_err(|_| PipelineError::MalformedInput {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    reason: format!("bad sigma '{}'", fields[2]),
                })?;
            sigmas.push(sigma);
        }
    }

    if ells.is_empty() {
        return Err(PipelineError::MalformedInput {
            path: path.to_path_buf(),
            line: 0,
            reason: "no data rows".to_string(),
        });
    }

    let sigmas = if columns == Some(3) { Some(sigmas) } else { None };
    let spectrum = Spectrum::new(ells, values, sigmas, expected_units)?
        .with_provenance(entry.sha256.clone());
    log::info!(
        "loaded spectrum {} ({} multipoles, sha256={})",
        path.display(),
        spectrum.len(),
        &entry.sha256[..16]
    );
    Ok((spectrum, entry))
}

/// Load a covariance matrix: one row of n floats per line on the given grid.
pub fn load_covariance(
    path: &Path,
    ells: &[u32],
    expected_sha256: Option<&str>,
    manifest: &mut Manifest,
) -> Result<(CovarianceMatrix, ManifestEntry)> {
    let entry = manifest.ingest(path, expected_sha256)?;
    let content = read_validated_text(path)?;
    let n = ells.len();

    let mut data = Vec::with_capacity(n * n);
    let mut rows = 0usize;
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != n {
            return Err(PipelineError::MalformedInput {
                path: path.to_path_buf(),
                line: lineno + 1,
                reason: format!("covariance row has {} entries, expected {n}", fields.len()),
            });
        }
        for f in fields {
            let v: f64 = f.parse().map_err(|_| PipelineError::MalformedInput {
                path: path.to_path_buf(),
                line: lineno + 1,
                reason: format!("bad covariance entry '{f}'"),
            })?;
            data.push(v);
        }
        rows += 1;
    }
    if rows != n {
        return Err(PipelineError::MalformedInput {
            path: path.to_path_buf(),
            line: 0,
            reason: format!("covariance has {rows} rows, expected {n}"),
        });
    }
    let cov = CovarianceMatrix::new(ells.to_vec(), data)?;
    Ok((cov, entry))
}

/// Load a 2D sky map: one row of floats per line, all rows equal length.
pub fn load_map(
    path: &Path,
    expected_sha256: Option<&str>,
    manifest: &mut Manifest,
) -> Result<(SkyMap, ManifestEntry)> {
    let entry = manifest.ingest(path, expected_sha256)?;
    let content = read_validated_text(path)?;

    let mut width: Option<usize> = None;
    let mut data = Vec::new();
    let mut height = 0usize;
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match width {
            None => width = Some(fields.len()),
            Some(w) if fields.len() != w => {
                return Err(PipelineError::MalformedInput {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                    reason: format!("map row has {} pixels, expected {w}", fields.len()),
                });
            }
            _ => {}
        }
        for f in fields {
            let v: f64 = f.parse().map_err(|_| PipelineError::MalformedInput {
                path: path.to_path_buf(),
                line: lineno + 1,
                reason: format!("bad pixel value '{f}'"),
            })?;
            data.push(v);
        }
        height += 1;
    }
    let width = width.ok_or_else(|| PipelineError::MalformedInput {
        path: path.to_path_buf(),
        line: 0,
        reason: "no data rows".to_string(),
    })?;
    let map = SkyMap::new(width, height, data)?;
    log::info!(
        "loaded map {} ({}x{}, sha256={})",
        path.display(),
        map.width,
        map.height,
        &entry.sha256[..16]
    );
    Ok((map, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_two_column_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "# units=uK^2\n2 100.0\n3 98.5\n4 95.2\n");
        let mut manifest = Manifest::new();
        let (s, entry) =
            load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest).unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s.ells(), &[2, 3, 4]);
        assert!(s.sigmas().is_none());
        assert_eq!(s.provenance(), Some(entry.sha256.as_str()));
    }

    #[test]
    fn test_load_three_column_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "2 100.0 5.0\n3 98.5 4.9\n");
        let mut manifest = Manifest::new();
        let (s, _) =
            load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest).unwrap();
        assert_eq!(s.sigmas(), Some(&[5.0, 4.9][..]));
    }

    #[test]
    fn test_html_rejected_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "cl.txt",
            "<!DOCTYPE html>\n<html><body>404 Not Found</body></html>\n",
        );
        let mut manifest = Manifest::new();
        let r = load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest);
        assert!(matches!(r, Err(PipelineError::LikelyHtml { .. })));
    }

    #[test]
    fn test_bare_tag_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "  <table>\n<tr><td>2</td></tr>\n");
        let mut manifest = Manifest::new();
        let r = load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest);
        assert!(matches!(r, Err(PipelineError::LikelyHtml { .. })));
    }

    #[test]
    fn test_unit_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "# units=dimensionless\n2 1.0\n3 1.1\n");
        let mut manifest = Manifest::new();
        let r = load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest);
        assert!(matches!(r, Err(PipelineError::UnitMismatch { .. })));
    }

    #[test]
    fn test_non_monotone_ell_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "2 1.0\n4 1.1\n3 1.2\n");
        let mut manifest = Manifest::new();
        let r = load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest);
        match r {
            Err(PipelineError::MalformedInput { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected MalformedInput, got {other:?}"),
        }
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "2 1.0 0.1\n3 1.1\n");
        let mut manifest = Manifest::new();
        let r = load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest);
        assert!(matches!(r, Err(PipelineError::MalformedInput { .. })));
    }

    #[test]
    fn test_non_numeric_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "2 one\n3 two\n");
        let mut manifest = Manifest::new();
        let r = load_spectrum(&path, Units::MicroKelvinSquared, None, &mut manifest);
        assert!(matches!(r, Err(PipelineError::MalformedInput { .. })));
    }

    #[test]
    fn test_load_covariance_square() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cov.txt", "4.0 0.0\n0.0 9.0\n");
        let mut manifest = Manifest::new();
        let (cov, _) = load_covariance(&path, &[2, 3], None, &mut manifest).unwrap();
        assert_eq!(cov.dim(), 2);
        assert_eq!(cov.diagonal_sigmas(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_load_covariance_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cov.txt", "4.0 0.0\n");
        let mut manifest = Manifest::new();
        let r = load_covariance(&path, &[2, 3], None, &mut manifest);
        assert!(matches!(r, Err(PipelineError::MalformedInput { .. })));
    }

    #[test]
    fn test_load_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "map.txt", "0.0 1.0 2.0\n3.0 4.0 5.0\n");
        let mut manifest = Manifest::new();
        let (map, _) = load_map(&path, None, &mut manifest).unwrap();
        assert_eq!((map.width, map.height), (3, 2));
        assert_eq!(map.get(1, 1), 4.0);
    }

    #[test]
    fn test_hash_mismatch_blocks_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "cl.txt", "2 1.0\n3 1.1\n");
        let mut manifest = Manifest::new();
        let r = load_spectrum(
            &path,
            Units::MicroKelvinSquared,
            Some("0000000000000000"),
            &mut manifest,
        );
        assert!(matches!(r, Err(PipelineError::HashMismatch { .. })));
    }
}
