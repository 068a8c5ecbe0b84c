//! Data provenance manifest: append-only log binding results to exact inputs.
//!
//! One record per ingested file: path, sha256 over raw bytes, byte length,
//! ingestion timestamp. Records are never edited in place; re-ingesting a
//! changed file appends a new entry. The on-disk form is one JSON object per
//! line, so the log is human-readable and independently re-verifiable by
//! recomputing digests.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Provenance record for a single ingested file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// Hex-encoded sha256 over the raw file bytes.
    pub sha256: String,
    pub bytes: u64,
    pub ingested_at: DateTime<Utc>,
}

/// Append-only collection of manifest entries.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

/// Sha256 over a file's raw bytes, hex-encoded, plus the byte count.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

impl Manifest {
    pub fn new() -> Self {
        Manifest::default()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hash `path` and append a new entry, returning the entry.
    ///
    /// If `expected_sha256` is given and disagrees with the recomputed
    /// digest, the ingestion fails with `HashMismatch` and nothing is
    /// appended.
    pub fn ingest(
        &mut self,
        path: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<ManifestEntry> {
        let (sha256, bytes) = hash_file(path)?;
        if let Some(expected) = expected_sha256 {
            if expected != sha256 {
                return Err(PipelineError::HashMismatch {
                    path: path.to_path_buf(),
                    expected: expected.to_string(),
                    actual: sha256,
                });
            }
        }
        let entry = ManifestEntry {
            path: path.to_path_buf(),
            sha256,
            bytes,
            ingested_at: Utc::now(),
        };
        log::debug!(
            "manifest: {} -> sha256={} ({} bytes)",
            entry.path.display(),
            &entry.sha256[..16],
            entry.bytes
        );
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Most recent entry for a path, if any.
    pub fn lookup(&self, path: &Path) -> Option<&ManifestEntry> {
        self.entries.iter().rev().find(|e| e.path == path)
    }

    /// Recompute every entry's digest from disk; error on the first mismatch.
    pub fn verify(&self) -> Result<()> {
        for entry in &self.entries {
            let (sha256, _) = hash_file(&entry.path)?;
            if sha256 != entry.sha256 {
                return Err(PipelineError::HashMismatch {
                    path: entry.path.clone(),
                    expected: entry.sha256.clone(),
                    actual: sha256,
                });
            }
        }
        Ok(())
    }

    /// Append all in-memory entries to a JSONL log.
    pub fn append_to(&self, log_path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        for entry in &self.entries {
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Read a JSONL log back into a manifest.
    pub fn read_from(log_path: &Path) -> Result<Manifest> {
        let file = File::open(log_path)?;
        let mut entries = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ManifestEntry =
                serde_json::from_str(&line).map_err(|e| PipelineError::MalformedInput {
                    path: log_path.to_path_buf(),
                    line: i + 1,
                    reason: format!("bad manifest record: {e}"),
                })?;
            entries.push(entry);
        }
        Ok(Manifest { entries })
    }
}
