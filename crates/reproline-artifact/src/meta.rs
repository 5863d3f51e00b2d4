//! Run metadata written alongside each dataset.
//!
//! The document makes an artifact self-describing: which run produced it,
//! from which source release and configuration, how long each stage took,
//! and the content digests a verifier needs to confirm the bytes.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Metadata document stored as `<dataset>.meta.json` next to the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Stable token identifying the run that produced this artifact.
    pub run_id: String,
    /// Upstream release the run was pinned to.
    pub source_release: String,
    /// Blake3 of the resolved configuration.
    pub config_fingerprint: String,
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
    pub finished_at_utc: chrono::DateTime<chrono::Utc>,
    /// Wall time per stage, milliseconds.
    pub stage_durations_ms: BTreeMap<String, u64>,
    pub row_count: usize,
    /// Digest folding every business-key hash in row order.
    pub hash_business_key: String,
    /// Digest folding every row hash in row order.
    pub hash_row: String,
    /// Contract version the artifact satisfies.
    pub schema_version: String,
    /// Rendered migration hops (`from -> to`), present only when the batch
    /// arrived at an older version and was migrated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migration_hops: Vec<String>,
    /// File name of the dataset this document describes.
    pub dataset_file: String,
    /// Blake3 content hash of the dataset file.
    pub dataset_blake3: String,
}

impl RunMetadata {
    /// Pretty JSON form; the writer persists it with temp-then-rename.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize run metadata")
    }

    /// Read a metadata document back, e.g. to verify an existing artifact.
    pub fn read_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
    }
}
