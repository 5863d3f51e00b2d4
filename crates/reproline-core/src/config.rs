//! Resolved pipeline configuration.
//!
//! The framework never parses flags or files itself; embedders deserialize
//! this from wherever their configuration lives (the types derive
//! `Deserialize`, so a TOML or JSON document maps straight onto them) and
//! hand over an already-resolved value. [`PipelineConfig::validate`] runs
//! before any network I/O and reports every problem at once.

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Everything one run needs, fully resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub contract: ContractRef,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub output: OutputConfig,
    /// Extraction worker count. Transform/validate/write are always
    /// single-threaded.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Optional wall-clock budget for the whole run, in seconds. When it
    /// elapses, in-flight workers observe cancellation and fall back.
    #[serde(default)]
    pub run_deadline_secs: Option<u64>,
}

/// Per-source resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Provider label stamped into `source_system`, e.g. `"PUBCHEM"`.
    pub name: String,
    /// Token bucket refill rate, requests per second.
    #[serde(default = "default_rps")]
    pub rps: f64,
    /// Token bucket capacity (burst allowance).
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Cache entry lifetime in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Hard deadline per network call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Declared JSON column that receives fallback diagnostics, when the
    /// contract has one.
    #[serde(default)]
    pub diagnostics_column: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (1 = no retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Reference to the schema contract a run pins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRef {
    /// Registry identifier, e.g. `"compound"`.
    pub id: String,
    /// Pinned semantic version the run requires.
    pub version: String,
    #[serde(default)]
    pub allow_migration: bool,
    #[serde(default = "default_max_migration_hops")]
    pub max_migration_hops: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Reject undeclared columns.
    #[serde(default = "default_true")]
    pub strict_columns: bool,
    /// Promote referential-integrity warnings to fatal violations.
    #[serde(default)]
    pub references_fatal: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strict_columns: true,
            references_fatal: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Caller-supplied output directory; staging lives underneath it.
    pub dir: PathBuf,
    /// Dataset stem: produces `<dataset>.parquet` + `<dataset>.meta.json`.
    pub dataset: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_workers() -> usize {
    4
}

fn default_rps() -> f64 {
    5.0
}

fn default_burst() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_migration_hops() -> u32 {
    3
}

fn default_zstd_level() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Check every field and report all problems in one error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.source.name.trim().is_empty() {
            errors.push("source.name must not be empty".to_string());
        }
        if !(self.source.rps > 0.0) {
            errors.push(format!("source.rps must be > 0, got {}", self.source.rps));
        }
        if self.source.burst == 0 {
            errors.push("source.burst must be at least 1".to_string());
        }
        if self.source.retry.max_attempts == 0 {
            errors.push("source.retry.max_attempts must be at least 1".to_string());
        }
        if self.source.retry.multiplier < 1.0 {
            errors.push(format!(
                "source.retry.multiplier must be >= 1.0, got {}",
                self.source.retry.multiplier
            ));
        }
        if self.source.retry.max_delay_ms < self.source.retry.base_delay_ms {
            errors.push(format!(
                "source.retry.max_delay_ms ({}) is below base_delay_ms ({})",
                self.source.retry.max_delay_ms, self.source.retry.base_delay_ms
            ));
        }
        if self.source.breaker.failure_threshold == 0 {
            errors.push("source.breaker.failure_threshold must be at least 1".to_string());
        }
        if self.source.breaker.cooldown_ms == 0 {
            errors.push("source.breaker.cooldown_ms must be at least 1".to_string());
        }
        if self.source.cache_ttl_secs == 0 {
            errors.push("source.cache_ttl_secs must be at least 1".to_string());
        }
        if self.source.request_timeout_ms == 0 {
            errors.push("source.request_timeout_ms must be at least 1".to_string());
        }
        if self.contract.id.trim().is_empty() {
            errors.push("contract.id must not be empty".to_string());
        }
        if self.contract.version.trim().is_empty() {
            errors.push("contract.version must not be empty".to_string());
        }
        if self.contract.allow_migration && self.contract.max_migration_hops == 0 {
            errors.push("contract.max_migration_hops must be at least 1 when migration is enabled".to_string());
        }
        if self.workers == 0 {
            errors.push("workers must be at least 1".to_string());
        }
        if self.output.dataset.trim().is_empty() {
            errors.push("output.dataset must not be empty".to_string());
        } else if self.output.dataset.contains(['/', '\\']) {
            errors.push(format!(
                "output.dataset must be a bare file stem, got '{}'",
                self.output.dataset
            ));
        }
        if self.output.dir.as_os_str().is_empty() {
            errors.push("output.dir must not be empty".to_string());
        }
        if !(1..=22).contains(&self.output.zstd_level) {
            errors.push(format!(
                "output.zstd_level must be in 1..=22, got {}",
                self.output.zstd_level
            ));
        }
        if self.run_deadline_secs == Some(0) {
            errors.push("run_deadline_secs must be at least 1 when set".to_string());
        }

        if !errors.is_empty() {
            bail!("invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// Stable fingerprint over the resolved configuration: blake3 of its
    /// canonical JSON. Field order is fixed by the struct definitions, so
    /// two equal configs always fingerprint identically.
    pub fn fingerprint(&self) -> String {
        // Serialization of a plain struct with string keys cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}
