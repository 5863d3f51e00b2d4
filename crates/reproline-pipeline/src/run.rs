//! Run identity and stage timing.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};

use reproline_artifact::hash::{hash_bytes, short_hash};

/// Derive the stable run token from everything that identifies an
/// invocation: the configuration fingerprint, the resolved upstream
/// release, and the start instant.
pub fn derive_run_id(
    config_fingerprint: &str,
    source_release: &str,
    started_at: DateTime<Utc>,
) -> String {
    let seed = format!(
        "{config_fingerprint}\n{source_release}\n{}",
        started_at.timestamp_millis()
    );
    format!("run-{}", short_hash(&hash_bytes(seed.as_bytes())))
}

/// Wall-clock accounting per pipeline stage, keyed by stage name.
#[derive(Debug, Default)]
pub struct StageTimer {
    durations: BTreeMap<String, u64>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time one stage; the closure's result passes straight through.
    pub fn time<T>(&mut self, stage: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.durations
            .insert(stage.to_string(), start.elapsed().as_millis() as u64);
        out
    }

    pub fn into_durations_ms(self) -> BTreeMap<String, u64> {
        self.durations
    }
}
