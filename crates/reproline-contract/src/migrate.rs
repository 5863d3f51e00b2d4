//! Migration chain between contract versions.
//!
//! Each step is a pure batch-to-batch transform registered under its source
//! version. The registry is a plain map built by the embedder at startup;
//! the gate walks it forward hop by hop, never loading anything by name.

use anyhow::Result;

use reproline_core::record::Batch;

use crate::contract::ContractVersion;

/// One applied hop, recorded for lineage in the run metadata.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MigrationHop {
    pub from: ContractVersion,
    pub to: ContractVersion,
}

impl std::fmt::Display for MigrationHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// A pure transform lifting a batch from one contract version to another.
///
/// Implementations must not touch anything outside the batch: same input,
/// same output, every time. The gate relies on that when it reports the
/// migrated batch as equivalent content.
pub trait BatchMigration: Send + Sync {
    fn from_version(&self) -> ContractVersion;
    fn to_version(&self) -> ContractVersion;
    fn apply(&self, batch: Batch) -> Result<Batch>;
}

/// Closure-backed migration, the convenient way to register steps.
pub struct FnMigration<F> {
    from: ContractVersion,
    to: ContractVersion,
    transform: F,
}

impl<F> FnMigration<F>
where
    F: Fn(Batch) -> Result<Batch> + Send + Sync,
{
    pub fn new(from: ContractVersion, to: ContractVersion, transform: F) -> Self {
        Self {
            from,
            to,
            transform,
        }
    }
}

impl<F> BatchMigration for FnMigration<F>
where
    F: Fn(Batch) -> Result<Batch> + Send + Sync,
{
    fn from_version(&self) -> ContractVersion {
        self.from
    }

    fn to_version(&self) -> ContractVersion {
        self.to
    }

    fn apply(&self, batch: Batch) -> Result<Batch> {
        (self.transform)(batch)
    }
}

/// Registered migration steps, one outgoing step per source version.
#[derive(Default)]
pub struct MigrationRegistry {
    steps: std::collections::BTreeMap<ContractVersion, Box<dyn BatchMigration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step. A version can only have one successor: the chain is a
    /// straight line, not a graph.
    pub fn register(&mut self, step: Box<dyn BatchMigration>) -> Result<()> {
        let from = step.from_version();
        let to = step.to_version();
        if from == to {
            anyhow::bail!("migration {from} -> {to} is a self-loop");
        }
        if self.steps.contains_key(&from) {
            anyhow::bail!("a migration from {from} is already registered");
        }
        self.steps.insert(from, step);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Find the ordered steps lifting `from` to `to`, if the chain reaches
    /// it within `max_hops`.
    pub fn plan(
        &self,
        from: ContractVersion,
        to: ContractVersion,
        max_hops: u32,
    ) -> Option<Vec<&dyn BatchMigration>> {
        let mut path = Vec::new();
        let mut cursor = from;
        while cursor != to {
            if path.len() as u32 >= max_hops {
                return None;
            }
            let step = self.steps.get(&cursor)?;
            path.push(step.as_ref());
            cursor = step.to_version();
        }
        Some(path)
    }

    /// Apply the planned chain, logging each hop for lineage. Returns the
    /// migrated batch and the hops taken.
    pub fn migrate(
        &self,
        batch: Batch,
        to: ContractVersion,
        max_hops: u32,
    ) -> Option<Result<(Batch, Vec<MigrationHop>)>> {
        let from = match ContractVersion::parse(&batch.schema_version) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let steps = self.plan(from, to, max_hops)?;
        let mut current = batch;
        let mut hops = Vec::with_capacity(steps.len());
        for step in steps {
            let hop = MigrationHop {
                from: step.from_version(),
                to: step.to_version(),
            };
            log::info!(
                "migrating batch {} ({} records)",
                hop,
                current.records.len()
            );
            current = match step.apply(current) {
                Ok(b) => b,
                Err(e) => return Some(Err(e)),
            };
            current.schema_version = hop.to.to_string();
            hops.push(hop);
        }
        Some(Ok((current, hops)))
    }
}
