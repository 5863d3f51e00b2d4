//! The orchestrator drives one run end to end: extract across a worker
//! pool, map raw items to records, gate the batch against the pinned
//! contract, canonicalize, and commit the artifact atomically.
//!
//! Extraction is the only parallel stage. Everything after it is
//! single-threaded and no longer cancellable: once validation starts, the
//! run either commits or fails without touching the destination.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use reproline_artifact::{
    is_valid_parquet, sweep_orphaned_staging, AtomicWriter, CanonicalBatch, CanonicalizationEngine,
    RunMetadata, StagedDataset,
};
use reproline_contract::contract::{ContractRegistry, ContractVersion, SchemaContract};
use reproline_contract::gate::{GateOutcome, SchemaGate};
use reproline_contract::migrate::MigrationRegistry;
use reproline_core::config::PipelineConfig;
use reproline_core::context::{CancelToken, RunContext};
use reproline_core::progress::{fmt_num, ProgressContext};
use reproline_core::record::Batch;
use reproline_core::work_queue::WorkQueue;
use reproline_fetch::{
    CircuitBreaker, ExtractionRequest, FetchOutcome, FetchStats, RateLimiter, ReleaseScopedCache,
    ResilienceLayer, SourceAdapter,
};

use crate::run::{derive_run_id, StageTimer};
use crate::summary::RunSummary;

/// A configured pipeline, ready to run against any source adapter.
pub struct Pipeline {
    config: PipelineConfig,
    contracts: ContractRegistry,
    migrations: MigrationRegistry,
    enrichments: FxHashMap<String, FxHashSet<String>>,
}

impl Pipeline {
    /// Build a pipeline after checking the configuration in full.
    pub fn new(config: PipelineConfig, contracts: ContractRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            contracts,
            migrations: MigrationRegistry::new(),
            enrichments: FxHashMap::default(),
        })
    }

    /// Install the migration chain consulted when a batch trails the pin.
    pub fn with_migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    /// Supply one named enrichment key set for reference checks.
    pub fn with_enrichment(mut self, name: impl Into<String>, keys: FxHashSet<String>) -> Self {
        self.enrichments.insert(name.into(), keys);
        self
    }

    /// Execute one run: extract every request, transform, validate against
    /// the pinned contract, canonicalize, and commit dataset plus metadata
    /// in one atomic step. The summary is rendered through `progress`
    /// before it is returned.
    pub fn run<A: SourceAdapter>(
        &self,
        adapter: &A,
        requests: Vec<ExtractionRequest>,
        progress: &ProgressContext,
    ) -> Result<RunSummary> {
        let contract = self.contracts.resolve(&self.config.contract)?;

        sweep_orphaned_staging(&self.config.output.dir)
            .context("failed to sweep orphaned staging state")?;
        let dataset_path = self
            .config
            .output
            .dir
            .join(format!("{}.parquet", self.config.output.dataset));
        if dataset_path.exists() && !is_valid_parquet(&dataset_path) {
            warn!(
                "existing dataset {} is not readable parquet; this run will replace it",
                dataset_path.display()
            );
        }

        let started_at = Utc::now();
        let config_fingerprint = self.config.fingerprint();
        let source_release = adapter
            .resolve_release()
            .context("failed to resolve the source release")?;

        let cancel = match self.config.run_deadline_secs {
            Some(secs) => CancelToken::with_deadline(Duration::from_secs(secs)),
            None => CancelToken::new(),
        };
        let run_id = derive_run_id(&config_fingerprint, &source_release, started_at);
        let ctx = RunContext::new(run_id, &source_release, cancel);

        info!(
            "{}: {} release {}, {} request(s), {} worker(s)",
            ctx.run_id,
            self.config.source.name,
            source_release,
            requests.len(),
            self.config.workers
        );

        let limiter = RateLimiter::new(self.config.source.rps, self.config.source.burst);
        let breaker = CircuitBreaker::from_config(&self.config.source.breaker);
        let cache = ReleaseScopedCache::new(Duration::from_secs(self.config.source.cache_ttl_secs));
        let shaping = self.shaping_contract(contract, adapter.schema_version())?;
        let layer = ResilienceLayer::new(&self.config.source, shaping, &limiter, &breaker, &cache);

        let mut timer = StageTimer::new();

        // Workers drain the queue in whatever order the pool schedules;
        // the canonical sort later erases that order from the artifact.
        let outcomes: Result<Vec<FetchOutcome>> = timer.time("extract", || {
            let queue = WorkQueue::new(requests);
            let collected = Mutex::new(Vec::with_capacity(queue.total()));
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .thread_name(|i| format!("extract-{i}"))
                .build()
                .context("failed to build the extraction pool")?;
            pool.scope(|scope| {
                for _ in 0..self.config.workers {
                    scope.spawn(|_| {
                        while let Some(request) = queue.next() {
                            let pb = progress.request_bar(&request.label);
                            let outcome = layer.fetch_all(&ctx, adapter, request, &pb);
                            pb.finish_and_clear();
                            collected
                                .lock()
                                .expect("outcome collector poisoned")
                                .push(outcome);
                        }
                    });
                }
            });
            Ok(collected.into_inner().expect("outcome collector poisoned"))
        });
        let outcomes = outcomes?;

        if ctx.is_cancelled() {
            warn!(
                "{}: cancellation observed during extraction; unanswered identifiers became fallbacks",
                ctx.run_id
            );
        }

        let mut stats = FetchStats::default();
        let mut raw_items = Vec::new();
        let mut fallbacks = Vec::new();
        for outcome in outcomes {
            stats.merge(&outcome.stats);
            raw_items.extend(outcome.raw_items);
            fallbacks.extend(outcome.fallbacks);
        }

        let transform_pb = progress.stage_line("transform");
        let (batch, malformed_items) = timer.time("transform", || {
            let mut batch = Batch::new(adapter.schema_version());
            let mut malformed = 0usize;
            for raw in &raw_items {
                let mapped = adapter.map_item(raw);
                if mapped.malformed {
                    malformed += 1;
                }
                for record in mapped.records {
                    batch.push(record);
                }
            }
            for record in fallbacks {
                batch.push(record);
            }
            transform_pb.set_message(format!("{} records", fmt_num(batch.len())));
            (batch, malformed)
        });
        transform_pb.finish_and_clear();
        if malformed_items > 0 {
            warn!(
                "{}: {} malformed item(s) salvaged during transform",
                ctx.run_id, malformed_items
            );
        }

        let validate_pb = progress.stage_line("validate");
        let gate = SchemaGate::new(
            contract,
            &self.migrations,
            &self.config.contract,
            &self.config.validation,
        );
        let gated = timer.time("validate", || gate.validate(batch, &self.enrichments));
        validate_pb.finish_and_clear();
        let GateOutcome {
            batch,
            hops,
            reference_warnings,
        } = gated?;

        let write_pb = progress.stage_line("write");
        let engine = CanonicalizationEngine::new(contract);
        let writer = AtomicWriter::new(contract, &self.config.output);
        let staged: Result<(CanonicalBatch, StagedDataset)> = timer.time("write", || {
            let canonical = engine.canonicalize(batch);
            let staged = writer.stage_dataset(&ctx.run_id, &canonical)?;
            Ok((canonical, staged))
        });
        write_pb.finish_and_clear();
        let (canonical, staged) = staged?;

        let stage_durations_ms = timer.into_durations_ms();
        let hops: Vec<String> = hops.iter().map(|hop| hop.to_string()).collect();
        let meta = RunMetadata {
            run_id: ctx.run_id.clone(),
            source_release: source_release.clone(),
            config_fingerprint,
            started_at_utc: started_at,
            finished_at_utc: Utc::now(),
            stage_durations_ms: stage_durations_ms.clone(),
            row_count: canonical.len(),
            hash_business_key: canonical.hash_business_key.clone(),
            hash_row: canonical.hash_row.clone(),
            schema_version: contract.version.to_string(),
            migration_hops: hops.clone(),
            dataset_file: staged.file_name.clone(),
            dataset_blake3: staged.dataset_blake3.clone(),
        };
        let artifact = writer.commit(staged, &meta)?;

        info!(
            "{}: committed {} row(s) to {} (hash_row {})",
            ctx.run_id,
            fmt_num(artifact.row_count),
            artifact.dataset_path.display(),
            &canonical.hash_row[..8]
        );

        let summary = RunSummary {
            run_id: ctx.run_id.clone(),
            source_release,
            stats,
            row_count: artifact.row_count,
            malformed_items,
            reference_warnings,
            migration_hops: hops,
            stage_durations_ms,
            hash_row: canonical.hash_row,
            hash_business_key: canonical.hash_business_key,
            artifact,
        };
        summary.render(progress);
        Ok(summary)
    }

    /// Contract matching the version the adapter's mapper emits. Fallback
    /// records are shaped against this one so they migrate together with
    /// the mapped records.
    fn shaping_contract<'a>(
        &'a self,
        pinned: &'a SchemaContract,
        batch_version: &str,
    ) -> Result<&'a SchemaContract> {
        let version = ContractVersion::parse(batch_version)
            .context("adapter declares an invalid schema version")?;
        if version == pinned.version {
            return Ok(pinned);
        }
        self.contracts
            .get(&self.config.contract.id, version)
            .with_context(|| {
                format!(
                    "adapter emits schema version {batch_version} but contract '{}' has no such version",
                    self.config.contract.id
                )
            })
    }
}
