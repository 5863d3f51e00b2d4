//! The resilience layer wrapped around a provider's page fetcher.
//!
//! Per page, in order: release-scoped cache lookup, rate-limiter token,
//! breaker-guarded network call, retry policy on transient failure. When
//! resilience is exhausted the extraction does not error out: every
//! requested identifier that no page answered comes back as a fallback
//! record, so identifiers never vanish silently from the output.

use std::cell::Cell;

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use log::{debug, warn};

use reproline_contract::contract::{ColumnType, SchemaContract};
use reproline_core::config::SourceConfig;
use reproline_core::context::RunContext;
use reproline_core::record::{Record, Value, FALLBACK_SUFFIX};

use crate::breaker::CircuitBreaker;
use crate::cache::{request_fingerprint, ReleaseScopedCache};
use crate::error::FetchError;
use crate::limiter::RateLimiter;
use crate::page::{ExtractionRequest, Page, PageQuery, Paginator};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::source::PageFetcher;
use crate::stats::FetchStats;

/// Everything one extraction produced: raw items for the mapper, fallback
/// records for identifiers nothing answered, and counters.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub raw_items: Vec<serde_json::Value>,
    pub fallbacks: Vec<Record>,
    pub stats: FetchStats,
}

struct PageFailure {
    error: FetchError,
    attempts: u32,
}

pub struct ResilienceLayer<'a> {
    config: &'a SourceConfig,
    contract: &'a SchemaContract,
    limiter: &'a RateLimiter,
    breaker: &'a CircuitBreaker,
    cache: &'a ReleaseScopedCache,
    policy: RetryPolicy,
}

impl<'a> ResilienceLayer<'a> {
    pub fn new(
        config: &'a SourceConfig,
        contract: &'a SchemaContract,
        limiter: &'a RateLimiter,
        breaker: &'a CircuitBreaker,
        cache: &'a ReleaseScopedCache,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self {
            config,
            contract,
            limiter,
            breaker,
            cache,
            policy,
        }
    }

    /// Traverse one extraction request to completion. Failures never
    /// propagate: once resilience is exhausted (or the run is cancelled),
    /// the identifiers still unanswered come back as fallback records.
    pub fn fetch_all(
        &self,
        ctx: &RunContext,
        fetcher: &dyn PageFetcher,
        request: &ExtractionRequest,
        pb: &ProgressBar,
    ) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let mut paginator = Paginator::for_request(request);

        let mut aborted = false;
        while let Some(query) = paginator.next_query() {
            match self.fetch_page(ctx, fetcher, request, &query, &mut outcome.stats, pb) {
                Ok(page) => {
                    let kept = paginator.advance(&page);
                    outcome.stats.pages += 1;
                    outcome.stats.items += kept.len();
                    outcome.raw_items.extend(kept);
                    pb.set_message(format!("{} items", outcome.raw_items.len()));
                }
                Err(failure) => {
                    self.give_up(request, &paginator, failure, &mut outcome);
                    aborted = true;
                    break;
                }
            }
        }
        if !aborted {
            outcome.stats.requests = 1;
            self.fallbacks_for_absent(request, &paginator, &mut outcome);
        }
        outcome.stats.duplicates_dropped = paginator.duplicates_dropped();
        outcome.stats.fallbacks = outcome.fallbacks.len();
        outcome
    }

    fn fetch_page(
        &self,
        ctx: &RunContext,
        fetcher: &dyn PageFetcher,
        request: &ExtractionRequest,
        query: &PageQuery,
        stats: &mut FetchStats,
        pb: &ProgressBar,
    ) -> Result<Page, PageFailure> {
        if ctx.is_cancelled() {
            return Err(PageFailure {
                error: FetchError::Cancelled,
                attempts: 0,
            });
        }

        let fingerprint = request_fingerprint(request, query);
        if let Some(payload) = self.cache.get(&ctx.source_release, &fingerprint) {
            match serde_json::from_value::<Page>(payload) {
                Ok(page) => {
                    stats.cache_hits += 1;
                    debug!("{}: cache hit for page {fingerprint:.8}", request.label);
                    return Ok(page);
                }
                Err(err) => {
                    warn!(
                        "{}: dropping undecodable cache entry {fingerprint:.8}: {err}",
                        request.label
                    );
                }
            }
        }

        let attempts = Cell::new(0u32);
        let calls = Cell::new(0usize);
        let result = run_with_retry(&self.policy, &request.label, pb, &ctx.cancel, || {
            self.limiter.acquire(&ctx.cancel)?;
            attempts.set(attempts.get() + 1);
            self.breaker.call(|| {
                calls.set(calls.get() + 1);
                fetcher.fetch_page(ctx, request, query)
            })
        });
        stats.network_calls += calls.get();
        stats.retries += attempts.get().saturating_sub(1) as usize;

        match result {
            Ok(page) => {
                // Only verified successes are cached.
                match serde_json::to_value(&page) {
                    Ok(payload) => self.cache.put(&ctx.source_release, &fingerprint, payload),
                    Err(err) => warn!("{}: page not cacheable: {err}", request.label),
                }
                Ok(page)
            }
            Err(error) => Err(PageFailure {
                error,
                attempts: attempts.get(),
            }),
        }
    }

    /// Resilience exhausted mid-traversal: synthesize fallbacks for every
    /// identifier no earlier page answered.
    fn give_up(
        &self,
        request: &ExtractionRequest,
        paginator: &Paginator,
        failure: PageFailure,
        outcome: &mut FetchOutcome,
    ) {
        warn!(
            "{}: extraction exhausted after {} attempt(s): {}; synthesizing fallbacks",
            request.label, failure.attempts, failure.error
        );
        let diagnostics = serde_json::json!({
            "error_class": failure.error.class(),
            "detail": failure.error.to_string(),
            "retry_after_ms": failure
                .error
                .retry_after()
                .map(|d| d.as_millis() as u64),
            "attempts": failure.attempts,
            "request": request.fingerprint(),
        });
        if request.identifiers.is_empty() {
            // Listing-style request: one placeholder row carrying the
            // request's own fingerprint as the business key.
            outcome
                .fallbacks
                .push(self.fallback_record(&request.fingerprint(), &diagnostics));
        } else {
            for id in &request.identifiers {
                if !paginator.seen().contains(id) {
                    outcome.fallbacks.push(self.fallback_record(id, &diagnostics));
                }
            }
        }
    }

    /// The traversal completed but some requested identifiers never showed
    /// up in any page. Not an upstream failure, but they must not vanish.
    fn fallbacks_for_absent(
        &self,
        request: &ExtractionRequest,
        paginator: &Paginator,
        outcome: &mut FetchOutcome,
    ) {
        let missing: Vec<&String> = request
            .identifiers
            .iter()
            .filter(|id| !paginator.seen().contains(*id))
            .collect();
        if missing.is_empty() {
            return;
        }
        warn!(
            "{}: {} requested identifier(s) absent upstream",
            request.label,
            missing.len()
        );
        let diagnostics = serde_json::json!({
            "error_class": "absent_upstream",
            "detail": "identifier not present in any returned page",
            "attempts": 0,
            "request": request.fingerprint(),
        });
        for id in missing {
            outcome.fallbacks.push(self.fallback_record(id, &diagnostics));
        }
    }

    /// A schema-conformant placeholder for one unanswered identifier:
    /// business-key columns carry the identifier, nullable columns are
    /// null, non-nullable columns get their type's empty value, and the
    /// configured diagnostics column records what happened.
    fn fallback_record(&self, identifier: &str, diagnostics: &serde_json::Value) -> Record {
        let mut record = Record::new(format!("{}{FALLBACK_SUFFIX}", self.config.name));
        for col in &self.contract.columns {
            let value = if self.contract.business_key.contains(&col.name) {
                key_value(col.ty, identifier)
            } else if col.nullable {
                Value::Null
            } else {
                empty_value(col.ty)
            };
            record.set(col.name.clone(), value);
        }
        if let Some(column) = &self.config.diagnostics_column {
            if self.contract.has_column(column) {
                record.set(column.clone(), Value::Json(diagnostics.clone()));
            }
        }
        record
    }
}

/// Identifier cast into the business-key column's type. Unparseable
/// numeric keys stay textual and surface at the validation gate.
fn key_value(ty: ColumnType, identifier: &str) -> Value {
    match ty {
        ColumnType::Int => identifier
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(identifier.to_string())),
        ColumnType::Float => identifier
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(identifier.to_string())),
        _ => Value::Text(identifier.to_string()),
    }
}

fn empty_value(ty: ColumnType) -> Value {
    match ty {
        ColumnType::Bool => Value::Bool(false),
        ColumnType::Int => Value::Int(0),
        ColumnType::Float => Value::Float(0.0),
        ColumnType::Text => Value::Text(String::new()),
        ColumnType::Timestamp => Value::Timestamp(DateTime::<Utc>::UNIX_EPOCH),
        ColumnType::Json => Value::Json(serde_json::Value::Null),
    }
}
