//! Reproline Core - shared substrate for deterministic acquisition pipelines
//!
//! This crate provides the pieces every other reproline crate builds on:
//! the record/value model batches move through, explicit run context with
//! cancellation, the resolved configuration object, and logging/progress
//! plumbing.

pub mod config;
pub mod context;
pub mod logging;
pub mod progress;
pub mod record;
pub mod work_queue;

// Re-exports for convenience
pub use config::{
    BreakerConfig, ContractRef, OutputConfig, PipelineConfig, RetryConfig, SourceConfig,
    ValidationConfig,
};
pub use context::{CancelToken, RunContext};
pub use logging::{ProgressAwareLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use record::{Batch, FALLBACK_SUFFIX, Record, Value, canonical_json};
pub use work_queue::WorkQueue;
