//! Resilient data acquisition.
//!
//! Providers implement the seams in [`source`]; the framework wraps them
//! in the [`layer::ResilienceLayer`] (release-scoped caching, token-bucket
//! rate limiting, breaker-guarded calls, retry with jitter) and guarantees
//! that no requested identifier ever silently disappears: whatever the
//! upstream refuses to answer comes back as a fallback record.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod layer;
pub mod limiter;
pub mod page;
pub mod retry;
pub mod source;
pub mod stats;
pub mod transport;

pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::{request_fingerprint, ReleaseScopedCache};
pub use error::FetchError;
pub use layer::{FetchOutcome, ResilienceLayer};
pub use limiter::RateLimiter;
pub use page::{ExtractionRequest, Page, PageQuery, PageStrategy, Paginator, SessionEnvelope};
pub use retry::{run_with_retry, RetryPolicy};
pub use source::{MappedItem, PageFetcher, RecordMapper, SourceAdapter};
pub use stats::FetchStats;
