//! Provider seams: fetching pages, mapping raw items, resolving releases.
//!
//! A source plugs into the framework by implementing these traits.
//! Everything else (rate limiting, retries, the breaker, caching,
//! fallback synthesis) is layered on by the framework and is not the
//! provider's business.

use reproline_core::context::RunContext;
use reproline_core::record::Record;

use crate::error::FetchError;
use crate::page::{ExtractionRequest, Page, PageQuery};

/// Fetches one page of one extraction request. An implementation performs
/// exactly one upstream call per invocation; the resilience layer decides
/// when and how often to invoke it.
pub trait PageFetcher: Send + Sync {
    fn fetch_page(
        &self,
        ctx: &RunContext,
        request: &ExtractionRequest,
        query: &PageQuery,
    ) -> Result<Page, FetchError>;
}

/// Result of mapping one raw item. Mapping never fails: unusable input
/// yields whatever could be salvaged, with the `malformed` flag raised.
#[derive(Debug, Default)]
pub struct MappedItem {
    /// One raw item may expand to several records: nested arrays are
    /// flattened to long format with the array index persisted as an
    /// explicit column.
    pub records: Vec<Record>,
    pub malformed: bool,
}

impl MappedItem {
    pub fn one(record: Record) -> Self {
        Self {
            records: vec![record],
            malformed: false,
        }
    }

    pub fn many(records: Vec<Record>) -> Self {
        Self {
            records,
            malformed: false,
        }
    }

    pub fn flagged(records: Vec<Record>) -> Self {
        Self {
            records,
            malformed: true,
        }
    }
}

/// Maps one raw wire item into typed records.
pub trait RecordMapper: Send + Sync {
    fn map_item(&self, raw: &serde_json::Value) -> MappedItem;
}

/// A complete source: page fetching, item mapping, and release resolution
/// under one roof.
pub trait SourceAdapter: PageFetcher + RecordMapper {
    /// Upstream snapshot label for this run, resolved exactly once before
    /// any fetching starts. Either a pass-through of a configured label or
    /// one metadata call to the provider.
    fn resolve_release(&self) -> Result<String, FetchError>;

    /// Schema version of the records [`RecordMapper::map_item`] produces.
    /// When it trails the pinned contract, the batch goes through
    /// migration at the validation gate.
    fn schema_version(&self) -> &str;
}
