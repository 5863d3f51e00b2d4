//! Pagination strategies and the per-request traversal state machine.
//!
//! Exactly three traversal shapes exist; a provider declares which one its
//! endpoint speaks and the [`Paginator`] drives it. Session-token
//! endpoints are two-phase: the opening call yields a token plus a result
//! count, and only then do slice queries exist at all. The position type
//! makes a slice without a token unrepresentable.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use reproline_core::record::canonical_json;

/// How one endpoint pages its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageStrategy {
    /// Opaque continuation cursor; a response without one ends the walk.
    Cursor { page_size: usize },
    /// Numeric offset advanced by the page size; a short page ends the walk.
    Offset { page_size: usize },
    /// Two-phase: an opening call yields a session token and a total
    /// count, then token-scoped slices walk the result set.
    SessionToken { slice_size: usize },
}

/// One concrete page request derived from the traversal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageQuery {
    Cursor { cursor: Option<String>, limit: usize },
    Offset { offset: usize, limit: usize },
    OpenSession,
    Slice { token: String, start: usize, count: usize },
}

/// Token and result count returned by a session-opening call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub token: String,
    pub total: usize,
}

/// One fetched page, as the provider returned it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<serde_json::Value>,
    /// Continuation cursor, for cursor-strategy endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Session envelope, from the opening call of a session-token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionEnvelope>,
}

impl Page {
    pub fn of_items(items: Vec<serde_json::Value>) -> Self {
        Self {
            items,
            next_cursor: None,
            session: None,
        }
    }
}

/// One logical extraction: an endpoint, its ordered filter parameters, the
/// traversal strategy, and (for identifier batches) the requested
/// identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Short label for logs and progress bars; not part of the request's
    /// identity.
    pub label: String,
    pub endpoint: String,
    /// Filter parameters in caller-declared order; the order is part of
    /// the request's identity.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    pub strategy: PageStrategy,
    /// Field of raw items that uniquely identifies a logical record, used
    /// for cross-page de-duplication.
    pub id_field: String,
    /// Requested identifiers; empty for listing-style requests.
    #[serde(default)]
    pub identifiers: Vec<String>,
}

impl ExtractionRequest {
    /// Stable identity of the logical request, independent of traversal
    /// position. Labels are excluded; everything that shapes the result
    /// set is included.
    pub fn fingerprint(&self) -> String {
        let payload = serde_json::json!({
            "endpoint": self.endpoint,
            "params": self.params,
            "identifiers": self.identifiers,
        });
        blake3::hash(canonical_json(&payload).as_bytes())
            .to_hex()
            .to_string()
    }
}

/// Traversal position. `InSession` can only be produced by consuming an
/// opening call's envelope.
#[derive(Debug)]
enum Position {
    Start,
    AtCursor(String),
    AtOffset(usize),
    InSession {
        token: String,
        fetched: usize,
        total: usize,
    },
    Done,
}

/// Walks one extraction request page by page: `next_query` derives the
/// next request from the position, `advance` consumes a fetched page,
/// de-duplicates its items against everything seen so far, and moves the
/// position.
pub struct Paginator {
    strategy: PageStrategy,
    position: Position,
    id_field: String,
    seen: FxHashSet<String>,
    duplicates: usize,
}

impl Paginator {
    pub fn new(strategy: PageStrategy, id_field: impl Into<String>) -> Self {
        Self {
            strategy,
            position: Position::Start,
            id_field: id_field.into(),
            seen: FxHashSet::default(),
            duplicates: 0,
        }
    }

    pub fn for_request(request: &ExtractionRequest) -> Self {
        Self::new(request.strategy.clone(), request.id_field.clone())
    }

    /// The next page request, or `None` once the walk is complete.
    pub fn next_query(&self) -> Option<PageQuery> {
        match (&self.position, &self.strategy) {
            (Position::Done, _) => None,
            (Position::Start, PageStrategy::Cursor { page_size }) => Some(PageQuery::Cursor {
                cursor: None,
                limit: *page_size,
            }),
            (Position::AtCursor(cursor), PageStrategy::Cursor { page_size }) => {
                Some(PageQuery::Cursor {
                    cursor: Some(cursor.clone()),
                    limit: *page_size,
                })
            }
            (Position::Start, PageStrategy::Offset { page_size }) => Some(PageQuery::Offset {
                offset: 0,
                limit: *page_size,
            }),
            (Position::AtOffset(offset), PageStrategy::Offset { page_size }) => {
                Some(PageQuery::Offset {
                    offset: *offset,
                    limit: *page_size,
                })
            }
            (Position::Start, PageStrategy::SessionToken { .. }) => Some(PageQuery::OpenSession),
            (
                Position::InSession {
                    token,
                    fetched,
                    total,
                },
                PageStrategy::SessionToken { slice_size },
            ) => Some(PageQuery::Slice {
                token: token.clone(),
                start: *fetched,
                count: (*slice_size).min(total - fetched),
            }),
            // Positions are only ever produced by this paginator's own
            // strategy, so the cross arms are unreachable.
            _ => None,
        }
    }

    /// Consume one fetched page: advance the position and return the items
    /// not seen before in this extraction.
    pub fn advance(&mut self, page: &Page) -> Vec<serde_json::Value> {
        let kept = self.dedup(&page.items);
        let next = match (&self.position, &self.strategy) {
            (Position::Done, _) => Position::Done,
            (_, PageStrategy::Cursor { .. }) => match &page.next_cursor {
                // An empty page with a cursor would loop forever; stop.
                Some(next) if !page.items.is_empty() => Position::AtCursor(next.clone()),
                _ => Position::Done,
            },
            (position, PageStrategy::Offset { page_size }) => {
                let offset = match position {
                    Position::AtOffset(offset) => *offset,
                    _ => 0,
                };
                if page.items.len() < *page_size {
                    Position::Done
                } else {
                    Position::AtOffset(offset + page_size)
                }
            }
            (Position::Start, PageStrategy::SessionToken { .. }) => match &page.session {
                Some(envelope) => {
                    let fetched = page.items.len();
                    if fetched >= envelope.total {
                        Position::Done
                    } else {
                        Position::InSession {
                            token: envelope.token.clone(),
                            fetched,
                            total: envelope.total,
                        }
                    }
                }
                None => {
                    log::warn!("session open returned no envelope; ending traversal");
                    Position::Done
                }
            },
            (
                Position::InSession {
                    token,
                    fetched,
                    total,
                },
                PageStrategy::SessionToken { .. },
            ) => {
                let fetched = fetched + page.items.len();
                if page.items.is_empty() || fetched >= *total {
                    Position::Done
                } else {
                    Position::InSession {
                        token: token.clone(),
                        fetched,
                        total: *total,
                    }
                }
            }
            // Cross-strategy positions cannot occur; see `next_query`.
            _ => Position::Done,
        };
        self.position = next;
        kept
    }

    fn dedup(&mut self, items: &[serde_json::Value]) -> Vec<serde_json::Value> {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            match item_id(item, &self.id_field) {
                Some(id) => {
                    if self.seen.insert(id) {
                        kept.push(item.clone());
                    } else {
                        self.duplicates += 1;
                    }
                }
                // Items without the identifier cannot be de-duplicated;
                // they pass through and the mapper flags them.
                None => kept.push(item.clone()),
            }
        }
        kept
    }

    pub fn is_done(&self) -> bool {
        matches!(self.position, Position::Done)
    }

    /// Identifiers observed so far in this extraction.
    pub fn seen(&self) -> &FxHashSet<String> {
        &self.seen
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates
    }
}

/// The identifier field as text; numeric ids are accepted since some
/// providers serialize them unquoted.
pub fn item_id(item: &serde_json::Value, field: &str) -> Option<String> {
    match item.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
