//! Release-scoped response cache.
//!
//! Entries are keyed by (source release, request fingerprint): a release
//! change makes every prior entry unreachable without any invalidation
//! sweep. Expiry is enforced lazily on lookup; nothing runs in the
//! background.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use reproline_core::record::canonical_json;

use crate::page::{ExtractionRequest, PageQuery};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    release: String,
    fingerprint: String,
}

struct CacheEntry {
    payload: serde_json::Value,
    stored_at: Instant,
}

pub struct ReleaseScopedCache {
    ttl: Duration,
    entries: Mutex<FxHashMap<CacheKey, CacheEntry>>,
}

impl ReleaseScopedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Look up a verified response. An entry past its TTL is removed here
    /// and reported as a miss.
    pub fn get(&self, release: &str, fingerprint: &str) -> Option<serde_json::Value> {
        let key = CacheKey {
            release: release.to_string(),
            fingerprint: fingerprint.to_string(),
        };
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store a verified response. Only successfully fetched pages belong
    /// here; failures are never cached.
    pub fn put(&self, release: &str, fingerprint: &str, payload: serde_json::Value) {
        let key = CacheKey {
            release: release.to_string(),
            fingerprint: fingerprint.to_string(),
        };
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.insert(
            key,
            CacheEntry {
                payload,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every entry stored under a different release.
    pub fn retain_release(&self, release: &str) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.retain(|key, _| key.release == release);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fingerprint of one concrete page fetch: the request's identity plus the
/// traversal query, hashed over canonical JSON so equal requests always
/// collide and different ones never share an entry.
pub fn request_fingerprint(request: &ExtractionRequest, query: &PageQuery) -> String {
    let payload = serde_json::json!({
        "request": request.fingerprint(),
        "query": query,
    });
    blake3::hash(canonical_json(&payload).as_bytes())
        .to_hex()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageStrategy;
    use serde_json::json;
    use std::thread;

    fn request() -> ExtractionRequest {
        ExtractionRequest {
            label: "works".to_string(),
            endpoint: "/works".to_string(),
            params: vec![],
            strategy: PageStrategy::Cursor { page_size: 10 },
            id_field: "id".to_string(),
            identifiers: vec!["w1".to_string()],
        }
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = ReleaseScopedCache::new(Duration::from_millis(40));
        cache.put("2026-08", "fp1", json!({"items": []}));
        assert!(cache.get("2026-08", "fp1").is_some());

        thread::sleep(Duration::from_millis(60));
        assert!(cache.get("2026-08", "fp1").is_none());
        // Lazy expiry removed the entry on that lookup.
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_are_scoped_to_their_release() {
        let cache = ReleaseScopedCache::new(Duration::from_secs(60));
        cache.put("2026-07", "fp1", json!(1));
        assert!(cache.get("2026-08", "fp1").is_none());
        assert!(cache.get("2026-07", "fp1").is_some());
    }

    #[test]
    fn retain_release_drops_stale_releases() {
        let cache = ReleaseScopedCache::new(Duration::from_secs(60));
        cache.put("2026-07", "fp1", json!(1));
        cache.put("2026-07", "fp2", json!(2));
        cache.put("2026-08", "fp1", json!(3));

        cache.retain_release("2026-08");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("2026-08", "fp1").is_some());
    }

    #[test]
    fn fingerprint_distinguishes_queries_and_requests() {
        let request = request();
        let first = PageQuery::Cursor {
            cursor: None,
            limit: 10,
        };
        let second = PageQuery::Cursor {
            cursor: Some("c1".to_string()),
            limit: 10,
        };
        assert_eq!(
            request_fingerprint(&request, &first),
            request_fingerprint(&request, &first)
        );
        assert_ne!(
            request_fingerprint(&request, &first),
            request_fingerprint(&request, &second)
        );

        let mut other = request.clone();
        other.identifiers.push("w2".to_string());
        assert_ne!(
            request_fingerprint(&request, &first),
            request_fingerprint(&other, &first)
        );
    }
}
