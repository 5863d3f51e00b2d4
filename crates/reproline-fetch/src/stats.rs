//! Counters collected during the extract stage.

/// Counters for one logical extraction, merged across workers into run
/// totals.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    /// Extraction requests traversed to completion.
    pub requests: usize,
    /// Pages consumed, cached or fetched.
    pub pages: usize,
    pub cache_hits: usize,
    /// Upstream calls that actually went out.
    pub network_calls: usize,
    /// Attempts beyond the first, across all pages.
    pub retries: usize,
    /// Fallback records synthesized for unanswered identifiers.
    pub fallbacks: usize,
    /// Items dropped by the cross-page de-duplication set.
    pub duplicates_dropped: usize,
    /// Raw items kept for mapping.
    pub items: usize,
}

impl FetchStats {
    pub fn merge(&mut self, other: &FetchStats) {
        self.requests += other.requests;
        self.pages += other.pages;
        self.cache_hits += other.cache_hits;
        self.network_calls += other.network_calls;
        self.retries += other.retries;
        self.fallbacks += other.fallbacks;
        self.duplicates_dropped += other.duplicates_dropped;
        self.items += other.items;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_fieldwise() {
        let mut total = FetchStats {
            requests: 1,
            pages: 3,
            cache_hits: 1,
            network_calls: 2,
            retries: 1,
            fallbacks: 0,
            duplicates_dropped: 4,
            items: 250,
        };
        total.merge(&FetchStats {
            requests: 1,
            pages: 2,
            cache_hits: 0,
            network_calls: 2,
            retries: 0,
            fallbacks: 3,
            duplicates_dropped: 1,
            items: 100,
        });
        assert_eq!(total.requests, 2);
        assert_eq!(total.pages, 5);
        assert_eq!(total.network_calls, 4);
        assert_eq!(total.fallbacks, 3);
        assert_eq!(total.items, 350);
    }
}
