//! Lock-free queue handing extraction requests to pool workers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Frozen list of work items with an atomic claim cursor.
///
/// Workers call [`next()`](WorkQueue::next) to claim the next item; each
/// item is handed out exactly once. The list never changes after
/// construction, so no locking is needed.
pub struct WorkQueue<T> {
    items: Vec<T>,
    cursor: AtomicUsize,
}

impl<T> WorkQueue<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Claim the next item (lock-free).
    pub fn next(&self) -> Option<&T> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.items.get(i)
    }

    /// Total items in the queue.
    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// How many items have been claimed so far.
    pub fn claimed(&self) -> usize {
        self.cursor.load(Ordering::Relaxed).min(self.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_each_item_once() {
        let q = WorkQueue::new(vec!["a", "b", "c"]);
        assert_eq!(q.total(), 3);
        assert_eq!(q.next(), Some(&"a"));
        assert_eq!(q.next(), Some(&"b"));
        assert_eq!(q.next(), Some(&"c"));
        assert_eq!(q.next(), None);
        assert_eq!(q.next(), None);
    }

    #[test]
    fn claimed_tracks_progress() {
        let q = WorkQueue::new(vec![1, 2]);
        assert_eq!(q.claimed(), 0);
        q.next();
        assert_eq!(q.claimed(), 1);
        q.next();
        q.next(); // exhausted; claimed stays capped at total
        assert_eq!(q.claimed(), 2);
    }

    #[test]
    fn empty_queue() {
        let q: WorkQueue<i32> = WorkQueue::new(vec![]);
        assert_eq!(q.total(), 0);
        assert_eq!(q.next(), None);
    }
}
