//! Bounded set of message ids already handled, for idempotent flooding.

use std::collections::HashSet;

/// Message ids seen so far. Bounded, not LRU: when the capacity is exceeded an
/// arbitrary batch of entries is dropped.
#[derive(Debug)]
pub struct SeenSet {
    ids: HashSet<String>,
    capacity: usize,
    evict: usize,
}

impl SeenSet {
    pub fn new(capacity: usize, evict: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity + 1),
            capacity,
            evict: evict.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_owned()) {
            return false;
        }
        if self.ids.len() > self.capacity {
            let drop_count = self.evict.max(self.ids.len() - self.capacity);
            let victims: Vec<String> = self
                .ids
                .iter()
                .filter(|v| v.as_str() != id)
                .take(drop_count)
                .cloned()
                .collect();
            for v in victims {
                self.ids.remove(&v);
            }
            tracing::trace!(remaining = self.ids.len(), "seen set evicted");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_reports_false() {
        let mut seen = SeenSet::new(10, 3);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.contains("a"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut seen = SeenSet::new(2000, 500);
        for i in 0..10_000 {
            seen.insert(&format!("m{i}"));
            assert!(seen.len() <= 2000);
        }
    }

    #[test]
    fn eviction_drops_a_batch_and_keeps_newest() {
        let mut seen = SeenSet::new(2000, 500);
        for i in 0..2000 {
            seen.insert(&format!("m{i}"));
        }
        assert_eq!(seen.len(), 2000);
        seen.insert("newest");
        assert_eq!(seen.len(), 1501);
        assert!(seen.contains("newest"));
    }
}
