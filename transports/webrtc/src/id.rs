//! Per-channel message ID sequencing

use std::collections::HashMap;

use parking_lot::Mutex;

/// First ID handed out for a key
pub const MIN_ID: u64 = 1;

/// Distance between consecutive IDs of a key
pub const ID_STEP: u64 = 1;

/// Monotonic ID generator keyed by channel
///
/// Every key has its own sequence starting at [`MIN_ID`]. A sequence never
/// rewinds while the key is known; [`IdentitySequencer::retire`] drops it,
/// so only retire keys that will not be used again.
#[derive(Debug, Default)]
pub struct IdentitySequencer {
    last: Mutex<HashMap<String, u64>>,
}

impl IdentitySequencer {
    /// Create an empty sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// Next ID for `key`
    pub fn next(&self, key: &str) -> u64 {
        let mut last = self.last.lock();
        let next = match last.get(key) {
            Some(previous) => previous + ID_STEP,
            None => MIN_ID,
        };
        last.insert(key.to_string(), next);
        next
    }

    /// Forget the sequence for a channel that has closed
    pub fn retire(&self, key: &str) {
        self.last.lock().remove(key);
    }

    /// Number of keys with a live sequence
    pub fn len(&self) -> usize {
        self.last.lock().len()
    }

    /// Check whether no key has been sequenced
    pub fn is_empty(&self) -> bool {
        self.last.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fresh_key_starts_at_minimum() {
        let ids = IdentitySequencer::new();
        assert_eq!(ids.next("hubnet-web-17"), MIN_ID);
        assert_eq!(ids.next("hubnet-web-18"), MIN_ID);
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let ids = IdentitySequencer::new();
        let seen: Vec<u64> = (0..100).map(|_| ids.next("peer")).collect();
        assert!(seen.windows(2).all(|pair| pair[1] == pair[0] + ID_STEP));
        assert_eq!(seen[0], MIN_ID);
    }

    #[test]
    fn test_retire_forgets_key() {
        let ids = IdentitySequencer::new();
        ids.next("a");
        ids.next("b");
        assert_eq!(ids.len(), 2);
        ids.retire("a");
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_share_an_id() {
        let ids = Arc::new(IdentitySequencer::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(tokio::spawn(async move {
                (0..50).map(|_| ids.next("shared")).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(all[0], MIN_ID);
        assert_eq!(all[399], 400);
    }
}
