//! # Sequence Reordering
//!
//! Restores sender order for numbered messages that the network delivered out
//! of order. Items ahead of the expected sequence are held in a bounded buffer
//! and released as soon as the gap before them closes; items behind it were
//! already delivered and are dropped.
//!
//! ## Overflow:
//! The buffer never grows past its capacity. When it is full, the new arrival
//! is dropped and the expected counter jumps to the lowest buffered sequence,
//! so one lost message cannot stall the session forever.

use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 50;

/// Gaps wider than this are logged as a probable drop upstream.
pub const GAP_WARNING_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub delivered: u64,
    pub buffered: u64,
    pub stale_dropped: u64,
    pub overflow_dropped: u64,
    pub gaps_skipped: u64,
}

#[derive(Debug)]
pub struct ReorderBuffer<T> {
    label: &'static str,
    expected: u64,
    pending: BTreeMap<u64, T>,
    capacity: usize,
    stats: ReorderStats,
}

impl<T> ReorderBuffer<T> {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            expected: 0,
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            stats: ReorderStats::default(),
        }
    }

    /// Accept one item and return everything that is now deliverable, in order.
    pub fn submit(&mut self, seq: Option<u64>, item: T) -> Vec<T> {
        let Some(seq) = seq else {
            return vec![item];
        };

        if seq < self.expected {
            self.stats.stale_dropped += 1;
            debug!(stream = self.label, seq, expected = self.expected, "dropping stale message");
            return Vec::new();
        }

        if seq == self.expected {
            let mut ready = vec![item];
            self.expected += 1;
            self.stats.delivered += 1;
            self.drain_into(&mut ready);
            return ready;
        }

        if self.pending.contains_key(&seq) {
            self.stats.stale_dropped += 1;
            debug!(stream = self.label, seq, "dropping duplicate buffered message");
            return Vec::new();
        }

        let gap = seq - self.expected;
        if gap > GAP_WARNING_THRESHOLD {
            warn!(
                stream = self.label,
                seq,
                expected = self.expected,
                gap,
                "large sequence gap, messages may have been dropped"
            );
        }

        if self.pending.len() >= self.capacity {
            self.stats.overflow_dropped += 1;
            warn!(
                stream = self.label,
                seq,
                capacity = self.capacity,
                "reorder buffer full, dropping arrival and skipping gap"
            );
            return self.skip_gap();
        }

        self.pending.insert(seq, item);
        self.stats.buffered += 1;
        Vec::new()
    }

    /// Deliver a batch envelope's members in their given order.
    ///
    /// Batch order is guaranteed by the sender, so members are not buffered
    /// individually; only already-delivered sequences are filtered out. The
    /// expected counter moves past the last member and any buffered items
    /// that became consecutive are drained after the batch.
    pub fn submit_batch(&mut self, items: Vec<(Option<u64>, T)>) -> Vec<T> {
        let mut ready = Vec::with_capacity(items.len());
        let mut last_seq = None;

        for (seq, item) in items {
            match seq {
                Some(seq) if seq < self.expected => {
                    self.stats.stale_dropped += 1;
                }
                Some(seq) => {
                    last_seq = Some(seq);
                    self.stats.delivered += 1;
                    ready.push(item);
                }
                None => ready.push(item),
            }
        }

        if let Some(last) = last_seq {
            self.expected = self.expected.max(last + 1);
            let expected = self.expected;
            let before = self.pending.len();
            self.pending.retain(|&seq, _| seq >= expected);
            self.stats.stale_dropped += (before - self.pending.len()) as u64;
        }

        self.drain_into(&mut ready);
        ready
    }

    /// Forget buffered items and restart counting at `next_expected`.
    pub fn reset(&mut self, next_expected: u64) {
        if !self.pending.is_empty() {
            debug!(stream = self.label, discarded = self.pending.len(), "reorder buffer reset");
        }
        self.pending.clear();
        self.expected = next_expected;
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Highest sequence handed to the dispatcher so far.
    pub fn last_delivered(&self) -> Option<u64> {
        self.expected.checked_sub(1)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    fn skip_gap(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        if let Some((&lowest, _)) = self.pending.iter().next() {
            self.stats.gaps_skipped += 1;
            warn!(
                stream = self.label,
                from = self.expected,
                to = lowest,
                "skipping unrecoverable sequence gap"
            );
            self.expected = lowest;
            self.drain_into(&mut ready);
        }
        ready
    }

    fn drain_into(&mut self, ready: &mut Vec<T>) {
        while let Some(item) = self.pending.remove(&self.expected) {
            ready.push(item);
            self.expected += 1;
            self.stats.delivered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn test_random_permutations_deliver_in_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for n in [1u64, 2, 5, 20, 49] {
            for _ in 0..50 {
                let mut order: Vec<u64> = (0..n).collect();
                order.shuffle(&mut rng);

                let mut buffer = ReorderBuffer::new("test", DEFAULT_CAPACITY);
                let mut delivered = Vec::new();
                for seq in order {
                    delivered.extend(buffer.submit(Some(seq), seq));
                }

                assert_eq!(delivered, (0..n).collect::<Vec<_>>());
                assert!(buffer.is_empty());
            }
        }
    }

    #[test]
    fn test_unsequenced_items_bypass_ordering() {
        let mut buffer = ReorderBuffer::new("test", 4);
        assert!(buffer.submit(Some(3), "c").is_empty());
        assert_eq!(buffer.submit(None, "ping"), vec!["ping"]);
        assert_eq!(buffer.expected(), 0);
    }

    #[test]
    fn test_stale_and_duplicate_are_dropped() {
        let mut buffer = ReorderBuffer::new("test", 4);
        assert_eq!(buffer.submit(Some(0), 0), vec![0]);
        assert!(buffer.submit(Some(0), 0).is_empty());
        assert!(buffer.submit(Some(2), 2).is_empty());
        assert!(buffer.submit(Some(2), 2).is_empty());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.stats().stale_dropped, 2);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let capacity = 5;
        let mut buffer = ReorderBuffer::new("test", capacity);
        // seq 0 never arrives
        for seq in 1..=capacity as u64 {
            assert!(buffer.submit(Some(seq), seq).is_empty());
        }
        assert_eq!(buffer.len(), capacity);

        // arrival at capacity is dropped, and the gap before 1 is skipped
        let released = buffer.submit(Some(40), 40);
        assert_eq!(released, vec![1, 2, 3, 4, 5]);
        assert!(buffer.len() <= capacity);
        assert_eq!(buffer.stats().overflow_dropped, 1);
        assert_eq!(buffer.expected(), 6);

        // 40 was dropped, not silently kept
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_batch_advances_past_last_member() {
        let mut buffer = ReorderBuffer::new("test", 10);
        assert!(buffer.submit(Some(5), 5).is_empty());
        let out = buffer.submit_batch(vec![(Some(0), 0), (Some(1), 1), (Some(2), 2), (Some(3), 3), (Some(4), 4)]);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(buffer.expected(), 6);
        assert_eq!(buffer.last_delivered(), Some(5));
    }

    #[test]
    fn test_batch_filters_already_delivered() {
        let mut buffer = ReorderBuffer::new("test", 10);
        buffer.submit(Some(0), 0);
        buffer.submit(Some(1), 1);
        let out = buffer.submit_batch(vec![(Some(1), 1), (Some(2), 2)]);
        assert_eq!(out, vec![2]);
    }
}
