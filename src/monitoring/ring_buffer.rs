//! Bounded FIFO history
//!
//! Every sample history in the supervisor is a `RingBuffer`: pushing past
//! capacity evicts the oldest entry.

use serde::{Deserialize, Serialize};
use std::collections::vec_deque::{self, VecDeque};

/// Entries kept by aggressive reclamation
pub const RECLAIM_FLOOR: usize = 100;

/// How hard a reclamation pass works
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimLevel {
    /// Release slack capacity only
    Routine,
    /// Drop older history down to the floor
    Aggressive,
    /// Same as aggressive, never throttled
    Emergency,
}

impl ReclaimLevel {
    pub fn index(&self) -> usize {
        match self {
            ReclaimLevel::Routine => 0,
            ReclaimLevel::Aggressive => 1,
            ReclaimLevel::Emergency => 2,
        }
    }
}

impl std::fmt::Display for ReclaimLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimLevel::Routine => write!(f, "routine"),
            ReclaimLevel::Aggressive => write!(f, "aggressive"),
            ReclaimLevel::Emergency => write!(f, "emergency"),
        }
    }
}

/// Something that can give memory back on request
pub trait Reclaimable {
    /// Label used in optimization reports
    fn label(&self) -> &str;

    /// Release memory, returning an estimate of the bytes freed
    fn reclaim(&mut self, level: ReclaimLevel) -> u64;
}

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    label: &'static str,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self::labeled("history", capacity)
    }

    pub fn labeled(label: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            label,
        }
    }

    /// Append an entry, returning the evicted oldest entry when full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    /// Oldest to newest
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    /// The newest `n` entries, oldest first
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> + '_ {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip)
    }

    /// Entry `n` positions back from the newest (0 = newest)
    pub fn nth_back(&self, n: usize) -> Option<&T> {
        self.items.len().checked_sub(n + 1).and_then(|i| self.items.get(i))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Keep only the newest `keep` entries, returning how many were dropped
    pub fn compact(&mut self, keep: usize) -> usize {
        let excess = self.items.len().saturating_sub(keep);
        self.items.drain(..excess);
        excess
    }
}

impl<T> Reclaimable for RingBuffer<T> {
    fn label(&self) -> &str {
        self.label
    }

    fn reclaim(&mut self, level: ReclaimLevel) -> u64 {
        let entry = std::mem::size_of::<T>() as u64;
        let before = self.items.capacity() as u64;

        if level >= ReclaimLevel::Aggressive {
            let keep = (self.items.len() / 2).max(RECLAIM_FLOOR);
            self.compact(keep);
        }
        self.items.shrink_to_fit();

        before.saturating_sub(self.items.capacity() as u64) * entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_exceeds_capacity() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.push(4), Some(1));

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.oldest(), Some(&2));
        assert_eq!(ring.latest(), Some(&4));
    }

    #[test]
    fn test_last_n_and_nth_back() {
        let mut ring = RingBuffer::new(10);
        for i in 0..6 {
            ring.push(i);
        }

        let tail: Vec<_> = ring.last_n(3).copied().collect();
        assert_eq!(tail, vec![3, 4, 5]);
        assert_eq!(ring.nth_back(0), Some(&5));
        assert_eq!(ring.nth_back(1), Some(&4));
        assert_eq!(ring.nth_back(6), None);
        assert_eq!(ring.last_n(100).count(), 6);
    }

    #[test]
    fn test_aggressive_reclaim_respects_floor() {
        let mut ring = RingBuffer::new(1000);
        for i in 0..150 {
            ring.push(i);
        }

        ring.reclaim(ReclaimLevel::Routine);
        assert_eq!(ring.len(), 150);

        ring.reclaim(ReclaimLevel::Aggressive);
        assert_eq!(ring.len(), RECLAIM_FLOOR);
        assert_eq!(ring.latest(), Some(&149));
    }
}
