//! Context window bookkeeping.
//!
//! Tracks how many positions of the window hold tokens and how many leading
//! positions belong to the protected anchor (the system prompt). The counters
//! mirror what backend memory holds; they can always be rebuilt from the
//! backend through [`WindowTracker::restore`].

use ctxkeeper_core::{Error, Position, Result, SequenceId, WindowUsage};

/// Window occupancy counters for one conversation sequence.
///
/// Invariant: `0 <= anchor <= occupied <= capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTracker {
    capacity: usize,
    occupied: usize,
    anchor: usize,
    sequence_id: SequenceId,
}

impl WindowTracker {
    /// Create a tracker for an empty window.
    pub fn new(capacity: usize, sequence_id: SequenceId) -> Self {
        Self {
            capacity,
            occupied: 0,
            anchor: 0,
            sequence_id,
        }
    }

    /// Start a fresh session over a window of `capacity` positions.
    pub fn begin_session(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.occupied = 0;
        self.anchor = 0;
    }

    /// Count `n` newly inserted tokens.
    pub fn record_insertion(&mut self, n: usize) -> Result<()> {
        if self.occupied + n > self.capacity {
            return Err(Error::WindowOverflow {
                occupied: self.occupied,
                requested: n,
                capacity: self.capacity,
            });
        }
        self.occupied += n;
        Ok(())
    }

    /// Anchor the first `n` tokens if nothing has been inserted yet.
    ///
    /// Returns whether the anchor was set.
    pub fn set_anchor_if_unset(&mut self, n: usize) -> bool {
        if self.occupied != 0 {
            return false;
        }
        self.anchor = n;
        true
    }

    /// The `[start, end)` span pruning may touch.
    pub fn evictable_span(&self) -> std::ops::Range<usize> {
        if self.occupied <= self.anchor {
            return self.anchor..self.anchor;
        }
        self.anchor..self.occupied
    }

    pub fn evictable(&self) -> usize {
        self.occupied.saturating_sub(self.anchor)
    }

    /// Forget `count` tokens that were evicted from backend memory.
    pub fn apply_eviction(&mut self, count: usize) -> Result<()> {
        let evictable = self.evictable();
        if count > evictable {
            return Err(Error::InvalidEviction { count, evictable });
        }
        self.occupied -= count;
        Ok(())
    }

    /// Overwrite both counters after a state restore.
    pub fn restore(&mut self, occupied: usize, anchor: usize) -> Result<()> {
        if occupied > self.capacity {
            return Err(Error::WindowOverflow {
                occupied: 0,
                requested: occupied,
                capacity: self.capacity,
            });
        }
        self.occupied = occupied;
        self.anchor = anchor.min(occupied);
        Ok(())
    }

    /// Drop everything after the anchor.
    pub fn rewind_to_anchor(&mut self) {
        self.occupied = self.anchor;
    }

    /// Position the next inserted token will take.
    pub fn next_position(&self) -> Position {
        self.occupied as Position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn anchor(&self) -> usize {
        self.anchor
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.occupied
    }

    pub fn is_full(&self) -> bool {
        self.occupied >= self.capacity
    }

    pub fn usage(&self) -> WindowUsage {
        WindowUsage::new(self.capacity, self.occupied, self.anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(tracker: &WindowTracker) {
        assert!(tracker.anchor() <= tracker.occupied());
        assert!(tracker.occupied() <= tracker.capacity());
    }

    #[test]
    fn test_first_insertion_sets_anchor() {
        let mut tracker = WindowTracker::new(8, 0);
        assert!(tracker.set_anchor_if_unset(3));
        tracker.record_insertion(3).unwrap();

        assert!(!tracker.set_anchor_if_unset(2));
        tracker.record_insertion(2).unwrap();

        assert_eq!(tracker.anchor(), 3);
        assert_eq!(tracker.occupied(), 5);
        assert_invariant(&tracker);
    }

    #[test]
    fn test_insertion_overflow() {
        let mut tracker = WindowTracker::new(8, 0);
        tracker.record_insertion(6).unwrap();

        let err = tracker.record_insertion(3).unwrap_err();
        assert!(matches!(err, Error::WindowOverflow { occupied: 6, requested: 3, capacity: 8 }));
        assert_eq!(tracker.occupied(), 6);

        tracker.record_insertion(2).unwrap();
        assert!(tracker.is_full());
    }

    #[test]
    fn test_eviction_cannot_touch_anchor() {
        let mut tracker = WindowTracker::new(100, 0);
        tracker.set_anchor_if_unset(10);
        tracker.record_insertion(10).unwrap();
        tracker.record_insertion(30).unwrap();

        assert_eq!(tracker.evictable_span(), 10..40);
        let err = tracker.apply_eviction(31).unwrap_err();
        assert!(matches!(err, Error::InvalidEviction { count: 31, evictable: 30 }));

        tracker.apply_eviction(30).unwrap();
        assert_eq!(tracker.occupied(), 10);
        assert!(tracker.evictable_span().is_empty());
        assert_invariant(&tracker);
    }

    #[test]
    fn test_invariant_over_mixed_operations() {
        let mut tracker = WindowTracker::new(64, 0);
        tracker.set_anchor_if_unset(5);
        tracker.record_insertion(5).unwrap();

        // Deterministic walk over inserts and evictions, including failing ones.
        let mut step: usize = 7;
        for _ in 0..200 {
            step = (step * 31 + 11) % 97;
            if step % 3 == 0 {
                let _ = tracker.apply_eviction(step % 20);
            } else {
                let _ = tracker.record_insertion(step % 13);
            }
            assert_invariant(&tracker);
        }
    }

    #[test]
    fn test_restore_anchors_whole_window() {
        let mut tracker = WindowTracker::new(2048, 0);
        tracker.restore(700, 700).unwrap();
        assert_eq!(tracker.occupied(), 700);
        assert_eq!(tracker.anchor(), 700);
        assert_eq!(tracker.evictable(), 0);

        assert!(tracker.restore(4096, 4096).is_err());
        assert_eq!(tracker.occupied(), 700);
    }

    #[test]
    fn test_begin_session_clears_counters() {
        let mut tracker = WindowTracker::new(16, 0);
        tracker.set_anchor_if_unset(4);
        tracker.record_insertion(9).unwrap();

        tracker.begin_session(32);
        assert_eq!(tracker.capacity(), 32);
        assert_eq!(tracker.occupied(), 0);
        assert_eq!(tracker.anchor(), 0);
    }

    #[test]
    fn test_rewind_to_anchor() {
        let mut tracker = WindowTracker::new(16, 0);
        tracker.set_anchor_if_unset(4);
        tracker.record_insertion(12).unwrap();
        tracker.rewind_to_anchor();
        assert_eq!(tracker.occupied(), 4);
        assert_eq!(tracker.next_position(), 4);
    }
}
