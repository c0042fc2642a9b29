//! Sliding-window pruning.
//!
//! When a prompt would crowd the window, the oldest quarter of the
//! non-anchored span is evicted from backend memory and every later position
//! is shifted down to close the gap. The anchor is never touched.

use tracing::info;

use ctxkeeper_core::{Error, KvMemory, Position, Result, WindowConfig};

use crate::tracker::WindowTracker;

/// Share of the evictable span removed per pruning event (1/4).
const EVICTION_DIVISOR: usize = 4;

/// A planned eviction of window positions `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPlan {
    pub start: usize,
    pub end: usize,
}

impl EvictionPlan {
    pub fn count(&self) -> usize {
        self.end - self.start
    }
}

/// Result of a pruning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOutcome {
    pub removed: usize,
    pub occupied_before: usize,
    pub occupied_after: usize,
}

/// Decides when and how much of the window to evict.
#[derive(Debug, Clone, Copy)]
pub struct PruningPolicy {
    /// Free positions to keep before an insertion triggers pruning.
    reserve_margin: usize,
    /// Free positions that must remain after pruning.
    overflow_margin: usize,
}

impl Default for PruningPolicy {
    fn default() -> Self {
        Self::from_config(&WindowConfig::default())
    }
}

impl PruningPolicy {
    pub fn new(reserve_margin: usize, overflow_margin: usize) -> Self {
        Self {
            reserve_margin,
            overflow_margin,
        }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        Self::new(config.reserve_margin, config.overflow_margin)
    }

    pub fn reserve_margin(&self) -> usize {
        self.reserve_margin
    }

    pub fn overflow_margin(&self) -> usize {
        self.overflow_margin
    }

    /// Whether inserting `incoming` tokens crosses the reserve margin.
    pub fn needs_pruning(&self, tracker: &WindowTracker, incoming: usize) -> bool {
        let threshold = tracker.capacity().saturating_sub(self.reserve_margin);
        tracker.occupied() + incoming > threshold
    }

    /// The oldest quarter of the evictable span, or `None` if it is empty.
    pub fn plan(&self, tracker: &WindowTracker) -> Option<EvictionPlan> {
        let to_remove = tracker.evictable() / EVICTION_DIVISOR;
        if to_remove == 0 {
            return None;
        }
        let start = tracker.anchor();
        Some(EvictionPlan {
            start,
            end: start + to_remove,
        })
    }

    /// Prune if needed so that `incoming` tokens can be inserted.
    ///
    /// Returns the pruning outcome when an eviction happened. Fails with
    /// [`Error::PromptTooLarge`] when the insertion still does not fit.
    pub fn make_room(
        &self,
        tracker: &mut WindowTracker,
        memory: Option<&mut dyn KvMemory>,
        incoming: usize,
    ) -> Result<Option<PruneOutcome>> {
        let mut outcome = None;

        if self.needs_pruning(tracker, incoming) {
            info!(
                occupied = tracker.occupied(),
                incoming, "Context is getting full, pruning"
            );
            if let Some(plan) = self.plan(tracker) {
                let memory = memory.ok_or(Error::MemoryUnavailable)?;
                outcome = Some(self.evict(tracker, memory, plan)?);
            }
        }

        self.check_fits(tracker, incoming)?;
        Ok(outcome)
    }

    /// Fail with [`Error::PromptTooLarge`] unless `incoming` fits under the overflow margin.
    pub fn check_fits(&self, tracker: &WindowTracker, incoming: usize) -> Result<()> {
        let limit = tracker.capacity().saturating_sub(self.overflow_margin);
        if tracker.occupied() + incoming > limit {
            return Err(Error::PromptTooLarge {
                prompt_tokens: incoming,
                occupied: tracker.occupied(),
                limit,
            });
        }
        Ok(())
    }

    /// Remove the planned span from memory and close the gap.
    pub fn evict(
        &self,
        tracker: &mut WindowTracker,
        memory: &mut dyn KvMemory,
        plan: EvictionPlan,
    ) -> Result<PruneOutcome> {
        let count = plan.count();
        if plan.start != tracker.anchor() || count > tracker.evictable() {
            return Err(Error::InvalidEviction {
                count,
                evictable: tracker.evictable(),
            });
        }

        let sequence = tracker.sequence_id();
        let occupied_before = tracker.occupied();
        let start = plan.start as Position;
        let end = plan.end as Position;

        memory.remove_range(sequence, start, Some(end));
        memory.shift_positions(sequence, end, None, -(count as Position));
        tracker.apply_eviction(count)?;

        info!(
            removed = count,
            occupied = tracker.occupied(),
            "Pruning complete"
        );

        Ok(PruneOutcome {
            removed: count,
            occupied_before,
            occupied_after: tracker.occupied(),
        })
    }
}
