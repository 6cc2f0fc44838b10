//! Ring buffer of recent sweeper transitions
//!
//! Debugging aid for tracking down premature reclamation: every state change
//! the sweeper applies is recorded with the pass it happened in, so a crash
//! at a stale entry address can be traced back to the unit that lived there.

use crate::unit::{CompileId, UnitState};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Which path applied a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOrigin {
    /// Incremental pass driven by `advance`
    Regular,
    /// Accelerated disconnect after a cache-full report
    Emergency,
}

/// One recorded transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepEvent {
    /// Pass the transition belongs to
    pub pass_id: u64,
    /// Unit that changed
    pub compile_id: CompileId,
    /// Entry address of the unit
    pub entry: usize,
    /// State before
    pub from: UnitState,
    /// State after
    pub to: UnitState,
    /// Path that applied it
    pub origin: SweepOrigin,
}

/// Fixed-capacity circular log of [`SweepEvent`]s
///
/// Storage is reserved up front; recording never allocates.
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<SweepEvent>>,
}

impl EventLog {
    /// Create a log keeping the last `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record an event, evicting the oldest when full
    pub fn record(&self, event: SweepEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events recorded for `id`, oldest first
    pub fn events_for(&self, id: CompileId) -> Vec<SweepEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.compile_id == id)
            .copied()
            .collect()
    }

    /// Events for whichever units had `entry` as entry address
    pub fn events_at(&self, entry: usize) -> Vec<SweepEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.entry == entry)
            .copied()
            .collect()
    }

    /// All retained events, oldest first
    pub fn recent(&self) -> Vec<SweepEvent> {
        self.events.lock().iter().copied().collect()
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained events
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
