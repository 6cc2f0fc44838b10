//! Cross-pass sweep bookkeeping

use crate::stats::{PassCounters, SweepStats};
use crate::unit::CompileId;
use rustc_hash::FxHashSet;
use std::time::{Duration, Instant};

/// Position of the running pass in the cache's iteration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCursor {
    /// Next slot to examine
    pub next_slot: usize,
    /// Highest compile id present when the pass began; newer units wait for
    /// the next pass
    pub limit: CompileId,
    /// Iteration reached the end of the cache
    pub exhausted: bool,
}

/// Memory of the most recent cache-full episode
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyRecord {
    /// The allocator reported a full cache and has not reported recovery
    pub cache_was_full: bool,
    /// When the last accelerated sweep was requested
    pub last_full: Option<Instant>,
    /// Highest compile id handed out at the time of the report
    pub highest_compile_id: CompileId,
    /// Pass id at the time of the report
    pub pass_id: u64,
    /// Consecutive accelerated sweeps that released nothing
    pub unproductive_runs: u32,
}

/// Sweep state guarded by the sweeper's mutex
#[derive(Debug, Default)]
pub(crate) struct SweepState {
    /// Pass the cursor belongs to
    pub current_pass: u64,
    /// Liveness epoch of the latest pass that began after a pause
    pub liveness_epoch: u64,
    pub cursor: Option<SweepCursor>,
    pub counters: PassCounters,
    pub remaining_invocations: usize,
    /// Fractions claimed but not yet folded back
    pub in_flight: usize,
    /// Units owned by in-flight fractions
    pub claimed: FxHashSet<CompileId>,
    pub pass_started: Option<Instant>,
    /// Time spent in fractions of the running pass
    pub time_this_pass: Duration,
    pub emergency: EmergencyRecord,
    pub totals: SweepStats,
    /// Counters of the last completed pass
    pub last_pass: PassCounters,
}

impl SweepState {
    pub fn is_sweeping(&self) -> bool {
        self.cursor.is_some()
    }

    /// The pass has no work left to hand out and nothing in flight
    pub fn pass_complete(&self) -> bool {
        match self.cursor {
            Some(cursor) => {
                (cursor.exhausted || self.remaining_invocations == 0) && self.in_flight == 0
            }
            None => false,
        }
    }

    /// Reset per-pass bookkeeping for a new pass
    pub fn start_pass(
        &mut self,
        pass_id: u64,
        cursor: SweepCursor,
        invocations: usize,
        now: Instant,
    ) {
        self.current_pass = pass_id;
        self.cursor = Some(cursor);
        self.counters = PassCounters::default();
        self.remaining_invocations = invocations;
        self.pass_started = Some(now);
        self.time_this_pass = Duration::ZERO;
    }

    /// Drop the running pass without publishing its counters
    pub fn abandon_pass(&mut self) {
        self.cursor = None;
        self.counters = PassCounters::default();
        self.remaining_invocations = 0;
        self.pass_started = None;
        self.time_this_pass = Duration::ZERO;
    }
}
