//! Sweep statistics

use std::fmt;
use std::time::Duration;

/// Counters for a single pass over the code cache
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassCounters {
    /// Units handed to the processor
    pub seen: usize,
    /// Zombies unloaded and released
    pub flushed: usize,
    /// Not-entrant units turned into zombies
    pub zombified: usize,
    /// Zombies deferred because they were created during this pass
    pub marked: usize,
    /// Zombies skipped because a reader held them
    pub locked_seen: usize,
    /// Not-entrant units still referenced by machine state
    pub not_entrant_on_stack: usize,
    /// Alive units left untouched
    pub alive_seen: usize,
}

impl PassCounters {
    /// Add another tally into this one
    pub fn merge(&mut self, other: &PassCounters) {
        self.seen += other.seen;
        self.flushed += other.flushed;
        self.zombified += other.zombified;
        self.marked += other.marked;
        self.locked_seen += other.locked_seen;
        self.not_entrant_on_stack += other.not_entrant_on_stack;
        self.alive_seen += other.alive_seen;
    }

    /// Every seen unit is accounted for by exactly one outcome
    pub fn is_conserved(&self) -> bool {
        self.flushed
            + self.zombified
            + self.marked
            + self.locked_seen
            + self.not_entrant_on_stack
            + self.alive_seen
            == self.seen
    }
}

/// Cumulative sweeper statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Passes started so far (also the current pass id)
    pub traversals: u64,
    /// Passes run to completion
    pub completed_passes: u64,
    /// Accelerated sweeps caused by a full code cache
    pub full_cache_sweeps: u64,
    /// Units released across all passes and emergency sweeps
    pub total_reclaimed: u64,
    /// Time spent in regular passes
    pub total_sweep_time: Duration,
    /// Longest regular pass
    pub peak_sweep_time: Duration,
    /// Longest single `advance` fraction
    pub peak_fraction_time: Duration,
    /// Time spent disconnecting inline caches
    pub total_disconnect_time: Duration,
    /// Longest single disconnect episode
    pub peak_disconnect_time: Duration,
}

impl SweepStats {
    pub(crate) fn record_fraction(&mut self, elapsed: Duration) {
        self.peak_fraction_time = self.peak_fraction_time.max(elapsed);
    }

    pub(crate) fn record_pass(&mut self, elapsed: Duration) {
        self.completed_passes += 1;
        self.total_sweep_time += elapsed;
        self.peak_sweep_time = self.peak_sweep_time.max(elapsed);
    }

    pub(crate) fn record_disconnect(&mut self, total: Duration, peak: Duration) {
        self.total_disconnect_time += total;
        self.peak_disconnect_time = self.peak_disconnect_time.max(peak);
    }
}

impl fmt::Display for SweepStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Code cache sweeper statistics:")?;
        writeln!(
            f,
            "  passes: {} started, {} completed, {} caused by full cache",
            self.traversals, self.completed_passes, self.full_cache_sweeps
        )?;
        writeln!(f, "  units reclaimed: {}", self.total_reclaimed)?;
        writeln!(
            f,
            "  sweep time: total {:?}, peak pass {:?}, peak fraction {:?}",
            self.total_sweep_time, self.peak_sweep_time, self.peak_fraction_time
        )?;
        write!(
            f,
            "  disconnect time: total {:?}, peak {:?}",
            self.total_disconnect_time, self.peak_disconnect_time
        )
    }
}
