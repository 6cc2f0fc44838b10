//! Per-unit state transitions
//!
//! Lifecycle handled here:
//!
//! ```text
//! Alive ──(deopt, external)──▶ NotEntrant ──(unreferenced)──▶ Zombie ──(next pass)──▶ Unloaded
//! ```
//!
//! Each sweeper step requires a full pass of confirmed non-liveness, so a
//! unit is released at the earliest one pass after it became a zombie.

use crate::cache::CodeCache;
use crate::clock::Clock;
use crate::error::{SweepError, SweepResult};
use crate::event_log::{EventLog, SweepEvent, SweepOrigin};
use crate::stats::PassCounters;
use crate::unit::{CodeUnit, UnitState};
use std::time::Duration;

/// Work done by one processor run, folded into the sweep state afterwards
#[derive(Debug, Default, Clone, Copy)]
pub struct Tally {
    /// Per-pass outcome counters
    pub counters: PassCounters,
    /// Time spent disconnecting inline caches
    pub disconnect_time: Duration,
    /// Longest single disconnect
    pub peak_disconnect: Duration,
}

/// Applies transitions to units on behalf of one pass
pub struct UnitProcessor<'a> {
    cache: &'a dyn CodeCache,
    clock: &'a dyn Clock,
    log: Option<&'a EventLog>,
    /// Pass the processed units belong to
    pass_id: u64,
    /// Units stamped at or after this pass id count as referenced
    epoch: u64,
}

impl<'a> UnitProcessor<'a> {
    /// Create a processor for pass `pass_id` with liveness `epoch`
    pub fn new(
        cache: &'a dyn CodeCache,
        clock: &'a dyn Clock,
        log: Option<&'a EventLog>,
        pass_id: u64,
        epoch: u64,
    ) -> Self {
        Self {
            cache,
            clock,
            log,
            pass_id,
            epoch,
        }
    }

    /// Apply the regular-pass transition for `unit`
    pub fn process(&self, unit: &CodeUnit, tally: &mut Tally) -> SweepResult<()> {
        tally.counters.seen += 1;

        match unit.state() {
            UnitState::Alive => {
                tally.counters.alive_seen += 1;
            }
            UnitState::NotEntrant => {
                if unit.is_referenced_in(self.epoch) {
                    tally.counters.not_entrant_on_stack += 1;
                } else {
                    self.make_zombie(unit, tally, SweepOrigin::Regular)?;
                    tally.counters.zombified += 1;
                }
            }
            UnitState::Zombie => {
                if unit.is_locked_by_reader() {
                    tally.counters.locked_seen += 1;
                } else if unit.zombie_pass() >= self.pass_id {
                    tally.counters.marked += 1;
                } else {
                    self.flush(unit, SweepOrigin::Regular)?;
                    tally.counters.flushed += 1;
                }
            }
            UnitState::Unloaded => {
                return Err(SweepError::IterationInconsistency {
                    compile_id: unit.compile_id(),
                });
            }
        }
        Ok(())
    }

    /// Apply the accelerated transition used when the cache is full.
    ///
    /// Only touches units that are eligible right now; returns whether the
    /// unit was released.
    pub fn reclaim_eligible(&self, unit: &CodeUnit, tally: &mut Tally) -> SweepResult<bool> {
        match unit.state() {
            UnitState::NotEntrant if !unit.is_referenced_in(self.epoch) => {
                self.make_zombie(unit, tally, SweepOrigin::Emergency)?;
                Ok(false)
            }
            UnitState::Zombie
                if !unit.is_locked_by_reader() && unit.zombie_pass() < self.pass_id =>
            {
                self.flush(unit, SweepOrigin::Emergency)?;
                Ok(true)
            }
            UnitState::Unloaded => Err(SweepError::IterationInconsistency {
                compile_id: unit.compile_id(),
            }),
            _ => Ok(false),
        }
    }

    fn make_zombie(
        &self,
        unit: &CodeUnit,
        tally: &mut Tally,
        origin: SweepOrigin,
    ) -> SweepResult<()> {
        self.transition(unit, UnitState::NotEntrant, UnitState::Zombie, origin)?;
        unit.set_zombie_pass(self.pass_id);

        let start = self.clock.now();
        self.cache.disconnect_inline_caches(unit);
        let elapsed = self.clock.now().saturating_duration_since(start);
        tally.disconnect_time += elapsed;
        tally.peak_disconnect = tally.peak_disconnect.max(elapsed);
        Ok(())
    }

    fn flush(&self, unit: &CodeUnit, origin: SweepOrigin) -> SweepResult<()> {
        self.transition(unit, UnitState::Zombie, UnitState::Unloaded, origin)?;
        self.cache.release(unit);
        Ok(())
    }

    fn transition(
        &self,
        unit: &CodeUnit,
        from: UnitState,
        to: UnitState,
        origin: SweepOrigin,
    ) -> SweepResult<()> {
        unit.transition(from, to).map_err(|found| SweepError::UnexpectedState {
            compile_id: unit.compile_id(),
            expected: from,
            found,
        })?;

        tracing::trace!(
            target: "otter::sweeper",
            compile_id = unit.compile_id().0,
            entry = unit.entry(),
            ?from,
            ?to,
            ?origin,
            pass = self.pass_id,
            "Unit transition"
        );

        if let Some(log) = self.log {
            log.record(SweepEvent {
                pass_id: self.pass_id,
                compile_id: unit.compile_id(),
                entry: unit.entry(),
                from,
                to,
                origin,
            });
        }
        Ok(())
    }
}
