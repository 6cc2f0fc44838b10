//! Emergency reclamation for a full code cache
//!
//! An allocator that cannot fit new code reports it through
//! [`Sweeper::handle_cache_full`]. The next `advance` then runs
//! [`Sweeper::speculative_disconnect`], which walks the whole cache in one go
//! instead of waiting for the fraction schedule. The walk holds the sweep
//! state mutex throughout, skips units claimed by in-flight fractions, and
//! performs no heap allocation.

use crate::error::{SweepError, SweepResult};
use crate::processor::{Tally, UnitProcessor};
use crate::sweeper::Sweeper;
use std::sync::atomic::Ordering;

impl Sweeper {
    /// Report the outcome of a code cache allocation.
    ///
    /// `is_full == false` reports recovery. When full, the episode is
    /// recorded and, unless one was requested within
    /// `emergency_interval`, an accelerated sweep is scheduled for the next
    /// `advance`. Fails with [`SweepError::CodeCacheExhausted`] once
    /// `max_unproductive_emergencies` accelerated sweeps in a row freed
    /// nothing; what to do about it is the runtime's call.
    pub fn handle_cache_full(&self, is_full: bool) -> SweepResult<()> {
        let mut state = self.state.lock();
        let record = &mut state.emergency;

        if !is_full {
            if record.cache_was_full {
                tracing::debug!(target: "otter::sweeper", "Code cache no longer full");
            }
            record.cache_was_full = false;
            record.unproductive_runs = 0;
            return Ok(());
        }

        if record.cache_was_full
            && record.unproductive_runs >= self.config.max_unproductive_emergencies
        {
            tracing::warn!(
                target: "otter::sweeper",
                episodes = record.unproductive_runs,
                highest_compile_id = record.highest_compile_id.0,
                "Code cache exhausted, emergency sweeps free nothing"
            );
            return Err(SweepError::CodeCacheExhausted {
                episodes: record.unproductive_runs,
            });
        }

        let now = self.clock.now();
        let throttled = record.cache_was_full
            && record.last_full.is_some_and(|last| {
                now.saturating_duration_since(last) < self.config.emergency_interval
            });

        record.cache_was_full = true;
        record.highest_compile_id = self.cache.highest_compile_id();
        record.pass_id = self.pass_id.load(Ordering::Acquire);
        if throttled {
            return Ok(());
        }
        record.last_full = Some(now);

        tracing::warn!(
            target: "otter::sweeper",
            pass = record.pass_id,
            highest_compile_id = record.highest_compile_id.0,
            units = self.cache.unit_count(),
            "Code cache full, requesting emergency sweep"
        );

        self.emergency_requested.store(true, Ordering::Release);
        self.sweep_enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Disconnect and reclaim every eligible unit right now.
    ///
    /// Unreferenced not-entrant units become zombies; unlocked zombies from
    /// an earlier pass are released. Reclamations go to the cumulative
    /// totals only, the running pass's counters are left alone. Returns the
    /// number of units released.
    ///
    /// The sweep state mutex is held for the whole walk, including every
    /// inline cache disconnect and release, so concurrent `advance` calls
    /// stall until it finishes. Units claimed by in-flight fractions are
    /// skipped.
    pub fn speculative_disconnect(&self, was_full: bool) -> SweepResult<usize> {
        if !self.config.enabled {
            return Ok(0);
        }

        let mut state = self.state.lock();
        let start = self.clock.now();
        let pass_id = self.pass_id.load(Ordering::Acquire);
        // While idle, zombies made here belong to the upcoming pass
        let acting_pass = if state.is_sweeping() { pass_id } else { pass_id + 1 };
        // A pending rescan means units were stamped at a pause after the last pass began
        let epoch = if self.rescan_requested.load(Ordering::Acquire) {
            pass_id + 1
        } else {
            state.liveness_epoch
        };
        let processor = UnitProcessor::new(
            &*self.cache,
            &*self.clock,
            self.event_log.as_ref(),
            acting_pass,
            epoch,
        );

        let mut tally = Tally::default();
        let mut reclaimed = 0usize;
        let mut failure = None;
        let mut slot = 0;
        while let Some((idx, unit)) = self.cache.next_unit(slot) {
            slot = idx + 1;
            if state.claimed.contains(&unit.compile_id()) {
                continue;
            }
            match processor.reclaim_eligible(&unit, &mut tally) {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let elapsed = self.clock.now().saturating_duration_since(start);
        state.totals.total_reclaimed += reclaimed as u64;
        state.totals.record_disconnect(elapsed, elapsed);
        if was_full {
            state.totals.full_cache_sweeps += 1;
            if reclaimed == 0 {
                state.emergency.unproductive_runs += 1;
            } else {
                state.emergency.unproductive_runs = 0;
            }
        }

        // Units released before a failure are gone either way
        if let Some(err) = failure {
            tracing::error!(
                target: "otter::sweeper",
                pass = acting_pass,
                reclaimed,
                error = %err,
                "Speculative disconnect aborted"
            );
            return Err(err);
        }

        tracing::debug!(
            target: "otter::sweeper",
            pass = acting_pass,
            reclaimed,
            was_full,
            disconnect_us = elapsed.as_micros() as u64,
            "Speculative disconnect complete"
        );
        Ok(reclaimed)
    }

    /// Whether the allocator last reported a full cache
    pub fn was_full(&self) -> bool {
        self.state.lock().emergency.cache_was_full
    }
}
