//! Incremental sweep scheduler
//!
//! ## Design
//!
//! - **Pauses only raise a flag**: `on_synchronization_pause` stamps the units
//!   the liveness oracle reports and sets `rescan_requested`
//! - **Opportunistic progress**: any worker thread may call `advance`, which
//!   claims one fraction of the cache under the state mutex and processes it
//!   with the mutex released
//! - **Bounded passes**: a pass is split into `ceil(units / fraction_size)`
//!   invocations and ends when the cursor or the budget runs out
//! - **Atomic finalization**: counters and timings of a pass are published
//!   under the mutex by whichever call folds the last in-flight fraction

use crate::cache::{CodeCache, LivenessOracle};
use crate::clock::{Clock, SystemClock};
use crate::config::SweeperConfig;
use crate::error::SweepResult;
use crate::event_log::EventLog;
use crate::processor::{Tally, UnitProcessor};
use crate::state::{EmergencyRecord, SweepCursor, SweepState};
use crate::stats::{PassCounters, SweepStats};
use crate::unit::CodeUnit;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Code cache sweeper
pub struct Sweeper {
    pub(crate) config: SweeperConfig,
    pub(crate) cache: Arc<dyn CodeCache>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) event_log: Option<EventLog>,
    /// Id of the latest pass to begin; pauses stamp units with `pass_id + 1`
    pub(crate) pass_id: CachePadded<AtomicU64>,
    /// Set by pauses, consumed when a pass begins
    pub(crate) rescan_requested: CachePadded<AtomicBool>,
    /// Set under cache pressure to begin a pass without a fresh rescan
    pub(crate) sweep_enabled: CachePadded<AtomicBool>,
    /// Next `advance` runs the accelerated disconnect first
    pub(crate) emergency_requested: CachePadded<AtomicBool>,
    pub(crate) state: Mutex<SweepState>,
}

impl Sweeper {
    /// Create a sweeper for `cache` using the system clock
    pub fn new(cache: Arc<dyn CodeCache>, config: SweeperConfig) -> SweepResult<Arc<Self>> {
        Self::with_clock(cache, config, Arc::new(SystemClock))
    }

    /// Create a sweeper with a custom time source
    pub fn with_clock(
        cache: Arc<dyn CodeCache>,
        config: SweeperConfig,
        clock: Arc<dyn Clock>,
    ) -> SweepResult<Arc<Self>> {
        config.validate()?;
        let event_log = (config.event_log_capacity > 0)
            .then(|| EventLog::with_capacity(config.event_log_capacity));

        Ok(Arc::new(Self {
            config,
            cache,
            clock,
            event_log,
            pass_id: CachePadded::new(AtomicU64::new(0)),
            rescan_requested: CachePadded::new(AtomicBool::new(false)),
            sweep_enabled: CachePadded::new(AtomicBool::new(false)),
            emergency_requested: CachePadded::new(AtomicBool::new(false)),
            state: Mutex::new(SweepState::default()),
        }))
    }

    /// Fold in fresh liveness data. Call once at the end of every
    /// synchronization pause.
    ///
    /// Never touches the state mutex: the only sweep-state mutation is the
    /// false -> true store of the rescan flag.
    pub fn on_synchronization_pause(&self, oracle: &dyn LivenessOracle) {
        if !self.config.enabled {
            return;
        }

        let mark = self.pass_id.load(Ordering::Acquire) + 1;
        let mut referenced = 0usize;
        oracle.visit_referenced(&mut |id| {
            if let Some(unit) = self.cache.find(id) {
                unit.mark_seen_on_stack(mark);
                referenced += 1;
            }
        });
        self.rescan_requested.store(true, Ordering::Release);

        tracing::trace!(
            target: "otter::sweeper",
            mark,
            referenced,
            "Stack scan folded in"
        );
    }

    /// Make `unit` not entrant on behalf of the deoptimization path.
    ///
    /// The unit is stamped so that it stays put until a synchronization
    /// pause has confirmed it is off every stack. Returns false if the unit
    /// was not alive.
    pub fn make_not_entrant(&self, unit: &CodeUnit) -> bool {
        // pass_id only moves under the state mutex
        let _state = self.state.lock();
        unit.make_not_entrant(self.pass_id.load(Ordering::Acquire) + 1)
    }

    /// Begin a new pass if a rescan is pending or sweeping was requested.
    ///
    /// Returns whether a pass is now in progress.
    pub fn begin_pass_if_needed(&self) -> bool {
        let mut state = self.state.lock();
        state.is_sweeping() || self.begin_pass(&mut state)
    }

    fn begin_pass(&self, state: &mut SweepState) -> bool {
        if !self.config.enabled {
            return false;
        }
        let rescan = self.rescan_requested.swap(false, Ordering::AcqRel);
        let requested = self.sweep_enabled.swap(false, Ordering::AcqRel);
        if !rescan && !requested {
            return false;
        }

        let pass_id = self.pass_id.fetch_add(1, Ordering::AcqRel) + 1;
        if rescan {
            state.liveness_epoch = pass_id;
        }

        // Limit first: units installed after it are skipped, so the count
        // read afterwards always covers everything under the limit
        let limit = self.cache.highest_compile_id();
        let units = self.cache.unit_count();
        let invocations = self.config.invocations_for(units);
        let cursor = SweepCursor {
            next_slot: 0,
            limit,
            exhausted: false,
        };
        state.start_pass(pass_id, cursor, invocations, self.clock.now());

        tracing::debug!(
            target: "otter::sweeper",
            pass = pass_id,
            units,
            invocations,
            fresh_liveness = rescan,
            "Sweep pass starting"
        );
        true
    }

    /// Contribute one fraction of sweep work.
    ///
    /// Safe to call from any number of threads. Returns `Ok(())` when there
    /// is nothing to do; errors only on broken cache invariants, in which
    /// case the running pass is abandoned.
    pub fn advance(&self) -> SweepResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.emergency_requested.swap(false, Ordering::AcqRel) {
            self.speculative_disconnect(true)?;
        }

        let fraction_start = self.clock.now();
        let (pass_id, epoch, batch) = {
            let mut state = self.state.lock();
            if !state.is_sweeping() && !self.begin_pass(&mut state) {
                return Ok(());
            }

            let batch = if state.remaining_invocations > 0 {
                state.remaining_invocations -= 1;
                self.claim_fraction(&mut state)
            } else {
                Vec::new()
            };
            state.in_flight += 1;
            (state.current_pass, state.liveness_epoch, batch)
        };

        let processor = UnitProcessor::new(
            &*self.cache,
            &*self.clock,
            self.event_log.as_ref(),
            pass_id,
            epoch,
        );
        let mut tally = Tally::default();
        let mut failure = None;
        for unit in &batch {
            if let Err(err) = processor.process(unit, &mut tally) {
                failure = Some(err);
                break;
            }
        }
        let elapsed = self.clock.now().saturating_duration_since(fraction_start);

        let mut state = self.state.lock();
        state.in_flight -= 1;
        for unit in &batch {
            state.claimed.remove(&unit.compile_id());
        }

        // Released units are gone whether or not the pass survives
        state.totals.total_reclaimed += tally.counters.flushed as u64;
        state
            .totals
            .record_disconnect(tally.disconnect_time, tally.peak_disconnect);
        state.totals.record_fraction(elapsed);

        let same_pass = state.is_sweeping() && state.current_pass == pass_id;
        if let Some(err) = failure {
            if same_pass {
                tracing::error!(
                    target: "otter::sweeper",
                    pass = pass_id,
                    error = %err,
                    "Sweep pass aborted"
                );
                state.abandon_pass();
            }
            return Err(err);
        }

        if same_pass {
            state.counters.merge(&tally.counters);
            state.time_this_pass += elapsed;
        }
        if state.pass_complete() {
            self.finish_pass(&mut state);
        }
        Ok(())
    }

    /// Claim up to `fraction_size` units past the cursor
    fn claim_fraction(&self, state: &mut SweepState) -> Vec<Arc<CodeUnit>> {
        let Some(mut cursor) = state.cursor else {
            return Vec::new();
        };

        let mut batch = Vec::with_capacity(self.config.fraction_size);
        while !cursor.exhausted && batch.len() < self.config.fraction_size {
            match self.cache.next_unit(cursor.next_slot) {
                Some((slot, unit)) => {
                    cursor.next_slot = slot + 1;
                    if unit.compile_id() > cursor.limit {
                        continue;
                    }
                    state.claimed.insert(unit.compile_id());
                    batch.push(unit);
                }
                None => cursor.exhausted = true,
            }
        }
        state.cursor = Some(cursor);
        batch
    }

    /// Publish the finished pass and return to idle
    fn finish_pass(&self, state: &mut SweepState) {
        let elapsed = state.time_this_pass;
        let wall = state
            .pass_started
            .map(|started| self.clock.now().saturating_duration_since(started))
            .unwrap_or_default();
        let counters = state.counters;
        debug_assert!(counters.is_conserved());

        state.totals.record_pass(elapsed);
        state.last_pass = counters;
        state.cursor = None;
        state.pass_started = None;

        tracing::info!(
            target: "otter::sweeper",
            pass = state.current_pass,
            seen = counters.seen,
            flushed = counters.flushed,
            zombified = counters.zombified,
            marked = counters.marked,
            locked = counters.locked_seen,
            on_stack = counters.not_entrant_on_stack,
            sweep_us = elapsed.as_micros() as u64,
            wall_us = wall.as_micros() as u64,
            "Sweep pass complete"
        );
    }

    /// Whether a pass is in progress
    pub fn is_sweeping(&self) -> bool {
        self.state.lock().is_sweeping()
    }

    /// Whether a rescan is pending
    pub fn rescan_requested(&self) -> bool {
        self.rescan_requested.load(Ordering::Acquire)
    }

    /// Id of the latest pass to begin
    pub fn traversal_count(&self) -> u64 {
        self.pass_id.load(Ordering::Acquire)
    }

    /// Advance calls left in the running pass
    pub fn remaining_invocations(&self) -> usize {
        self.state.lock().remaining_invocations
    }

    /// Counters of the running pass so far
    pub fn current_pass(&self) -> PassCounters {
        self.state.lock().counters
    }

    /// Counters of the last completed pass
    pub fn last_pass(&self) -> PassCounters {
        self.state.lock().last_pass
    }

    /// Snapshot of cumulative statistics
    pub fn stats(&self) -> SweepStats {
        let state = self.state.lock();
        SweepStats {
            traversals: self.traversal_count(),
            ..state.totals.clone()
        }
    }

    /// Details of the most recent cache-full report
    pub fn emergency_record(&self) -> EmergencyRecord {
        self.state.lock().emergency
    }

    /// Transition log, when enabled in the config
    pub fn event_log(&self) -> Option<&EventLog> {
        self.event_log.as_ref()
    }

    /// Configuration in use
    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("pass_id", &self.traversal_count())
            .field("rescan_requested", &self.rescan_requested())
            .field("sweeping", &self.is_sweeping())
            .finish()
    }
}
