//! Sweeper correctness tests
//!
//! These tests drive the scheduler the way a runtime would: pauses feed in
//! stack snapshots, worker threads call `advance`, allocators report a full
//! cache.

use otter_code_sweeper::{
    CodeCache, CodeHeap, CodeUnit, CompileId, ManualClock, PassCounters, StackSnapshot, SweepError,
    SweepOrigin, Sweeper, SweeperConfig, UnitState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn sweeper_with(heap: &Arc<CodeHeap>, fraction_size: usize) -> Arc<Sweeper> {
    let config = SweeperConfig {
        fraction_size,
        event_log_capacity: 256,
        ..Default::default()
    };
    Sweeper::with_clock(heap.clone(), config, Arc::new(ManualClock::new())).unwrap()
}

/// Run advance until the running pass finishes
fn finish_pass(sweeper: &Sweeper) {
    sweeper.advance().unwrap();
    while sweeper.is_sweeping() {
        sweeper.advance().unwrap();
    }
}

/// One pause followed by a complete pass
fn pause_and_sweep(sweeper: &Sweeper, stacks: &StackSnapshot) {
    sweeper.on_synchronization_pause(stacks);
    finish_pass(sweeper);
}

#[test]
fn test_empty_pass_completes_in_one_call() {
    let heap = CodeHeap::new(4096);
    let sweeper = sweeper_with(&heap, 4);

    sweeper.on_synchronization_pause(&StackSnapshot::new());
    sweeper.advance().unwrap();

    assert!(!sweeper.is_sweeping());
    assert_eq!(sweeper.last_pass(), PassCounters::default());
    assert_eq!(sweeper.stats().completed_passes, 1);
}

#[test]
fn test_pass_bounded_by_invocation_budget() {
    let heap = CodeHeap::new(1 << 16);
    for _ in 0..10 {
        heap.install(64).unwrap();
    }
    let sweeper = sweeper_with(&heap, 3);
    sweeper.on_synchronization_pause(&StackSnapshot::new());

    // ceil(10 / 3) = 4 calls
    for _ in 0..3 {
        sweeper.advance().unwrap();
        assert!(sweeper.is_sweeping());
    }
    sweeper.advance().unwrap();
    assert!(!sweeper.is_sweeping());
    assert_eq!(sweeper.remaining_invocations(), 0);
    assert_eq!(sweeper.last_pass().seen, 10);
}

#[test]
fn test_rescan_flag_is_idempotent() {
    let heap = CodeHeap::new(4096);
    heap.install(64).unwrap();
    let sweeper = sweeper_with(&heap, 4);
    let stacks = StackSnapshot::new();

    sweeper.on_synchronization_pause(&stacks);
    sweeper.on_synchronization_pause(&stacks);
    sweeper.on_synchronization_pause(&stacks);
    finish_pass(&sweeper);

    sweeper.advance().unwrap();
    sweeper.advance().unwrap();
    assert_eq!(sweeper.traversal_count(), 1);
    assert_eq!(sweeper.stats().completed_passes, 1);
}

#[test]
fn test_single_unit_reclaimed_over_two_passes() {
    let heap = CodeHeap::new(4096);
    let sweeper = sweeper_with(&heap, 4);
    let stacks = StackSnapshot::new();
    let unit = heap.install(128).unwrap();

    // A pause has to see the unit off every stack after it went not entrant
    pause_and_sweep(&sweeper, &stacks);
    sweeper.make_not_entrant(&unit);
    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_not_entrant());
    assert_eq!(sweeper.last_pass().not_entrant_on_stack, 1);

    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_zombie());
    assert_eq!(sweeper.last_pass().zombified, 1);
    assert_eq!(heap.disconnect_count(), 1);

    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_unloaded());
    assert_eq!(sweeper.last_pass().flushed, 1);
    assert_eq!(sweeper.stats().total_reclaimed, 1);
    assert_eq!(heap.used_bytes(), 0);

    let log = sweeper.event_log().unwrap();
    let events = log.events_for(unit.compile_id());
    assert_eq!(events.len(), 2);
    assert!(events[1].pass_id > events[0].pass_id);
    assert!(events.iter().all(|e| e.origin == SweepOrigin::Regular));
}

#[test]
fn test_referenced_unit_never_reclaimed() {
    let heap = CodeHeap::new(4096);
    let sweeper = sweeper_with(&heap, 4);
    let stacks = StackSnapshot::new();
    let unit = heap.install(64).unwrap();
    sweeper.make_not_entrant(&unit);
    stacks.add(unit.compile_id());

    for _ in 0..5 {
        pause_and_sweep(&sweeper, &stacks);
        assert!(unit.is_not_entrant());
    }

    // Frame returned: zombie next pass, released the one after
    stacks.remove(unit.compile_id());
    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_zombie());
    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_unloaded());
}

#[test]
fn test_locked_zombie_retried() {
    let heap = CodeHeap::new(4096);
    let sweeper = sweeper_with(&heap, 4);
    let stacks = StackSnapshot::new();
    let unit = heap.install(64).unwrap();
    sweeper.make_not_entrant(&unit);
    pause_and_sweep(&sweeper, &stacks);
    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_zombie());

    let guard = unit.lock_for_reader();
    pause_and_sweep(&sweeper, &stacks);
    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_zombie());
    assert_eq!(sweeper.last_pass().locked_seen, 1);

    drop(guard);
    pause_and_sweep(&sweeper, &stacks);
    assert!(unit.is_unloaded());
}

#[test]
fn test_counters_conserved_across_mixed_population() {
    let heap = CodeHeap::new(1 << 16);
    let sweeper = sweeper_with(&heap, 3);
    let stacks = StackSnapshot::new();

    let units: Vec<_> = (0..12).map(|_| heap.install(64).unwrap()).collect();
    for unit in units.iter().step_by(2) {
        sweeper.make_not_entrant(unit);
    }
    stacks.add(units[0].compile_id());
    let _guard = units[2].lock_for_reader();

    for _ in 0..4 {
        pause_and_sweep(&sweeper, &stacks);
        let pass = sweeper.last_pass();
        assert!(pass.is_conserved(), "{pass:?}");
    }

    assert!(units[0].is_not_entrant());
    assert!(units[2].is_zombie());
    assert!(units[4].is_unloaded());
    assert!(units[1].is_alive());
    assert_eq!(sweeper.stats().total_reclaimed, 4);
}

#[test]
fn test_concurrent_advance_visits_each_unit_once() {
    const UNITS: usize = 500;

    let heap = CodeHeap::new(1 << 20);
    let sweeper = sweeper_with(&heap, 7);
    let stacks = StackSnapshot::new();
    let units: Vec<_> = (0..UNITS).map(|_| heap.install(32).unwrap()).collect();
    for unit in &units {
        sweeper.make_not_entrant(unit);
    }
    pause_and_sweep(&sweeper, &stacks);
    sweeper.on_synchronization_pause(&stacks);

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                sweeper.advance().unwrap();
                while sweeper.is_sweeping() {
                    sweeper.advance().unwrap();
                }
            });
        }
    });

    // A second visit would have failed the NotEntrant -> Zombie exchange
    let pass = sweeper.last_pass();
    assert_eq!(pass.seen, UNITS);
    assert_eq!(pass.zombified, UNITS);
    assert!(units.iter().all(|u| u.is_zombie()));
    assert_eq!(heap.disconnect_count(), UNITS);
}

#[test]
fn test_emergency_during_pass_leaves_pass_counters_alone() {
    let heap = CodeHeap::new(1 << 16);
    let sweeper = sweeper_with(&heap, 2);
    let stacks = StackSnapshot::new();
    let units: Vec<_> = (0..8).map(|_| heap.install(64).unwrap()).collect();
    for unit in &units {
        sweeper.make_not_entrant(unit);
    }
    pause_and_sweep(&sweeper, &stacks);

    // Cursor mid-cache: first four zombified by the regular pass
    sweeper.on_synchronization_pause(&stacks);
    sweeper.advance().unwrap();
    sweeper.advance().unwrap();
    let before = sweeper.current_pass();
    assert_eq!(before.zombified, 4);

    sweeper.handle_cache_full(true).unwrap();
    let reclaimed = sweeper.speculative_disconnect(true).unwrap();

    // Zombies from this pass are not released again, the rest go zombie
    assert_eq!(reclaimed, 0);
    assert!(units.iter().all(|u| u.is_zombie()));
    assert_eq!(sweeper.current_pass(), before);
    assert_eq!(sweeper.stats().full_cache_sweeps, 1);

    finish_pass(&sweeper);
    let pass = sweeper.last_pass();
    assert_eq!(pass.seen, 8);
    assert_eq!(pass.zombified, 4);
    assert_eq!(pass.marked, 4);
    assert!(pass.is_conserved());

    pause_and_sweep(&sweeper, &stacks);
    assert!(units.iter().all(|u| u.is_unloaded()));
    assert_eq!(sweeper.stats().total_reclaimed, 8);

    let log = sweeper.event_log().unwrap();
    let emergency = log
        .recent()
        .iter()
        .filter(|e| e.origin == SweepOrigin::Emergency)
        .count();
    assert_eq!(emergency, 4);
}

#[test]
fn test_full_cache_recovers_space() {
    let heap = CodeHeap::new(1024);
    let sweeper = sweeper_with(&heap, 4);
    let stacks = StackSnapshot::new();

    let units: Vec<_> = (0..4).map(|_| heap.install(256).unwrap()).collect();
    for unit in &units {
        sweeper.make_not_entrant(unit);
    }
    pause_and_sweep(&sweeper, &stacks);
    pause_and_sweep(&sweeper, &stacks);
    assert!(units.iter().all(|u| u.is_zombie()));

    let err = heap.install(256).unwrap_err();
    assert!(matches!(err, SweepError::CodeCacheFull { .. }));
    sweeper.handle_cache_full(true).unwrap();
    sweeper.advance().unwrap();

    assert_eq!(heap.used_bytes(), 0);
    assert!(heap.install(256).is_ok());
    sweeper.handle_cache_full(false).unwrap();
    assert!(!sweeper.was_full());
    assert_eq!(sweeper.stats().full_cache_sweeps, 1);
}

/// Cache whose `release` forgets to drop the unit from iteration
struct LeakyCache {
    units: Mutex<Vec<Arc<CodeUnit>>>,
}

impl CodeCache for LeakyCache {
    fn unit_count(&self) -> usize {
        self.units.lock().len()
    }

    fn next_unit(&self, slot: usize) -> Option<(usize, Arc<CodeUnit>)> {
        self.units.lock().get(slot).map(|u| (slot, u.clone()))
    }

    fn find(&self, id: CompileId) -> Option<Arc<CodeUnit>> {
        self.units
            .lock()
            .iter()
            .find(|u| u.compile_id() == id)
            .cloned()
    }

    fn highest_compile_id(&self) -> CompileId {
        CompileId(self.units.lock().len() as u64)
    }

    fn disconnect_inline_caches(&self, _unit: &CodeUnit) {}

    fn release(&self, _unit: &CodeUnit) {}
}

#[test]
fn test_unloaded_unit_in_iteration_aborts_pass() {
    let cache = Arc::new(LeakyCache {
        units: Mutex::new(vec![
            Arc::new(CodeUnit::new(CompileId(1), 0x1000, 64)),
            Arc::new(CodeUnit::new(CompileId(2), 0x1040, 64)),
        ]),
    });
    let sweeper = Sweeper::with_clock(
        cache.clone(),
        SweeperConfig::default(),
        Arc::new(ManualClock::new()),
    )
    .unwrap();
    let stacks = StackSnapshot::new();
    let leaked = cache.units.lock()[0].clone();
    sweeper.make_not_entrant(&leaked);

    for _ in 0..3 {
        pause_and_sweep(&sweeper, &stacks);
    }
    assert_eq!(leaked.state(), UnitState::Unloaded);
    let completed = sweeper.stats().completed_passes;

    sweeper.on_synchronization_pause(&stacks);
    let err = sweeper.advance().unwrap_err();
    assert_eq!(
        err,
        SweepError::IterationInconsistency {
            compile_id: CompileId(1)
        }
    );
    assert!(!sweeper.is_sweeping());
    assert_eq!(sweeper.stats().completed_passes, completed);
}

#[test]
fn test_disabled_sweeper_does_nothing() {
    let heap = CodeHeap::new(4096);
    let unit = heap.install(64).unwrap();
    let config = SweeperConfig {
        enabled: false,
        ..Default::default()
    };
    let sweeper = Sweeper::new(heap.clone(), config).unwrap();
    sweeper.make_not_entrant(&unit);

    for _ in 0..4 {
        sweeper.on_synchronization_pause(&StackSnapshot::new());
        sweeper.advance().unwrap();
    }
    assert!(unit.is_not_entrant());
    assert_eq!(sweeper.traversal_count(), 0);
}

#[test]
fn test_failed_emergency_walk_still_counts_released_units() {
    let cache = Arc::new(LeakyCache {
        units: Mutex::new(vec![
            Arc::new(CodeUnit::new(CompileId(1), 0x1000, 64)),
            Arc::new(CodeUnit::new(CompileId(2), 0x1040, 64)),
        ]),
    });
    let sweeper = Sweeper::with_clock(
        cache.clone(),
        SweeperConfig::default(),
        Arc::new(ManualClock::new()),
    )
    .unwrap();
    let stacks = StackSnapshot::new();
    let (first, second) = {
        let units = cache.units.lock();
        (units[0].clone(), units[1].clone())
    };

    // Second unit unloaded but still iterated, first one a zombie ahead of it
    sweeper.make_not_entrant(&second);
    pause_and_sweep(&sweeper, &stacks);
    pause_and_sweep(&sweeper, &stacks);
    sweeper.make_not_entrant(&first);
    pause_and_sweep(&sweeper, &stacks);
    assert!(second.is_unloaded());
    sweeper.on_synchronization_pause(&stacks);
    assert!(sweeper.advance().is_err());
    assert!(first.is_zombie());
    let before = sweeper.stats();

    let err = sweeper.speculative_disconnect(true).unwrap_err();
    assert_eq!(
        err,
        SweepError::IterationInconsistency {
            compile_id: CompileId(2)
        }
    );
    assert!(first.is_unloaded());

    let after = sweeper.stats();
    assert_eq!(after.total_reclaimed, before.total_reclaimed + 1);
    assert_eq!(after.full_cache_sweeps, before.full_cache_sweeps + 1);
    assert_eq!(sweeper.emergency_record().unproductive_runs, 0);
}

/// Cache that installs one more unit while a pass is being set up
struct InstallingCache {
    heap: Arc<CodeHeap>,
    armed: AtomicBool,
    installed: Mutex<Option<Arc<CodeUnit>>>,
}

impl InstallingCache {
    fn install_if_armed(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            *self.installed.lock() = self.heap.install(64).ok();
        }
    }
}

impl CodeCache for InstallingCache {
    fn unit_count(&self) -> usize {
        let count = self.heap.unit_count();
        self.install_if_armed();
        count
    }

    fn next_unit(&self, slot: usize) -> Option<(usize, Arc<CodeUnit>)> {
        self.heap.next_unit(slot)
    }

    fn find(&self, id: CompileId) -> Option<Arc<CodeUnit>> {
        self.heap.find(id)
    }

    fn highest_compile_id(&self) -> CompileId {
        let highest = self.heap.highest_compile_id();
        self.install_if_armed();
        highest
    }

    fn disconnect_inline_caches(&self, unit: &CodeUnit) {
        self.heap.disconnect_inline_caches(unit);
    }

    fn release(&self, unit: &CodeUnit) {
        self.heap.release(unit);
    }
}

#[test]
fn test_install_during_pass_setup_keeps_every_unit_covered() {
    let heap = CodeHeap::new(1 << 16);
    let units: Vec<_> = (0..5).map(|_| heap.install(64).unwrap()).collect();
    // Free slot 0 so the late unit lands ahead of the cursor
    heap.release(&units[0]);

    let cache = Arc::new(InstallingCache {
        heap: heap.clone(),
        armed: AtomicBool::new(false),
        installed: Mutex::new(None),
    });
    let config = SweeperConfig {
        fraction_size: 2,
        ..Default::default()
    };
    let sweeper =
        Sweeper::with_clock(cache.clone(), config, Arc::new(ManualClock::new())).unwrap();
    let stacks = StackSnapshot::new();
    for unit in &units[1..] {
        sweeper.make_not_entrant(unit);
    }
    pause_and_sweep(&sweeper, &stacks);

    cache.armed.store(true, Ordering::Release);
    pause_and_sweep(&sweeper, &stacks);

    let late = cache.installed.lock().clone().unwrap();
    assert_eq!(late.compile_id(), CompileId(6));
    assert_eq!(heap.next_unit(0).unwrap().1.compile_id(), CompileId(6));
    assert!(late.is_alive());
    assert!(units[1..].iter().all(|u| u.is_zombie()));

    let pass = sweeper.last_pass();
    assert_eq!(pass.seen, 4);
    assert_eq!(pass.zombified, 4);
}

/// Cache that parks the first disconnect of one unit until released
struct GatedCache {
    heap: Arc<CodeHeap>,
    gate: Mutex<Option<CompileId>>,
    barrier: Barrier,
}

impl CodeCache for GatedCache {
    fn unit_count(&self) -> usize {
        self.heap.unit_count()
    }

    fn next_unit(&self, slot: usize) -> Option<(usize, Arc<CodeUnit>)> {
        self.heap.next_unit(slot)
    }

    fn find(&self, id: CompileId) -> Option<Arc<CodeUnit>> {
        self.heap.find(id)
    }

    fn highest_compile_id(&self) -> CompileId {
        self.heap.highest_compile_id()
    }

    fn disconnect_inline_caches(&self, unit: &CodeUnit) {
        self.heap.disconnect_inline_caches(unit);
        let parked = {
            let mut gate = self.gate.lock();
            if *gate == Some(unit.compile_id()) {
                *gate = None;
                true
            } else {
                false
            }
        };
        if parked {
            // Signal the fraction is in flight, then wait to be let go
            self.barrier.wait();
            self.barrier.wait();
        }
    }

    fn release(&self, unit: &CodeUnit) {
        self.heap.release(unit);
    }
}

#[test]
fn test_emergency_walk_skips_fraction_in_flight() {
    let heap = CodeHeap::new(1 << 16);
    let units: Vec<_> = (0..6).map(|_| heap.install(64).unwrap()).collect();
    let cache = Arc::new(GatedCache {
        heap: heap.clone(),
        gate: Mutex::new(None),
        barrier: Barrier::new(2),
    });
    let config = SweeperConfig {
        fraction_size: 3,
        event_log_capacity: 64,
        ..Default::default()
    };
    let sweeper =
        Sweeper::with_clock(cache.clone(), config, Arc::new(ManualClock::new())).unwrap();
    let stacks = StackSnapshot::new();
    for unit in &units {
        sweeper.make_not_entrant(unit);
    }
    pause_and_sweep(&sweeper, &stacks);

    *cache.gate.lock() = Some(units[0].compile_id());
    sweeper.on_synchronization_pause(&stacks);

    thread::scope(|s| {
        let worker = s.spawn(|| sweeper.advance());
        cache.barrier.wait();

        // First three units belong to the parked fraction
        let reclaimed = sweeper.speculative_disconnect(true).unwrap();
        assert_eq!(reclaimed, 0);
        assert!(units[0].is_zombie());
        assert!(units[1].is_not_entrant());
        assert!(units[2].is_not_entrant());
        assert!(units[3..].iter().all(|u| u.is_zombie()));
        assert_eq!(sweeper.current_pass(), PassCounters::default());

        cache.barrier.wait();
        worker.join().unwrap().unwrap();
    });

    assert_eq!(sweeper.current_pass().zombified, 3);
    finish_pass(&sweeper);

    let pass = sweeper.last_pass();
    assert_eq!(pass.seen, 6);
    assert_eq!(pass.zombified, 3);
    assert_eq!(pass.marked, 3);
    assert!(pass.is_conserved());
    assert_eq!(heap.disconnect_count(), 6);

    let log = sweeper.event_log().unwrap();
    for unit in &units[..3] {
        let events = log.events_for(unit.compile_id());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, SweepOrigin::Regular);
    }
    for unit in &units[3..] {
        let events = log.events_for(unit.compile_id());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, SweepOrigin::Emergency);
    }
}
