//! Compiled code unit layout
//!
//! A [`CodeUnit`] is owned by the code cache and shared with the sweeper
//! through `Arc`. All mutable fields are atomics so the sweeper, compiler
//! threads and the stack walker can touch a unit without a common lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Monotonically increasing compilation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompileId(pub u64);

impl fmt::Display for CompileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a compiled unit
///
/// Units only move forward: `Alive -> NotEntrant -> Zombie -> Unloaded`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    /// Installed and selectable for new invocations
    Alive = 0,
    /// No new invocations, may still have activations on some stack
    NotEntrant = 1,
    /// Not entrant and confirmed unreferenced, storage pending release
    Zombie = 2,
    /// Storage released
    Unloaded = 3,
}

impl From<u8> for UnitState {
    fn from(v: u8) -> Self {
        match v {
            0 => UnitState::Alive,
            1 => UnitState::NotEntrant,
            2 => UnitState::Zombie,
            _ => UnitState::Unloaded,
        }
    }
}

/// A region of generated machine code
pub struct CodeUnit {
    compile_id: CompileId,
    /// Entry address of the code
    entry: usize,
    /// Size of the code in bytes
    size: usize,
    state: AtomicU8,
    /// Readers currently inspecting the unit (compiler threads, debuggers)
    readers: AtomicU32,
    /// Pass id stamped when the unit was last seen on a stack
    stack_mark: AtomicU64,
    /// Pass id in which the unit became a zombie
    zombie_pass: AtomicU64,
}

impl CodeUnit {
    /// Create a new alive unit
    pub fn new(compile_id: CompileId, entry: usize, size: usize) -> Self {
        Self {
            compile_id,
            entry,
            size,
            state: AtomicU8::new(UnitState::Alive as u8),
            readers: AtomicU32::new(0),
            stack_mark: AtomicU64::new(0),
            zombie_pass: AtomicU64::new(0),
        }
    }

    /// Compilation id
    #[inline]
    pub fn compile_id(&self) -> CompileId {
        self.compile_id
    }

    /// Entry address
    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Code size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> UnitState {
        UnitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the unit still accepts new invocations
    pub fn is_alive(&self) -> bool {
        self.state() == UnitState::Alive
    }

    /// Whether the unit has been made not entrant
    pub fn is_not_entrant(&self) -> bool {
        self.state() == UnitState::NotEntrant
    }

    /// Whether the unit is a zombie
    pub fn is_zombie(&self) -> bool {
        self.state() == UnitState::Zombie
    }

    /// Whether the unit's storage has been released
    pub fn is_unloaded(&self) -> bool {
        self.state() == UnitState::Unloaded
    }

    /// Move `from -> to` atomically.
    ///
    /// Returns the state actually found when the exchange fails.
    pub(crate) fn transition(&self, from: UnitState, to: UnitState) -> Result<(), UnitState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(UnitState::from)
    }

    /// Make the unit not entrant and stamp it as seen at `mark`.
    ///
    /// The stamp forces the unit to survive at least one synchronization
    /// pause before it can be converted to a zombie, since activations may
    /// have been created after the last stack scan.
    pub(crate) fn make_not_entrant(&self, mark: u64) -> bool {
        self.mark_seen_on_stack(mark);
        self.transition(UnitState::Alive, UnitState::NotEntrant).is_ok()
    }

    /// Record that the unit was referenced by machine state at `mark`
    #[inline]
    pub fn mark_seen_on_stack(&self, mark: u64) {
        self.stack_mark.fetch_max(mark, Ordering::AcqRel);
    }

    /// Last pass id at which the unit was known to be referenced
    #[inline]
    pub fn stack_mark(&self) -> u64 {
        self.stack_mark.load(Ordering::Acquire)
    }

    /// Whether the unit counts as referenced for a pass with liveness `epoch`
    #[inline]
    pub fn is_referenced_in(&self, epoch: u64) -> bool {
        self.stack_mark() >= epoch
    }

    pub(crate) fn set_zombie_pass(&self, pass_id: u64) {
        self.zombie_pass.store(pass_id, Ordering::Release);
    }

    /// Pass id in which the unit became a zombie (0 if it never did)
    pub fn zombie_pass(&self) -> u64 {
        self.zombie_pass.load(Ordering::Acquire)
    }

    /// Lock the unit for inspection.
    ///
    /// A locked zombie is skipped by the sweeper until every guard is dropped.
    pub fn lock_for_reader(&self) -> ReaderGuard<'_> {
        self.readers.fetch_add(1, Ordering::AcqRel);
        ReaderGuard { unit: self }
    }

    /// Whether any reader currently holds the unit
    #[inline]
    pub fn is_locked_by_reader(&self) -> bool {
        self.readers.load(Ordering::Acquire) > 0
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("compile_id", &self.compile_id)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("size", &self.size)
            .field("state", &self.state())
            .finish()
    }
}

/// Reader lock on a [`CodeUnit`], released on drop
pub struct ReaderGuard<'a> {
    unit: &'a CodeUnit,
}

impl ReaderGuard<'_> {
    /// The locked unit
    pub fn unit(&self) -> &CodeUnit {
        self.unit
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.unit.readers.fetch_sub(1, Ordering::AcqRel);
    }
}
