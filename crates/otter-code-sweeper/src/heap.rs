//! In-memory code heap

use crate::cache::CodeCache;
use crate::error::{SweepError, SweepResult};
use crate::unit::{CodeUnit, CompileId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Base of the synthetic code address space
const CODE_BASE: usize = 0x1000_0000;

/// Code alignment
const CODE_ALIGN: usize = 16;

/// Code heap with a fixed byte capacity
///
/// Units live in slots; released slots are reused lowest-first, and
/// iteration walks slots in increasing order.
pub struct CodeHeap {
    capacity: usize,
    /// Bytes held by installed units
    used: AtomicUsize,
    /// Next compile id to hand out
    next_id: AtomicU64,
    /// Next entry address
    next_entry: AtomicUsize,
    slots: RwLock<CodeSlots>,
    /// Inline cache disconnect requests served
    disconnects: AtomicUsize,
    /// Units released
    releases: AtomicUsize,
}

struct CodeSlots {
    units: Vec<Option<Arc<CodeUnit>>>,
    index: FxHashMap<CompileId, usize>,
}

impl CodeHeap {
    /// Create a heap holding at most `capacity` bytes of code
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            next_entry: AtomicUsize::new(CODE_BASE),
            slots: RwLock::new(CodeSlots {
                units: Vec::new(),
                index: FxHashMap::default(),
            }),
            disconnects: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    /// Install a new alive unit of `size` bytes.
    ///
    /// Fails with [`SweepError::CodeCacheFull`] when the code does not fit;
    /// the caller is expected to report that to the sweeper.
    pub fn install(&self, size: usize) -> SweepResult<Arc<CodeUnit>> {
        let aligned_size = (size + CODE_ALIGN - 1) & !(CODE_ALIGN - 1);
        let mut slots = self.slots.write();

        let used = self.used.load(Ordering::Relaxed);
        if used + aligned_size > self.capacity {
            return Err(SweepError::CodeCacheFull {
                requested: aligned_size,
                available: self.capacity - used,
            });
        }

        let id = CompileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = self.next_entry.fetch_add(aligned_size, Ordering::Relaxed);
        let unit = Arc::new(CodeUnit::new(id, entry, aligned_size));

        let slot = match slots.units.iter().position(Option::is_none) {
            Some(free) => {
                slots.units[free] = Some(unit.clone());
                free
            }
            None => {
                slots.units.push(Some(unit.clone()));
                slots.units.len() - 1
            }
        };
        slots.index.insert(id, slot);
        self.used.fetch_add(aligned_size, Ordering::Relaxed);
        Ok(unit)
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by installed units
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes still free
    pub fn available(&self) -> usize {
        self.capacity - self.used_bytes()
    }

    /// Number of inline cache disconnects performed
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Number of units released
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }
}

impl CodeCache for CodeHeap {
    fn unit_count(&self) -> usize {
        self.slots.read().index.len()
    }

    fn next_unit(&self, slot: usize) -> Option<(usize, Arc<CodeUnit>)> {
        let slots = self.slots.read();
        slots
            .units
            .iter()
            .enumerate()
            .skip(slot)
            .find_map(|(idx, unit)| unit.as_ref().map(|u| (idx, u.clone())))
    }

    fn find(&self, id: CompileId) -> Option<Arc<CodeUnit>> {
        let slots = self.slots.read();
        let slot = *slots.index.get(&id)?;
        slots.units[slot].clone()
    }

    fn highest_compile_id(&self) -> CompileId {
        CompileId(self.next_id.load(Ordering::Relaxed) - 1)
    }

    fn disconnect_inline_caches(&self, _unit: &CodeUnit) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, unit: &CodeUnit) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.index.remove(&unit.compile_id()) {
            slots.units[slot] = None;
            self.used.fetch_sub(unit.size(), Ordering::Relaxed);
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }
}
