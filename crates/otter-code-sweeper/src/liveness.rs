//! Snapshot-based liveness oracle

use crate::cache::LivenessOracle;
use crate::unit::CompileId;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// Set of units referenced by machine state, filled by the embedder's
/// stack walk and handed to the sweeper at each synchronization pause.
#[derive(Default)]
pub struct StackSnapshot {
    referenced: Mutex<FxHashSet<CompileId>>,
}

impl StackSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a unit as referenced by an active frame or entry point
    pub fn add(&self, id: CompileId) {
        self.referenced.lock().insert(id);
    }

    /// Forget a reference (frame returned)
    pub fn remove(&self, id: CompileId) {
        self.referenced.lock().remove(&id);
    }

    /// Replace the whole snapshot
    pub fn replace(&self, ids: impl IntoIterator<Item = CompileId>) {
        let mut referenced = self.referenced.lock();
        referenced.clear();
        referenced.extend(ids);
    }

    /// Drop every reference
    pub fn clear(&self) {
        self.referenced.lock().clear();
    }

    /// Whether `id` is currently referenced
    pub fn contains(&self, id: CompileId) -> bool {
        self.referenced.lock().contains(&id)
    }
}

impl LivenessOracle for StackSnapshot {
    fn visit_referenced(&self, visit: &mut dyn FnMut(CompileId)) {
        for &id in self.referenced.lock().iter() {
            visit(id);
        }
    }
}
