//! Collaborator interfaces consumed by the sweeper

use crate::unit::{CodeUnit, CompileId};
use std::sync::Arc;

/// View of the code cache the sweeper iterates over
///
/// Units are addressed by slot. Iteration in increasing slot order must be
/// deterministic so a pass can resume from a saved slot across many
/// `advance` calls. Implementations must not allocate in
/// [`disconnect_inline_caches`](CodeCache::disconnect_inline_caches),
/// [`release`](CodeCache::release) or [`next_unit`](CodeCache::next_unit):
/// those run on the allocation-failure path.
pub trait CodeCache: Send + Sync {
    /// Number of units currently installed
    fn unit_count(&self) -> usize;

    /// First installed unit at or after `slot`, with its slot
    fn next_unit(&self, slot: usize) -> Option<(usize, Arc<CodeUnit>)>;

    /// Look up a unit by compile id
    fn find(&self, id: CompileId) -> Option<Arc<CodeUnit>>;

    /// Highest compile id handed out so far
    fn highest_compile_id(&self) -> CompileId;

    /// Unlink every inline cache and dispatch entry that targets `unit`
    fn disconnect_inline_caches(&self, unit: &CodeUnit);

    /// Release the storage of an unloaded unit and drop it from iteration
    fn release(&self, unit: &CodeUnit);
}

/// Stack walker reporting which units are referenced by machine state
///
/// Called once per synchronization pause while all execution contexts are
/// quiescent.
pub trait LivenessOracle {
    /// Report every unit referenced by an active frame or entry point
    fn visit_referenced(&self, visit: &mut dyn FnMut(CompileId));
}
