//! Sweeper error types

use crate::unit::{CompileId, UnitState};
use thiserror::Error;

/// Errors surfaced by the code cache sweeper
///
/// Routine conditions (locked zombies, empty fractions) are never reported
/// here; they are absorbed and retried on a later pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SweepError {
    /// An unloaded unit showed up during cache iteration.
    ///
    /// The cache's bookkeeping is broken, so the running pass is aborted
    /// instead of folding counters that can no longer be trusted.
    #[error("code cache iteration returned unloaded unit {compile_id}")]
    IterationInconsistency {
        /// Compile id of the offending unit
        compile_id: CompileId,
    },

    /// A unit changed state underneath a transition
    #[error("unit {compile_id} expected to be {expected:?}, found {found:?}")]
    UnexpectedState {
        /// Compile id of the unit
        compile_id: CompileId,
        /// State the transition started from
        expected: UnitState,
        /// State actually observed
        found: UnitState,
    },

    /// Emergency reclamation keeps failing to free any code
    #[error("code cache exhausted after {episodes} unproductive emergency sweeps")]
    CodeCacheExhausted {
        /// Consecutive emergency runs that reclaimed nothing
        episodes: u32,
    },

    /// Installing a unit did not fit in the remaining code space
    #[error("code cache full: requested {requested} bytes, {available} available")]
    CodeCacheFull {
        /// Bytes requested
        requested: usize,
        /// Bytes still free
        available: usize,
    },

    /// Rejected sweeper configuration
    #[error("invalid sweeper config: {0}")]
    InvalidConfig(String),
}

/// Result alias for sweeper operations
pub type SweepResult<T> = Result<T, SweepError>;
