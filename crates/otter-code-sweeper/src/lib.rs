//! # Otter Code Sweeper
//!
//! Incremental reclamation of compiled code that is no longer reachable.
//!
//! ## Design
//!
//! - **Lifecycle**: `Alive -> NotEntrant -> Zombie -> Unloaded`, one step per
//!   pass, so a unit is released no sooner than two passes after it was
//!   confirmed off every stack
//! - **Liveness**: a stack walker reports referenced units at each
//!   synchronization pause; the pause only stamps units and requests a rescan
//! - **Incremental passes**: worker threads call `advance`, each call sweeps
//!   one bounded fraction of the cache
//! - **Emergency path**: a full cache triggers a synchronous, allocation-free
//!   disconnect of everything eligible

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod driver;
mod emergency;
pub mod error;
pub mod event_log;
pub mod heap;
pub mod liveness;
pub mod processor;
mod state;
pub mod stats;
pub mod sweeper;
pub mod unit;

pub use cache::{CodeCache, LivenessOracle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SweeperConfig;
pub use driver::SweeperThread;
pub use error::{SweepError, SweepResult};
pub use event_log::{EventLog, SweepEvent, SweepOrigin};
pub use heap::CodeHeap;
pub use liveness::StackSnapshot;
pub use state::{EmergencyRecord, SweepCursor};
pub use stats::{PassCounters, SweepStats};
pub use sweeper::Sweeper;
pub use unit::{CodeUnit, CompileId, ReaderGuard, UnitState};
