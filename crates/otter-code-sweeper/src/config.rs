//! Sweeper configuration

use crate::error::{SweepError, SweepResult};
use std::time::Duration;

/// Sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Whether compiled code is ever reclaimed (default: true)
    pub enabled: bool,
    /// Units processed per `advance` call (default: 64)
    pub fraction_size: usize,
    /// Minimum time between two accelerated runs caused by a full cache
    /// (default: 1s)
    pub emergency_interval: Duration,
    /// Unproductive emergency runs tolerated before the cache is reported
    /// exhausted (default: 3)
    pub max_unproductive_emergencies: u32,
    /// Capacity of the transition ring buffer, 0 disables it (default: 0)
    pub event_log_capacity: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fraction_size: 64,
            emergency_interval: Duration::from_secs(1),
            max_unproductive_emergencies: 3,
            event_log_capacity: 0,
        }
    }
}

impl SweeperConfig {
    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> SweepResult<()> {
        if self.fraction_size == 0 {
            return Err(SweepError::InvalidConfig(
                "fraction_size must be at least 1".to_string(),
            ));
        }
        if self.max_unproductive_emergencies == 0 {
            return Err(SweepError::InvalidConfig(
                "max_unproductive_emergencies must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of `advance` calls a pass over `units` units is split into
    pub fn invocations_for(&self, units: usize) -> usize {
        units.div_ceil(self.fraction_size).max(1)
    }
}
