use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::board::transfer::{CLOCK_DIVIDER, RING_CAPACITY};

/// Driver tunables. The defaults match the board; tests shorten the delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Watchdog tick
    pub tick_period_ms: u64,
    /// Ticks a parked reader waits before it gets a timeout
    pub timeout_ticks: u32,
    /// Board reset held low for this long
    pub reset_hold_ms: u64,
    /// Wait after releasing board reset before touching the PICs
    pub reset_settle_ms: u64,
    /// Pause after each pass of disabling the SPI interrupt sources
    pub teardown_settle_ms: u64,
    pub clock_divider: u32,
    pub ring_capacity: usize,
    /// Empty RX polls tolerated while waiting for the tail of a packet
    pub final_drain_spins: u32,
}

impl DriverConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn reset_hold(&self) -> Duration {
        Duration::from_millis(self.reset_hold_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn teardown_settle(&self) -> Duration {
        Duration::from_millis(self.teardown_settle_ms)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            timeout_ticks: 5,
            reset_hold_ms: 100,
            reset_settle_ms: 1000,
            teardown_settle_ms: 100,
            clock_divider: CLOCK_DIVIDER,
            ring_capacity: RING_CAPACITY,
            final_drain_spins: 100_000,
        }
    }
}
