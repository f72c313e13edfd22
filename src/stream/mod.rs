//! Rate control for subscriber streams.
//!
//! Telemetry arrives at about 10Hz and video at about 30Hz. Consumers that
//! render or forward data more slowly subscribe with an [`UpdateRate`] and get
//! a latest-wins [`Throttle`]d stream instead of every value.

mod throttle;

pub use throttle::{Throttle, ThrottleExt};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Nominal telemetry broadcast rate.
pub const TELEMETRY_SOURCE_HZ: f64 = 10.0;

/// Nominal video frame rate.
pub const VIDEO_SOURCE_HZ: f64 = 30.0;

/// Update rate for subscriber streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every value the source produces
    Native,

    /// At most this many values per second.
    /// A rate at or above the source rate is treated as `Native`.
    Max(u32),
}

impl UpdateRate {
    /// Normalize rate against source frequency
    pub fn normalize(self, source_hz: f64) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(hz) if hz as f64 >= source_hz => UpdateRate::Native,
            UpdateRate::Max(hz) => UpdateRate::Max(hz.max(1)),
        }
    }

    /// Throttle interval if throttling is needed
    pub fn throttle_interval(self, source_hz: f64) -> Option<Duration> {
        match self.normalize(source_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}
