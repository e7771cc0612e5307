//! Telemetry samples

use super::fan::FanSpeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Temperature in degrees Celsius
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Temperature(i32);

impl Temperature {
    pub const fn new(celsius: i32) -> Self {
        Self(celsius)
    }

    pub const fn as_celsius(&self) -> i32 {
        self.0
    }
}

impl From<u32> for Temperature {
    fn from(value: u32) -> Self {
        Self(i32::try_from(value).unwrap_or(i32::MAX))
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°C", self.0)
    }
}

/// One read-only snapshot of a device
///
/// Produced once per sampler tick and never mutated afterwards. Optional
/// readings are `None` when the board does not report them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device_index: u32,
    pub timestamp: DateTime<Utc>,
    pub temperature_c: i32,
    pub power_watts: Option<f64>,
    pub core_clock_mhz: u32,
    pub mem_clock_mhz: u32,
    /// One entry per fan; empty if the board has no tachometer readout
    pub fan_rpm: Vec<u32>,
    /// Current duty per fan as reported by the driver
    pub fan_duty_percent: Vec<u8>,
    pub utilization_percent: Option<u8>,
}

impl TelemetrySample {
    /// Largest distance between any fan's duty and `target`
    ///
    /// Returns `None` if the sample carries no duty readings.
    pub fn duty_drift(&self, target: FanSpeed) -> Option<u8> {
        self.fan_duty_percent
            .iter()
            .map(|&duty| duty.abs_diff(target.as_percentage()))
            .max()
    }
}
