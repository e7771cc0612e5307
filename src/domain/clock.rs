//! Clock domain types
//!
//! Offsets are signed MHz deltas applied to the GPU's V/F curve; speeds are
//! what the clocks currently run at.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which clock an offset or reading refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockDomain {
    /// Graphics (GPC) clock
    Core,
    /// Memory clock
    Memory,
}

impl fmt::Display for ClockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockDomain::Core => write!(f, "core"),
            ClockDomain::Memory => write!(f, "memory"),
        }
    }
}

/// Signed clock offset in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ClockOffset(i32);

impl ClockOffset {
    /// Create a new offset
    pub const fn from_mhz(mhz: i32) -> Self {
        Self(mhz)
    }

    /// Offset in MHz
    #[inline]
    pub const fn as_mhz(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ClockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+} MHz", self.0)
    }
}

/// Current clock speed in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClockSpeed(u32);

impl ClockSpeed {
    /// Create a new clock speed value
    pub fn new(mhz: u32) -> Self {
        Self(mhz)
    }

    /// Get clock speed in MHz
    pub fn as_mhz(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClockSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz", self.0)
    }
}

/// GPU and memory utilization rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Utilization {
    /// GPU compute utilization (0-100%)
    pub gpu: u8,
    /// Memory bandwidth utilization (0-100%)
    pub memory: u8,
}

impl Utilization {
    /// Create a new utilization value
    pub fn new(gpu: u8, memory: u8) -> Self {
        Self {
            gpu: gpu.min(100),
            memory: memory.min(100),
        }
    }
}
