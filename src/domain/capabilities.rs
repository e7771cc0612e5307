//! Per-device write capabilities
//!
//! Queried once when a device session opens and immutable afterwards. The
//! ranges here are what the bounds validator clamps against.

use super::setting::SettingField;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Board power limit in milliwatts, the unit NVML reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PowerLimit(u32);

impl PowerLimit {
    pub const fn from_watts(watts: u32) -> Self {
        Self(watts.saturating_mul(1000))
    }

    pub const fn from_milliwatts(mw: u32) -> Self {
        Self(mw)
    }

    /// Whole watts, rounded down
    pub const fn as_watts(&self) -> u32 {
        self.0 / 1000
    }

    pub const fn as_milliwatts(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PowerLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}W", self.as_watts())
    }
}

/// Power limit bounds as the driver reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerConstraints {
    pub min: PowerLimit,
    pub max: PowerLimit,
    pub default: PowerLimit,
}

impl PowerConstraints {
    pub fn new(min: PowerLimit, max: PowerLimit, default: PowerLimit) -> Self {
        Self { min, max, default }
    }

    pub fn contains(&self, limit: &PowerLimit) -> bool {
        (self.min..=self.max).contains(limit)
    }

    /// The same bounds in whole watts, as the validator uses them
    ///
    /// The minimum rounds up and the maximum down, so every whole-watt value
    /// in the range is one the driver accepts.
    pub fn range(&self) -> PowerRange {
        PowerRange {
            min_watts: self.min.as_milliwatts().div_ceil(1000),
            max_watts: self.max.as_watts(),
            default_watts: self.default.as_watts(),
        }
    }
}

impl fmt::Display for PowerConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Power limit range in watts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRange {
    pub min_watts: u32,
    pub max_watts: u32,
    pub default_watts: u32,
}

impl PowerRange {
    pub fn clamp(&self, watts: i64) -> u32 {
        watts.clamp(self.min_watts as i64, self.max_watts as i64) as u32
    }
}

/// Signed clock offset range in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    pub min_mhz: i32,
    pub max_mhz: i32,
}

impl OffsetRange {
    pub fn contains(&self, mhz: i64) -> bool {
        mhz >= self.min_mhz as i64 && mhz <= self.max_mhz as i64
    }

    pub fn clamp(&self, mhz: i64) -> i32 {
        mhz.clamp(self.min_mhz as i64, self.max_mhz as i64) as i32
    }

    /// Intersection with a symmetric `±limit` window
    ///
    /// Returns `None` if nothing of the range survives.
    pub fn within(&self, limit: i32) -> Option<Self> {
        let limit = limit.abs();
        let min_mhz = self.min_mhz.max(-limit);
        let max_mhz = self.max_mhz.min(limit);
        (min_mhz <= max_mhz).then_some(Self { min_mhz, max_mhz })
    }
}

/// Manual fan duty range in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyRange {
    pub min_percent: u8,
    pub max_percent: u8,
}

impl DutyRange {
    pub fn clamp(&self, duty: i64) -> u8 {
        duty.clamp(self.min_percent as i64, self.max_percent as i64) as u8
    }
}

impl Default for DutyRange {
    fn default() -> Self {
        Self {
            min_percent: 0,
            max_percent: 100,
        }
    }
}

/// Hard limits that apply on top of whatever the driver reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_core_offset_mhz: i32,
    pub max_mem_offset_mhz: i32,
    pub min_fan_duty_percent: u8,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_core_offset_mhz: 1500,
            max_mem_offset_mhz: 4000,
            min_fan_duty_percent: 30,
        }
    }
}

/// What a device lets us write, and within which ranges
///
/// A `None` range means the control is not available on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub power: Option<PowerRange>,
    pub core_offset: Option<OffsetRange>,
    pub mem_offset: Option<OffsetRange>,
    pub fan_count: u32,
    /// Range accepted for manual duty; `None` if manual fan control is unavailable
    pub fan_duty: Option<DutyRange>,
}

impl DeviceCapabilities {
    /// Narrow every range to the configured safety limits
    pub fn restricted_to(mut self, limits: &SafetyLimits) -> Self {
        self.core_offset = self
            .core_offset
            .and_then(|r| r.within(limits.max_core_offset_mhz));
        self.mem_offset = self
            .mem_offset
            .and_then(|r| r.within(limits.max_mem_offset_mhz));
        self.fan_duty = self.fan_duty.and_then(|r| {
            let min_percent = r.min_percent.max(limits.min_fan_duty_percent);
            (min_percent <= r.max_percent).then_some(DutyRange {
                min_percent,
                max_percent: r.max_percent,
            })
        });
        self
    }

    /// Whether the device can take a write for this field
    pub fn supports(&self, field: SettingField) -> bool {
        match field {
            SettingField::PowerLimit => self.power.is_some(),
            SettingField::CoreClockOffset => self.core_offset.is_some(),
            SettingField::MemClockOffset => self.mem_offset.is_some(),
            SettingField::FanMode => self.fan_count > 0,
            SettingField::FanDuty | SettingField::FanCurve => {
                self.fan_count > 0 && self.fan_duty.is_some()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_constraints_in_watts() {
        let constraints = PowerConstraints::new(
            PowerLimit::from_milliwatts(100_500),
            PowerLimit::from_watts(400),
            PowerLimit::from_watts(300),
        );
        assert!(constraints.contains(&PowerLimit::from_watts(400)));
        assert!(!constraints.contains(&PowerLimit::from_watts(100)));
        assert_eq!(constraints.to_string(), "100W-400W");

        let range = constraints.range();
        assert_eq!((range.min_watts, range.max_watts, range.default_watts), (101, 400, 300));
        assert!(constraints.contains(&PowerLimit::from_watts(range.min_watts)));

        let exact = PowerConstraints::new(
            PowerLimit::from_watts(100),
            PowerLimit::from_milliwatts(350_900),
            PowerLimit::from_watts(300),
        )
        .range();
        assert_eq!((exact.min_watts, exact.max_watts), (100, 350));
    }

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            index: 0,
            name: "Test GPU".into(),
            uuid: "GPU-0".into(),
            power: Some(PowerRange {
                min_watts: 100,
                max_watts: 350,
                default_watts: 320,
            }),
            core_offset: Some(OffsetRange {
                min_mhz: -1000,
                max_mhz: 2000,
            }),
            mem_offset: Some(OffsetRange {
                min_mhz: -2000,
                max_mhz: 6000,
            }),
            fan_count: 2,
            fan_duty: Some(DutyRange::default()),
        }
    }

    #[test]
    fn test_range_clamp() {
        let range = OffsetRange {
            min_mhz: -500,
            max_mhz: 500,
        };
        assert_eq!(range.clamp(900), 500);
        assert_eq!(range.clamp(-900), -500);
        assert_eq!(range.clamp(120), 120);
        assert!(range.contains(500));
        assert!(!range.contains(501));
    }

    #[test]
    fn test_restricted_to_safety_limits() {
        let restricted = caps().restricted_to(&SafetyLimits::default());

        assert_eq!(
            restricted.core_offset,
            Some(OffsetRange {
                min_mhz: -1000,
                max_mhz: 1500
            })
        );
        assert_eq!(
            restricted.mem_offset,
            Some(OffsetRange {
                min_mhz: -2000,
                max_mhz: 4000
            })
        );
        assert_eq!(
            restricted.fan_duty,
            Some(DutyRange {
                min_percent: 30,
                max_percent: 100
            })
        );
        assert_eq!(restricted.power, caps().power);
    }

    #[test]
    fn test_disjoint_range_becomes_unsupported() {
        let range = OffsetRange {
            min_mhz: 200,
            max_mhz: 400,
        };
        assert_eq!(range.within(100), None);
    }

    #[test]
    fn test_supports() {
        let mut c = caps();
        assert!(c.supports(SettingField::FanCurve));

        c.fan_duty = None;
        assert!(c.supports(SettingField::FanMode));
        assert!(!c.supports(SettingField::FanDuty));

        c.fan_count = 0;
        assert!(!c.supports(SettingField::FanMode));

        c.power = None;
        assert!(!c.supports(SettingField::PowerLimit));
    }
}
