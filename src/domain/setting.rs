//! Setting requests and applied state
//!
//! A [`SettingRequest`] is what a caller asks for: every field is optional
//! and an absent field means "leave unchanged". The validator turns it into
//! a [`ValidatedSetting`], and the gateway records what actually reached
//! the hardware as an [`AppliedSetting`].

use super::fan::{FanCurve, FanSpeed};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names a single writable field
///
/// Used in errors and adjustment reports so the caller can tell exactly
/// which control was clamped, rejected or left in an unknown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingField {
    #[serde(rename = "power_limit_watts")]
    PowerLimit,
    #[serde(rename = "core_clock_offset_mhz")]
    CoreClockOffset,
    #[serde(rename = "mem_clock_offset_mhz")]
    MemClockOffset,
    #[serde(rename = "fan_mode")]
    FanMode,
    #[serde(rename = "fan_duty_percent")]
    FanDuty,
    #[serde(rename = "fan_curve")]
    FanCurve,
}

impl SettingField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingField::PowerLimit => "power_limit_watts",
            SettingField::CoreClockOffset => "core_clock_offset_mhz",
            SettingField::MemClockOffset => "mem_clock_offset_mhz",
            SettingField::FanMode => "fan_mode",
            SettingField::FanDuty => "fan_duty_percent",
            SettingField::FanCurve => "fan_curve",
        }
    }
}

impl fmt::Display for SettingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested fan behaviour
///
/// Duty and curve are optional on the wire so that an incomplete request
/// is reported as a missing field rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FanRequest {
    /// Hand control back to the firmware
    Auto,
    /// Fixed duty on every fan
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duty_percent: Option<i32>,
    },
    /// Closed-loop control from a temperature curve
    Custom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        curve: Option<FanCurve>,
    },
}

impl FanRequest {
    pub fn manual(duty_percent: i32) -> Self {
        FanRequest::Manual {
            duty_percent: Some(duty_percent),
        }
    }

    pub fn custom(curve: FanCurve) -> Self {
        FanRequest::Custom { curve: Some(curve) }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            FanRequest::Auto => "auto",
            FanRequest::Manual { .. } => "manual",
            FanRequest::Custom { .. } => "custom",
        }
    }
}

/// A partial setting change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_limit_watts: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_clock_offset_mhz: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_clock_offset_mhz: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan: Option<FanRequest>,
}

impl SettingRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_power_limit(mut self, watts: i32) -> Self {
        self.power_limit_watts = Some(watts);
        self
    }

    pub fn with_core_offset(mut self, mhz: i32) -> Self {
        self.core_clock_offset_mhz = Some(mhz);
        self
    }

    pub fn with_mem_offset(mut self, mhz: i32) -> Self {
        self.mem_clock_offset_mhz = Some(mhz);
        self
    }

    pub fn with_fan(mut self, fan: FanRequest) -> Self {
        self.fan = Some(fan);
        self
    }

    /// True if the request would not change anything
    pub fn is_empty(&self) -> bool {
        self.power_limit_watts.is_none()
            && self.core_clock_offset_mhz.is_none()
            && self.mem_clock_offset_mhz.is_none()
            && self.fan.is_none()
    }
}

/// Fan behaviour after validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidatedFan {
    Auto,
    Manual { duty: FanSpeed },
    Custom { curve: FanCurve },
}

/// A value the validator changed to fit the device's range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub field: SettingField,
    pub requested: i64,
    pub applied: i64,
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: requested {}, clamped to {}",
            self.field, self.requested, self.applied
        )
    }
}

/// A request whose every present field fits the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedSetting {
    pub power_limit_watts: Option<u32>,
    pub core_clock_offset_mhz: Option<i32>,
    pub mem_clock_offset_mhz: Option<i32>,
    pub fan: Option<ValidatedFan>,
    /// Fields that were clamped on the way in
    pub adjustments: Vec<Adjustment>,
}

impl ValidatedSetting {
    pub fn is_adjusted(&self, field: SettingField) -> bool {
        self.adjustments.iter().any(|a| a.field == field)
    }
}

/// Fan state as last written (or read back from the hardware)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AppliedFan {
    Auto,
    Manual { duty_percent: u8 },
    Custom { curve: FanCurve },
}

impl fmt::Display for AppliedFan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppliedFan::Auto => write!(f, "auto"),
            AppliedFan::Manual { duty_percent } => write!(f, "manual {}%", duty_percent),
            AppliedFan::Custom { curve } => write!(f, "custom ({} points)", curve.points().len()),
        }
    }
}

impl From<&ValidatedFan> for AppliedFan {
    fn from(fan: &ValidatedFan) -> Self {
        match fan {
            ValidatedFan::Auto => AppliedFan::Auto,
            ValidatedFan::Manual { duty } => AppliedFan::Manual {
                duty_percent: duty.as_percentage(),
            },
            ValidatedFan::Custom { curve } => AppliedFan::Custom {
                curve: curve.clone(),
            },
        }
    }
}

/// The last fully committed configuration of one device
///
/// A `None` field is a control this device does not expose (or whose value
/// could not be read when the session opened).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSetting {
    pub device_index: u32,
    pub power_limit_watts: Option<u32>,
    pub core_clock_offset_mhz: Option<i32>,
    pub mem_clock_offset_mhz: Option<i32>,
    pub fan: Option<AppliedFan>,
    pub updated_at: DateTime<Utc>,
}

impl AppliedSetting {
    pub fn empty(device_index: u32) -> Self {
        Self {
            device_index,
            power_limit_watts: None,
            core_clock_offset_mhz: None,
            mem_clock_offset_mhz: None,
            fan: None,
            updated_at: Utc::now(),
        }
    }

    /// New state after every field of `validated` has been written
    pub fn merged(&self, validated: &ValidatedSetting) -> Self {
        Self {
            device_index: self.device_index,
            power_limit_watts: validated.power_limit_watts.or(self.power_limit_watts),
            core_clock_offset_mhz: validated
                .core_clock_offset_mhz
                .or(self.core_clock_offset_mhz),
            mem_clock_offset_mhz: validated.mem_clock_offset_mhz.or(self.mem_clock_offset_mhz),
            fan: validated
                .fan
                .as_ref()
                .map(AppliedFan::from)
                .or_else(|| self.fan.clone()),
            updated_at: Utc::now(),
        }
    }

    /// Mark a field as unknown after a write whose outcome is uncertain
    pub fn forget(&mut self, field: SettingField) {
        match field {
            SettingField::PowerLimit => self.power_limit_watts = None,
            SettingField::CoreClockOffset => self.core_clock_offset_mhz = None,
            SettingField::MemClockOffset => self.mem_clock_offset_mhz = None,
            SettingField::FanMode | SettingField::FanDuty | SettingField::FanCurve => {
                self.fan = None
            }
        }
        self.updated_at = Utc::now();
    }
}

/// A request that reproduces this state; unknown fields stay unset
impl From<&AppliedSetting> for SettingRequest {
    fn from(applied: &AppliedSetting) -> Self {
        Self {
            power_limit_watts: applied.power_limit_watts.map(|w| w as i32),
            core_clock_offset_mhz: applied.core_clock_offset_mhz,
            mem_clock_offset_mhz: applied.mem_clock_offset_mhz,
            fan: applied.fan.as_ref().map(|fan| match fan {
                AppliedFan::Auto => FanRequest::Auto,
                AppliedFan::Manual { duty_percent } => FanRequest::manual(*duty_percent as i32),
                AppliedFan::Custom { curve } => FanRequest::custom(curve.clone()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fan::CurvePoint;

    #[test]
    fn test_field_display_matches_wire_name() {
        for field in [
            SettingField::PowerLimit,
            SettingField::CoreClockOffset,
            SettingField::MemClockOffset,
            SettingField::FanMode,
            SettingField::FanDuty,
            SettingField::FanCurve,
        ] {
            let json = serde_json::to_string(&field).unwrap();
            assert_eq!(json, format!("\"{}\"", field));
        }
    }

    #[test]
    fn test_request_unset_fields_are_omitted() {
        let request = SettingRequest::new().with_power_limit(300);
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"power_limit_watts":300}"#);
        assert!(!request.is_empty());
        assert!(SettingRequest::new().is_empty());
    }

    #[test]
    fn test_request_ignores_unknown_fields() {
        let json = r#"{"power_limit_watts":250,"max_clock_mhz":1800}"#;
        let request: SettingRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.power_limit_watts, Some(250));
    }

    #[test]
    fn test_fan_request_tagging() {
        let json = r#"{"mode":"manual","duty_percent":55}"#;
        let fan: FanRequest = serde_json::from_str(json).unwrap();
        assert_eq!(fan, FanRequest::manual(55));

        let fan: FanRequest = serde_json::from_str(r#"{"mode":"manual"}"#).unwrap();
        assert_eq!(fan, FanRequest::Manual { duty_percent: None });

        let fan: FanRequest = serde_json::from_str(r#"{"mode":"auto"}"#).unwrap();
        assert_eq!(fan.mode_name(), "auto");
    }

    #[test]
    fn test_merged_keeps_untouched_fields() {
        let mut applied = AppliedSetting::empty(0);
        applied.power_limit_watts = Some(300);
        applied.core_clock_offset_mhz = Some(0);
        applied.fan = Some(AppliedFan::Auto);

        let validated = ValidatedSetting {
            core_clock_offset_mhz: Some(150),
            fan: Some(ValidatedFan::Custom {
                curve: FanCurve::new(vec![CurvePoint::new(40, 30)]).unwrap(),
            }),
            ..Default::default()
        };

        let next = applied.merged(&validated);
        assert_eq!(next.power_limit_watts, Some(300));
        assert_eq!(next.core_clock_offset_mhz, Some(150));
        assert!(matches!(next.fan, Some(AppliedFan::Custom { .. })));
    }

    #[test]
    fn test_adjustment_display() {
        let adj = Adjustment {
            field: SettingField::PowerLimit,
            requested: 9999,
            applied: 350,
        };
        assert_eq!(
            adj.to_string(),
            "power_limit_watts: requested 9999, clamped to 350"
        );
    }

    #[test]
    fn test_request_from_applied_state() {
        let mut applied = AppliedSetting::empty(0);
        applied.power_limit_watts = Some(280);
        applied.mem_clock_offset_mhz = Some(500);
        applied.fan = Some(AppliedFan::Manual { duty_percent: 65 });

        let request = SettingRequest::from(&applied);
        assert_eq!(
            request,
            SettingRequest::new()
                .with_power_limit(280)
                .with_mem_offset(500)
                .with_fan(FanRequest::manual(65))
        );
        assert!(SettingRequest::from(&AppliedSetting::empty(1)).is_empty());
    }
}
