//! Domain types for nvoc
//!
//! Plain values shared by the validator, the gateway, the fan controller
//! and the profile store. Most of them are serde types because they cross
//! the privilege boundary or land on disk.

pub mod capabilities;
pub mod clock;
pub mod fan;
pub mod profile;
pub mod setting;
pub mod telemetry;

pub use capabilities::{
    DeviceCapabilities, DutyRange, OffsetRange, PowerConstraints, PowerLimit, PowerRange,
    SafetyLimits,
};
pub use clock::{ClockDomain, ClockOffset, ClockSpeed, Utilization};
pub use fan::{CurvePoint, FanCurve, FanPolicy, FanSpeed};
pub use profile::Profile;
pub use setting::{
    Adjustment, AppliedFan, AppliedSetting, FanRequest, SettingField, SettingRequest,
    ValidatedFan, ValidatedSetting,
};
pub use telemetry::{Temperature, TelemetrySample};
