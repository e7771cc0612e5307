//! Unified error types for nvoc
//!
//! This module defines all error types used throughout the application.
//! Uses thiserror for ergonomic error definitions.
//!
//! `ValidationError`, `SampleError` and `ApplyError` are plain values
//! (`Clone` + serde) because they travel across the privilege boundary.

use crate::domain::SettingField;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from NVML operations
    #[error("NVML error: {0}")]
    Nvml(#[from] NvmlError),

    /// Error from configuration parsing/validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A setting request was rejected by the bounds validator
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A telemetry read failed
    #[error("Telemetry error: {0}")]
    Sample(#[from] SampleError),

    /// A hardware write failed
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Profile store failure
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Privilege boundary failure
    #[error("Privileged helper error: {0}")]
    Ipc(#[from] IpcError),

    /// GPU not found by index
    #[error("GPU not found: {0}")]
    GpuNotFound(String),

    /// No GPUs detected in the system
    #[error("No NVIDIA GPUs detected")]
    NoGpusFound,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from NVML wrapper operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NvmlError {
    /// Failed to initialize NVML library
    #[error("Failed to initialize NVML: {0}")]
    InitializationFailed(String),

    /// NVML library not found
    #[error("NVML library not found. Is the NVIDIA driver installed?")]
    LibraryNotFound,

    /// Device not found at index
    #[error("GPU device not found at index {0}")]
    DeviceNotFound(u32),

    /// Operation not supported by this GPU
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Insufficient permissions
    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),

    /// Unknown NVML error
    #[error("NVML error: {0}")]
    Unknown(String),

    /// GPU is lost (fallen off bus, etc.)
    #[error("GPU is lost or has become inaccessible")]
    GpuLost,

    /// Invalid argument passed to NVML
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The vendor call did not return in time
    #[error("NVML call timed out after {0:?}")]
    Timeout(Duration),

    /// The thread owning the device handle is gone
    #[error("Device session closed")]
    SessionClosed,
}

/// Why a fan curve was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveDefect {
    /// The curve has no points
    Empty,
    /// Temperature is not strictly greater than the previous point's
    TemperatureNotIncreasing,
    /// Duty is outside 0-100%
    DutyOutOfRange,
    /// Duty is lower than the previous point's
    DutyDecreasing,
}

impl std::fmt::Display for CurveDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CurveDefect::Empty => "curve has no points",
            CurveDefect::TemperatureNotIncreasing => "temperatures must strictly increase",
            CurveDefect::DutyOutOfRange => "duty must be within 0-100%",
            CurveDefect::DutyDecreasing => "duty must not decrease as temperature rises",
        };
        f.write_str(text)
    }
}

/// Errors from the bounds validator and domain type construction
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    /// Value cannot be clamped into a sane range (e.g. negative duty)
    #[error("{field} value {value} is out of range")]
    OutOfRange { field: SettingField, value: i64 },

    /// Fan curve point violates the curve invariants
    #[error("Invalid fan curve at point {index}: {defect}")]
    InvalidCurve { index: usize, defect: CurveDefect },

    /// Request is structurally incomplete (e.g. manual mode without a duty)
    #[error("Missing required field: {0}")]
    MissingField(SettingField),

    /// The device does not expose this control
    #[error("{0} is not supported by this GPU")]
    Unsupported(SettingField),

    /// Invalid fan speed value (must be 0-100)
    #[error("Invalid fan speed: {0}% (must be 0-100)")]
    InvalidFanSpeed(u8),
}

/// Errors from a single telemetry tick
///
/// Never fatal to the sample stream: the next tick tries again.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleError {
    /// A read-only vendor call failed or timed out for this tick
    #[error("GPU {device} telemetry unavailable: {reason}")]
    Transient { device: u32, reason: String },
}

/// Errors from the apply gateway
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyError {
    /// The request failed bounds validation; nothing was written
    #[error("Request rejected: {0}")]
    Validation(ValidationError),

    /// The first write of the transaction failed; nothing was changed
    #[error("Driver rejected {field}: {reason}")]
    VendorRejected { field: SettingField, reason: String },

    /// A later write failed after earlier fields were written
    ///
    /// `unknown_fields` lists every field whose rollback also failed and
    /// whose hardware state is therefore unknown.
    #[error(
        "Applying {failed_field} failed ({reason}); rolled back: {rolled_back}{}",
        format_unknown(.unknown_fields)
    )]
    PartialApply {
        failed_field: SettingField,
        reason: String,
        rolled_back: bool,
        unknown_fields: Vec<SettingField>,
    },

    /// Another write transaction held the device for too long
    #[error("GPU {device} is busy (waited {waited_ms} ms for the apply lock)")]
    LockTimeout { device: u32, waited_ms: u64 },

    /// The request uses a control the device does not have
    #[error("GPU {device} cannot apply {field}: {reason}")]
    CapabilityMismatch {
        device: u32,
        field: SettingField,
        reason: String,
    },

    /// A controller duty arrived while the fans are under firmware control
    #[error("GPU {device} fans are in automatic mode; duty not written")]
    FanModeMismatch { device: u32 },

    /// No session is open for this device index
    #[error("Unknown GPU index {0}")]
    UnknownDevice(u32),
}

fn format_unknown(fields: &[SettingField]) -> String {
    if fields.is_empty() {
        return String::new();
    }
    let names: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    format!("; state unknown for: {}", names.join(", "))
}

impl From<ValidationError> for ApplyError {
    fn from(err: ValidationError) -> Self {
        ApplyError::Validation(err)
    }
}

/// Errors from configuration parsing and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// Invalid config value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Profile store errors
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to access profile storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse profile {name}: {message}")]
    Parse { name: String, message: String },

    #[error("Failed to serialize profile: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Invalid profile name: {0}")]
    InvalidName(String),

    /// Import without overwrite found a stored profile of that name
    #[error("Profile already exists: {0} (use --force to replace it)")]
    AlreadyExists(String),

    /// Two names that map to the same file
    #[error("Profile name '{name}' collides with stored profile '{existing}'")]
    NameConflict { name: String, existing: String },

    #[error("Profile {name} is invalid: {source}")]
    Invalid {
        name: String,
        #[source]
        source: ValidationError,
    },
}

/// Errors on the unprivileged side of the privilege boundary
#[derive(Error, Debug)]
pub enum IpcError {
    /// The escalation command could not be started
    #[error("Failed to start privileged helper '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Authentication was dismissed or refused
    #[error("Authentication cancelled or refused")]
    AuthenticationFailed,

    /// The helper closed the channel
    #[error("Privileged helper exited unexpectedly")]
    Disconnected,

    /// Transport-level IO error
    #[error("IO error talking to privileged helper: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded
    #[error("Malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The helper refused the request as malformed
    #[error("Helper rejected request: {0}")]
    BadRequest(String),

    /// The helper answered with a response of the wrong kind
    #[error("Unexpected response from helper: {0}")]
    UnexpectedResponse(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
