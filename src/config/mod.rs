//! Configuration system
//!
//! Handles TOML config file parsing and CLI argument merging. Every section
//! is `#[serde(default)]`, so a partial or older file still loads and keys
//! this version does not know are ignored.

pub mod builder;
pub mod file;

pub use builder::ConfigBuilder;
pub use file::ConfigFile;

use crate::domain::SafetyLimits;
use crate::error::ConfigError;
use crate::services::fan_controller::FanTuning;
use crate::services::gateway::GatewayConfig;
use crate::services::profile_store::ProfileStore;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub sampler: SamplerConfig,
    pub fan: FanConfig,
    pub gateway: GatewaySection,
    pub safety: SafetySection,
    pub paths: PathsConfig,
}

impl Config {
    /// Reject values no component can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampler.interval_ms == 0 {
            return Err(invalid("sampler.interval_ms", "must be greater than 0"));
        }
        if self.fan.min_step_percent > 100 {
            return Err(invalid("fan.min_step_percent", "must be within 0-100"));
        }
        if self.fan.drift_tolerance_percent > 100 {
            return Err(invalid("fan.drift_tolerance_percent", "must be within 0-100"));
        }
        if self.gateway.lock_timeout_ms == 0 {
            return Err(invalid("gateway.lock_timeout_ms", "must be greater than 0"));
        }
        if self.gateway.call_timeout_ms == 0 {
            return Err(invalid("gateway.call_timeout_ms", "must be greater than 0"));
        }
        if self.safety.min_fan_duty_percent > 100 {
            return Err(invalid("safety.min_fan_duty_percent", "must be within 0-100"));
        }
        if self.safety.max_core_offset_mhz < 0 || self.safety.max_mem_offset_mhz < 0 {
            return Err(invalid("safety", "offset limits must not be negative"));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sampler.interval_ms)
    }

    pub fn fan_tuning(&self) -> FanTuning {
        FanTuning {
            min_step_percent: self.fan.min_step_percent,
            min_dwell: Duration::from_millis(self.fan.min_dwell_ms),
            drift_tolerance_percent: self.fan.drift_tolerance_percent,
        }
    }

    pub fn safety_limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_core_offset_mhz: self.safety.max_core_offset_mhz,
            max_mem_offset_mhz: self.safety.max_mem_offset_mhz,
            min_fan_duty_percent: self.safety.min_fan_duty_percent,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            lock_timeout: Duration::from_millis(self.gateway.lock_timeout_ms),
            call_timeout: Duration::from_millis(self.gateway.call_timeout_ms),
            safety: self.safety_limits(),
        }
    }

    /// Profile directory: configured, else the user's config directory
    pub fn profiles_dir(&self) -> Result<PathBuf, ConfigError> {
        self.paths
            .profiles_dir
            .clone()
            .or_else(ProfileStore::default_dir)
            .ok_or_else(|| invalid("paths.profiles_dir", "no config directory for this user"))
    }

    /// Directory for the boot apply flag; defaults to the profile directory
    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.paths.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => self.profiles_dir(),
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// General configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,
}

/// Telemetry sampling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Sampling period in milliseconds
    pub interval_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Fan curve controller hysteresis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    pub min_step_percent: u8,
    pub min_dwell_ms: u64,
    pub drift_tolerance_percent: u8,
}

impl Default for FanConfig {
    fn default() -> Self {
        let tuning = FanTuning::default();
        Self {
            min_step_percent: tuning.min_step_percent,
            min_dwell_ms: tuning.min_dwell.as_millis() as u64,
            drift_tolerance_percent: tuning.drift_tolerance_percent,
        }
    }
}

/// Apply gateway and privilege escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub lock_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Command that runs the privileged helper; empty runs it directly
    pub escalation_command: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            call_timeout_ms: 5000,
            escalation_command: "pkexec".to_string(),
        }
    }
}

/// Hard limits applied on top of the driver's ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    pub max_core_offset_mhz: i32,
    pub max_mem_offset_mhz: i32,
    pub min_fan_duty_percent: u8,
}

impl Default for SafetySection {
    fn default() -> Self {
        let limits = SafetyLimits::default();
        Self {
            max_core_offset_mhz: limits.max_core_offset_mhz,
            max_mem_offset_mhz: limits.max_mem_offset_mhz,
            min_fan_duty_percent: limits.min_fan_duty_percent,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub profiles_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sampler.interval_ms, 1000);
        assert_eq!(config.fan_tuning(), FanTuning::default());
        assert_eq!(config.safety_limits(), SafetyLimits::default());
        assert_eq!(config.gateway_config(), GatewayConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[fan]
min_dwell_ms = 3000

[boot]
profile = "ignored"
"#,
        )
        .unwrap();
        assert_eq!(config.fan.min_dwell_ms, 3000);
        assert_eq!(config.fan.min_step_percent, 2);
        assert_eq!(config.gateway.escalation_command, "pkexec");
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.sampler.interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "sampler.interval_ms"
        ));
    }

    #[test]
    fn test_state_dir_falls_back_to_profiles_dir() {
        let mut config = Config::default();
        config.paths.profiles_dir = Some(PathBuf::from("/var/lib/nvoc/profiles"));
        assert_eq!(
            config.state_dir().unwrap(),
            PathBuf::from("/var/lib/nvoc/profiles")
        );

        config.paths.state_dir = Some(PathBuf::from("/run/nvoc"));
        assert_eq!(config.state_dir().unwrap(), PathBuf::from("/run/nvoc"));
    }
}
