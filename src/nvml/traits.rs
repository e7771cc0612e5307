//! Trait definitions for GPU operations
//!
//! These traits abstract over NVML to enable testing with mocks.

use crate::domain::{
    AppliedFan, AppliedSetting, ClockDomain, ClockOffset, ClockSpeed, DeviceCapabilities,
    DutyRange, FanPolicy, FanSpeed, OffsetRange, PowerConstraints, PowerLimit, Temperature,
    Utilization,
};
use crate::error::NvmlError;
use chrono::Utc;

/// Trait for GPU device operations
///
/// A device is owned by exactly one [`DeviceSession`](super::DeviceSession)
/// worker, so implementations only need to be `Send`.
pub trait GpuDevice: Send {
    /// Get the GPU index
    fn index(&self) -> u32;

    /// Get the GPU name
    fn name(&self) -> Result<String, NvmlError>;

    /// Get the GPU UUID
    fn uuid(&self) -> Result<String, NvmlError>;

    /// Get current GPU temperature
    fn temperature(&self) -> Result<Temperature, NvmlError>;

    // Fan operations
    /// Get the number of fans
    fn fan_count(&self) -> Result<u32, NvmlError>;

    /// Get current duty for a specific fan
    fn fan_speed(&self, fan_idx: u32) -> Result<FanSpeed, NvmlError>;

    /// Get tachometer reading for a specific fan
    fn fan_rpm(&self, fan_idx: u32) -> Result<u32, NvmlError>;

    /// Range the driver accepts for manual duty
    fn fan_duty_range(&self) -> Result<DutyRange, NvmlError>;

    /// Set duty for a specific fan
    fn set_fan_speed(&mut self, fan_idx: u32, speed: FanSpeed) -> Result<(), NvmlError>;

    /// Get current fan control policy
    fn fan_policy(&self, fan_idx: u32) -> Result<FanPolicy, NvmlError>;

    /// Set fan control policy
    fn set_fan_policy(&mut self, fan_idx: u32, policy: FanPolicy) -> Result<(), NvmlError>;

    // Power operations
    /// Get current power limit
    fn power_limit(&self) -> Result<PowerLimit, NvmlError>;

    /// Get power constraints (min/max/default)
    fn power_constraints(&self) -> Result<PowerConstraints, NvmlError>;

    /// Set power limit
    fn set_power_limit(&mut self, limit: PowerLimit) -> Result<(), NvmlError>;

    /// Get current power draw
    fn power_usage(&self) -> Result<PowerLimit, NvmlError>;

    // Clock operations
    /// Get current clock speed
    fn clock_speed(&self, domain: ClockDomain) -> Result<ClockSpeed, NvmlError>;

    /// Get GPU and memory utilization rates
    fn utilization(&self) -> Result<Utilization, NvmlError>;

    /// Get the current V/F offset
    fn clock_offset(&self, domain: ClockDomain) -> Result<ClockOffset, NvmlError>;

    /// Range the driver accepts for the V/F offset
    fn clock_offset_range(&self, domain: ClockDomain) -> Result<OffsetRange, NvmlError>;

    /// Set the V/F offset
    fn set_clock_offset(&mut self, domain: ClockDomain, offset: ClockOffset)
        -> Result<(), NvmlError>;

    /// Query what this device lets us write
    ///
    /// Controls whose range cannot be read are reported as unavailable.
    fn capabilities(&self) -> Result<DeviceCapabilities, NvmlError> {
        let power = self.power_constraints().ok().map(|c| c.range());
        let fan_count = self.fan_count().unwrap_or(0);
        let fan_duty = if fan_count > 0 {
            self.fan_duty_range().ok()
        } else {
            None
        };

        Ok(DeviceCapabilities {
            index: self.index(),
            name: self.name()?,
            uuid: self.uuid()?,
            power,
            core_offset: self.clock_offset_range(ClockDomain::Core).ok(),
            mem_offset: self.clock_offset_range(ClockDomain::Memory).ok(),
            fan_count,
            fan_duty,
        })
    }

    /// Read the writable state back from the hardware
    ///
    /// Fan mode is derived from the first fan's policy; a custom curve
    /// cannot be told apart from manual mode at this level.
    fn read_setting(&self) -> AppliedSetting {
        let fan = match self.fan_count() {
            Ok(count) if count > 0 => match self.fan_policy(0) {
                Ok(FanPolicy::Auto) => Some(AppliedFan::Auto),
                Ok(FanPolicy::Manual) => self.fan_speed(0).ok().map(|s| AppliedFan::Manual {
                    duty_percent: s.as_percentage(),
                }),
                Err(_) => None,
            },
            _ => None,
        };

        AppliedSetting {
            device_index: self.index(),
            power_limit_watts: self.power_limit().ok().map(|l| l.as_watts()),
            core_clock_offset_mhz: self
                .clock_offset(ClockDomain::Core)
                .ok()
                .map(|o| o.as_mhz()),
            mem_clock_offset_mhz: self
                .clock_offset(ClockDomain::Memory)
                .ok()
                .map(|o| o.as_mhz()),
            fan,
            updated_at: Utc::now(),
        }
    }
}

/// Trait for managing multiple GPUs
///
/// This trait provides methods for discovering and accessing GPU devices.
pub trait GpuManager: Send + Sync {
    /// The device type returned by this manager
    type Device: GpuDevice + 'static;

    /// Get the number of GPU devices
    fn device_count(&self) -> Result<u32, NvmlError>;

    /// Get a device by index
    fn device_by_index(&self, index: u32) -> Result<Self::Device, NvmlError>;

    /// Get all devices
    fn all_devices(&self) -> Result<Vec<Self::Device>, NvmlError> {
        let count = self.device_count()?;
        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            devices.push(self.device_by_index(i)?);
        }
        Ok(devices)
    }

    /// Get driver version
    fn driver_version(&self) -> Result<String, NvmlError>;
}
