//! Mock implementations for testing
//!
//! Provides a mock GPU device and manager for unit testing without real
//! hardware. A `MockDevice` is cheap to clone and every clone shares the
//! same state, so a test can keep a handle while the original is moved into
//! a device session.

use crate::domain::{
    ClockDomain, ClockOffset, ClockSpeed, DutyRange, FanPolicy, FanSpeed, OffsetRange,
    PowerConstraints, PowerLimit, Temperature, Utilization,
};
use crate::error::NvmlError;
use crate::nvml::{GpuDevice, GpuManager};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Temperature,
    FanSpeed,
    SetPowerLimit,
    SetCoreOffset,
    SetMemOffset,
    SetFanSpeed,
    SetFanPolicy,
}

/// A write that reached the mock hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockWrite {
    PowerLimit(u32),
    ClockOffset(ClockDomain, i32),
    FanSpeed(u32, u8),
    FanPolicy(u32, FanPolicy),
}

#[derive(Debug, Clone, Copy)]
struct FailRule {
    /// Calls that still succeed before failures start
    skip: u32,
}

#[derive(Debug)]
struct MockState {
    temperature: Temperature,
    fan_speeds: Vec<FanSpeed>,
    fan_policies: Vec<FanPolicy>,
    fan_duty_range: Option<DutyRange>,
    power_limit: PowerLimit,
    power_constraints: Option<PowerConstraints>,
    power_usage: PowerLimit,
    core_offset: ClockOffset,
    mem_offset: ClockOffset,
    core_offset_range: Option<OffsetRange>,
    mem_offset_range: Option<OffsetRange>,
    latency: Duration,
    failures: HashMap<MockOp, FailRule>,
    writes: Vec<MockWrite>,
}

/// Mock GPU device for testing
#[derive(Debug, Clone)]
pub struct MockDevice {
    index: u32,
    name: String,
    uuid: String,
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Create a new mock device with default values
    ///
    /// Two fans in auto mode at 50%, power 100-400 W (300 W default),
    /// offsets -1000..=2000 MHz core and -2000..=6000 MHz memory.
    pub fn new(index: u32) -> Self {
        let state = MockState {
            temperature: Temperature::new(45),
            fan_speeds: vec![FanSpeed::new_unchecked(50); 2],
            fan_policies: vec![FanPolicy::Auto; 2],
            fan_duty_range: Some(DutyRange::default()),
            power_limit: PowerLimit::from_watts(300),
            power_constraints: Some(PowerConstraints::new(
                PowerLimit::from_watts(100),
                PowerLimit::from_watts(400),
                PowerLimit::from_watts(300),
            )),
            power_usage: PowerLimit::from_watts(150),
            core_offset: ClockOffset::default(),
            mem_offset: ClockOffset::default(),
            core_offset_range: Some(OffsetRange {
                min_mhz: -1000,
                max_mhz: 2000,
            }),
            mem_offset_range: Some(OffsetRange {
                min_mhz: -2000,
                max_mhz: 6000,
            }),
            latency: Duration::ZERO,
            failures: HashMap::new(),
            writes: Vec::new(),
        };

        Self {
            index,
            name: format!("Mock GPU {}", index),
            uuid: format!("GPU-MOCK-{:04}", index),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builder: set fan count (all fans start in auto mode at 50%)
    pub fn with_fan_count(self, count: u32) -> Self {
        {
            let mut state = self.state();
            state.fan_speeds = vec![FanSpeed::new_unchecked(50); count as usize];
            state.fan_policies = vec![FanPolicy::Auto; count as usize];
        }
        self
    }

    /// Builder: set power constraints (`None` = power limit not supported)
    pub fn with_power_constraints(self, constraints: Option<PowerConstraints>) -> Self {
        {
            let mut state = self.state();
            if let Some(c) = constraints {
                state.power_limit = c.default;
            }
            state.power_constraints = constraints;
        }
        self
    }

    /// Builder: remove clock offset support
    pub fn without_clock_offsets(self) -> Self {
        {
            let mut state = self.state();
            state.core_offset_range = None;
            state.mem_offset_range = None;
        }
        self
    }

    /// Builder: set the manual duty range (`None` = manual control unsupported)
    pub fn with_fan_duty_range(self, range: Option<DutyRange>) -> Self {
        self.state().fan_duty_range = range;
        self
    }

    /// Set the mock temperature
    pub fn set_temperature(&self, temp: Temperature) {
        self.state().temperature = temp;
    }

    /// Overwrite the reported duty of every fan without recording a write
    pub fn set_reported_fan_speed(&self, speed: FanSpeed) {
        let mut state = self.state();
        for s in state.fan_speeds.iter_mut() {
            *s = speed;
        }
    }

    /// Overwrite the policy of every fan without recording a write
    pub fn set_reported_fan_policy(&self, policy: FanPolicy) {
        let mut state = self.state();
        for p in state.fan_policies.iter_mut() {
            *p = policy;
        }
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Make every call of `op` fail
    pub fn fail_on(&self, op: MockOp) {
        self.fail_after(op, 0);
    }

    /// Let `successes` calls of `op` through, then fail every later one
    pub fn fail_after(&self, op: MockOp, successes: u32) {
        self.state()
            .failures
            .insert(op, FailRule { skip: successes });
    }

    /// Stop failing `op`
    pub fn clear_failure(&self, op: MockOp) {
        self.state().failures.remove(&op);
    }

    /// Writes that reached the device, oldest first
    pub fn writes(&self) -> Vec<MockWrite> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    pub fn current_power_limit(&self) -> PowerLimit {
        self.state().power_limit
    }

    pub fn current_offset(&self, domain: ClockDomain) -> ClockOffset {
        let state = self.state();
        match domain {
            ClockDomain::Core => state.core_offset,
            ClockDomain::Memory => state.mem_offset,
        }
    }

    pub fn fan_speeds(&self) -> Vec<FanSpeed> {
        self.state().fan_speeds.clone()
    }

    pub fn fan_policies(&self) -> Vec<FanPolicy> {
        self.state().fan_policies.clone()
    }

    /// Sleep for the configured latency, then check for an injected failure
    fn enter(&self, op: Option<MockOp>) -> Result<(), NvmlError> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let Some(op) = op else {
            return Ok(());
        };
        let mut state = self.state();
        match state.failures.get_mut(&op) {
            Some(rule) if rule.skip > 0 => {
                rule.skip -= 1;
                Ok(())
            }
            Some(_) => Err(NvmlError::Unknown(format!("injected failure: {:?}", op))),
            None => Ok(()),
        }
    }

    fn check_fan(&self, fan_idx: u32) -> Result<(), NvmlError> {
        if (fan_idx as usize) < self.state().fan_speeds.len() {
            Ok(())
        } else {
            Err(NvmlError::InvalidArgument(format!(
                "Fan index {} out of range",
                fan_idx
            )))
        }
    }

    fn not_supported(what: &str) -> NvmlError {
        NvmlError::NotSupported(format!("{} not supported by mock", what))
    }
}

impl GpuDevice for MockDevice {
    fn index(&self) -> u32 {
        self.index
    }

    fn name(&self) -> Result<String, NvmlError> {
        Ok(self.name.clone())
    }

    fn uuid(&self) -> Result<String, NvmlError> {
        Ok(self.uuid.clone())
    }

    fn temperature(&self) -> Result<Temperature, NvmlError> {
        self.enter(Some(MockOp::Temperature))?;
        Ok(self.state().temperature)
    }

    fn fan_count(&self) -> Result<u32, NvmlError> {
        self.enter(None)?;
        Ok(self.state().fan_speeds.len() as u32)
    }

    fn fan_speed(&self, fan_idx: u32) -> Result<FanSpeed, NvmlError> {
        self.enter(Some(MockOp::FanSpeed))?;
        self.check_fan(fan_idx)?;
        Ok(self.state().fan_speeds[fan_idx as usize])
    }

    fn fan_rpm(&self, fan_idx: u32) -> Result<u32, NvmlError> {
        let speed = self.fan_speed(fan_idx)?;
        Ok(speed.as_percentage() as u32 * 30)
    }

    fn fan_duty_range(&self) -> Result<DutyRange, NvmlError> {
        self.enter(None)?;
        self.state()
            .fan_duty_range
            .ok_or_else(|| Self::not_supported("Manual fan control"))
    }

    fn set_fan_speed(&mut self, fan_idx: u32, speed: FanSpeed) -> Result<(), NvmlError> {
        self.enter(Some(MockOp::SetFanSpeed))?;
        self.check_fan(fan_idx)?;
        let mut state = self.state();
        state.fan_speeds[fan_idx as usize] = speed;
        state
            .writes
            .push(MockWrite::FanSpeed(fan_idx, speed.as_percentage()));
        Ok(())
    }

    fn fan_policy(&self, fan_idx: u32) -> Result<FanPolicy, NvmlError> {
        self.enter(None)?;
        self.check_fan(fan_idx)?;
        Ok(self.state().fan_policies[fan_idx as usize])
    }

    fn set_fan_policy(&mut self, fan_idx: u32, policy: FanPolicy) -> Result<(), NvmlError> {
        self.enter(Some(MockOp::SetFanPolicy))?;
        self.check_fan(fan_idx)?;
        let mut state = self.state();
        state.fan_policies[fan_idx as usize] = policy;
        state.writes.push(MockWrite::FanPolicy(fan_idx, policy));
        Ok(())
    }

    fn power_limit(&self) -> Result<PowerLimit, NvmlError> {
        self.enter(None)?;
        let state = self.state();
        match state.power_constraints {
            Some(_) => Ok(state.power_limit),
            None => Err(Self::not_supported("Power limit")),
        }
    }

    fn power_constraints(&self) -> Result<PowerConstraints, NvmlError> {
        self.enter(None)?;
        self.state()
            .power_constraints
            .ok_or_else(|| Self::not_supported("Power limit"))
    }

    fn set_power_limit(&mut self, limit: PowerLimit) -> Result<(), NvmlError> {
        self.enter(Some(MockOp::SetPowerLimit))?;
        let mut state = self.state();
        let constraints = state
            .power_constraints
            .ok_or_else(|| Self::not_supported("Power limit"))?;
        if !constraints.contains(&limit) {
            return Err(NvmlError::InvalidArgument(format!(
                "Power limit {} outside {}",
                limit, constraints
            )));
        }
        state.power_limit = limit;
        state.writes.push(MockWrite::PowerLimit(limit.as_watts()));
        Ok(())
    }

    fn power_usage(&self) -> Result<PowerLimit, NvmlError> {
        self.enter(None)?;
        Ok(self.state().power_usage)
    }

    fn clock_speed(&self, domain: ClockDomain) -> Result<ClockSpeed, NvmlError> {
        self.enter(None)?;
        let state = self.state();
        Ok(match domain {
            ClockDomain::Core => {
                ClockSpeed::new((1800 + state.core_offset.as_mhz()).max(0) as u32)
            }
            ClockDomain::Memory => {
                ClockSpeed::new((9500 + state.mem_offset.as_mhz()).max(0) as u32)
            }
        })
    }

    fn utilization(&self) -> Result<Utilization, NvmlError> {
        self.enter(None)?;
        Ok(Utilization::new(35, 20))
    }

    fn clock_offset(&self, domain: ClockDomain) -> Result<ClockOffset, NvmlError> {
        self.enter(None)?;
        let state = self.state();
        let (range, value) = match domain {
            ClockDomain::Core => (state.core_offset_range, state.core_offset),
            ClockDomain::Memory => (state.mem_offset_range, state.mem_offset),
        };
        range
            .map(|_| value)
            .ok_or_else(|| Self::not_supported("Clock offset"))
    }

    fn clock_offset_range(&self, domain: ClockDomain) -> Result<OffsetRange, NvmlError> {
        self.enter(None)?;
        let state = self.state();
        match domain {
            ClockDomain::Core => state.core_offset_range,
            ClockDomain::Memory => state.mem_offset_range,
        }
        .ok_or_else(|| Self::not_supported("Clock offset"))
    }

    fn set_clock_offset(
        &mut self,
        domain: ClockDomain,
        offset: ClockOffset,
    ) -> Result<(), NvmlError> {
        let op = match domain {
            ClockDomain::Core => MockOp::SetCoreOffset,
            ClockDomain::Memory => MockOp::SetMemOffset,
        };
        self.enter(Some(op))?;

        let mut state = self.state();
        let range = match domain {
            ClockDomain::Core => state.core_offset_range,
            ClockDomain::Memory => state.mem_offset_range,
        }
        .ok_or_else(|| Self::not_supported("Clock offset"))?;
        if !range.contains(offset.as_mhz() as i64) {
            return Err(NvmlError::InvalidArgument(format!(
                "Offset {} out of range",
                offset
            )));
        }

        match domain {
            ClockDomain::Core => state.core_offset = offset,
            ClockDomain::Memory => state.mem_offset = offset,
        }
        state
            .writes
            .push(MockWrite::ClockOffset(domain, offset.as_mhz()));
        Ok(())
    }
}

/// Mock GPU manager for testing
#[derive(Debug, Clone)]
pub struct MockManager {
    devices: Vec<MockDevice>,
    driver_version: String,
}

impl MockManager {
    /// Create a mock manager with `device_count` default devices
    pub fn new(device_count: u32) -> Self {
        Self::with_devices((0..device_count).map(MockDevice::new).collect())
    }

    /// Create a mock manager with custom devices
    pub fn with_devices(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            driver_version: "550.54.14".to_string(),
        }
    }
}

impl GpuManager for MockManager {
    type Device = MockDevice;

    fn device_count(&self) -> Result<u32, NvmlError> {
        Ok(self.devices.len() as u32)
    }

    fn device_by_index(&self, index: u32) -> Result<Self::Device, NvmlError> {
        self.devices
            .get(index as usize)
            .cloned()
            .ok_or(NvmlError::DeviceNotFound(index))
    }

    fn driver_version(&self) -> Result<String, NvmlError> {
        Ok(self.driver_version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SafetyLimits;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new(0);
        assert_eq!(device.index(), 0);
        assert_eq!(device.name().unwrap(), "Mock GPU 0");
        assert_eq!(device.fan_count().unwrap(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let mut device = MockDevice::new(0);
        let hw = device.clone();

        device
            .set_fan_speed(1, FanSpeed::new(70).unwrap())
            .unwrap();
        assert_eq!(hw.fan_speeds()[1].as_percentage(), 70);
        assert_eq!(hw.writes(), vec![MockWrite::FanSpeed(1, 70)]);
    }

    #[test]
    fn test_power_limit_out_of_range() {
        let mut device = MockDevice::new(0);
        assert!(device.set_power_limit(PowerLimit::from_watts(500)).is_err());
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_fail_after() {
        let mut device = MockDevice::new(0);
        device.fail_after(MockOp::SetPowerLimit, 1);

        assert!(device.set_power_limit(PowerLimit::from_watts(200)).is_ok());
        assert!(device.set_power_limit(PowerLimit::from_watts(250)).is_err());

        device.clear_failure(MockOp::SetPowerLimit);
        assert!(device.set_power_limit(PowerLimit::from_watts(250)).is_ok());
    }

    #[test]
    fn test_capabilities_from_mock() {
        let caps = MockDevice::new(0)
            .capabilities()
            .unwrap()
            .restricted_to(&SafetyLimits::default());

        assert_eq!(caps.power.unwrap().max_watts, 400);
        assert_eq!(caps.core_offset.unwrap().max_mhz, 1500);
        assert_eq!(caps.fan_duty.unwrap().min_percent, 30);
        assert_eq!(caps.fan_count, 2);
    }

    #[test]
    fn test_unsupported_controls() {
        let device = MockDevice::new(0)
            .with_power_constraints(None)
            .without_clock_offsets()
            .with_fan_count(0);
        let caps = device.capabilities().unwrap();

        assert!(caps.power.is_none());
        assert!(caps.core_offset.is_none());
        assert!(caps.fan_duty.is_none());

        let applied = device.read_setting();
        assert_eq!(applied.power_limit_watts, None);
        assert_eq!(applied.fan, None);
    }

    #[test]
    fn test_mock_manager() {
        let manager = MockManager::new(2);
        assert_eq!(manager.device_count().unwrap(), 2);
        assert_eq!(manager.device_by_index(1).unwrap().index(), 1);
        assert!(manager.device_by_index(5).is_err());
    }
}
