//! NVML device implementation
//!
//! Real implementation of GpuDevice trait using nvml-wrapper. Range queries
//! the high-level API does not expose go straight to the C library.

use crate::domain::{
    ClockDomain, ClockOffset, ClockSpeed, DutyRange, FanPolicy, FanSpeed, OffsetRange,
    PowerConstraints, PowerLimit, Temperature, Utilization,
};
use crate::error::NvmlError;
use crate::nvml::traits::GpuDevice;

use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::Device;
use nvml_wrapper_sys::bindings::nvmlDevice_t;

// nvmlReturn_t codes we map to specific errors
const NVML_ERROR_INVALID_ARGUMENT: u32 = 2;
const NVML_ERROR_NOT_SUPPORTED: u32 = 3;
const NVML_ERROR_NO_PERMISSION: u32 = 4;
const NVML_ERROR_GPU_IS_LOST: u32 = 15;

/// NVML device wrapper implementing GpuDevice trait
pub struct NvmlDevice<'a> {
    device: Device<'a>,
    index: u32,
}

impl<'a> NvmlDevice<'a> {
    /// Create a new NVML device wrapper
    pub fn new(device: Device<'a>, index: u32) -> Self {
        Self { device, index }
    }

    /// Convert NVML error to our error type
    fn convert_error(err: nvml_wrapper::error::NvmlError) -> NvmlError {
        use nvml_wrapper::error::NvmlError as NE;
        match err {
            NE::NotSupported => {
                NvmlError::NotSupported("Operation not supported by this GPU".to_string())
            }
            NE::NoPermission => {
                NvmlError::InsufficientPermissions("Insufficient permissions".to_string())
            }
            NE::GpuLost => NvmlError::GpuLost,
            NE::InvalidArg => NvmlError::InvalidArgument("Invalid argument".to_string()),
            _ => NvmlError::Unknown(err.to_string()),
        }
    }

    fn nvml_clock(domain: ClockDomain) -> Clock {
        match domain {
            ClockDomain::Core => Clock::Graphics,
            ClockDomain::Memory => Clock::Memory,
        }
    }
}

impl GpuDevice for NvmlDevice<'_> {
    fn index(&self) -> u32 {
        self.index
    }

    fn name(&self) -> Result<String, NvmlError> {
        self.device.name().map_err(Self::convert_error)
    }

    fn uuid(&self) -> Result<String, NvmlError> {
        self.device.uuid().map_err(Self::convert_error)
    }

    fn temperature(&self) -> Result<Temperature, NvmlError> {
        let temp = self
            .device
            .temperature(TemperatureSensor::Gpu)
            .map_err(Self::convert_error)?;
        Ok(Temperature::from(temp))
    }

    fn fan_count(&self) -> Result<u32, NvmlError> {
        self.device.num_fans().map_err(Self::convert_error)
    }

    fn fan_speed(&self, fan_idx: u32) -> Result<FanSpeed, NvmlError> {
        let speed = self
            .device
            .fan_speed(fan_idx)
            .map_err(Self::convert_error)?;

        // NVML can report > 100 on some boards
        Ok(FanSpeed::saturating(speed as i64))
    }

    fn fan_rpm(&self, fan_idx: u32) -> Result<u32, NvmlError> {
        self.device
            .fan_speed_rpm(fan_idx)
            .map_err(Self::convert_error)
    }

    fn fan_duty_range(&self) -> Result<DutyRange, NvmlError> {
        let handle = unsafe { self.device.handle() };
        let (min, max) = get_min_max_fan_speed_raw(handle)?;
        Ok(DutyRange {
            min_percent: min.min(100) as u8,
            max_percent: max.min(100) as u8,
        })
    }

    fn set_fan_speed(&mut self, fan_idx: u32, speed: FanSpeed) -> Result<(), NvmlError> {
        self.device
            .set_fan_speed(fan_idx, speed.as_percentage() as u32)
            .map_err(Self::convert_error)
    }

    fn fan_policy(&self, fan_idx: u32) -> Result<FanPolicy, NvmlError> {
        use nvml_wrapper::enums::device::FanControlPolicy;

        let policy = self
            .device
            .fan_control_policy(fan_idx)
            .map_err(Self::convert_error)?;

        Ok(match policy {
            FanControlPolicy::TemperatureContinousSw => FanPolicy::Auto,
            FanControlPolicy::Manual => FanPolicy::Manual,
        })
    }

    fn set_fan_policy(&mut self, fan_idx: u32, policy: FanPolicy) -> Result<(), NvmlError> {
        use nvml_wrapper::enums::device::FanControlPolicy;

        let nvml_policy = match policy {
            FanPolicy::Auto => FanControlPolicy::TemperatureContinousSw,
            FanPolicy::Manual => FanControlPolicy::Manual,
        };

        self.device
            .set_fan_control_policy(fan_idx, nvml_policy)
            .map_err(Self::convert_error)
    }

    fn power_limit(&self) -> Result<PowerLimit, NvmlError> {
        let limit_mw = self
            .device
            .power_management_limit()
            .map_err(Self::convert_error)?;
        Ok(PowerLimit::from_milliwatts(limit_mw))
    }

    fn power_constraints(&self) -> Result<PowerConstraints, NvmlError> {
        let constraints = self
            .device
            .power_management_limit_constraints()
            .map_err(Self::convert_error)?;

        let default = self
            .device
            .power_management_limit_default()
            .map_err(Self::convert_error)?;

        Ok(PowerConstraints::new(
            PowerLimit::from_milliwatts(constraints.min_limit),
            PowerLimit::from_milliwatts(constraints.max_limit),
            PowerLimit::from_milliwatts(default),
        ))
    }

    fn set_power_limit(&mut self, limit: PowerLimit) -> Result<(), NvmlError> {
        self.device
            .set_power_management_limit(limit.as_milliwatts())
            .map_err(Self::convert_error)
    }

    fn power_usage(&self) -> Result<PowerLimit, NvmlError> {
        let usage_mw = self.device.power_usage().map_err(Self::convert_error)?;
        Ok(PowerLimit::from_milliwatts(usage_mw))
    }

    fn clock_speed(&self, domain: ClockDomain) -> Result<ClockSpeed, NvmlError> {
        let speed = self
            .device
            .clock_info(Self::nvml_clock(domain))
            .map_err(Self::convert_error)?;

        Ok(ClockSpeed::new(speed))
    }

    fn utilization(&self) -> Result<Utilization, NvmlError> {
        let util = self
            .device
            .utilization_rates()
            .map_err(Self::convert_error)?;

        Ok(Utilization::new(util.gpu as u8, util.memory as u8))
    }

    fn clock_offset(&self, domain: ClockDomain) -> Result<ClockOffset, NvmlError> {
        let mhz = match domain {
            ClockDomain::Core => self.device.gpc_clock_vf_offset(),
            ClockDomain::Memory => self.device.mem_clock_vf_offset(),
        }
        .map_err(Self::convert_error)?;

        Ok(ClockOffset::from_mhz(mhz))
    }

    fn clock_offset_range(&self, domain: ClockDomain) -> Result<OffsetRange, NvmlError> {
        let symbol: &[u8] = match domain {
            ClockDomain::Core => b"nvmlDeviceGetGpcClkMinMaxVfOffset",
            ClockDomain::Memory => b"nvmlDeviceGetMemClkMinMaxVfOffset",
        };
        let handle = unsafe { self.device.handle() };
        let (min_mhz, max_mhz) = get_vf_offset_range_raw(handle, symbol)?;
        Ok(OffsetRange { min_mhz, max_mhz })
    }

    fn set_clock_offset(
        &mut self,
        domain: ClockDomain,
        offset: ClockOffset,
    ) -> Result<(), NvmlError> {
        match domain {
            ClockDomain::Core => self.device.set_gpc_clock_vf_offset(offset.as_mhz()),
            ClockDomain::Memory => self.device.set_mem_clock_vf_offset(offset.as_mhz()),
        }
        .map_err(Self::convert_error)
    }
}

/// Map a raw nvmlReturn_t to our error type
fn raw_error(code: u32, what: &str) -> NvmlError {
    match code {
        NVML_ERROR_INVALID_ARGUMENT => NvmlError::InvalidArgument(what.to_string()),
        NVML_ERROR_NOT_SUPPORTED => NvmlError::NotSupported(what.to_string()),
        NVML_ERROR_NO_PERMISSION => NvmlError::InsufficientPermissions(what.to_string()),
        NVML_ERROR_GPU_IS_LOST => NvmlError::GpuLost,
        other => NvmlError::Unknown(format!("{}: NVML error code {}", what, other)),
    }
}

/// Get the accepted V/F offset range for one clock using raw FFI
///
/// `symbol` is either `nvmlDeviceGetGpcClkMinMaxVfOffset` or
/// `nvmlDeviceGetMemClkMinMaxVfOffset`; both share a signature.
fn get_vf_offset_range_raw(handle: nvmlDevice_t, symbol: &[u8]) -> Result<(i32, i32), NvmlError> {
    use libloading::{Library, Symbol};
    use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_SUCCESS;
    use std::os::raw::{c_int, c_uint};

    type GetRangeFn = unsafe extern "C" fn(nvmlDevice_t, *mut c_int, *mut c_int) -> c_uint;

    let lib = unsafe { Library::new("libnvidia-ml.so.1") }
        .map_err(|e| NvmlError::Unknown(format!("Failed to load NVML library: {}", e)))?;

    let func: Symbol<GetRangeFn> = unsafe { lib.get(symbol) }
        .map_err(|e| NvmlError::NotSupported(format!("Function not available: {}", e)))?;

    let mut min: c_int = 0;
    let mut max: c_int = 0;
    let result = unsafe { func(handle, &mut min, &mut max) };

    if result == nvmlReturn_enum_NVML_SUCCESS {
        Ok((min, max))
    } else {
        Err(raw_error(result, "clock offset range"))
    }
}

/// Get the manual fan duty range using raw FFI
fn get_min_max_fan_speed_raw(handle: nvmlDevice_t) -> Result<(u32, u32), NvmlError> {
    use libloading::{Library, Symbol};
    use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_SUCCESS;
    use std::os::raw::c_uint;

    type GetMinMaxFn = unsafe extern "C" fn(nvmlDevice_t, *mut c_uint, *mut c_uint) -> c_uint;

    let lib = unsafe { Library::new("libnvidia-ml.so.1") }
        .map_err(|e| NvmlError::Unknown(format!("Failed to load NVML library: {}", e)))?;

    let func: Symbol<GetMinMaxFn> = unsafe { lib.get(b"nvmlDeviceGetMinMaxFanSpeed") }
        .map_err(|e| NvmlError::NotSupported(format!("Function not available: {}", e)))?;

    let mut min: c_uint = 0;
    let mut max: c_uint = 0;
    let result = unsafe { func(handle, &mut min, &mut max) };

    if result == nvmlReturn_enum_NVML_SUCCESS {
        Ok((min, max))
    } else {
        Err(raw_error(result, "fan speed range"))
    }
}
