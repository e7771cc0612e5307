//! NVML manager implementation
//!
//! Provides NVML initialization and device discovery.

use crate::error::NvmlError;
use crate::nvml::device::NvmlDevice;
use crate::nvml::traits::GpuManager;

use nvml_wrapper::Nvml;

/// NVML manager for GPU discovery
///
/// The NVML session lives for the rest of the process. Device handles
/// borrow it and are moved into session worker threads, so the session is
/// leaked once at startup instead of being tied to this struct's lifetime.
pub struct NvmlManager {
    nvml: &'static Nvml,
}

impl NvmlManager {
    /// Initialize NVML and create a new manager
    pub fn new() -> Result<Self, NvmlError> {
        let nvml = Nvml::init().map_err(|e| match e {
            nvml_wrapper::error::NvmlError::LibloadingError(_) => NvmlError::LibraryNotFound,
            nvml_wrapper::error::NvmlError::DriverNotLoaded => {
                NvmlError::InitializationFailed("NVIDIA driver not loaded".to_string())
            }
            other => NvmlError::InitializationFailed(other.to_string()),
        })?;

        Ok(Self {
            nvml: Box::leak(Box::new(nvml)),
        })
    }
}

impl GpuManager for NvmlManager {
    type Device = NvmlDevice<'static>;

    fn device_count(&self) -> Result<u32, NvmlError> {
        self.nvml
            .device_count()
            .map_err(|e| NvmlError::Unknown(e.to_string()))
    }

    fn device_by_index(&self, index: u32) -> Result<Self::Device, NvmlError> {
        let device = self.nvml.device_by_index(index).map_err(|e| match e {
            nvml_wrapper::error::NvmlError::NotFound
            | nvml_wrapper::error::NvmlError::InvalidArg => NvmlError::DeviceNotFound(index),
            other => NvmlError::Unknown(other.to_string()),
        })?;

        Ok(NvmlDevice::new(device, index))
    }

    fn driver_version(&self) -> Result<String, NvmlError> {
        self.nvml
            .sys_driver_version()
            .map_err(|e| NvmlError::Unknown(e.to_string()))
    }
}
