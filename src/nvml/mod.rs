//! NVML abstraction layer
//!
//! Provides trait-based abstractions over NVML for testability, and the
//! single-owner session every vendor call goes through.

pub mod device;
pub mod session;
pub mod traits;
pub mod wrapper;

pub use device::NvmlDevice;
pub use session::DeviceSession;
pub use traits::{GpuDevice, GpuManager};
pub use wrapper::NvmlManager;
