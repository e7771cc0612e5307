//! Command handlers
//!
//! Each command handler orchestrates the execution of a CLI command.

pub mod apply;
pub mod boot;
pub mod profile;
pub mod serve;
pub mod status;

pub use apply::run_apply;
pub use boot::run_apply_default;
pub use profile::run_profile;
pub use serve::run_serve;
pub use status::run_status;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::nvml::NvmlManager;
use crate::services::{ApplyGateway, FanControlLoop, StopSignal, TelemetryFeed};

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Resolve `--gpu` against the devices that exist
fn select_devices(available: &[u32], gpu: Option<u32>) -> Result<Vec<u32>> {
    if available.is_empty() {
        return Err(AppError::NoGpusFound);
    }
    match gpu {
        Some(index) if available.contains(&index) => Ok(vec![index]),
        Some(index) => Err(AppError::GpuNotFound(format!(
            "index {} (found {} GPU(s))",
            index,
            available.len()
        ))),
        None => Ok(available.to_vec()),
    }
}

/// Open a gateway over every GPU on the system
fn open_gateway(config: &Config) -> Result<Arc<ApplyGateway>> {
    let manager = NvmlManager::new()?;
    let gateway = ApplyGateway::open(&manager, &config.gateway_config())?;
    Ok(Arc::new(gateway))
}

/// Start one fan control loop per device
fn spawn_control_loops(
    gateway: &Arc<ApplyGateway>,
    devices: &[u32],
    config: &Config,
    feed: &TelemetryFeed,
) -> Result<Vec<FanControlLoop>> {
    devices
        .iter()
        .map(|&index| {
            FanControlLoop::spawn(
                Arc::clone(gateway),
                index,
                config.sample_interval(),
                config.fan_tuning(),
                feed.clone(),
            )
        })
        .collect()
}

/// Block until SIGINT or SIGTERM
fn wait_for_shutdown() -> Result<()> {
    let stop = StopSignal::new();
    let signal = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        signal.stop();
    })
    .map_err(|e| AppError::Io(io::Error::other(format!("Failed to set signal handler: {}", e))))?;

    while !stop.wait_timeout(Duration::from_secs(60)) {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all_devices() {
        assert_eq!(select_devices(&[0, 1], None).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_select_one_device() {
        assert_eq!(select_devices(&[0, 1], Some(1)).unwrap(), vec![1]);
        assert!(matches!(
            select_devices(&[0, 1], Some(2)),
            Err(AppError::GpuNotFound(_))
        ));
    }

    #[test]
    fn test_select_without_gpus() {
        assert!(matches!(select_devices(&[], None), Err(AppError::NoGpusFound)));
    }
}
