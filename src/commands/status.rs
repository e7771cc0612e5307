//! Status command implementation
//!
//! Reads telemetry and current settings without privileges.

use crate::cli::args::OutputFormat;
use crate::cli::output::{print_output, GpuStatus, StatusReport};
use crate::commands::select_devices;
use crate::error::{Result, SampleError};
use crate::nvml::{GpuDevice, GpuManager, NvmlManager};
use crate::services::sampler::{read_sample, TelemetryFeed};

/// Execute `--status`
pub fn run_status(format: OutputFormat, gpu: Option<u32>) -> Result<()> {
    let manager = NvmlManager::new()?;
    let driver_version = match manager.driver_version() {
        Ok(version) => Some(version),
        Err(e) => {
            log::warn!("Failed to read driver version: {}", e);
            None
        }
    };

    let available: Vec<u32> = (0..manager.device_count()?).collect();
    let feed = TelemetryFeed::new();
    let mut gpus = Vec::new();

    for index in select_devices(&available, gpu)? {
        let device = manager.device_by_index(index)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        match read_sample(&device) {
            Ok(sample) => feed.publish(sample),
            Err(e) => feed.mark_stale(&SampleError::Transient {
                device: index,
                reason: e.to_string(),
            }),
        }

        gpus.push(GpuStatus {
            index,
            name,
            telemetry: feed.latest(index),
            applied: device.read_setting(),
        });
    }

    print_output(
        &StatusReport {
            driver_version,
            gpus,
        },
        format,
    )?;

    Ok(())
}
