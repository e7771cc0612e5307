//! Boot-time apply
//!
//! Runs privileged from a boot service. A failed apply is reported and
//! logged but the machine keeps booting with driver defaults.

use crate::cli::args::OutputFormat;
use crate::cli::output::print_output;
use crate::commands::{open_gateway, select_devices, spawn_control_loops, wait_for_shutdown};
use crate::config::Config;
use crate::error::Result;
use crate::services::boot::{apply_default, needs_control_loop, BootOutcome};
use crate::services::{ProfileStore, TelemetryFeed};

/// Execute `--apply-default`
pub fn run_apply_default(config: &Config, format: OutputFormat, gpu: Option<u32>) -> Result<()> {
    let store = ProfileStore::open(config.profiles_dir()?)?;
    let state_dir = config.state_dir()?;
    let gateway = open_gateway(config)?;
    let devices = select_devices(&gateway.device_indices(), gpu)?;

    let outcome = apply_default(&gateway, &store, &state_dir, &devices);
    print_output(&outcome, format)?;
    if outcome.is_failure() {
        log::warn!("Boot apply incomplete; affected GPUs keep their current settings");
    }

    let (profile, applied) = match &outcome {
        BootOutcome::Applied {
            profile, reports, ..
        }
        | BootOutcome::Failed {
            profile, reports, ..
        } => (profile, reports.iter().map(|r| r.device).collect::<Vec<_>>()),
        _ => return Ok(()),
    };
    let curve_active = store
        .load(profile)
        .map(|p| needs_control_loop(&p))
        .unwrap_or(false);
    if !curve_active || applied.is_empty() {
        return Ok(());
    }

    let feed = TelemetryFeed::new();
    let mut loops = spawn_control_loops(&gateway, &applied, config, &feed)?;
    log::info!("Custom fan curve active on {} GPU(s)", loops.len());
    wait_for_shutdown()?;

    for control in &mut loops {
        control.stop();
    }
    gateway.release_fans()?;
    Ok(())
}
