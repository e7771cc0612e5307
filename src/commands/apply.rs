//! Apply command implementation
//!
//! Validates a profile's shape locally, then sends it through the
//! privileged helper. Nothing here touches the hardware directly.

use crate::cli::args::{ApplyArgs, OutputFormat};
use crate::cli::output::{print_output, ApplyOutput};
use crate::commands::{select_devices, wait_for_shutdown};
use crate::config::Config;
use crate::domain::{FanRequest, Profile, SettingRequest};
use crate::error::{AppError, Result};
use crate::ipc::{ChildTransport, GatewayClient, Transport};
use crate::nvml::{GpuManager, NvmlManager};
use crate::services::{validator, ProfileStore};

use std::env;
use std::ffi::OsString;
use std::path::Path;

/// True if the helper has to stay up for the fan setting to last
///
/// The helper hands fans back to the firmware when its session ends.
fn holds_fans(profile: &Profile) -> bool {
    matches!(
        profile.settings.fan,
        Some(FanRequest::Manual { .. } | FanRequest::Custom { .. })
    )
}

/// Arguments for the helper process
fn helper_args(config_path: Option<&Path>, verbose: bool) -> Vec<OsString> {
    let mut args = vec![OsString::from("serve")];
    // The escalation command does not pass our environment through
    if let Some(path) = config_path {
        args.push(OsString::from("--config"));
        args.push(path.as_os_str().to_os_string());
    }
    if verbose {
        args.push(OsString::from("--verbose"));
    }
    args
}

/// Validate against the limits the helper enforces for `index`
///
/// Clamped values are only logged; the helper reports them again.
fn preflight<T: Transport>(
    client: &mut GatewayClient<T>,
    index: u32,
    settings: &SettingRequest,
) -> Result<()> {
    let caps = client.capabilities(index)?;
    let validated = validator::validate(settings, &caps)?;
    for adjustment in &validated.adjustments {
        log::info!("GPU {}: {}", index, adjustment);
    }
    Ok(())
}

/// Execute the `apply` subcommand
pub fn run_apply(
    args: &ApplyArgs,
    config: &Config,
    config_path: Option<&Path>,
    format: OutputFormat,
    gpu: Option<u32>,
) -> Result<()> {
    let store = ProfileStore::open(config.profiles_dir()?)?;
    let profile = store.load(&args.profile)?;
    validator::check_request_shape(&profile.settings)?;

    let manager = NvmlManager::new()?;
    let available: Vec<u32> = (0..manager.device_count()?).collect();
    let devices = select_devices(&available, gpu)?;

    let program = env::current_exe()?.into_os_string();
    let transport = ChildTransport::spawn(
        &config.gateway.escalation_command,
        program,
        helper_args(config_path, config.general.verbose),
    )?;
    let mut client = GatewayClient::new(transport);

    let mut first_error: Option<AppError> = None;
    let mut applied_any = false;
    for index in devices {
        match preflight(&mut client, index, &profile.settings) {
            Ok(()) => {}
            Err(e @ (AppError::Apply(_) | AppError::Validation(_))) => {
                log::error!("GPU {}: {}", index, e);
                first_error.get_or_insert(e);
                continue;
            }
            Err(e) => return Err(e),
        }

        match client.apply(index, &profile.settings) {
            Ok(report) => {
                applied_any = true;
                print_output(
                    &ApplyOutput {
                        gpu_index: index,
                        profile: profile.name.clone(),
                        report,
                    },
                    format,
                )?;
            }
            // Later devices are independent; keep going
            Err(AppError::Apply(e)) => {
                log::error!("GPU {}: {}", index, e);
                first_error.get_or_insert(AppError::Apply(e));
            }
            Err(e) => return Err(e),
        }
    }

    if applied_any && holds_fans(&profile) {
        eprintln!("Fan control active. Press Ctrl+C to stop and return fans to automatic.");
        wait_for_shutdown()?;
    }
    client.shutdown()?;

    first_error.map_or(Ok(()), Err)
}
