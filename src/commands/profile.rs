//! Profile command implementation
//!
//! Manages stored profiles. Profiles are plain files in the user's
//! configuration directory, so none of this needs privileges. Saving
//! from the current GPU state only reads the hardware.

use crate::cli::args::{OutputFormat, ProfileArgs, ProfileCommands, SaveArgs};
use crate::cli::output::{print_output, Message, ProfileEntry, ProfileList, ProfileView};
use crate::commands::select_devices;
use crate::config::Config;
use crate::domain::{Profile, SettingRequest};
use crate::error::{AppError, Result};
use crate::nvml::{GpuDevice, GpuManager, NvmlManager};
use crate::services::ProfileStore;

use std::io;

/// Execute a `profile` subcommand
pub fn run_profile(
    args: &ProfileArgs,
    config: &Config,
    format: OutputFormat,
    gpu: Option<u32>,
) -> Result<()> {
    let store = ProfileStore::open(config.profiles_dir()?)?;

    match &args.command {
        ProfileCommands::List => {
            let list = list_profiles(&store)?;
            print_output(&list, format)?;
        }

        ProfileCommands::Show { name } => {
            let profile = store.load(name)?;
            let default = is_default(&store, &profile.name)?;
            print_output(&ProfileView { profile, default }, format)?;
        }

        ProfileCommands::Save(save) => {
            let current = if save.from_current {
                Some(current_request(&NvmlManager::new()?, gpu)?)
            } else {
                None
            };
            let profile = build_profile(save, current)?;
            let stored = store.save(&profile)?;
            print_output(
                &Message::ok(format!("Saved profile '{}'", stored.name)),
                format,
            )?;
        }

        ProfileCommands::Delete { name } => {
            store.delete(name)?;
            print_output(&Message::ok(format!("Deleted profile '{}'", name)), format)?;
        }

        ProfileCommands::SetDefault { name } => {
            store.set_default(name)?;
            print_output(
                &Message::ok(format!("'{}' will be applied at boot", name)),
                format,
            )?;
        }

        ProfileCommands::ClearDefault => {
            store.clear_default()?;
            print_output(&Message::ok("No profile will be applied at boot"), format)?;
        }

        ProfileCommands::Export { name, path } => {
            let profile = store.export(name, path)?;
            print_output(
                &Message::ok(format!("Exported '{}' to {}", profile.name, path.display())),
                format,
            )?;
        }

        ProfileCommands::Import { path, force } => {
            let profile = store.import(path, *force)?;
            print_output(&Message::ok(format!("Imported profile '{}'", profile.name)), format)?;
        }
    }

    Ok(())
}

/// Settings the selected GPU runs with now, as a request
fn current_request<M: GpuManager>(manager: &M, gpu: Option<u32>) -> Result<SettingRequest> {
    let available: Vec<u32> = (0..manager.device_count()?).collect();
    let index = gpu.unwrap_or(0);
    select_devices(&available, Some(index))?;
    let device = manager.device_by_index(index)?;
    Ok(SettingRequest::from(&device.read_setting()))
}

/// `current` replaces the value flags when saving from the hardware
fn build_profile(args: &SaveArgs, current: Option<SettingRequest>) -> Result<Profile> {
    let request = match current {
        Some(request) => request,
        None => args
            .to_request()
            .map_err(|e| AppError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?,
    };
    Ok(Profile::new(args.name.trim(), request).with_description(args.description.clone()))
}

fn is_default(store: &ProfileStore, name: &str) -> Result<bool> {
    Ok(store
        .default_name()?
        .is_some_and(|d| Profile::file_stem(&d) == Profile::file_stem(name)))
}

/// Stored profiles first, then any preset not shadowed by a stored profile
fn list_profiles(store: &ProfileStore) -> Result<ProfileList> {
    let default = store.default_name()?.map(|d| Profile::file_stem(&d));
    let marked = |name: &str| default.as_deref() == Some(Profile::file_stem(name).as_str());

    let stored = store.list()?;
    let mut profiles: Vec<ProfileEntry> = stored
        .iter()
        .map(|p| ProfileEntry {
            name: p.name.clone(),
            description: p.description.clone(),
            preset: false,
            default: marked(&p.name),
        })
        .collect();

    for preset in Profile::presets() {
        let shadowed = stored
            .iter()
            .any(|p| Profile::file_stem(&p.name) == Profile::file_stem(&preset.name));
        if !shadowed {
            profiles.push(ProfileEntry {
                default: marked(&preset.name),
                name: preset.name,
                description: preset.description,
                preset: true,
            });
        }
    }

    Ok(ProfileList { profiles })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClockDomain, ClockOffset, FanPolicy, FanRequest, FanSpeed, PowerLimit};
    use crate::mock::{MockDevice, MockManager};
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_list_includes_presets() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();

        let list = list_profiles(&store).unwrap();
        let names: Vec<&str> = list.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Stock", "Quiet", "Performance"]);
        assert!(list.profiles.iter().all(|p| p.preset && !p.default));
    }

    #[test]
    fn test_stored_profile_shadows_preset() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();
        store
            .save(&Profile::new("quiet", SettingRequest::new().with_power_limit(200)))
            .unwrap();
        store
            .save(&Profile::new("Gaming", SettingRequest::new().with_core_offset(150)))
            .unwrap();
        store.set_default("Gaming").unwrap();

        let list = list_profiles(&store).unwrap();
        let names: Vec<&str> = list.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Gaming", "quiet", "Stock", "Performance"]);

        let gaming = &list.profiles[0];
        assert!(gaming.default);
        assert!(!gaming.preset);
        assert!(!list.profiles[1].preset);
    }

    #[test]
    fn test_default_matches_by_file_name() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();
        store
            .save(&Profile::new("Night Mode", SettingRequest::new().with_power_limit(180)))
            .unwrap();
        store.set_default("night mode").unwrap();

        assert!(is_default(&store, "Night Mode").unwrap());
        assert!(!is_default(&store, "Stock").unwrap());
    }

    #[test]
    fn test_build_profile_rejects_orphan_duty() {
        let args = SaveArgs::try_parse_from(["save", "Odd", "--fan-duty", "50"]).unwrap();
        assert!(build_profile(&args, None).is_err());

        let args = SaveArgs::try_parse_from([
            "save",
            " Fixed ",
            "-d",
            "fixed fan",
            "--fan",
            "manual",
            "--fan-duty",
            "60",
        ])
        .unwrap();
        let profile = build_profile(&args, None).unwrap();
        assert_eq!(profile.name, "Fixed");
        assert_eq!(profile.description, "fixed fan");
    }

    #[test]
    fn test_save_from_current_reads_selected_gpu() {
        let mut second = MockDevice::new(1);
        second.set_power_limit(PowerLimit::from_watts(250)).unwrap();
        second
            .set_clock_offset(ClockDomain::Core, ClockOffset::from_mhz(120))
            .unwrap();
        for fan in 0..2 {
            second.set_fan_policy(fan, FanPolicy::Manual).unwrap();
            second.set_fan_speed(fan, FanSpeed::new(70).unwrap()).unwrap();
        }
        let manager = MockManager::with_devices(vec![MockDevice::new(0), second]);

        let current = current_request(&manager, Some(1)).unwrap();
        assert_eq!(current.power_limit_watts, Some(250));
        assert_eq!(current.core_clock_offset_mhz, Some(120));
        assert_eq!(current.mem_clock_offset_mhz, Some(0));
        assert_eq!(current.fan, Some(FanRequest::manual(70)));

        let args = SaveArgs::try_parse_from(["save", "Snapshot", "--from-current"]).unwrap();
        let profile = build_profile(&args, Some(current)).unwrap();
        assert_eq!(profile.settings.power_limit_watts, Some(250));

        // First GPU by default
        let first = current_request(&manager, None).unwrap();
        assert_eq!(first.power_limit_watts, Some(300));
        assert_eq!(first.fan, Some(FanRequest::Auto));
        assert!(matches!(
            current_request(&manager, Some(5)),
            Err(AppError::GpuNotFound(_))
        ));
    }
}
