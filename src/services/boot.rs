//! Boot-time apply of the default profile
//!
//! Runs once at system start. A failure is reported in the outcome and
//! logged; it never aborts the caller. A flag file marks an apply in
//! progress: if it is still there on the next run, the previous boot
//! crashed mid-apply and this boot leaves the hardware alone.

use crate::domain::{FanRequest, Profile};
use crate::services::gateway::{ApplyGateway, ApplyReport};
use crate::services::profile_store::ProfileStore;

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the in-progress flag inside the state directory
pub const CRASH_FLAG: &str = ".applying";

/// What the boot apply did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BootOutcome {
    /// No default profile is set
    NoDefault,
    /// The previous boot apply never finished
    Skipped { reason: String },
    /// The default profile could not be loaded
    LoadFailed { reason: String },
    Applied {
        profile: String,
        reports: Vec<DeviceReport>,
    },
    /// At least one device rejected the profile
    Failed {
        profile: String,
        reports: Vec<DeviceReport>,
        errors: Vec<DeviceFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub device: u32,
    pub report: ApplyReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFailure {
    pub device: u32,
    pub error: String,
}

impl BootOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BootOutcome::LoadFailed { .. } | BootOutcome::Failed { .. }
        )
    }
}

/// In-progress marker for the boot apply
#[derive(Debug)]
pub struct CrashGuard {
    path: PathBuf,
}

impl CrashGuard {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CRASH_FLAG),
        }
    }

    /// True if a previous apply left its flag behind; the flag is removed
    pub fn take_tripped(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove {}: {}", self.path.display(), e);
        }
        true
    }

    pub fn arm(&self) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, b"")
    }

    pub fn disarm(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to clear {}: {}", self.path.display(), e),
        }
    }
}

/// True if applying the profile leaves a custom curve that needs the
/// control loop to keep running
pub fn needs_control_loop(profile: &Profile) -> bool {
    matches!(profile.settings.fan, Some(FanRequest::Custom { .. }))
}

/// Apply the default profile to every listed device
pub fn apply_default(
    gateway: &ApplyGateway,
    store: &ProfileStore,
    state_dir: &Path,
    devices: &[u32],
) -> BootOutcome {
    let guard = CrashGuard::new(state_dir);
    if guard.take_tripped() {
        log::error!("Previous boot apply did not finish; leaving GPU settings at driver defaults");
        return BootOutcome::Skipped {
            reason: "previous apply did not finish".to_string(),
        };
    }

    let profile = match store.default_profile() {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            log::info!("No default profile set, nothing to apply");
            return BootOutcome::NoDefault;
        }
        Err(e) => {
            log::error!("Failed to load default profile: {}", e);
            return BootOutcome::LoadFailed {
                reason: e.to_string(),
            };
        }
    };

    if let Err(e) = guard.arm() {
        log::warn!("Failed to set boot apply flag: {}", e);
    }

    let mut reports = Vec::new();
    let mut errors = Vec::new();
    for &device in devices {
        match gateway.apply(device, &profile.settings) {
            Ok(report) => {
                log::info!("GPU {}: applied profile '{}'", device, profile.name);
                reports.push(DeviceReport { device, report });
            }
            Err(e) => {
                log::error!("GPU {}: boot apply of '{}' failed: {}", device, profile.name, e);
                errors.push(DeviceFailure {
                    device,
                    error: e.to_string(),
                });
            }
        }
    }

    guard.disarm();

    if errors.is_empty() {
        BootOutcome::Applied {
            profile: profile.name,
            reports,
        }
    } else {
        BootOutcome::Failed {
            profile: profile.name,
            reports,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FanCurve, SettingRequest};
    use crate::mock::{MockDevice, MockOp, MockWrite};
    use crate::nvml::DeviceSession;
    use crate::services::gateway::GatewayConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state_dir: PathBuf,
        store: ProfileStore,
        hw: MockDevice,
        gateway: ApplyGateway,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::open(dir.path().join("profiles")).unwrap();
        let device = MockDevice::new(0);
        let hw = device.clone();
        let session = DeviceSession::spawn(device, Duration::from_secs(1)).unwrap();
        let gateway =
            ApplyGateway::with_sessions(vec![Arc::new(session)], &GatewayConfig::default())
                .unwrap();
        Fixture {
            state_dir: dir.path().join("state"),
            _dir: dir,
            store,
            hw,
            gateway,
        }
    }

    #[test]
    fn test_no_default_profile() {
        let f = fixture();
        let outcome = apply_default(&f.gateway, &f.store, &f.state_dir, &[0]);
        assert_eq!(outcome, BootOutcome::NoDefault);
        assert!(f.hw.writes().is_empty());
    }

    #[test]
    fn test_applies_default_profile() {
        let f = fixture();
        f.store
            .save(&Profile::new(
                "Boot",
                SettingRequest::new().with_power_limit(280),
            ))
            .unwrap();
        f.store.set_default("Boot").unwrap();

        let outcome = apply_default(&f.gateway, &f.store, &f.state_dir, &[0]);
        assert!(matches!(outcome, BootOutcome::Applied { ref profile, .. } if profile == "Boot"));
        assert_eq!(f.hw.writes(), vec![MockWrite::PowerLimit(280)]);
        assert!(!f.state_dir.join(CRASH_FLAG).exists());
    }

    #[test]
    fn test_leftover_flag_skips_apply_once() {
        let f = fixture();
        f.store.set_default("Performance").unwrap();
        CrashGuard::new(&f.state_dir).arm().unwrap();

        let outcome = apply_default(&f.gateway, &f.store, &f.state_dir, &[0]);
        assert!(matches!(outcome, BootOutcome::Skipped { .. }));
        assert!(f.hw.writes().is_empty());

        // The next boot tries again
        let outcome = apply_default(&f.gateway, &f.store, &f.state_dir, &[0]);
        assert!(matches!(outcome, BootOutcome::Applied { .. }));
    }

    #[test]
    fn test_failure_is_reported_and_flag_cleared() {
        let f = fixture();
        f.store.set_default("Performance").unwrap();
        f.hw.fail_on(MockOp::SetCoreOffset);

        let outcome = apply_default(&f.gateway, &f.store, &f.state_dir, &[0]);
        assert!(outcome.is_failure());
        let BootOutcome::Failed { errors, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].device, 0);
        assert!(!f.state_dir.join(CRASH_FLAG).exists());
    }

    #[test]
    fn test_unloadable_default() {
        let f = fixture();
        fs::write(f.store.dir().join("default_profile"), "Vanished\n").unwrap();

        let outcome = apply_default(&f.gateway, &f.store, &f.state_dir, &[0]);
        assert!(matches!(outcome, BootOutcome::LoadFailed { .. }));
    }

    #[test]
    fn test_needs_control_loop() {
        let custom = Profile::new(
            "Curve",
            SettingRequest::new().with_fan(FanRequest::custom(FanCurve::default_curve())),
        );
        assert!(needs_control_loop(&custom));
        assert!(!needs_control_loop(&Profile::preset("Stock").unwrap()));
    }
}
