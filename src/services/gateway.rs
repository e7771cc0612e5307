//! Privileged apply gateway
//!
//! The only component that issues hardware writes. Every request is
//! re-validated, then applied under a per-device transaction lock in a
//! fixed order: power limit, core offset, memory offset, fan. If a step
//! fails, the steps already written are rolled back in reverse order and
//! any field whose state could not be restored is reported by name.

use crate::domain::{
    Adjustment, AppliedFan, AppliedSetting, ClockDomain, ClockOffset, DeviceCapabilities,
    DutyRange, FanPolicy, FanRequest, FanSpeed, PowerLimit, SafetyLimits, SettingField,
    SettingRequest, ValidatedFan, ValidatedSetting,
};
use crate::error::{ApplyError, NvmlError, ValidationError};
use crate::nvml::{DeviceSession, GpuDevice, GpuManager};
use crate::services::validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Gateway settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long `apply` waits for another transaction on the same device
    pub lock_timeout: Duration,
    /// Bound on every single vendor call
    pub call_timeout: Duration,
    pub safety: SafetyLimits,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            safety: SafetyLimits::default(),
        }
    }
}

/// Result of a successful apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Device state after the transaction
    pub applied: AppliedSetting,
    /// Values that were clamped before being written
    pub adjustments: Vec<Adjustment>,
}

/// Fan mode committed by a transaction, forwarded to the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanModeChange {
    pub fan: ValidatedFan,
    /// Duty already written as part of the transaction
    pub written: Option<FanSpeed>,
    pub at: DateTime<Utc>,
}

/// Exclusive per-device write lock with a bounded wait
#[derive(Debug, Default)]
struct TxLock {
    busy: Mutex<bool>,
    released: Condvar,
}

struct TxGuard<'a> {
    lock: &'a TxLock,
}

impl TxLock {
    fn acquire(&self, timeout: Duration) -> Option<TxGuard<'_>> {
        let busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut busy, _) = self
            .released
            .wait_timeout_while(busy, timeout, |busy| *busy)
            .unwrap_or_else(PoisonError::into_inner);
        if *busy {
            return None;
        }
        *busy = true;
        Some(TxGuard { lock: self })
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        *self.lock.busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.lock.released.notify_one();
    }
}

struct DeviceSlot {
    session: Arc<DeviceSession>,
    caps: DeviceCapabilities,
    tx: TxLock,
    applied: RwLock<AppliedSetting>,
    fan_subscriber: Mutex<Option<Sender<FanModeChange>>>,
}

impl DeviceSlot {
    fn applied(&self) -> AppliedSetting {
        self.applied
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_applied(&self, setting: AppliedSetting) {
        *self.applied.write().unwrap_or_else(PoisonError::into_inner) = setting;
    }

    fn notify_fan(&self, change: FanModeChange) {
        let mut subscriber = self
            .fan_subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = subscriber.as_ref() {
            if tx.send(change).is_err() {
                *subscriber = None;
            }
        }
    }
}

/// One hardware write of a transaction
#[derive(Debug, Clone)]
enum Step {
    Power(u32),
    Offset(ClockDomain, i32),
    Fan(ValidatedFan),
}

impl Step {
    fn field(&self) -> SettingField {
        match self {
            Step::Power(_) => SettingField::PowerLimit,
            Step::Offset(ClockDomain::Core, _) => SettingField::CoreClockOffset,
            Step::Offset(ClockDomain::Memory, _) => SettingField::MemClockOffset,
            Step::Fan(ValidatedFan::Manual { .. }) => SettingField::FanDuty,
            Step::Fan(ValidatedFan::Custom { .. }) => SettingField::FanCurve,
            Step::Fan(ValidatedFan::Auto) => SettingField::FanMode,
        }
    }
}

/// Steps in the order they are written
///
/// Power goes first so that clock offsets never run against a stale,
/// possibly higher, power limit.
fn plan(validated: &ValidatedSetting) -> Vec<Step> {
    let mut steps = Vec::with_capacity(4);
    if let Some(watts) = validated.power_limit_watts {
        steps.push(Step::Power(watts));
    }
    if let Some(mhz) = validated.core_clock_offset_mhz {
        steps.push(Step::Offset(ClockDomain::Core, mhz));
    }
    if let Some(mhz) = validated.mem_clock_offset_mhz {
        steps.push(Step::Offset(ClockDomain::Memory, mhz));
    }
    if let Some(fan) = &validated.fan {
        steps.push(Step::Fan(fan.clone()));
    }
    steps
}

/// Why a step failed, and whether the hardware may have changed anyway
struct StepFailure {
    error: NvmlError,
    touched: bool,
}

impl From<NvmlError> for StepFailure {
    fn from(error: NvmlError) -> Self {
        // A call that timed out may still complete on the device
        let touched = matches!(error, NvmlError::Timeout(_));
        Self { error, touched }
    }
}

/// Put every fan under the given policy, optionally at a fixed duty
fn write_fans(
    device: &mut dyn GpuDevice,
    policy: FanPolicy,
    duty: Option<FanSpeed>,
) -> Result<(), (NvmlError, bool)> {
    let count = device.fan_count().map_err(|e| (e, false))?;
    let mut touched = false;
    for fan in 0..count {
        device
            .set_fan_policy(fan, policy)
            .map_err(|e| (e, touched))?;
        touched = true;
        if let Some(duty) = duty {
            device.set_fan_speed(fan, duty).map_err(|e| (e, true))?;
        }
    }
    Ok(())
}

/// Privileged write authority for every opened device
pub struct ApplyGateway {
    slots: BTreeMap<u32, DeviceSlot>,
    lock_timeout: Duration,
}

impl ApplyGateway {
    /// Open a session for every GPU the manager reports
    pub fn open<M: GpuManager>(manager: &M, config: &GatewayConfig) -> Result<Self, NvmlError> {
        let sessions = manager
            .all_devices()?
            .into_iter()
            .map(|device| DeviceSession::spawn(device, config.call_timeout).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_sessions(sessions, config)
    }

    /// Build the gateway over already open sessions
    ///
    /// Capabilities are queried once here and narrowed to the safety
    /// limits. The hardware's current state becomes the first
    /// `AppliedSetting`, which is what a failed first transaction rolls
    /// back to.
    pub fn with_sessions(
        sessions: Vec<Arc<DeviceSession>>,
        config: &GatewayConfig,
    ) -> Result<Self, NvmlError> {
        let mut slots = BTreeMap::new();
        for session in sessions {
            let caps = session
                .call(|d| d.capabilities())?
                .restricted_to(&config.safety);
            let applied = session.call(|d| Ok(d.read_setting()))?;
            log::info!(
                "GPU {} ({}): power {:?}, core offset {:?}, memory offset {:?}, {} fan(s)",
                caps.index,
                caps.name,
                caps.power,
                caps.core_offset,
                caps.mem_offset,
                caps.fan_count
            );

            slots.insert(
                session.index(),
                DeviceSlot {
                    session,
                    caps,
                    tx: TxLock::default(),
                    applied: RwLock::new(applied),
                    fan_subscriber: Mutex::new(None),
                },
            );
        }

        Ok(Self {
            slots,
            lock_timeout: config.lock_timeout,
        })
    }

    fn slot(&self, index: u32) -> Result<&DeviceSlot, ApplyError> {
        self.slots.get(&index).ok_or(ApplyError::UnknownDevice(index))
    }

    /// Indices of every opened device
    pub fn device_indices(&self) -> Vec<u32> {
        self.slots.keys().copied().collect()
    }

    pub fn capabilities(&self, index: u32) -> Result<DeviceCapabilities, ApplyError> {
        Ok(self.slot(index)?.caps.clone())
    }

    /// Last fully committed setting; never shows a half-applied transaction
    pub fn applied(&self, index: u32) -> Result<AppliedSetting, ApplyError> {
        Ok(self.slot(index)?.applied())
    }

    pub fn session(&self, index: u32) -> Result<Arc<DeviceSession>, ApplyError> {
        Ok(Arc::clone(&self.slot(index)?.session))
    }

    /// Fan mode the control loop should be running for this device
    pub fn current_fan_mode(&self, index: u32) -> Result<ValidatedFan, ApplyError> {
        Ok(match self.slot(index)?.applied().fan {
            Some(AppliedFan::Custom { curve }) => ValidatedFan::Custom { curve },
            Some(AppliedFan::Manual { duty_percent }) => ValidatedFan::Manual {
                duty: FanSpeed::saturating(duty_percent as i64),
            },
            Some(AppliedFan::Auto) | None => ValidatedFan::Auto,
        })
    }

    /// Receive every fan mode committed on this device from now on
    ///
    /// Replaces any previous subscriber.
    pub fn subscribe_fan(&self, index: u32) -> Result<Receiver<FanModeChange>, ApplyError> {
        let slot = self.slot(index)?;
        let (tx, rx) = mpsc::channel();
        *slot
            .fan_subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    fn rejected(&self, index: u32, err: ValidationError) -> ApplyError {
        match err {
            ValidationError::Unsupported(field) => ApplyError::CapabilityMismatch {
                device: index,
                field,
                reason: "the driver does not expose this control".to_string(),
            },
            other => ApplyError::Validation(other),
        }
    }

    fn lock<'a>(&self, index: u32, slot: &'a DeviceSlot) -> Result<TxGuard<'a>, ApplyError> {
        slot.tx
            .acquire(self.lock_timeout)
            .ok_or(ApplyError::LockTimeout {
                device: index,
                waited_ms: self.lock_timeout.as_millis() as u64,
            })
    }

    /// Validate and write a setting request as one transaction
    ///
    /// # Errors
    /// - `Validation` / `CapabilityMismatch` before anything is written
    /// - `LockTimeout` if another transaction holds the device too long
    /// - `VendorRejected` if the first write fails and nothing changed
    /// - `PartialApply` if a later write fails; names every field left in
    ///   an unknown state
    pub fn apply(
        &self,
        index: u32,
        request: &SettingRequest,
    ) -> Result<ApplyReport, ApplyError> {
        let slot = self.slot(index)?;
        let validated =
            validator::validate(request, &slot.caps).map_err(|e| self.rejected(index, e))?;
        for adjustment in &validated.adjustments {
            log::info!("GPU {}: {}", index, adjustment);
        }

        let _guard = self.lock(index, slot)?;
        let before = slot.applied();

        let mut written_duty = None;
        let mut done: Vec<Step> = Vec::new();
        for step in plan(&validated) {
            match self.write_step(slot, &step) {
                Ok(duty) => {
                    written_duty = duty.or(written_duty);
                    done.push(step);
                }
                Err(failure) => {
                    return Err(self.abort(index, slot, step, failure, &done, &before));
                }
            }
        }

        let after = before.merged(&validated);
        slot.set_applied(after.clone());

        if let Some(fan) = &validated.fan {
            slot.notify_fan(FanModeChange {
                fan: fan.clone(),
                written: written_duty,
                at: Utc::now(),
            });
        }

        if !done.is_empty() {
            log::info!("GPU {}: applied {} field(s)", index, done.len());
        }
        Ok(ApplyReport {
            applied: after,
            adjustments: validated.adjustments,
        })
    }

    fn write_step(&self, slot: &DeviceSlot, step: &Step) -> Result<Option<FanSpeed>, StepFailure> {
        match step.clone() {
            Step::Power(watts) => {
                slot.session
                    .call(move |d| d.set_power_limit(PowerLimit::from_watts(watts)))?;
                Ok(None)
            }
            Step::Offset(domain, mhz) => {
                slot.session
                    .call(move |d| d.set_clock_offset(domain, ClockOffset::from_mhz(mhz)))?;
                Ok(None)
            }
            Step::Fan(fan) => {
                let range = slot.caps.fan_duty.unwrap_or_default();
                let outcome = slot.session.call(move |d| Ok(write_fan_mode(d, &fan, range)))?;
                outcome.map_err(|(error, touched)| StepFailure { error, touched })
            }
        }
    }

    /// Roll back after a failed step and build the error to report
    fn abort(
        &self,
        index: u32,
        slot: &DeviceSlot,
        failed: Step,
        failure: StepFailure,
        done: &[Step],
        before: &AppliedSetting,
    ) -> ApplyError {
        let failed_field = failed.field();
        let reason = failure.error.to_string();
        log::warn!("GPU {}: writing {} failed: {}", index, failed_field, reason);

        let mut unknown_fields = Vec::new();
        if failure.touched && !self.restore(index, slot, &failed, before) {
            unknown_fields.push(failed_field);
        }
        for step in done.iter().rev() {
            if !self.restore(index, slot, step, before) {
                unknown_fields.push(step.field());
            }
        }

        if done.is_empty() && unknown_fields.is_empty() {
            return ApplyError::VendorRejected {
                field: failed_field,
                reason,
            };
        }

        if !unknown_fields.is_empty() {
            let mut state = before.clone();
            for field in &unknown_fields {
                state.forget(*field);
            }
            slot.set_applied(state);
            log::error!(
                "GPU {}: rollback incomplete, state unknown for {:?}",
                index,
                unknown_fields
            );
        }

        ApplyError::PartialApply {
            failed_field,
            reason,
            rolled_back: unknown_fields.is_empty(),
            unknown_fields,
        }
    }

    /// Write the pre-transaction value of one step back; true on success
    fn restore(&self, index: u32, slot: &DeviceSlot, step: &Step, before: &AppliedSetting) -> bool {
        let result = match step {
            Step::Power(_) => match before.power_limit_watts {
                Some(watts) => slot
                    .session
                    .call(move |d| d.set_power_limit(PowerLimit::from_watts(watts))),
                None => return false,
            },
            Step::Offset(domain, _) => {
                let previous = match domain {
                    ClockDomain::Core => before.core_clock_offset_mhz,
                    ClockDomain::Memory => before.mem_clock_offset_mhz,
                };
                let Some(mhz) = previous else {
                    return false;
                };
                let domain = *domain;
                slot.session
                    .call(move |d| d.set_clock_offset(domain, ClockOffset::from_mhz(mhz)))
            }
            Step::Fan(_) => {
                let (policy, duty) = match &before.fan {
                    Some(AppliedFan::Manual { duty_percent }) => (
                        FanPolicy::Manual,
                        Some(FanSpeed::saturating(*duty_percent as i64)),
                    ),
                    // The control loop takes the duty over again
                    Some(AppliedFan::Custom { .. }) => (FanPolicy::Manual, None),
                    Some(AppliedFan::Auto) | None => (FanPolicy::Auto, None),
                };
                slot.session
                    .call(move |d| write_fans(d, policy, duty).map_err(|(e, _)| e))
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("GPU {}: rolling back {} failed: {}", index, step.field(), e);
                false
            }
        }
    }

    /// Write a duty chosen by the fan controller
    ///
    /// The duty is re-validated against the device's manual range first,
    /// and refused unless the committed fan mode is manual or custom.
    /// Returns the duty actually written.
    pub fn apply_fan_duty(&self, index: u32, duty: FanSpeed) -> Result<FanSpeed, ApplyError> {
        let slot = self.slot(index)?;
        let (duty, adjustment) =
            validator::validate_fan_duty(duty, &slot.caps).map_err(|e| self.rejected(index, e))?;
        if let Some(adjustment) = adjustment {
            log::debug!("GPU {}: {}", index, adjustment);
        }

        let _guard = self.lock(index, slot)?;
        // The mode may have changed since the controller decided
        if !matches!(
            slot.applied().fan,
            Some(AppliedFan::Manual { .. } | AppliedFan::Custom { .. })
        ) {
            return Err(ApplyError::FanModeMismatch { device: index });
        }
        slot.session
            .call(move |d| {
                for fan in 0..d.fan_count()? {
                    d.set_fan_speed(fan, duty)?;
                }
                Ok(())
            })
            .map_err(|e| ApplyError::VendorRejected {
                field: SettingField::FanDuty,
                reason: e.to_string(),
            })?;
        Ok(duty)
    }

    /// Give fan control back to the firmware on every device not in auto
    ///
    /// Tries every device; returns the first failure.
    pub fn restore_auto(&self) -> Result<(), ApplyError> {
        self.return_fans(true)
    }

    /// Write automatic fan mode to every device, whatever its recorded mode
    ///
    /// For process exit, after the control loops have stopped.
    pub fn release_fans(&self) -> Result<(), ApplyError> {
        self.return_fans(false)
    }

    fn return_fans(&self, skip_auto: bool) -> Result<(), ApplyError> {
        let mut first_error = None;
        for (&index, slot) in &self.slots {
            if !slot.caps.supports(SettingField::FanMode)
                || (skip_auto && slot.applied().fan == Some(AppliedFan::Auto))
            {
                continue;
            }
            let request = SettingRequest::new().with_fan(FanRequest::Auto);
            match self.apply(index, &request) {
                Ok(_) => log::info!("GPU {}: fan control returned to firmware", index),
                Err(e) => {
                    log::error!("GPU {}: could not restore automatic fan control: {}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Fan step of a transaction; returns the duty written, if any
fn write_fan_mode(
    device: &mut dyn GpuDevice,
    fan: &ValidatedFan,
    range: DutyRange,
) -> Result<Option<FanSpeed>, (NvmlError, bool)> {
    match fan {
        ValidatedFan::Auto => {
            write_fans(device, FanPolicy::Auto, None)?;
            Ok(None)
        }
        ValidatedFan::Manual { duty } => {
            write_fans(device, FanPolicy::Manual, Some(*duty))?;
            Ok(Some(*duty))
        }
        ValidatedFan::Custom { curve } => {
            // Start from the curve's duty for the current temperature so
            // the fans are never left at an unrelated fixed speed
            let temperature = device.temperature().map_err(|e| (e, false))?;
            let target = curve.duty_at(temperature.as_celsius()).as_percentage();
            let duty = FanSpeed::saturating(range.clamp(target as i64) as i64);
            write_fans(device, FanPolicy::Manual, Some(duty))?;
            Ok(Some(duty))
        }
    }
}
