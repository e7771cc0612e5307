//! Bounds validator
//!
//! Pure functions that check a [`SettingRequest`] against a device's
//! capabilities. Present fields are clamped into range and every clamp is
//! reported back as an [`Adjustment`]; values that have no sane clamp fail.
//! Runs on both sides of the privilege boundary, and the privileged side
//! always runs it again.

use crate::domain::{
    Adjustment, CurvePoint, DeviceCapabilities, DutyRange, FanCurve, FanRequest, FanSpeed,
    SettingField, SettingRequest, ValidatedFan, ValidatedSetting,
};
use crate::error::ValidationError;

/// Check the parts of a request that do not depend on any device
///
/// Used before a profile is stored, when no GPU may be present.
pub fn check_request_shape(request: &SettingRequest) -> Result<(), ValidationError> {
    if let Some(watts) = request.power_limit_watts {
        if watts < 0 {
            return Err(ValidationError::OutOfRange {
                field: SettingField::PowerLimit,
                value: watts as i64,
            });
        }
    }

    match &request.fan {
        None | Some(FanRequest::Auto) => Ok(()),
        Some(FanRequest::Manual { duty_percent }) => match duty_percent {
            None => Err(ValidationError::MissingField(SettingField::FanDuty)),
            Some(duty) if *duty < 0 => Err(ValidationError::OutOfRange {
                field: SettingField::FanDuty,
                value: *duty as i64,
            }),
            Some(_) => Ok(()),
        },
        Some(FanRequest::Custom { curve }) => match curve {
            None => Err(ValidationError::MissingField(SettingField::FanCurve)),
            Some(curve) => curve.check(),
        },
    }
}

/// Validate a request against a device
///
/// # Errors
/// - `OutOfRange` for negative power or duty
/// - `MissingField` for a manual/custom fan request without its value
/// - `InvalidCurve` for a curve that breaks the monotonic invariant
/// - `Unsupported` for a field the device does not expose
pub fn validate(
    request: &SettingRequest,
    caps: &DeviceCapabilities,
) -> Result<ValidatedSetting, ValidationError> {
    check_request_shape(request)?;

    let mut validated = ValidatedSetting::default();

    if let Some(watts) = request.power_limit_watts {
        let range = caps
            .power
            .ok_or(ValidationError::Unsupported(SettingField::PowerLimit))?;
        let applied = range.clamp(watts as i64);
        note(&mut validated.adjustments, SettingField::PowerLimit, watts as i64, applied as i64);
        validated.power_limit_watts = Some(applied);
    }

    if let Some(mhz) = request.core_clock_offset_mhz {
        let range = caps
            .core_offset
            .ok_or(ValidationError::Unsupported(SettingField::CoreClockOffset))?;
        let applied = range.clamp(mhz as i64);
        note(&mut validated.adjustments, SettingField::CoreClockOffset, mhz as i64, applied as i64);
        validated.core_clock_offset_mhz = Some(applied);
    }

    if let Some(mhz) = request.mem_clock_offset_mhz {
        let range = caps
            .mem_offset
            .ok_or(ValidationError::Unsupported(SettingField::MemClockOffset))?;
        let applied = range.clamp(mhz as i64);
        note(&mut validated.adjustments, SettingField::MemClockOffset, mhz as i64, applied as i64);
        validated.mem_clock_offset_mhz = Some(applied);
    }

    if let Some(fan) = &request.fan {
        validated.fan = Some(validate_fan(fan, caps, &mut validated.adjustments)?);
    }

    Ok(validated)
}

/// Re-check a duty computed by the fan controller
pub fn validate_fan_duty(
    duty: FanSpeed,
    caps: &DeviceCapabilities,
) -> Result<(FanSpeed, Option<Adjustment>), ValidationError> {
    let range = manual_range(caps, SettingField::FanDuty)?;
    let requested = duty.as_percentage() as i64;
    let applied = range.clamp(requested);
    let adjustment = (applied as i64 != requested).then_some(Adjustment {
        field: SettingField::FanDuty,
        requested,
        applied: applied as i64,
    });
    Ok((FanSpeed::new_unchecked(applied), adjustment))
}

fn validate_fan(
    fan: &FanRequest,
    caps: &DeviceCapabilities,
    adjustments: &mut Vec<Adjustment>,
) -> Result<ValidatedFan, ValidationError> {
    match fan {
        FanRequest::Auto => {
            if !caps.supports(SettingField::FanMode) {
                return Err(ValidationError::Unsupported(SettingField::FanMode));
            }
            Ok(ValidatedFan::Auto)
        }
        FanRequest::Manual { duty_percent } => {
            let duty = duty_percent.ok_or(ValidationError::MissingField(SettingField::FanDuty))?;
            let range = manual_range(caps, SettingField::FanDuty)?;
            let applied = range.clamp(duty as i64);
            note(adjustments, SettingField::FanDuty, duty as i64, applied as i64);
            Ok(ValidatedFan::Manual {
                duty: FanSpeed::new_unchecked(applied),
            })
        }
        FanRequest::Custom { curve } => {
            let curve = curve
                .as_ref()
                .ok_or(ValidationError::MissingField(SettingField::FanCurve))?;
            curve.check()?;
            let range = manual_range(caps, SettingField::FanCurve)?;
            Ok(ValidatedFan::Custom {
                curve: clamp_curve(curve, range, adjustments)?,
            })
        }
    }
}

fn manual_range(
    caps: &DeviceCapabilities,
    field: SettingField,
) -> Result<DutyRange, ValidationError> {
    match caps.fan_duty {
        Some(range) if caps.fan_count > 0 => Ok(range),
        _ => Err(ValidationError::Unsupported(field)),
    }
}

/// Clamp every point's duty into the manual range
///
/// Clamping a non-decreasing sequence keeps it non-decreasing.
fn clamp_curve(
    curve: &FanCurve,
    range: DutyRange,
    adjustments: &mut Vec<Adjustment>,
) -> Result<FanCurve, ValidationError> {
    let points = curve
        .points()
        .iter()
        .map(|p| {
            let applied = range.clamp(p.duty_percent as i64) as i32;
            note(adjustments, SettingField::FanCurve, p.duty_percent as i64, applied as i64);
            CurvePoint::new(p.temperature_c, applied)
        })
        .collect();
    FanCurve::new(points)
}

fn note(adjustments: &mut Vec<Adjustment>, field: SettingField, requested: i64, applied: i64) {
    if requested != applied {
        adjustments.push(Adjustment {
            field,
            requested,
            applied,
        });
    }
}
