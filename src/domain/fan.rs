//! Fan-related domain types
//!
//! Provides validated types for fan duty, curves, and policies.

use crate::error::{CurveDefect, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fan duty cycle percentage (0-100)
///
/// Validated on construction to ensure the value is within valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FanSpeed(u8);

impl FanSpeed {
    /// Minimum valid fan speed
    pub const MIN: u8 = 0;
    /// Maximum valid fan speed
    pub const MAX: u8 = 100;

    /// Create a new FanSpeed with validation
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidFanSpeed` if value > 100
    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if value > Self::MAX {
            return Err(ValidationError::InvalidFanSpeed(value));
        }
        Ok(Self(value))
    }

    /// Create a FanSpeed without validation (for internal use)
    ///
    /// Caller must ensure value <= 100
    pub(crate) const fn new_unchecked(value: u8) -> Self {
        Self(value)
    }

    /// Saturating conversion from any integer percentage
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(Self::MIN as i64, Self::MAX as i64) as u8)
    }

    /// Get the speed as a percentage value (0-100)
    #[inline]
    pub const fn as_percentage(&self) -> u8 {
        self.0
    }

    /// Absolute difference in percentage points
    pub fn distance(&self, other: FanSpeed) -> u8 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl TryFrom<u8> for FanSpeed {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FanSpeed> for u8 {
    fn from(speed: FanSpeed) -> Self {
        speed.0
    }
}

impl From<FanSpeed> for u32 {
    fn from(speed: FanSpeed) -> Self {
        speed.0 as u32
    }
}

/// A single point on a fan curve
///
/// Values are kept raw so that a bad point can be reported by index
/// instead of failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Temperature in Celsius
    pub temperature_c: i32,
    /// Target duty at this temperature
    pub duty_percent: i32,
}

impl CurvePoint {
    /// Create a new fan curve point
    pub fn new(temperature_c: i32, duty_percent: i32) -> Self {
        Self {
            temperature_c,
            duty_percent,
        }
    }
}

/// A fan curve mapping temperature to duty
///
/// Invariants (checked by [`FanCurve::check`]): at least one point,
/// temperatures strictly increasing, duties within 0-100% and
/// non-decreasing. Curves parsed from disk or from the wire are
/// unchecked data until validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

impl FanCurve {
    /// Create a validated fan curve
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidCurve` naming the first bad point
    pub fn new(points: Vec<CurvePoint>) -> Result<Self, ValidationError> {
        let curve = Self { points };
        curve.check()?;
        Ok(curve)
    }

    /// Wrap points without checking them
    ///
    /// For user input that is validated later, where the error should name
    /// the offending point.
    pub fn from_points(points: Vec<CurvePoint>) -> Self {
        Self { points }
    }

    /// Verify the curve invariants
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.points.is_empty() {
            return Err(ValidationError::InvalidCurve {
                index: 0,
                defect: CurveDefect::Empty,
            });
        }

        let mut previous: Option<&CurvePoint> = None;
        for (index, point) in self.points.iter().enumerate() {
            if !(0..=100).contains(&point.duty_percent) {
                return Err(ValidationError::InvalidCurve {
                    index,
                    defect: CurveDefect::DutyOutOfRange,
                });
            }
            if let Some(prev) = previous {
                if point.temperature_c <= prev.temperature_c {
                    return Err(ValidationError::InvalidCurve {
                        index,
                        defect: CurveDefect::TemperatureNotIncreasing,
                    });
                }
                if point.duty_percent < prev.duty_percent {
                    return Err(ValidationError::InvalidCurve {
                        index,
                        defect: CurveDefect::DutyDecreasing,
                    });
                }
            }
            previous = Some(point);
        }

        Ok(())
    }

    /// Target duty for a temperature
    ///
    /// Linear interpolation between the two bracketing points, clamped to
    /// the first/last point outside the curve's range. An empty curve asks
    /// for full speed.
    pub fn duty_at(&self, temperature_c: i32) -> FanSpeed {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return FanSpeed::new_unchecked(FanSpeed::MAX);
        };

        if temperature_c <= first.temperature_c {
            return FanSpeed::saturating(first.duty_percent as i64);
        }
        if temperature_c >= last.temperature_c {
            return FanSpeed::saturating(last.duty_percent as i64);
        }

        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if temperature_c >= a.temperature_c && temperature_c <= b.temperature_c {
                let span = (b.temperature_c - a.temperature_c) as f64;
                let t = (temperature_c - a.temperature_c) as f64 / span;
                let duty = a.duty_percent as f64 + t * (b.duty_percent - a.duty_percent) as f64;
                return FanSpeed::saturating(duty.round() as i64);
            }
        }

        FanSpeed::saturating(last.duty_percent as i64)
    }

    /// Get the curve points
    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Create a default fan curve
    pub fn default_curve() -> Self {
        Self {
            points: vec![
                CurvePoint::new(30, 30),
                CurvePoint::new(50, 40),
                CurvePoint::new(60, 50),
                CurvePoint::new(70, 65),
                CurvePoint::new(80, 85),
                CurvePoint::new(85, 100),
            ],
        }
    }
}

impl Default for FanCurve {
    fn default() -> Self {
        Self::default_curve()
    }
}

/// Fan control policy as seen by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FanPolicy {
    /// GPU controls fan speed automatically
    #[default]
    Auto,
    /// Manual fan speed control
    Manual,
}

impl fmt::Display for FanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanPolicy::Auto => write!(f, "Auto"),
            FanPolicy::Manual => write!(f, "Manual"),
        }
    }
}
