//! Proposal confidence.
//!
//! The canonical scale is 0.0 to 1.0. Percentages exist only for display.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ValidationError;

/// A confidence value in `[0.0, 1.0]`.
///
/// # Examples
///
/// ```
/// use kyrologic::action::Confidence;
///
/// let conf = Confidence::new(0.95).unwrap();
/// assert_eq!(conf.value(), 0.95);
/// assert_eq!(Confidence::clamped(1.7).value(), 1.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(into = "f64", from = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Minimum valid confidence value.
    pub const MIN_VALUE: f64 = 0.0;

    /// Maximum valid confidence value.
    pub const MAX_VALUE: f64 = 1.0;

    /// Creates a confidence, rejecting values outside `[0.0, 1.0]`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ConfidenceOutOfRange` for NaN or out-of-range values.
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if value.is_nan() || !(Self::MIN_VALUE..=Self::MAX_VALUE).contains(&value) {
            return Err(ValidationError::ConfidenceOutOfRange { value });
        }
        Ok(Self(value))
    }

    /// Clamps into range, logging a warning when the input was outside it.
    /// NaN becomes 0.
    #[must_use]
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            warn!(value, "confidence is NaN; using 0");
            return Self(Self::MIN_VALUE);
        }
        let clamped = value.clamp(Self::MIN_VALUE, Self::MAX_VALUE);
        #[allow(clippy::float_cmp)]
        let changed = clamped != value;
        if changed {
            warn!(value, clamped, "confidence out of range; clamped");
        }
        Self(clamped)
    }

    /// Parses a presentation percentage.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::PercentOutOfRange` outside `[0, 100]`.
    pub fn from_percent(percent: f64) -> Result<Self, ValidationError> {
        if percent.is_nan() || !(0.0..=100.0).contains(&percent) {
            return Err(ValidationError::PercentOutOfRange { value: percent });
        }
        Ok(Self(percent / 100.0))
    }

    /// Presentation percentage.
    #[must_use]
    pub fn to_percent(self) -> f64 {
        self.0 * 100.0
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(Self::MIN_VALUE)
    }

    #[must_use]
    pub const fn one() -> Self {
        Self(Self::MAX_VALUE)
    }

    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    pub fn is_high(self) -> bool {
        self.0 >= 0.8
    }

    pub fn is_medium(self) -> bool {
        self.0 >= 0.5 && self.0 < 0.8
    }

    pub fn is_low(self) -> bool {
        self.0 < 0.5
    }

    /// Both must hold: the minimum.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Either suffices: the maximum.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<f64> for Confidence {
    fn from(value: f64) -> Self {
        Self::clamped(value)
    }
}

impl From<Confidence> for f64 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_valid_and_invalid_values() {
        assert!(Confidence::new(0.0).is_ok());
        assert!(Confidence::new(1.0).is_ok());
        assert!(Confidence::new(-0.1).is_err());
        assert!(Confidence::new(1.1).is_err());
        assert!(Confidence::new(f64::NAN).is_err());
    }

    #[test]
    fn test_confidence_clamps() {
        assert!((Confidence::clamped(1.5).value() - 1.0).abs() < f64::EPSILON);
        assert!(Confidence::clamped(-3.0).value().abs() < f64::EPSILON);
        assert!(Confidence::clamped(f64::NAN).value().abs() < f64::EPSILON);
        assert!((Confidence::clamped(0.42).value() - 0.42).abs() < f64::EPSILON);
    }

    #[test]
    fn test_percent_round_trip() {
        for v in [0.0, 0.05, 0.333, 0.9, 1.0] {
            let c = Confidence::new(v).unwrap();
            let back = Confidence::from_percent(c.to_percent()).unwrap();
            assert!((back.value() - v).abs() < 1e-12);
        }
        assert!(Confidence::from_percent(101.0).is_err());
    }

    #[test]
    fn test_confidence_levels() {
        assert!(Confidence::new(0.9).unwrap().is_high());
        assert!(Confidence::new(0.6).unwrap().is_medium());
        assert!(Confidence::new(0.3).unwrap().is_low());
    }

    #[test]
    fn test_confidence_and_or() {
        let a = Confidence::new(0.8).unwrap();
        let b = Confidence::new(0.6).unwrap();
        assert!((a.and(b).value() - 0.6).abs() < f64::EPSILON);
        assert!((a.or(b).value() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serde_clamps_on_read() {
        let c: Confidence = serde_json::from_str("1.25").unwrap();
        assert!((c.value() - 1.0).abs() < f64::EPSILON);
        assert_eq!(serde_json::to_string(&Confidence::new(0.5).unwrap()).unwrap(), "0.5");
        assert_eq!(format!("{}", Confidence::new(0.856).unwrap()), "0.86");
    }
}
