//! Value normalization
//!
//! This module normalizes raw device values into platform units and scales.
//! - Out-of-range glucose readings clamped to just past the meter's limits
//! - mmol/L and mg/dL conversion
//! - Floating-point noise removed from decoded insulin volumes

use crate::types::{Annotation, MGDL, MMOLL};

/// mg/dL per mmol/L
pub const MGDL_PER_MMOLL: f64 = 18.01559;

/// Reporting limits of a meter or CGM
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlucoseRange {
    /// Readings below this are reported as "LO"
    pub low: f64,
    /// Readings above this are reported as "HI"
    pub high: f64,
}

impl GlucoseRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Value stored for a "LO" reading
    pub fn low_value(&self) -> f64 {
        self.low - 1.0
    }

    /// Value stored for a "HI" reading
    pub fn high_value(&self) -> f64 {
        self.high + 1.0
    }
}

impl Default for GlucoseRange {
    fn default() -> Self {
        Self::new(20.0, 600.0)
    }
}

/// Which side of the meter's range a reading fell on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfRange {
    Low,
    High,
}

impl OutOfRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutOfRange::Low => "low",
            OutOfRange::High => "high",
        }
    }
}

/// Normalizer for raw device values
pub struct Normalizer;

impl Normalizer {
    /// Clamp a reading the device flagged as out of range
    ///
    /// Returns the value to store and the `bg/out-of-range` annotation to attach.
    pub fn out_of_range(range: &GlucoseRange, side: OutOfRange) -> (f64, Annotation) {
        match side {
            OutOfRange::Low => (
                range.low_value(),
                Annotation::out_of_range(side.as_str(), range.low),
            ),
            OutOfRange::High => (
                range.high_value(),
                Annotation::out_of_range(side.as_str(), range.high),
            ),
        }
    }

    /// Clamp a numeric reading that lies outside the device range
    pub fn clamp_glucose(value: f64, range: &GlucoseRange) -> (f64, Option<Annotation>) {
        if value < range.low {
            let (v, a) = Self::out_of_range(range, OutOfRange::Low);
            (v, Some(a))
        } else if value > range.high {
            let (v, a) = Self::out_of_range(range, OutOfRange::High);
            (v, Some(a))
        } else {
            (value, None)
        }
    }

    pub fn mmoll_to_mgdl(value: f64) -> f64 {
        value * MGDL_PER_MMOLL
    }

    pub fn mgdl_to_mmoll(value: f64) -> f64 {
        value / MGDL_PER_MMOLL
    }

    /// Convert a value in `units` to mg/dL
    pub fn to_mgdl(value: f64, units: &str) -> f64 {
        if is_mmoll(units) {
            Self::mmoll_to_mgdl(value)
        } else {
            value
        }
    }

    /// Canonical spelling of a unit string reported by a device
    pub fn canonical_units(units: &str) -> &'static str {
        if is_mmoll(units) {
            MMOLL
        } else {
            MGDL
        }
    }
}

fn is_mmoll(units: &str) -> bool {
    units.eq_ignore_ascii_case("mmol/l") || units.eq_ignore_ascii_case("mmol")
}

/// Round away binary noise (0.1 + 0.2) to `digits` decimals
pub fn fix_floating_point(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Device volumes are stored in hundredths of a unit
pub fn hundredths(raw: impl Into<f64>) -> f64 {
    fix_floating_point(raw.into() / 100.0, 2)
}
