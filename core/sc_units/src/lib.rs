//! Unit conversions for the slidercam servo axes.
//!
//! Every axis reports raw encoder steps (4096 per revolution). Each motor id
//! maps to a fixed [`AxisScale`]:
//!
//! - rotational axes: 360° per revolution, with an optional angular offset so
//!   that the user-facing zero of pan and tilt is the physically centred
//!   orientation (`units = steps * 360 / 4096 - offset`);
//! - the slider: a calibrated number of millimetres per revolution.
//!
//! The units side is rounded to two decimals, the step side to the nearest
//! integer step, so `units_to_steps(steps_to_units(s))` lands within one step
//! of `s`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uom::si::angle::{degree, radian};
use uom::si::f64::{Angle, Length};
use uom::si::length::millimeter;

/// Raw encoder resolution of every axis.
pub const STEPS_PER_REV: i32 = 4096;

/// Highest raw step value within one revolution.
pub const MAX_STEP: i32 = STEPS_PER_REV - 1;

/// Bus id of a servo.
pub type MotorId = u8;

/// Fixed bus ids of the rig's physical axes.
pub mod axis {
    use super::MotorId;

    pub const TURNTABLE: MotorId = 1;
    pub const SLIDER: MotorId = 2;
    pub const PAN: MotorId = 3;
    pub const TILT: MotorId = 4;
    pub const ZOOM: MotorId = 5;
    pub const FOCUS: MotorId = 6;

    pub const ALL: [MotorId; 6] = [TURNTABLE, SLIDER, PAN, TILT, ZOOM, FOCUS];

    /// Human readable name for a known axis id.
    pub fn name(id: MotorId) -> Option<&'static str> {
        match id {
            TURNTABLE => Some("turntable"),
            SLIDER => Some("slider"),
            PAN => Some("pan"),
            TILT => Some("tilt"),
            ZOOM => Some("zoom"),
            FOCUS => Some("focus"),
            _ => None,
        }
    }
}

/// Calibrated slider travel per motor revolution.
pub const SLIDER_MM_PER_REV: f64 = 64.0;

/// Offset applied to pan and tilt so that 0° is the centred orientation.
pub const PAN_TILT_OFFSET_DEG: f64 = 180.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnitsError {
    #[error("unknown motor id {0}")]
    UnknownMotor(MotorId),
    #[error("value {0} is not a finite number")]
    NonFinite(f64),
    #[error("value {value} for motor {id} does not fit a step count")]
    OutOfRange { id: MotorId, value: f64 },
    #[error("motor {id} is not a {expected} axis")]
    WrongKind { id: MotorId, expected: AxisKind },
}

/// Physical nature of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    /// Degrees.
    Rotational,
    /// Millimetres.
    Linear,
}

impl std::fmt::Display for AxisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rotational => f.write_str("rotational"),
            Self::Linear => f.write_str("linear"),
        }
    }
}

/// Static conversion parameters of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisScale {
    pub kind: AxisKind,
    /// Degrees (rotational) or millimetres (linear) per revolution.
    pub units_per_rev: f64,
    /// Subtracted after scaling, in the axis unit.
    #[serde(default)]
    pub offset: f64,
}

impl AxisScale {
    pub const fn rotational(offset_deg: f64) -> Self {
        Self {
            kind: AxisKind::Rotational,
            units_per_rev: 360.0,
            offset: offset_deg,
        }
    }

    pub const fn linear(mm_per_rev: f64) -> Self {
        Self {
            kind: AxisKind::Linear,
            units_per_rev: mm_per_rev,
            offset: 0.0,
        }
    }

    #[inline]
    pub fn units_per_step(&self) -> f64 {
        self.units_per_rev / STEPS_PER_REV as f64
    }

    /// Unrounded conversion, used where the extra precision feeds further math.
    #[inline]
    pub fn to_units_exact(&self, steps: i32) -> f64 {
        steps as f64 * self.units_per_step() - self.offset
    }

    pub fn unit_label(&self) -> &'static str {
        match self.kind {
            AxisKind::Rotational => "deg",
            AxisKind::Linear => "mm",
        }
    }
}

/// Round to the two decimals shown to operators.
#[inline]
pub fn round_display(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Per-motor conversion table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitConverter {
    scales: BTreeMap<MotorId, AxisScale>,
}

impl UnitConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversion table of the six-axis camera slider.
    pub fn slider_rig() -> Self {
        Self::new()
            .with_axis(axis::TURNTABLE, AxisScale::rotational(0.0))
            .with_axis(axis::SLIDER, AxisScale::linear(SLIDER_MM_PER_REV))
            .with_axis(axis::PAN, AxisScale::rotational(PAN_TILT_OFFSET_DEG))
            .with_axis(axis::TILT, AxisScale::rotational(PAN_TILT_OFFSET_DEG))
            .with_axis(axis::ZOOM, AxisScale::rotational(0.0))
            .with_axis(axis::FOCUS, AxisScale::rotational(0.0))
    }

    pub fn with_axis(mut self, id: MotorId, scale: AxisScale) -> Self {
        self.insert(id, scale);
        self
    }

    pub fn insert(&mut self, id: MotorId, scale: AxisScale) {
        self.scales.insert(id, scale);
    }

    pub fn ids(&self) -> impl Iterator<Item = MotorId> + '_ {
        self.scales.keys().copied()
    }

    pub fn scale(&self, id: MotorId) -> Result<&AxisScale, UnitsError> {
        self.scales.get(&id).ok_or(UnitsError::UnknownMotor(id))
    }

    /// Raw steps to the axis unit (mm or deg), rounded to two decimals.
    pub fn steps_to_units(&self, steps: i32, id: MotorId) -> Result<f64, UnitsError> {
        Ok(round_display(self.scale(id)?.to_units_exact(steps)))
    }

    /// Axis unit back to the nearest integer step.
    ///
    /// The result is not clamped: callers validate it against the motor's
    /// limits.
    pub fn units_to_steps(&self, value: f64, id: MotorId) -> Result<i32, UnitsError> {
        if !value.is_finite() {
            return Err(UnitsError::NonFinite(value));
        }
        let scale = self.scale(id)?;
        let steps = ((value + scale.offset) / scale.units_per_step()).round();
        if steps < i32::MIN as f64 || steps > i32::MAX as f64 {
            return Err(UnitsError::OutOfRange { id, value });
        }
        Ok(steps as i32)
    }

    pub fn steps_to_angle(&self, steps: i32, id: MotorId) -> Result<Angle, UnitsError> {
        let scale = self.expect_kind(id, AxisKind::Rotational)?;
        Ok(Angle::new::<degree>(scale.to_units_exact(steps)))
    }

    pub fn angle_to_steps(&self, angle: Angle, id: MotorId) -> Result<i32, UnitsError> {
        self.expect_kind(id, AxisKind::Rotational)?;
        self.units_to_steps(angle.get::<degree>(), id)
    }

    pub fn steps_to_length(&self, steps: i32, id: MotorId) -> Result<Length, UnitsError> {
        let scale = self.expect_kind(id, AxisKind::Linear)?;
        Ok(Length::new::<millimeter>(scale.to_units_exact(steps)))
    }

    pub fn length_to_steps(&self, length: Length, id: MotorId) -> Result<i32, UnitsError> {
        self.expect_kind(id, AxisKind::Linear)?;
        self.units_to_steps(length.get::<millimeter>(), id)
    }

    fn expect_kind(&self, id: MotorId, expected: AxisKind) -> Result<&AxisScale, UnitsError> {
        let scale = self.scale(id)?;
        if scale.kind != expected {
            return Err(UnitsError::WrongKind { id, expected });
        }
        Ok(scale)
    }
}

/// `atan2(y, x)` as a typed angle, readable in whatever unit the caller needs.
#[inline]
pub fn atan2_angle(y: f64, x: f64) -> Angle {
    Angle::new::<radian>(y.atan2(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn round_trip_is_within_one_step_for_every_axis() {
        let conv = UnitConverter::slider_rig();
        for id in axis::ALL {
            for s in 0..=MAX_STEP {
                let units = conv.steps_to_units(s, id).unwrap();
                let back = conv.units_to_steps(units, id).unwrap();
                assert!((back - s).abs() <= 1, "id {id} step {s} -> {units} -> {back}");
            }
        }
    }

    #[test]
    fn pan_and_tilt_are_centred_at_half_turn() {
        let conv = UnitConverter::slider_rig();
        assert_relative_eq!(conv.steps_to_units(2048, axis::PAN).unwrap(), 0.0);
        assert_relative_eq!(conv.steps_to_units(0, axis::TILT).unwrap(), -180.0);
        assert_eq!(conv.units_to_steps(0.0, axis::PAN).unwrap(), 2048);
        assert_eq!(conv.units_to_steps(90.0, axis::TILT).unwrap(), 3072);
    }

    #[test]
    fn slider_uses_millimetres_per_revolution() {
        let conv = UnitConverter::slider_rig();
        assert_relative_eq!(conv.steps_to_units(4096, axis::SLIDER).unwrap(), 64.0);
        assert_relative_eq!(conv.steps_to_units(1000, axis::SLIDER).unwrap(), 15.63);
        assert_eq!(conv.units_to_steps(32.0, axis::SLIDER).unwrap(), 2048);
    }

    #[test]
    fn units_are_rounded_to_two_decimals() {
        let conv = UnitConverter::slider_rig();
        // 1 step = 0.087890625 deg
        assert_relative_eq!(conv.steps_to_units(1, axis::TURNTABLE).unwrap(), 0.09);
    }

    #[test]
    fn typed_accessors_check_the_axis_kind() {
        let conv = UnitConverter::slider_rig();
        let a = conv.steps_to_angle(3072, axis::PAN).unwrap();
        assert_relative_eq!(a.get::<degree>(), 90.0);
        assert_eq!(conv.angle_to_steps(a, axis::PAN).unwrap(), 3072);
        let l = conv.steps_to_length(2048, axis::SLIDER).unwrap();
        assert_relative_eq!(l.get::<millimeter>(), 32.0);
        assert!(matches!(
            conv.steps_to_angle(0, axis::SLIDER),
            Err(UnitsError::WrongKind { id: 2, .. })
        ));
    }

    #[test]
    fn rejects_unknown_ids_and_non_finite_values() {
        let conv = UnitConverter::slider_rig();
        assert_eq!(conv.steps_to_units(0, 9), Err(UnitsError::UnknownMotor(9)));
        assert!(matches!(
            conv.units_to_steps(f64::NAN, axis::PAN),
            Err(UnitsError::NonFinite(_))
        ));
        assert!(matches!(
            conv.units_to_steps(1e12, axis::SLIDER),
            Err(UnitsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn atan2_angle_reads_in_degrees() {
        assert_relative_eq!(
            atan2_angle(100.0, 200.0).get::<degree>(),
            26.565051177077994,
            epsilon = 1e-9
        );
    }
}
