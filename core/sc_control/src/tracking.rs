//! Keeps the camera aimed at a focus point while the slider moves.
//!
//! The point's `y` is measured along the rail from the slider's zero, so the
//! aim is recomputed from `y - slider_mm` on every tick.

use crate::controller::MotionController;
use crate::error::ControlError;
use crate::motor::{Limits, MAX_PROFILE_VALUE};
use crate::points::{FocusPoint, PointId};
use log::debug;
use sc_units::{MotorId, axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Optional focus motor drive: subject distance mapped linearly onto the
/// motor's step range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusDrive {
    pub motor: MotorId,
    /// Distance at the low end of the motor's limits.
    pub near_mm: f64,
    /// Distance at the high end.
    pub far_mm: f64,
}

impl Default for FocusDrive {
    fn default() -> Self {
        Self {
            motor: axis::FOCUS,
            near_mm: 100.0,
            far_mm: 2000.0,
        }
    }
}

impl FocusDrive {
    pub fn steps_for(&self, distance_mm: f64, limits: Limits) -> i32 {
        let t = ((distance_mm - self.near_mm) / (self.far_mm - self.near_mm)).clamp(0.0, 1.0);
        limits.min + (t * f64::from(limits.span())).round() as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Profile velocity of tracking goals.
    pub velocity: u32,
    /// Profile acceleration written to tracked axes when a session starts.
    pub acceleration: u32,
    /// Aim at where the slider will be this far ahead, from the estimator.
    pub lead_ms: u64,
    pub focus: Option<FocusDrive>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            velocity: 800,
            acceleration: 2000,
            lead_ms: 0,
            focus: None,
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.velocity == 0 || self.velocity > MAX_PROFILE_VALUE {
            return Err(format!("tracking.velocity must be within 1..={MAX_PROFILE_VALUE}"));
        }
        if self.acceleration > MAX_PROFILE_VALUE {
            return Err(format!("tracking.acceleration must be at most {MAX_PROFILE_VALUE}"));
        }
        if self.lead_ms > 1000 {
            return Err("tracking.lead_ms must be at most 1000".into());
        }
        if let Some(f) = &self.focus
            && !(f.near_mm.is_finite() && f.far_mm.is_finite() && f.near_mm < f.far_mm)
        {
            return Err("tracking.focus needs near_mm < far_mm".into());
        }
        Ok(())
    }

    /// Motors a tracking session writes to.
    pub fn driven_axes(&self) -> Vec<MotorId> {
        let mut axes = vec![axis::PAN, axis::TILT];
        axes.extend(self.focus.map(|f| f.motor));
        axes
    }
}

/// Who started the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Operator,
    /// Started by a focus-linked profile; ends with that playback's `stop`.
    Playback,
}

/// Camera angles towards a point, in degrees relative to the centred pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AimSolution {
    pub pan_deg: f64,
    pub tilt_deg: f64,
    pub distance_mm: f64,
}

/// `pan = atan2(x, |z|)`, `tilt = atan2(y - slider, sqrt(x² + z²))`.
pub fn aim(point: &FocusPoint, slider_mm: f64) -> AimSolution {
    let y_rel = point.y - slider_mm;
    let horizontal = point.x.hypot(point.z);
    AimSolution {
        pan_deg: sc_units::atan2_angle(point.x, point.z.abs()).get::<uom::si::angle::degree>(),
        tilt_deg: sc_units::atan2_angle(y_rel, horizontal).get::<uom::si::angle::degree>(),
        distance_mm: horizontal.hypot(y_rel),
    }
}

#[derive(Debug, Clone)]
pub struct TrackingSession {
    pub point_id: PointId,
    pub owner: Owner,
    pub last_aim: Option<AimSolution>,
    /// Goals this session last wrote, so unchanged goals are not re-sent.
    last_goals: BTreeMap<MotorId, i32>,
    accelerations_set: bool,
}

impl TrackingSession {
    pub fn new(point_id: PointId, owner: Owner) -> Self {
        Self {
            point_id,
            owner,
            last_aim: None,
            last_goals: BTreeMap::new(),
            accelerations_set: false,
        }
    }

    /// Points the session at another target, keeping the written-goal cache.
    pub fn retarget(&mut self, point_id: PointId) {
        if self.point_id != point_id {
            debug!("tracking: retarget {} -> {point_id}", self.point_id);
            self.point_id = point_id;
            self.last_aim = None;
        }
    }

    /// Forgets what this session wrote, so the next update re-sends its
    /// accelerations and every goal.
    pub fn invalidate(&mut self) {
        self.last_goals.clear();
        self.accelerations_set = false;
    }

    /// Recomputes the aim from the latest slider position and writes every
    /// goal that changed.
    ///
    /// Without a slider reading yet this is a no-op. A failed write leaves
    /// the cache untouched so the goal is retried on the next tick.
    pub fn update(
        &mut self,
        point: &FocusPoint,
        ctrl: &mut MotionController,
        config: &TrackingConfig,
    ) -> Result<(), ControlError> {
        let predicted = match config.lead_ms {
            0 => None,
            ms => ctrl.predicted_units(axis::SLIDER, Duration::from_millis(ms)),
        };
        let Some(slider_mm) = predicted.or_else(|| ctrl.position_units(axis::SLIDER)) else {
            return Ok(());
        };

        if !self.accelerations_set {
            for id in config.driven_axes() {
                ctrl.set_profile_acceleration(id, config.acceleration)?;
            }
            self.accelerations_set = true;
        }

        let solution = aim(point, slider_mm);
        self.last_aim = Some(solution);

        let conv = ctrl.converter();
        let mut goals = vec![
            (axis::PAN, conv.units_to_steps(solution.pan_deg, axis::PAN)?),
            (axis::TILT, conv.units_to_steps(solution.tilt_deg, axis::TILT)?),
        ];
        if let Some(drive) = config.focus
            && let Some(limits) = ctrl.limits(drive.motor)
        {
            goals.push((drive.motor, drive.steps_for(solution.distance_mm, limits)));
        }

        for (id, steps) in goals {
            let Some(limits) = ctrl.limits(id) else {
                continue;
            };
            let target = limits.clamp(steps);
            if self.last_goals.get(&id) == Some(&target) {
                continue;
            }
            ctrl.set_goal(id, target, config.velocity)?;
            self.last_goals.insert(id, target);
        }
        Ok(())
    }
}

/// Polled by clients to detect tracking changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingStatus {
    pub active: bool,
    pub current_point_id: Option<PointId>,
    pub owner: Option<Owner>,
    pub pan_deg: Option<f64>,
    pub tilt_deg: Option<f64>,
}

impl TrackingStatus {
    pub fn of(session: Option<&TrackingSession>) -> Self {
        Self {
            active: session.is_some(),
            current_point_id: session.map(|s| s.point_id),
            owner: session.map(|s| s.owner),
            pan_deg: session.and_then(|s| s.last_aim).map(|a| sc_units::round_display(a.pan_deg)),
            tilt_deg: session.and_then(|s| s.last_aim).map(|a| sc_units::round_display(a.tilt_deg)),
        }
    }
}
