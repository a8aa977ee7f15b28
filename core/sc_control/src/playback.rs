//! Sequential playback of a profile's waypoints.
//!
//! A session issues one waypoint at a time and moves on once the waypoint's
//! motors have arrived. Advancement only happens from the rig tick, so the
//! bus is never driven faster than the poll rate.

use crate::controller::MotionController;
use crate::error::ControlError;
use crate::points::PointId;
use crate::profiles::{Profile, ProfilePoint};
use log::{debug, info, warn};
use sc_units::{MotorId, STEPS_PER_REV, axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Profile velocity unit, rev/min.
const VELOCITY_UNIT_RPM: f64 = 0.229;
/// Profile acceleration unit, rev/min².
const ACCELERATION_UNIT_RPM2: f64 = 214.577;

fn default_pan_tilt_tolerance() -> i32 {
    20
}

/// When a waypoint counts as reached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Arrival {
    /// Every claimed motor within `tolerance` steps of its target, the pan
    /// and tilt heads within `pan_tilt_tolerance`. After `timeout_ms` the
    /// waypoint is abandoned and playback moves on.
    Position {
        tolerance: i32,
        #[serde(default = "default_pan_tilt_tolerance")]
        pan_tilt_tolerance: i32,
        timeout_ms: u64,
    },
    /// Fixed dwell: the computed move time plus `settle_ms`.
    Timed { settle_ms: u64 },
}

impl Default for Arrival {
    fn default() -> Self {
        Self::Position {
            tolerance: 10,
            pan_tilt_tolerance: default_pan_tilt_tolerance(),
            timeout_ms: 30_000,
        }
    }
}

impl Arrival {
    /// Allowed distance in steps from the target of motor `id`.
    fn tolerance_for(tolerance: i32, pan_tilt_tolerance: i32, id: MotorId) -> i32 {
        if id == axis::PAN || id == axis::TILT {
            pan_tilt_tolerance
        } else {
            tolerance
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub arrival: Arrival,
    /// On `stop`, command the claimed motors to where they are.
    pub hold_on_stop: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            arrival: Arrival::default(),
            hold_on_stop: true,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self.arrival {
            Arrival::Position {
                tolerance,
                pan_tilt_tolerance,
                timeout_ms,
            } if tolerance < 0 || pan_tilt_tolerance < 0 || timeout_ms == 0 => {
                Err("playback.arrival needs tolerances >= 0 and timeout_ms > 0".into())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlayOptions {
    /// Loop back to the first waypoint instead of finishing.
    pub repeat: bool,
}

/// Time for a move of `distance` steps under the servo's trapezoidal
/// profile. Acceleration 0 means an instant ramp.
pub fn move_duration(distance: f64, velocity: u32, acceleration: u32) -> Duration {
    let steps_per_rev = f64::from(STEPS_PER_REV);
    let v = f64::from(velocity) * VELOCITY_UNIT_RPM * steps_per_rev / 60.0;
    if v <= 0.0 || distance <= 0.0 {
        return Duration::ZERO;
    }
    let a = f64::from(acceleration) * ACCELERATION_UNIT_RPM2 * steps_per_rev / 3600.0;
    let secs = if a <= 0.0 {
        distance / v
    } else if distance >= v * v / a {
        distance / v + v / a
    } else {
        2.0 * (distance / a).sqrt()
    };
    Duration::from_secs_f64(secs)
}

/// Outcome of one playback tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Waiting,
    /// Moved on to this waypoint.
    Advanced(usize),
    /// Last waypoint reached without `repeat`.
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct Issued {
    at: Duration,
    dwell: Duration,
}

#[derive(Debug, Clone)]
pub struct PlaybackSession {
    profile: Profile,
    index: usize,
    repeat: bool,
    iterations: u32,
    claimed: BTreeSet<MotorId>,
    issued: Option<Issued>,
}

impl PlaybackSession {
    /// `claimed` are the motors this session writes; targets for any other
    /// motor are skipped.
    pub fn new(profile: Profile, options: PlayOptions, claimed: BTreeSet<MotorId>) -> Self {
        Self {
            profile,
            index: 0,
            repeat: options.repeat,
            iterations: 0,
            claimed,
            issued: None,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn claimed(&self) -> &BTreeSet<MotorId> {
        &self.claimed
    }

    pub fn claims(&self, id: MotorId) -> bool {
        self.claimed.contains(&id)
    }

    /// Gives up `axes`; returns true when nothing is left to drive.
    pub fn release(&mut self, axes: &[MotorId]) -> bool {
        for id in axes {
            self.claimed.remove(id);
        }
        self.claimed.is_empty()
    }

    fn current(&self) -> Option<&ProfilePoint> {
        self.profile.points.get(self.index)
    }

    /// Focus point that should be tracked at the current waypoint: the
    /// nearest linked waypoint at or before it.
    pub fn focus_target(&self) -> Option<PointId> {
        self.profile.points[..(self.index + 1).min(self.profile.points.len())]
            .iter()
            .rev()
            .find_map(|p| p.focus_point_id)
    }

    /// Writes the profile acceleration to every claimed motor.
    pub fn prepare(&self, ctrl: &mut MotionController) -> Result<(), ControlError> {
        for &id in &self.claimed {
            ctrl.set_profile_acceleration(id, self.profile.acceleration)?;
        }
        Ok(())
    }

    /// Commands the current waypoint on the claimed motors.
    pub fn issue(&mut self, ctrl: &mut MotionController, now: Duration) -> Result<(), ControlError> {
        self.issued = None;
        let Some(point) = self.current().cloned() else {
            return Ok(());
        };
        let mut dwell = Duration::ZERO;
        for (&id, &target) in point.positions.iter().filter(|(id, _)| self.claimed.contains(id)) {
            let from = ctrl.position(id).or(ctrl.motor(id)?.goal).unwrap_or(target);
            let d = move_duration(f64::from((target - from).abs()), point.velocity, self.profile.acceleration);
            dwell = dwell.max(d);
            ctrl.set_goal(id, target, point.velocity)?;
        }
        debug!(
            "playback '{}': issued point {}/{}",
            self.profile.name,
            self.index + 1,
            self.profile.points.len()
        );
        self.issued = Some(Issued { at: now, dwell });
        Ok(())
    }

    fn arrived(&self, ctrl: &MotionController, arrival: &Arrival, issued: Issued, now: Duration) -> bool {
        let elapsed = now.saturating_sub(issued.at);
        match *arrival {
            Arrival::Position {
                tolerance,
                pan_tilt_tolerance,
                timeout_ms,
            } => {
                let Some(point) = self.current() else {
                    return true;
                };
                let reached = point
                    .positions
                    .iter()
                    .filter(|(id, _)| self.claimed.contains(id))
                    .all(|(&id, &target)| {
                        let allowed = Arrival::tolerance_for(tolerance, pan_tilt_tolerance, id);
                        ctrl.position(id).is_some_and(|p| (p - target).abs() <= allowed)
                    });
                if reached {
                    return true;
                }
                if elapsed >= Duration::from_millis(timeout_ms) {
                    warn!(
                        "playback '{}': point {} not reached after {timeout_ms} ms, moving on",
                        self.profile.name, self.index
                    );
                    return true;
                }
                false
            }
            Arrival::Timed { settle_ms } => elapsed >= issued.dwell + Duration::from_millis(settle_ms),
        }
    }

    /// Advances when the current waypoint has arrived. A waypoint whose
    /// commands failed is re-issued first.
    pub fn tick(
        &mut self,
        ctrl: &mut MotionController,
        arrival: &Arrival,
        now: Duration,
    ) -> Result<Step, ControlError> {
        let Some(issued) = self.issued else {
            self.issue(ctrl, now)?;
            return Ok(Step::Waiting);
        };
        if !self.arrived(ctrl, arrival, issued, now) {
            return Ok(Step::Waiting);
        }

        self.index += 1;
        if self.index >= self.profile.points.len() {
            self.iterations += 1;
            if !self.repeat {
                self.index = self.profile.points.len().saturating_sub(1);
                info!("playback '{}' finished", self.profile.name);
                return Ok(Step::Finished);
            }
            self.index = 0;
            debug!("playback '{}': iteration {} done, looping", self.profile.name, self.iterations);
        }
        self.issue(ctrl, now)?;
        Ok(Step::Advanced(self.index))
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            active: true,
            profile: Some(self.profile.name.clone()),
            index: Some(self.index),
            total: self.profile.points.len(),
            repeat: self.repeat,
            completed_iterations: self.iterations,
        }
    }
}

/// Enough for a client to render progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub active: bool,
    pub profile: Option<String>,
    pub index: Option<usize>,
    pub total: usize,
    pub repeat: bool,
    pub completed_iterations: u32,
}

impl PlaybackStatus {
    pub fn idle() -> Self {
        Self {
            active: false,
            profile: None,
            index: None,
            total: 0,
            repeat: false,
            completed_iterations: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use approx::assert_relative_eq;
    use cu29_clock::{RobotClock, RobotClockMock};
    use sc_dynamixel::{Register, SimBus, SimHandle};

    fn rig() -> (MotionController, SimHandle, RobotClockMock) {
        let (clock, mock) = RobotClock::mock();
        let bus = SimBus::new(sc_units::axis::ALL, clock);
        let h = bus.handle();
        (MotionController::new(&SystemConfig::default(), Box::new(bus)), h, mock)
    }

    fn profile(points: &[&[(MotorId, i32)]]) -> Profile {
        Profile {
            name: "p".into(),
            points: points
                .iter()
                .map(|targets| ProfilePoint {
                    positions: targets.iter().copied().collect(),
                    velocity: 100,
                    focus_point_id: None,
                })
                .collect(),
            acceleration: 0,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn move_time_covers_cruise_and_short_moves() {
        // 100 units = 1563.3 steps/s
        assert_relative_eq!(move_duration(1563.307, 100, 0).as_secs_f64(), 1.0, epsilon = 1e-3);
        assert_eq!(move_duration(0.0, 100, 10), Duration::ZERO);
        let a = 10.0 * ACCELERATION_UNIT_RPM2 * 4096.0 / 3600.0;
        let short = move_duration(100.0, 100, 10).as_secs_f64();
        assert_relative_eq!(short, 2.0 * (100.0 / a).sqrt(), epsilon = 1e-9);
        assert!(move_duration(4000.0, 100, 10) > move_duration(4000.0, 100, 0));
    }

    #[test]
    fn advances_on_arrival_and_finishes() {
        let (mut ctrl, h, clock) = rig();
        let p = profile(&[&[(1, 1000)], &[(1, 1500)], &[(1, 2000)]]);
        let mut s = PlaybackSession::new(p, PlayOptions::default(), [1].into_iter().collect());
        s.issue(&mut ctrl, ms(0)).unwrap();
        assert_eq!(h.goal(1), Some(1000));

        let arrival = Arrival::default();
        ctrl.refresh(ms(50)).unwrap();
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(50)).unwrap(), Step::Waiting);

        let mut steps = Vec::new();
        for k in 2..200u64 {
            clock.set_value(k * 50 * 1_000_000);
            ctrl.refresh(ms(k * 50)).unwrap();
            match s.tick(&mut ctrl, &arrival, ms(k * 50)).unwrap() {
                Step::Waiting => {}
                Step::Finished => {
                    steps.push(usize::MAX);
                    break;
                }
                Step::Advanced(i) => steps.push(i),
            }
        }
        assert_eq!(steps, vec![1, 2, usize::MAX]);
        assert_eq!(h.writes_to(1, Register::GoalPosition), vec![1000, 1500, 2000]);
        assert_eq!(s.status().completed_iterations, 1);
    }

    #[test]
    fn position_timeout_moves_on() {
        let (mut ctrl, _h, _clock) = rig();
        ctrl.set_torque(crate::controller::TorqueTarget::One(1), false).unwrap();
        let p = profile(&[&[(1, 100)], &[(1, 200)]]);
        let mut s = PlaybackSession::new(p, PlayOptions::default(), [1].into_iter().collect());
        s.issue(&mut ctrl, ms(0)).unwrap();
        let arrival = Arrival::Position {
            tolerance: 10,
            pan_tilt_tolerance: 20,
            timeout_ms: 500,
        };
        ctrl.refresh(ms(400)).unwrap();
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(400)).unwrap(), Step::Waiting);
        ctrl.refresh(ms(500)).unwrap();
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(500)).unwrap(), Step::Advanced(1));
    }

    #[test]
    fn timed_arrival_waits_for_the_dwell() {
        let (mut ctrl, _h, _clock) = rig();
        ctrl.refresh(ms(0)).unwrap();
        // 2048 -> 3611 at 100 units is one second
        let p = profile(&[&[(1, 3611)], &[(1, 2048)]]);
        let mut s = PlaybackSession::new(p, PlayOptions::default(), [1].into_iter().collect());
        s.issue(&mut ctrl, ms(0)).unwrap();
        let arrival = Arrival::Timed { settle_ms: 200 };
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(1100)).unwrap(), Step::Waiting);
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(1200)).unwrap(), Step::Advanced(1));
    }

    #[test]
    fn repeat_loops_and_counts_iterations() {
        let (mut ctrl, _h, _clock) = rig();
        let p = profile(&[&[(1, 2048)], &[(1, 2048)]]);
        let opts = PlayOptions { repeat: true };
        let mut s = PlaybackSession::new(p, opts, [1].into_iter().collect());
        s.issue(&mut ctrl, ms(0)).unwrap();
        ctrl.refresh(ms(10)).unwrap();
        let arrival = Arrival::default();
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(10)).unwrap(), Step::Advanced(1));
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(20)).unwrap(), Step::Advanced(0));
        assert_eq!(s.status().completed_iterations, 1);
        assert!(s.status().repeat);
    }

    #[test]
    fn unclaimed_targets_are_skipped() {
        let (mut ctrl, h, _clock) = rig();
        let p = profile(&[&[(1, 1000), (3, 1000)]]);
        let mut s = PlaybackSession::new(p, PlayOptions::default(), [1, 3].into_iter().collect());
        assert!(!s.release(&[3]));
        s.issue(&mut ctrl, ms(0)).unwrap();
        assert_eq!(h.writes_to(3, Register::GoalPosition), Vec::<u32>::new());
        assert!(s.release(&[1]));
    }

    #[test]
    fn focus_target_is_the_latest_linked_waypoint() {
        let mut p = profile(&[&[(2, 0)], &[(2, 100)], &[(2, 200)]]);
        p.points[1].focus_point_id = Some(7);
        let mut s = PlaybackSession::new(p, PlayOptions::default(), [2].into_iter().collect());
        assert_eq!(s.focus_target(), None);
        s.index = 1;
        assert_eq!(s.focus_target(), Some(7));
        s.index = 2;
        assert_eq!(s.focus_target(), Some(7));
    }

    #[test]
    fn pan_and_tilt_arrive_within_their_own_tolerance() {
        let (mut ctrl, h, _clock) = rig();
        let p = profile(&[&[(axis::PAN, 2500), (axis::SLIDER, 2500)], &[(axis::PAN, 2048)]]);
        let claim = [axis::PAN, axis::SLIDER].into_iter().collect();
        let mut s = PlaybackSession::new(p, PlayOptions::default(), claim);
        s.issue(&mut ctrl, ms(0)).unwrap();
        let arrival = Arrival::default();

        // 15 steps off: close enough for the pan head, not for the slider
        h.set_position(axis::PAN, 2485);
        h.set_position(axis::SLIDER, 2485);
        ctrl.refresh(ms(50)).unwrap();
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(50)).unwrap(), Step::Waiting);

        h.set_position(axis::SLIDER, 2495);
        ctrl.refresh(ms(100)).unwrap();
        assert_eq!(s.tick(&mut ctrl, &arrival, ms(100)).unwrap(), Step::Advanced(1));
    }
}
