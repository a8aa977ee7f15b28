//! The rig as one object: controller, stores and sessions behind a single
//! lock.

use crate::arbitration::{AxisClaims, Sessions};
use crate::config::SystemConfig;
use crate::controller::{MotionController, TorqueTarget};
use crate::error::{ControlError, MotorFailure};
use crate::motor::PidGains;
use crate::playback::{PlayOptions, PlaybackSession, PlaybackStatus, Step};
use crate::points::{FocusPoint, FocusPointPatch, NewFocusPoint, PointId, PointStore};
use crate::profiles::{Profile, ProfileStore, ProfileSummary};
use crate::snapshot::StatusSnapshot;
use crate::tracking::{Owner, TrackingSession, TrackingStatus};
use cu29_clock::RobotClock;
use log::{debug, info, warn};
use parking_lot::Mutex;
use sc_dynamixel::BusGateway;
use sc_units::{MotorId, UnitConverter};
use std::time::Duration;

const POINTS_FILE: &str = "focus_points.json";
const PROFILES_DIR: &str = "profiles";

struct Inner {
    config: SystemConfig,
    ctrl: MotionController,
    points: PointStore,
    profiles: ProfileStore,
    claims: AxisClaims,
    sessions: Sessions,
    /// Latest clock reading seen; never moves backwards.
    now: Duration,
}

impl Inner {
    /// Bulk read, snapshot and estimator update at the clock's present time.
    fn refresh(&mut self, clock: &RobotClock) -> Result<&StatusSnapshot, ControlError> {
        self.now = self.now.max(Duration::from_nanos(clock.now().as_nanos()));
        let now = self.now;
        self.ctrl.refresh(now)
    }

    /// Aligns a playback-owned tracking session with the waypoint playing.
    fn follow_linked_focus(&mut self) {
        let Some(target) = self
            .sessions
            .playback
            .as_ref()
            .filter(|p| p.profile().is_focus_linked())
            .and_then(PlaybackSession::focus_target)
        else {
            return;
        };
        match self.sessions.tracking.as_mut() {
            Some(t) if t.owner == Owner::Playback => t.retarget(target),
            Some(_) => {}
            None => {
                info!("playback tracking point {target}");
                self.sessions.tracking = Some(TrackingSession::new(target, Owner::Playback));
            }
        }
    }

    fn advance_playback(&mut self) {
        let Some(session) = self.sessions.playback.as_mut() else {
            return;
        };
        let arrival = self.config.playback.arrival;
        match session.tick(&mut self.ctrl, &arrival, self.now) {
            Ok(Step::Waiting) => {}
            Ok(Step::Advanced(index)) => {
                debug!("playback at point {index}");
                self.follow_linked_focus();
            }
            Ok(Step::Finished) => {
                self.sessions.playback = None;
                if let Some(t) = self.sessions.tracking.as_mut()
                    && t.owner == Owner::Playback
                {
                    info!("tracking of point {} handed to the operator", t.point_id);
                    t.owner = Owner::Operator;
                }
            }
            Err(e) => warn!("playback: {e}, retrying next tick"),
        }
    }

    fn update_tracking(&mut self) {
        let Some(session) = self.sessions.tracking.as_mut() else {
            return;
        };
        let Some(point) = self.points.get(session.point_id) else {
            warn!("tracked point {} vanished, stopping tracking", session.point_id);
            self.sessions.tracking = None;
            return;
        };
        if let Err(e) = session.update(point, &mut self.ctrl, &self.config.tracking) {
            warn!("tracking point {}: {e}", session.point_id);
        }
    }

    fn playback_status(&self) -> PlaybackStatus {
        self.sessions
            .playback
            .as_ref()
            .map_or_else(PlaybackStatus::idle, PlaybackSession::status)
    }

    fn tracking_status(&self) -> TrackingStatus {
        TrackingStatus::of(self.sessions.tracking.as_ref())
    }
}

/// Serialises every bus access, estimator update and session change.
///
/// Each operation takes the one lock for its whole duration, so a stop that
/// has returned can't be followed by a command from the stopped session.
pub struct SliderRig {
    inner: Mutex<Inner>,
    clock: RobotClock,
}

impl SliderRig {
    /// Opens the point and profile stores under `config.data_dir`, or keeps
    /// them in memory when it is unset. The bus is not touched.
    ///
    /// Every tick and estimate is stamped from `clock`.
    pub fn new(config: SystemConfig, bus: Box<dyn BusGateway>, clock: RobotClock) -> Result<Self, ControlError> {
        let (points, profiles) = match &config.data_dir {
            Some(dir) => (
                PointStore::open(dir.join(POINTS_FILE))?,
                ProfileStore::open(dir.join(PROFILES_DIR))?,
            ),
            None => (PointStore::in_memory(), ProfileStore::in_memory()),
        };
        let ctrl = MotionController::new(&config, bus);
        let claims = AxisClaims::new(&config.tracking);
        Ok(Self {
            inner: Mutex::new(Inner {
                config,
                ctrl,
                points,
                profiles,
                claims,
                sessions: Sessions::default(),
                now: Duration::ZERO,
            }),
            clock,
        })
    }

    pub fn clock(&self) -> &RobotClock {
        &self.clock
    }

    pub fn initialize(&self) -> Vec<MotorFailure> {
        self.inner.lock().ctrl.initialize()
    }

    pub fn config(&self) -> SystemConfig {
        self.inner.lock().config.clone()
    }

    pub fn converter(&self) -> UnitConverter {
        self.inner.lock().ctrl.converter().clone()
    }

    /// One polling cycle at the clock's present time: bulk read and
    /// snapshot, then playback, then tracking. A failed bulk read skips the
    /// rest; both sessions wait for fresh positions.
    pub fn tick(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        inner.refresh(&self.clock)?;
        inner.advance_playback();
        inner.update_tracking();
        Ok(())
    }

    /// A fresh bulk read, outside the tick schedule.
    pub fn bulk_status(&self) -> Result<StatusSnapshot, ControlError> {
        self.inner.lock().refresh(&self.clock).cloned()
    }

    /// The last published snapshot, possibly stale.
    pub fn cached_status(&self) -> Option<StatusSnapshot> {
        self.inner.lock().ctrl.snapshot().cloned()
    }

    pub fn set_goal(&self, id: MotorId, target: i32, velocity: u32) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        inner.ctrl.validate_goal(id, target, velocity)?;
        let Inner { sessions, claims, .. } = &mut *inner;
        sessions.yield_to_manual(id, claims);
        inner.ctrl.set_goal(id, target, velocity)
    }

    /// Takes the present position of `id` as its new zero. Sessions driving
    /// the motor are stopped first, as for a manual goal.
    pub fn home(&self, id: MotorId) -> Result<i32, ControlError> {
        let mut inner = self.inner.lock();
        inner.ctrl.motor(id)?;
        let Inner { sessions, claims, .. } = &mut *inner;
        sessions.yield_to_manual(id, claims);
        inner.ctrl.home(id)
    }

    pub fn set_profile_acceleration(&self, id: MotorId, acceleration: u32) -> Result<(), ControlError> {
        self.inner.lock().ctrl.set_profile_acceleration(id, acceleration)
    }

    /// Releasing torque on a motor a session drives ends that session.
    pub fn set_torque(&self, target: TorqueTarget, enabled: bool) -> Result<Vec<MotorId>, ControlError> {
        let mut inner = self.inner.lock();
        if !enabled {
            let ids: Vec<MotorId> = match target {
                TorqueTarget::One(id) => {
                    inner.ctrl.motor(id)?;
                    vec![id]
                }
                TorqueTarget::All => inner.ctrl.motor_ids().collect(),
            };
            let Inner { sessions, claims, .. } = &mut *inner;
            for id in ids {
                sessions.yield_to_manual(id, claims);
            }
        }
        inner.ctrl.set_torque(target, enabled)
    }

    pub fn pid_gains(&self, id: MotorId) -> Result<PidGains, ControlError> {
        self.inner.lock().ctrl.read_pid_gains(id)
    }

    pub fn set_pid_gains(&self, id: MotorId, gains: PidGains) -> Result<(), ControlError> {
        self.inner.lock().ctrl.set_pid_gains(id, gains)
    }

    pub fn list_profiles(&self) -> Vec<ProfileSummary> {
        self.inner.lock().profiles.list()
    }

    pub fn save_profile(&self, profile: Profile) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        profile.validate(|id| inner.ctrl.limits(id))?;
        inner.profiles.save(profile)
    }

    pub fn load_profile(&self, name: &str) -> Result<Profile, ControlError> {
        self.inner.lock().profiles.load(name)
    }

    pub fn delete_profile(&self, name: &str) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.sessions.playback.as_ref().is_some_and(|p| p.profile().name == name) {
            return Err(ControlError::Conflict(format!("profile '{name}' is playing")));
        }
        inner.profiles.delete(name)
    }

    pub fn play(&self, name: &str, options: PlayOptions) -> Result<PlaybackStatus, ControlError> {
        let profile = self.inner.lock().profiles.load(name)?;
        self.play_profile(profile, options)
    }

    /// Starts `profile`, stored or not.
    ///
    /// Tracking on the shared axes is stopped before the acceleration and
    /// the first waypoint are written. If either write fails the call
    /// errors and that tracking session is put back, so the axes keep a
    /// driver.
    pub fn play_profile(&self, profile: Profile, options: PlayOptions) -> Result<PlaybackStatus, ControlError> {
        let mut inner = self.inner.lock();
        if let Some(active) = &inner.sessions.playback {
            return Err(ControlError::AlreadyPlaying(active.profile().name.clone()));
        }
        if profile.points.is_empty() {
            return Err(ControlError::EmptyProfile(profile.name));
        }
        profile.validate(|id| inner.ctrl.limits(id))?;
        for id in profile.points.iter().filter_map(|p| p.focus_point_id) {
            inner.points.require(id)?;
        }

        let claim = inner.claims.playback_claim(&profile);
        let linked = profile.is_focus_linked();
        let Inner { sessions, claims, .. } = &mut *inner;
        let stopped = sessions.yield_to_playback(&claim, linked, claims);

        let now = inner.now;
        let mut session = PlaybackSession::new(profile, options, claim);
        if let Err(e) = session
            .prepare(&mut inner.ctrl)
            .and_then(|()| session.issue(&mut inner.ctrl, now))
        {
            if let Some(mut tracking) = stopped {
                info!("tracking of point {} resumed, playback failed to start", tracking.point_id);
                tracking.invalidate();
                inner.sessions.tracking = Some(tracking);
            }
            return Err(e);
        }
        info!(
            "playing '{}' ({} points{})",
            session.profile().name,
            session.profile().points.len(),
            if options.repeat { ", repeating" } else { "" }
        );
        inner.sessions.playback = Some(session);
        inner.follow_linked_focus();
        Ok(inner.playback_status())
    }

    /// Idle on return. With `hold_on_stop` the released motors are
    /// commanded to where they are; a failed hold is logged only.
    pub fn stop_playback(&self) -> PlaybackStatus {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.end_playback() {
            info!("playback '{}' stopped at point {}", session.profile().name, session.index());
            if inner.config.playback.hold_on_stop {
                for &id in session.claimed() {
                    if let Err(e) = inner.ctrl.hold(id) {
                        warn!("motor {id}: hold after stop failed: {e}");
                    }
                }
            }
        }
        inner.playback_status()
    }

    pub fn playback_status(&self) -> PlaybackStatus {
        self.inner.lock().playback_status()
    }

    pub fn list_points(&self) -> Vec<FocusPoint> {
        self.inner.lock().points.list()
    }

    pub fn point(&self, id: PointId) -> Result<FocusPoint, ControlError> {
        self.inner.lock().points.require(id).cloned()
    }

    pub fn add_point(&self, point: NewFocusPoint) -> Result<FocusPoint, ControlError> {
        self.inner.lock().points.add(point)
    }

    /// Takes effect on the next tick if the point is being tracked.
    pub fn update_point(&self, id: PointId, patch: FocusPointPatch) -> Result<FocusPoint, ControlError> {
        self.inner.lock().points.update(id, patch)
    }

    /// Stops tracking first when `id` is the tracked point.
    pub fn delete_point(&self, id: PointId) -> Result<FocusPoint, ControlError> {
        let mut inner = self.inner.lock();
        inner.points.require(id)?;
        if inner.sessions.tracking.as_ref().is_some_and(|t| t.point_id == id) {
            info!("tracked point {id} deleted, stopping tracking");
            inner.sessions.tracking = None;
        }
        inner.points.delete(id)
    }

    /// Replaces any running session and aims right away when a slider
    /// position is known.
    pub fn start_tracking(&self, id: PointId) -> Result<TrackingStatus, ControlError> {
        let mut inner = self.inner.lock();
        inner.points.require(id)?;
        let Inner { sessions, claims, .. } = &mut *inner;
        sessions.yield_to_tracking(claims);
        inner.sessions.tracking = Some(TrackingSession::new(id, Owner::Operator));
        info!("tracking point {id}");
        inner.update_tracking();
        Ok(inner.tracking_status())
    }

    pub fn stop_tracking(&self) -> TrackingStatus {
        let mut inner = self.inner.lock();
        if let Some(t) = inner.sessions.tracking.take() {
            info!("tracking of point {} stopped", t.point_id);
        }
        inner.tracking_status()
    }

    pub fn tracking_status(&self) -> TrackingStatus {
        self.inner.lock().tracking_status()
    }
}
