//! Who may write which axis.
//!
//! Three drivers compete for the motors: manual commands, profile playback
//! and focus tracking. The slider, pan and tilt (and focus, when tracking
//! drives it) form the shared set; whenever a driver starts on it, the
//! others lose their write path there before the new driver's first
//! command goes out.

use crate::playback::PlaybackSession;
use crate::profiles::Profile;
use crate::tracking::{Owner, TrackingConfig, TrackingSession};
use log::info;
use sc_units::{MotorId, axis};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisClaims {
    tracking: BTreeSet<MotorId>,
    shared: BTreeSet<MotorId>,
}

impl AxisClaims {
    pub fn new(config: &TrackingConfig) -> Self {
        let tracking: BTreeSet<MotorId> = config.driven_axes().into_iter().collect();
        let mut shared = tracking.clone();
        shared.insert(axis::SLIDER);
        Self { tracking, shared }
    }

    /// Motors a tracking session writes.
    pub fn tracking(&self) -> &BTreeSet<MotorId> {
        &self.tracking
    }

    pub fn shared(&self) -> &BTreeSet<MotorId> {
        &self.shared
    }

    /// Motors a playback of `profile` writes. Focus-linked profiles leave
    /// the tracked axes to their tracking session.
    pub fn playback_claim(&self, profile: &Profile) -> BTreeSet<MotorId> {
        let ids = profile.motor_ids();
        if profile.is_focus_linked() {
            ids.difference(&self.tracking).copied().collect()
        } else {
            ids
        }
    }
}

/// The two long-running drivers. At most one of each exists.
#[derive(Debug, Default)]
pub struct Sessions {
    pub playback: Option<PlaybackSession>,
    pub tracking: Option<TrackingSession>,
}

impl Sessions {
    pub fn playback_owns_tracking(&self) -> bool {
        self.tracking.as_ref().is_some_and(|t| t.owner == Owner::Playback)
    }

    /// Ends playback, along with the tracking session it started.
    pub fn end_playback(&mut self) -> Option<PlaybackSession> {
        let session = self.playback.take()?;
        if self.playback_owns_tracking() {
            self.tracking = None;
        }
        Some(session)
    }

    /// A manual command is about to be written to `id`.
    pub fn yield_to_manual(&mut self, id: MotorId, claims: &AxisClaims) {
        if self.playback.as_ref().is_some_and(|p| p.claims(id))
            && let Some(p) = self.end_playback()
        {
            info!("playback '{}' stopped by a manual command on motor {id}", p.profile().name);
        }
        if claims.tracking().contains(&id)
            && let Some(t) = self.tracking.take()
        {
            info!("tracking of point {} stopped by a manual command on motor {id}", t.point_id);
        }
    }

    /// Operator tracking is about to start: playback gives up the shared
    /// axes and keeps going on the rest.
    pub fn yield_to_tracking(&mut self, claims: &AxisClaims) {
        let shared: Vec<MotorId> = claims.shared().iter().copied().collect();
        if let Some(p) = self.playback.as_mut()
            && p.release(&shared)
        {
            info!("playback '{}' stopped: tracking took its last axes", p.profile().name);
            self.playback = None;
        }
        self.tracking = None;
    }

    /// A playback writing `claim` is about to start. Returns the tracking
    /// session it stopped, if any.
    pub fn yield_to_playback(
        &mut self,
        claim: &BTreeSet<MotorId>,
        focus_linked: bool,
        claims: &AxisClaims,
    ) -> Option<TrackingSession> {
        let overlaps = !claim.is_disjoint(claims.shared());
        if !(overlaps || focus_linked) {
            return None;
        }
        let t = self.tracking.take()?;
        info!("tracking of point {} stopped for playback", t.point_id);
        Some(t)
    }
}
