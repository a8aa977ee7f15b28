//! Control core of the slidercam rig.
//!
//! [`SliderRig`] owns the servo bus, the per-axis estimators, the profile
//! and focus point stores, and the two long-running sessions (profile
//! playback and focus tracking). Everything runs under one lock and is
//! advanced by a periodic tick stamped from the rig's
//! [`cu29_clock::RobotClock`], usually from a [`Poller`]:
//!
//! ```text
//! bulk read -> estimators (ascending id) -> snapshot -> playback -> tracking
//! ```
//!
//! The bus itself is any [`sc_dynamixel::BusGateway`]; tests and the
//! daemon's `--sim` mode use [`sc_dynamixel::SimBus`] on the same clock,
//! with `RobotClock::mock()` standing in for wall time in tests.

pub mod arbitration;
pub mod config;
pub mod controller;
pub mod error;
pub mod motor;
pub mod playback;
pub mod points;
mod poller;
pub mod profiles;
pub mod snapshot;
mod storage;
mod system;
pub mod tracking;

pub use config::{ConfigError, SystemConfig};
pub use controller::{MotionController, TorqueTarget};
pub use error::{CommandOutcome, ControlError, ErrorKind, MotorFailure};
pub use motor::PidGains;
pub use playback::{Arrival, PlayOptions, PlaybackStatus};
pub use points::{FocusPoint, FocusPointPatch, NewFocusPoint, PointId};
pub use poller::Poller;
pub use profiles::{Profile, ProfilePoint, ProfileSummary};
pub use snapshot::{MotorSnapshot, StatusSnapshot};
pub use storage::StorageError;
pub use system::SliderRig;
pub use tracking::{Owner, TrackingStatus};
