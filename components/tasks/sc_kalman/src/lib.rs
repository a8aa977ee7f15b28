//! State estimation for the filtered slider axes.
//!
//! Each filtered axis (slider, pan, tilt) owns an independent
//! constant-velocity Kalman filter ([`AxisFilter`]) over the state
//! `[position, velocity]` on `nalgebra` 2x2 matrices, in the axis' display
//! unit (mm or degrees). The filters are grouped in an [`EstimatorBank`]
//! keyed by motor id, which the controller feeds exactly once per bulk-read
//! cycle in ascending id order.
//!
//! Clock anomalies and missing samples never surface as errors: a
//! non-positive time step skips the prediction, a missing sample coasts the
//! filter, and both simply show up as a larger `uncertainty`.

mod bands;
mod bank;
mod filter;

pub use bands::{Band, Level};
pub use bank::EstimatorBank;
pub use filter::{AxisFilter, Estimate};

use serde::{Deserialize, Serialize};

/// Bus id of a filtered axis.
pub type AxisId = u8;

/// Process noise added per nominal time step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessNoise {
    pub position: f64,
    pub velocity: f64,
}

/// Tuning of one filter.
///
/// Defaults are the "balanced" tuning used on the rig: they favour a smooth
/// pan/tilt estimate while still following a 100 Hz sample stream closely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanParams {
    pub process_noise: ProcessNoise,
    /// Variance of one position sample (R).
    pub measurement_noise: f64,
    /// Initial diagonal of P, also the upper bound of the reported uncertainty.
    pub initial_uncertainty: f64,
    /// Time step `process_noise` is expressed for, in milliseconds.
    pub nominal_dt_ms: f64,
}

impl Default for KalmanParams {
    fn default() -> Self {
        Self {
            process_noise: ProcessNoise {
                position: 0.005,
                velocity: 0.08,
            },
            measurement_noise: 0.7,
            initial_uncertainty: 80.0,
            nominal_dt_ms: 10.0,
        }
    }
}

impl KalmanParams {
    /// Checks that every term is finite and strictly positive.
    pub fn validate(&self) -> Result<(), String> {
        let terms = [
            ("process_noise.position", self.process_noise.position),
            ("process_noise.velocity", self.process_noise.velocity),
            ("measurement_noise", self.measurement_noise),
            ("initial_uncertainty", self.initial_uncertainty),
            ("nominal_dt_ms", self.nominal_dt_ms),
        ];
        for (name, value) in terms {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("kalman {name} must be > 0, got {value}"));
            }
        }
        Ok(())
    }
}
