use crate::KalmanParams;
use log::trace;
use nalgebra::{Matrix2, RowVector2, Vector2};
use serde::Serialize;
use std::time::Duration;

/// Snapshot of one filter's belief.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub position: f64,
    pub velocity: f64,
    /// |observed - predicted| of the last fused sample.
    pub prediction_error: f64,
    /// Position variance of the posterior (P00).
    pub uncertainty: f64,
    /// Number of samples fused so far.
    pub samples: u64,
}

/// Constant-velocity Kalman filter over `[position, velocity]`.
#[derive(Debug, Clone)]
pub struct AxisFilter {
    params: KalmanParams,
    x: Vector2<f64>,
    p: Matrix2<f64>,
    last_update: Option<Duration>,
    last_error: f64,
    samples: u64,
}

// Only the position is observed.
fn observation() -> RowVector2<f64> {
    RowVector2::new(1.0, 0.0)
}

impl AxisFilter {
    pub fn new(params: KalmanParams) -> Self {
        Self {
            params,
            x: Vector2::zeros(),
            p: Matrix2::identity() * params.initial_uncertainty,
            last_update: None,
            last_error: 0.0,
            samples: 0,
        }
    }

    pub fn params(&self) -> &KalmanParams {
        &self.params
    }

    pub fn is_initialized(&self) -> bool {
        self.samples > 0
    }

    pub fn last_update(&self) -> Option<Duration> {
        self.last_update
    }

    /// Current belief. Before the first sample this is the conservative
    /// default: zero position and velocity at the initial uncertainty.
    pub fn estimate(&self) -> Estimate {
        Estimate {
            position: self.x[0],
            velocity: self.x[1],
            prediction_error: self.last_error,
            uncertainty: self.p[(0, 0)],
            samples: self.samples,
        }
    }

    /// Position extrapolated `lead` ahead of the last update.
    pub fn predict_position(&self, lead: Duration) -> f64 {
        self.x[0] + self.x[1] * lead.as_secs_f64()
    }

    /// Fuses one position sample taken at `now`.
    ///
    /// A non-finite sample is treated as missing and only coasts the filter.
    pub fn observe(&mut self, measurement: f64, now: Duration) -> Estimate {
        if !measurement.is_finite() {
            return self.coast(now);
        }

        if !self.is_initialized() {
            self.x = Vector2::new(measurement, 0.0);
            self.last_update = Some(now);
            self.last_error = 0.0;
            self.samples = 1;
            return self.estimate();
        }

        if let Some(dt) = self.elapsed(now) {
            self.predict(dt);
            self.last_update = Some(now);
        } else {
            trace!("kalman: non-positive time step, fusing without prediction");
        }

        let h = observation();
        let r = self.params.measurement_noise;
        let innovation = measurement - (h * self.x)[0];
        let s = (h * self.p * h.transpose())[0] + r;
        let gain: Vector2<f64> = self.p * h.transpose() / s;

        self.x += gain * innovation;

        // Joseph form keeps P symmetric positive semi-definite.
        let i_kh = Matrix2::identity() - gain * h;
        self.p = i_kh * self.p * i_kh.transpose() + gain * gain.transpose() * r;
        self.symmetrize();

        self.last_error = innovation.abs();
        self.samples += 1;
        self.estimate()
    }

    /// Prediction-only step for a cycle without a sample.
    pub fn coast(&mut self, now: Duration) -> Estimate {
        if self.is_initialized()
            && let Some(dt) = self.elapsed(now)
        {
            self.predict(dt);
            self.last_update = Some(now);
        }
        self.estimate()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.params);
    }

    /// Seconds since the last update, `None` when the clock did not advance.
    fn elapsed(&self, now: Duration) -> Option<f64> {
        let last = self.last_update?;
        let dt = now.checked_sub(last)?.as_secs_f64();
        (dt > 0.0).then_some(dt)
    }

    fn predict(&mut self, dt: f64) {
        let f = Matrix2::new(1.0, dt, 0.0, 1.0);
        let scale = dt * 1000.0 / self.params.nominal_dt_ms;
        let q = &self.params.process_noise;
        let noise = Matrix2::from_diagonal(&Vector2::new(q.position, q.velocity)) * scale;

        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + noise;
        self.symmetrize();
        self.bound();
    }

    fn symmetrize(&mut self) {
        self.p = (self.p + self.p.transpose()) * 0.5;
    }

    // Keeps P00 at or below the initial uncertainty; scaling the whole matrix
    // keeps it positive semi-definite.
    fn bound(&mut self) {
        let cap = self.params.initial_uncertainty;
        let p00 = self.p[(0, 0)];
        if p00 > cap {
            self.p *= cap / p00;
            self.p[(0, 0)] = cap;
        }
    }
}
