use sc_kalman::{Band, Estimate, Level};
use sc_units::MotorId;
use serde::{Deserialize, Serialize};

use crate::motor::PidGains;

/// Telemetry metric an alert refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Voltage,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Alert {
    pub metric: Metric,
    pub level: Level,
    pub value: f64,
}

/// Warning/error thresholds for servo telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryThresholds {
    /// °C
    pub temperature_warning: f64,
    pub temperature_error: f64,
    /// V; alerts fire below these.
    pub voltage_warning: f64,
    pub voltage_error: f64,
    /// mA, on the absolute current.
    pub current_warning: f64,
    pub current_error: f64,
}

impl Default for TelemetryThresholds {
    fn default() -> Self {
        Self {
            temperature_warning: 55.0,
            temperature_error: 65.0,
            voltage_warning: 11.5,
            voltage_error: 11.0,
            current_warning: 800.0,
            current_error: 1000.0,
        }
    }
}

impl TelemetryThresholds {
    pub fn alerts(&self, temperature: f64, voltage: f64, current: f64) -> Vec<Alert> {
        let above = |value: f64, warning: f64, error: f64| {
            if value >= error {
                Level::Error
            } else if value >= warning {
                Level::Warning
            } else {
                Level::Ok
            }
        };
        let voltage_level = if voltage < self.voltage_error {
            Level::Error
        } else if voltage < self.voltage_warning {
            Level::Warning
        } else {
            Level::Ok
        };

        [
            (
                Metric::Temperature,
                above(temperature, self.temperature_warning, self.temperature_error),
                temperature,
            ),
            (Metric::Voltage, voltage_level, voltage),
            (
                Metric::Current,
                above(current.abs(), self.current_warning, self.current_error),
                current,
            ),
        ]
        .into_iter()
        .filter(|(_, level, _)| *level != Level::Ok)
        .map(|(metric, level, value)| Alert { metric, level, value })
        .collect()
    }
}

/// Estimator output merged into a filtered motor's snapshot, in the axis unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EstimateReport {
    pub estimated_position: f64,
    pub estimated_velocity: f64,
    pub prediction_error: f64,
    pub filter_uncertainty: f64,
    pub prediction_error_level: Level,
    pub uncertainty_level: Level,
    pub samples: u64,
}

impl EstimateReport {
    pub fn new(e: &Estimate, prediction_error: &Band, uncertainty: &Band) -> Self {
        Self {
            estimated_position: e.position,
            estimated_velocity: e.velocity,
            prediction_error: e.prediction_error,
            filter_uncertainty: e.uncertainty,
            prediction_error_level: prediction_error.classify(e.prediction_error),
            uncertainty_level: uncertainty.classify(e.uncertainty),
            samples: e.samples,
        }
    }
}

/// One motor's entry in a bulk status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorSnapshot {
    pub id: MotorId,
    pub name: String,
    /// Raw steps, normalised to one revolution.
    pub raw_position: i32,
    /// Axis unit, two decimals.
    pub position: f64,
    pub unit: &'static str,
    pub goal: Option<i32>,
    pub temperature: f64,
    pub voltage: f64,
    pub current: f64,
    pub load: f64,
    pub torque_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<EstimateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<PidGains>,
    pub alerts: Vec<Alert>,
}

/// Result of one successful bulk read, one entry per known motor in
/// ascending id order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Controller clock at the time of the read.
    pub taken_at_ms: u64,
    pub motors: Vec<MotorSnapshot>,
}

impl StatusSnapshot {
    pub fn motor(&self, id: MotorId) -> Option<&MotorSnapshot> {
        self.motors.iter().find(|m| m.id == id)
    }
}
