//! Rig configuration, read from a RON file.
//!
//! Every field has a default, so an empty `()` document describes the stock
//! six-axis slider on `/dev/ttyUSB0`.

use crate::motor::Limits;
use crate::playback::PlaybackConfig;
use crate::snapshot::TelemetryThresholds;
use crate::tracking::TrackingConfig;
use sc_dynamixel::calibration::CalibrationData;
use sc_kalman::{Band, KalmanParams};
use sc_units::{
    AxisKind, AxisScale, MAX_STEP, MotorId, PAN_TILT_OFFSET_DEG, SLIDER_MM_PER_REV, UnitConverter, axis,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("calibration {path}: {source}")]
    Calibration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub device: String,
    pub baud: u32,
    /// Per-transaction timeout.
    pub timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".into(),
            baud: 2_000_000,
            timeout_ms: 1000,
        }
    }
}

impl BusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_max() -> i32 {
    MAX_STEP
}

/// Stock Current Limit for every axis.
pub const DEFAULT_CURRENT_LIMIT: u16 = 400;

fn default_current_limit() -> Option<u16> {
    Some(DEFAULT_CURRENT_LIMIT)
}

/// Static description of one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub id: MotorId,
    pub name: String,
    pub kind: AxisKind,
    /// Degrees or millimetres per revolution.
    pub units_per_rev: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub min: i32,
    #[serde(default = "default_max")]
    pub max: i32,
    /// Runs a Kalman filter over this axis' position.
    #[serde(default)]
    pub filtered: bool,
    /// Current Limit register value written by `initialize`; `None` keeps
    /// whatever the servo has stored.
    #[serde(default = "default_current_limit")]
    pub current_limit: Option<u16>,
}

impl MotorConfig {
    fn rotational(id: MotorId, offset: f64, filtered: bool) -> Self {
        Self {
            id,
            name: axis::name(id).unwrap_or("motor").into(),
            kind: AxisKind::Rotational,
            units_per_rev: 360.0,
            offset,
            min: 0,
            max: MAX_STEP,
            filtered,
            current_limit: default_current_limit(),
        }
    }

    pub fn scale(&self) -> AxisScale {
        AxisScale {
            kind: self.kind,
            units_per_rev: self.units_per_rev,
            offset: self.offset,
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            min: self.min,
            max: self.max,
        }
    }
}

fn default_motors() -> Vec<MotorConfig> {
    vec![
        MotorConfig::rotational(axis::TURNTABLE, 0.0, false),
        MotorConfig {
            id: axis::SLIDER,
            name: "slider".into(),
            kind: AxisKind::Linear,
            units_per_rev: SLIDER_MM_PER_REV,
            offset: 0.0,
            min: 0,
            max: MAX_STEP,
            filtered: true,
            current_limit: default_current_limit(),
        },
        MotorConfig::rotational(axis::PAN, PAN_TILT_OFFSET_DEG, true),
        MotorConfig::rotational(axis::TILT, PAN_TILT_OFFSET_DEG, true),
        MotorConfig::rotational(axis::ZOOM, 0.0, false),
        MotorConfig::rotational(axis::FOCUS, 0.0, false),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub kalman: KalmanParams,
    pub prediction_error: Band,
    pub uncertainty: Band,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            kalman: KalmanParams::default(),
            prediction_error: Band::new(10.0),
            uncertainty: Band::new(20.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub bus: BusConfig,
    /// Poll period of the bulk-read / playback / tracking tick.
    pub tick_ms: u64,
    #[serde(default = "default_motors")]
    pub motors: Vec<MotorConfig>,
    pub estimator: EstimatorConfig,
    pub playback: PlaybackConfig,
    pub tracking: TrackingConfig,
    pub telemetry: TelemetryThresholds,
    /// Where profiles and focus points are persisted; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// `dxl-calibrate` output narrowing the motors' limits.
    pub calibration: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            tick_ms: 50,
            motors: default_motors(),
            estimator: EstimatorConfig::default(),
            playback: PlaybackConfig::default(),
            tracking: TrackingConfig::default(),
            telemetry: TelemetryThresholds::default(),
            data_dir: None,
            calibration: None,
        }
    }
}

impl SystemConfig {
    pub const TICK_MS: std::ops::RangeInclusive<u64> = 20..=100;
    pub const TIMEOUT_MS: std::ops::RangeInclusive<u64> = 1000..=2000;

    pub fn parse(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    /// Reads, applies the calibration file if any, and validates.
    ///
    /// Relative `data_dir` and `calibration` paths are resolved against the
    /// directory of the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(dir) = config.data_dir.as_mut() {
            resolve(dir);
        }
        if let Some(cal) = config.calibration.as_mut() {
            resolve(cal);
            let data = CalibrationData::load(cal).map_err(|source| ConfigError::Calibration {
                path: cal.clone(),
                source,
            })?;
            config.apply_calibration(&data);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn motor(&self, id: MotorId) -> Option<&MotorConfig> {
        self.motors.iter().find(|m| m.id == id)
    }

    /// Narrows each calibrated motor's limits to the recorded range.
    pub fn apply_calibration(&mut self, data: &CalibrationData) {
        for motor in &mut self.motors {
            if let Some(range) = data.range_for(motor.id) {
                motor.min = motor.min.max(i32::from(range.min));
                motor.max = motor.max.min(i32::from(range.max));
            }
        }
    }

    pub fn converter(&self) -> UnitConverter {
        self.motors
            .iter()
            .fold(UnitConverter::new(), |conv, m| conv.with_axis(m.id, m.scale()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !Self::TICK_MS.contains(&self.tick_ms) {
            return invalid(format!("tick_ms {} outside {:?}", self.tick_ms, Self::TICK_MS));
        }
        if !Self::TIMEOUT_MS.contains(&self.bus.timeout_ms) {
            return invalid(format!(
                "bus.timeout_ms {} outside {:?}",
                self.bus.timeout_ms,
                Self::TIMEOUT_MS
            ));
        }
        if self.motors.is_empty() {
            return invalid("no motors configured".into());
        }

        let mut seen = BTreeSet::new();
        for m in &self.motors {
            if !seen.insert(m.id) {
                return invalid(format!("duplicate motor id {}", m.id));
            }
            if !(m.units_per_rev.is_finite() && m.units_per_rev > 0.0) || !m.offset.is_finite() {
                return invalid(format!("motor {}: bad scale", m.id));
            }
            if m.min < 0 || m.max > MAX_STEP || m.min > m.max {
                return invalid(format!("motor {}: limits {}..={} outside 0..={MAX_STEP}", m.id, m.min, m.max));
            }
            if m.current_limit == Some(0) {
                return invalid(format!("motor {}: current_limit must be positive", m.id));
            }
        }

        self.estimator.kalman.validate().map_err(ConfigError::Invalid)?;
        for (name, band) in [
            ("prediction_error", self.estimator.prediction_error),
            ("uncertainty", self.estimator.uncertainty),
        ] {
            if !(band.error > 0.0 && (0.0..=1.0).contains(&band.warning_ratio)) {
                return invalid(format!("estimator.{name} band is invalid"));
            }
        }

        self.playback.validate().map_err(ConfigError::Invalid)?;
        self.tracking.validate().map_err(ConfigError::Invalid)?;
        if let Some(drive) = &self.tracking.focus
            && self.motor(drive.motor).is_none()
        {
            return invalid(format!("focus drive motor {} is not configured", drive.motor));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::Arrival;
    use sc_dynamixel::calibration::MotorRange;

    #[test]
    fn empty_document_is_the_stock_rig() {
        let config = SystemConfig::parse("()").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.motors.len(), 6);
        assert_eq!(
            config.motors.iter().filter(|m| m.filtered).map(|m| m.id).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(config.bus.baud, 2_000_000);
        assert_eq!(config.tick(), Duration::from_millis(50));
    }

    #[test]
    fn parses_partial_documents() {
        let config = SystemConfig::parse(
            r#"(
                tick_ms: 20,
                bus: (device: "/dev/ttyACM0"),
                playback: (arrival: Timed(settle_ms: 250), hold_on_stop: false),
                tracking: (lead_ms: 40),
                data_dir: Some("/var/lib/slidercam"),
            )"#,
        )
        .unwrap();
        assert_eq!(config.tick_ms, 20);
        assert_eq!(config.bus.device, "/dev/ttyACM0");
        assert_eq!(config.bus.timeout_ms, 1000);
        assert_eq!(config.playback.arrival, Arrival::Timed { settle_ms: 250 });
        assert!(!config.playback.hold_on_stop);
        assert_eq!(config.tracking.lead_ms, 40);
        assert_eq!(config.tracking.velocity, 800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_timing_and_duplicate_ids() {
        let mut c = SystemConfig { tick_ms: 10, ..SystemConfig::default() };
        assert!(c.validate().is_err());
        c.tick_ms = 100;
        c.bus.timeout_ms = 3000;
        assert!(c.validate().is_err());
        c.bus.timeout_ms = 2000;
        assert!(c.validate().is_ok());
        let dup = c.motors[0].clone();
        c.motors.push(dup);
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn current_limits_and_arrival_tolerances_parse() {
        let config = SystemConfig::parse(
            r#"(
                motors: [
                    (id: 2, name: "slider", kind: linear, units_per_rev: 64.0, current_limit: Some(300)),
                    (id: 3, name: "pan", kind: rotational, units_per_rev: 360.0, current_limit: None),
                    (id: 4, name: "tilt", kind: rotational, units_per_rev: 360.0),
                ],
                playback: (arrival: Position(tolerance: 5, timeout_ms: 1000)),
            )"#,
        )
        .unwrap();
        assert_eq!(config.motor(2).unwrap().current_limit, Some(300));
        assert_eq!(config.motor(3).unwrap().current_limit, None);
        assert_eq!(config.motor(4).unwrap().current_limit, Some(DEFAULT_CURRENT_LIMIT));
        assert_eq!(
            config.playback.arrival,
            Arrival::Position {
                tolerance: 5,
                pan_tilt_tolerance: 20,
                timeout_ms: 1000
            }
        );

        let mut zero = SystemConfig::default();
        zero.motors[1].current_limit = Some(0);
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("current_limit")));
    }

    #[test]
    fn calibration_only_narrows_limits() {
        let mut c = SystemConfig::default();
        c.motors[2].min = 500;
        c.apply_calibration(&CalibrationData {
            motors: vec![MotorRange { id: 3, min: 100, max: 3500 }],
        });
        let pan = c.motor(3).unwrap();
        assert_eq!((pan.min, pan.max), (500, 3500));
        assert_eq!(c.motor(4).unwrap().max, MAX_STEP);
    }

    #[test]
    fn load_resolves_relative_paths_next_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        CalibrationData {
            motors: vec![MotorRange { id: 4, min: 1200, max: 2900 }],
        }
        .save(&dir.path().join("calibration.json"))
        .unwrap();
        let path = dir.path().join("slidercam.ron");
        std::fs::write(
            &path,
            r#"(data_dir: Some("data"), calibration: Some("calibration.json"))"#,
        )
        .unwrap();

        let config = SystemConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, Some(dir.path().join("data")));
        let tilt = config.motor(4).unwrap();
        assert_eq!((tilt.min, tilt.max), (1200, 2900));
    }

    #[test]
    fn converter_follows_the_motor_table() {
        let conv = SystemConfig::default().converter();
        assert_eq!(conv.steps_to_units(2048, 3).unwrap(), 0.0);
        assert_eq!(conv.steps_to_units(4096, 2).unwrap(), 64.0);
    }
}
