//! Recorded travel limits for the rig's servos.
//!
//! Each motor has a recorded min and max raw position, captured by moving it
//! by hand through its safe range with torque off. The controller narrows
//! its goal-position limits to these values when a calibration file is
//! configured.
//!
//! Run the `dxl-calibrate` binary to generate a `calibration.json`.

use crate::gateway::MotorId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Travel range of a single motor, in raw steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorRange {
    pub id: MotorId,
    pub min: u16,
    pub max: u16,
}

impl MotorRange {
    pub fn center(&self) -> f32 {
        (self.min as f32 + self.max as f32) / 2.0
    }

    /// Total usable range in raw steps.
    pub fn span(&self) -> u16 {
        self.max.saturating_sub(self.min)
    }

    pub fn contains(&self, steps: u16) -> bool {
        (self.min..=self.max).contains(&steps)
    }
}

/// Calibration data for all motors on a bus.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalibrationData {
    pub motors: Vec<MotorRange>,
}

impl CalibrationData {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let data: Self = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::other(format!("bad calibration JSON: {e}")))?;
        if let Some(bad) = data.motors.iter().find(|m| m.min > m.max || m.max > 4095) {
            return Err(std::io::Error::other(format!(
                "motor {}: invalid range {}..={}",
                bad.id, bad.min, bad.max
            )));
        }
        Ok(data)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Returns `None` if no calibration entry exists for that id.
    pub fn range_for(&self, id: MotorId) -> Option<MotorRange> {
        self.motors.iter().find(|m| m.id == id).copied()
    }
}
