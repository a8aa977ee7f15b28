use crate::error::ControlError;
use sc_dynamixel::{RawTelemetry, Register};
use sc_units::{MAX_STEP, MotorId, STEPS_PER_REV};
use serde::{Deserialize, Serialize};

/// Largest profile velocity / acceleration the controller will command.
pub const MAX_PROFILE_VALUE: u32 = 32_767;

/// Inclusive goal-position window of a motor, in raw steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub min: i32,
    pub max: i32,
}

impl Default for Limits {
    fn default() -> Self {
        Self { min: 0, max: MAX_STEP }
    }
}

impl Limits {
    pub fn contains(&self, steps: i32) -> bool {
        (self.min..=self.max).contains(&steps)
    }

    pub fn clamp(&self, steps: i32) -> i32 {
        steps.clamp(self.min, self.max)
    }

    pub fn span(&self) -> i32 {
        self.max - self.min
    }
}

/// Folds a bus-reported position into one revolution.
pub fn normalize_steps(raw: i32) -> i32 {
    raw.rem_euclid(STEPS_PER_REV)
}

/// Position and velocity loop gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PidGains {
    pub position_p: u32,
    pub position_i: u32,
    pub position_d: u32,
    pub velocity_p: u32,
    pub velocity_i: u32,
}

impl PidGains {
    const GAIN_MAX: u32 = 16_383;

    pub(crate) const REGISTERS: [Register; 5] = [
        Register::PositionPGain,
        Register::PositionIGain,
        Register::PositionDGain,
        Register::VelocityPGain,
        Register::VelocityIGain,
    ];

    pub fn validate(&self) -> Result<(), ControlError> {
        let checks = [
            ("position_p", self.position_p),
            ("position_i", self.position_i),
            ("position_d", self.position_d),
            ("velocity_p", self.velocity_p),
            ("velocity_i", self.velocity_i),
        ];
        for (name, value) in checks {
            if value > Self::GAIN_MAX {
                return Err(ControlError::invalid(format!(
                    "{name} must be within 0..={}, got {value}",
                    Self::GAIN_MAX
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, register: Register) -> u32 {
        match register {
            Register::PositionPGain => self.position_p,
            Register::PositionIGain => self.position_i,
            Register::PositionDGain => self.position_d,
            Register::VelocityPGain => self.velocity_p,
            Register::VelocityIGain => self.velocity_i,
            _ => 0,
        }
    }

    pub(crate) fn set(&mut self, register: Register, value: u32) {
        match register {
            Register::PositionPGain => self.position_p = value,
            Register::PositionIGain => self.position_i = value,
            Register::PositionDGain => self.position_d = value,
            Register::VelocityPGain => self.velocity_p = value,
            Register::VelocityIGain => self.velocity_i = value,
            _ => {}
        }
    }
}

/// Controller-side view of one servo.
///
/// Everything here is a cache of what was last written to or read from the
/// bus; `None` means "never observed".
#[derive(Debug, Clone)]
pub struct Motor {
    pub id: MotorId,
    pub name: String,
    pub limits: Limits,
    pub filtered: bool,
    pub torque_enabled: Option<bool>,
    pub profile_velocity: Option<u32>,
    pub profile_acceleration: Option<u32>,
    pub goal: Option<i32>,
    /// Last bus position, normalised to 0..4095.
    pub position: Option<i32>,
    pub telemetry: Option<RawTelemetry>,
    pub gains: Option<PidGains>,
}

impl Motor {
    pub fn new(id: MotorId, name: impl Into<String>, limits: Limits, filtered: bool) -> Self {
        Self {
            id,
            name: name.into(),
            limits,
            filtered,
            torque_enabled: None,
            profile_velocity: None,
            profile_acceleration: None,
            goal: None,
            position: None,
            telemetry: None,
            gains: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_multi_turn_positions() {
        assert_eq!(normalize_steps(4096), 0);
        assert_eq!(normalize_steps(4097 + 4096), 1);
        assert_eq!(normalize_steps(-1), 4095);
        assert_eq!(normalize_steps(2048), 2048);
    }

    #[test]
    fn gain_ranges_follow_the_control_table() {
        let ok = PidGains {
            position_p: 800,
            position_i: 0,
            position_d: 0,
            velocity_p: 100,
            velocity_i: 1920,
        };
        assert!(ok.validate().is_ok());
        assert!(PidGains { velocity_p: 0, ..ok }.validate().is_ok());
        assert!(PidGains { velocity_i: 16_384, ..ok }.validate().is_err());
        assert!(PidGains { position_p: 16_384, ..ok }.validate().is_err());
    }

    #[test]
    fn limits_clamp_and_contain() {
        let l = Limits { min: 1000, max: 3000 };
        assert!(l.contains(1000) && l.contains(3000) && !l.contains(3001));
        assert_eq!(l.clamp(-5), 1000);
        assert_eq!(l.clamp(5000), 3000);
        assert_eq!(l.span(), 2000);
    }
}
