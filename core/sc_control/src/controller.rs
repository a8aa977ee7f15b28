use crate::config::SystemConfig;
use crate::error::{ControlError, MotorFailure};
use crate::motor::{Limits, MAX_PROFILE_VALUE, Motor, PidGains, normalize_steps};
use crate::snapshot::{EstimateReport, MotorSnapshot, StatusSnapshot, TelemetryThresholds};
use log::{debug, info, warn};
use sc_dynamixel::{BusError, BusGateway, Register};
use sc_kalman::{Band, Estimate, EstimatorBank};
use sc_units::{AxisKind, AxisScale, MotorId, UnitConverter, round_display};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Homing Offset range of X-series servos, in steps.
const HOMING_OFFSET_RANGE: std::ops::RangeInclusive<i32> = -1_044_479..=1_044_479;

/// Moves a rotational reading by whole turns to the one nearest `prior`, so
/// a wrap between step 4095 and 0 reaches the filter as a small move.
fn unwrap_near(units: f64, prior: Option<f64>, scale: &AxisScale) -> f64 {
    match (scale.kind, prior) {
        (AxisKind::Rotational, Some(prior)) => {
            let turn = scale.units_per_rev;
            units + turn * ((prior - units) / turn).round()
        }
        _ => units,
    }
}

/// Which motors a torque command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorqueTarget {
    One(MotorId),
    All,
}

/// Per-motor command path and bulk status aggregation.
///
/// Not synchronised on its own; the owning [`SliderRig`](crate::SliderRig)
/// serialises every call.
pub struct MotionController {
    bus: Box<dyn BusGateway>,
    converter: UnitConverter,
    motors: BTreeMap<MotorId, Motor>,
    bank: EstimatorBank,
    prediction_band: Band,
    uncertainty_band: Band,
    thresholds: TelemetryThresholds,
    current_limits: BTreeMap<MotorId, u16>,
    snapshot: Option<StatusSnapshot>,
}

impl MotionController {
    pub fn new(config: &SystemConfig, bus: Box<dyn BusGateway>) -> Self {
        let motors = config
            .motors
            .iter()
            .map(|m| (m.id, Motor::new(m.id, m.name.clone(), m.limits(), m.filtered)))
            .collect::<BTreeMap<_, _>>();
        let current_limits = config
            .motors
            .iter()
            .filter_map(|m| Some((m.id, m.current_limit?)))
            .collect();
        let filtered = config.motors.iter().filter(|m| m.filtered).map(|m| m.id);
        Self {
            bus,
            converter: config.converter(),
            bank: EstimatorBank::new(filtered, config.estimator.kalman),
            motors,
            prediction_band: config.estimator.prediction_error,
            uncertainty_band: config.estimator.uncertainty,
            thresholds: config.telemetry,
            current_limits,
            snapshot: None,
        }
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    pub fn motor_ids(&self) -> impl Iterator<Item = MotorId> + '_ {
        self.motors.keys().copied()
    }

    pub fn motor(&self, id: MotorId) -> Result<&Motor, ControlError> {
        self.motors
            .get(&id)
            .ok_or_else(|| ControlError::invalid(format!("unknown motor id {id}")))
    }

    fn motor_mut(&mut self, id: MotorId) -> Result<&mut Motor, ControlError> {
        self.motors
            .get_mut(&id)
            .ok_or_else(|| ControlError::invalid(format!("unknown motor id {id}")))
    }

    pub fn limits(&self, id: MotorId) -> Option<Limits> {
        self.motors.get(&id).map(|m| m.limits)
    }

    /// Last normalised bus position of a motor.
    pub fn position(&self, id: MotorId) -> Option<i32> {
        self.motors.get(&id).and_then(|m| m.position)
    }

    /// Last bus position in the axis unit, unrounded.
    pub fn position_units(&self, id: MotorId) -> Option<f64> {
        let steps = self.position(id)?;
        Some(self.converter.scale(id).ok()?.to_units_exact(steps))
    }

    pub fn estimate(&self, id: MotorId) -> Option<Estimate> {
        self.bank.filter(id).filter(|f| f.is_initialized()).map(|f| f.estimate())
    }

    /// Estimator position extrapolated by `lead`, in the axis unit.
    pub fn predicted_units(&self, id: MotorId, lead: Duration) -> Option<f64> {
        self.bank
            .filter(id)
            .filter(|f| f.is_initialized())
            .map(|f| f.predict_position(lead))
    }

    pub fn snapshot(&self) -> Option<&StatusSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn validate_goal(&self, id: MotorId, target: i32, velocity: u32) -> Result<(), ControlError> {
        let motor = self.motor(id)?;
        if !motor.limits.contains(target) {
            return Err(ControlError::invalid(format!(
                "target {target} for motor {id} outside {}..={}",
                motor.limits.min, motor.limits.max
            )));
        }
        if velocity == 0 || velocity > MAX_PROFILE_VALUE {
            return Err(ControlError::invalid(format!(
                "profile velocity must be within 1..={MAX_PROFILE_VALUE}, got {velocity}"
            )));
        }
        Ok(())
    }

    /// Writes Profile Velocity (only when it changed) then Goal Position.
    pub fn set_goal(&mut self, id: MotorId, target: i32, velocity: u32) -> Result<(), ControlError> {
        self.validate_goal(id, target, velocity)?;
        if self.motor(id)?.profile_velocity != Some(velocity) {
            self.bus.write(id, Register::ProfileVelocity, velocity)?;
            self.motor_mut(id)?.profile_velocity = Some(velocity);
        }
        self.bus.write(id, Register::GoalPosition, target as u32)?;
        self.motor_mut(id)?.goal = Some(target);
        debug!("motor {id}: goal {target} at velocity {velocity}");
        Ok(())
    }

    /// Re-commands the last known position, clamped to the limits.
    pub fn hold(&mut self, id: MotorId) -> Result<(), ControlError> {
        let motor = self.motor(id)?;
        let Some(position) = motor.position else {
            return Ok(());
        };
        let target = motor.limits.clamp(position);
        self.bus.write(id, Register::GoalPosition, target as u32)?;
        self.motor_mut(id)?.goal = Some(target);
        debug!("motor {id}: holding at {target}");
        Ok(())
    }

    pub fn set_profile_acceleration(&mut self, id: MotorId, acceleration: u32) -> Result<(), ControlError> {
        if acceleration > MAX_PROFILE_VALUE {
            return Err(ControlError::invalid(format!(
                "profile acceleration must be within 0..={MAX_PROFILE_VALUE}, got {acceleration}"
            )));
        }
        if self.motor(id)?.profile_acceleration == Some(acceleration) {
            return Ok(());
        }
        self.bus.write(id, Register::ProfileAcceleration, acceleration)?;
        self.motor_mut(id)?.profile_acceleration = Some(acceleration);
        debug!("motor {id}: profile acceleration {acceleration}");
        Ok(())
    }

    /// Returns the motors that accepted the command.
    ///
    /// Every addressed motor is attempted; for [`TorqueTarget::All`] the
    /// failures are reported together while the successes stay applied.
    pub fn set_torque(&mut self, target: TorqueTarget, enabled: bool) -> Result<Vec<MotorId>, ControlError> {
        let ids: Vec<MotorId> = match target {
            TorqueTarget::One(id) => {
                self.motor(id)?;
                vec![id]
            }
            TorqueTarget::All => self.motor_ids().collect(),
        };

        let mut applied = Vec::with_capacity(ids.len());
        let mut failures = Vec::new();
        for id in ids {
            match self.bus.write(id, Register::TorqueEnable, u32::from(enabled)) {
                Ok(()) => {
                    self.motor_mut(id)?.torque_enabled = Some(enabled);
                    applied.push(id);
                }
                Err(e) if target == TorqueTarget::One(id) => return Err(e.into()),
                Err(e) => {
                    warn!("motor {id}: torque {} failed: {e}", if enabled { "on" } else { "off" });
                    failures.push(MotorFailure {
                        id,
                        message: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(applied)
        } else {
            Err(ControlError::TorqueFailures(failures))
        }
    }

    /// One bulk read: feeds the filters in ascending id order, then publishes
    /// a new snapshot. On failure the filters coast and the previous
    /// snapshot stays in place.
    pub fn refresh(&mut self, now: Duration) -> Result<&StatusSnapshot, ControlError> {
        let ids: Vec<MotorId> = self.motor_ids().collect();
        let readings = match self.bus.bulk_read(&ids) {
            Ok(r) => match ids.iter().find(|id| !r.contains_key(id)) {
                Some(&id) => Err(BusError::Missing { id }),
                None => Ok(r),
            },
            Err(e) => Err(e),
        };
        let readings = match readings {
            Ok(r) => r,
            Err(e) => {
                self.bank.coast_all(now);
                return Err(e.into());
            }
        };

        for (id, telemetry) in &readings {
            if let Some(motor) = self.motors.get_mut(id) {
                motor.position = Some(normalize_steps(telemetry.position));
                motor.telemetry = Some(*telemetry);
            }
        }

        let samples: BTreeMap<MotorId, f64> = self
            .bank
            .ids()
            .filter_map(|id| {
                let steps = self.motors.get(&id)?.position?;
                let scale = self.converter.scale(id).ok()?;
                let prior = self.estimate(id).map(|e| e.position);
                Some((id, unwrap_near(scale.to_units_exact(steps), prior, scale)))
            })
            .collect();
        self.bank.feed(now, |id| samples.get(&id).copied());

        let snapshot = StatusSnapshot {
            taken_at_ms: now.as_millis() as u64,
            motors: self.motors.values().map(|m| self.motor_snapshot(m)).collect(),
        };
        Ok(self.snapshot.insert(snapshot))
    }

    fn motor_snapshot(&self, motor: &Motor) -> MotorSnapshot {
        let t = motor.telemetry.unwrap_or_default();
        let raw = motor.position.unwrap_or_default();
        let (position, unit) = match self.converter.scale(motor.id) {
            Ok(scale) => (round_display(scale.to_units_exact(raw)), scale.unit_label()),
            Err(_) => (f64::from(raw), "steps"),
        };
        let estimate = self
            .bank
            .filter(motor.id)
            .map(|f| EstimateReport::new(&f.estimate(), &self.prediction_band, &self.uncertainty_band));
        MotorSnapshot {
            id: motor.id,
            name: motor.name.clone(),
            raw_position: raw,
            position,
            unit,
            goal: motor.goal,
            temperature: f64::from(t.temperature),
            voltage: t.voltage(),
            current: t.current(),
            load: round_display(t.load_percent()),
            torque_enabled: motor.torque_enabled,
            estimate,
            pid: motor.gains,
            alerts: self.thresholds.alerts(f64::from(t.temperature), t.voltage(), t.current()),
        }
    }

    pub fn read_pid_gains(&mut self, id: MotorId) -> Result<PidGains, ControlError> {
        self.motor(id)?;
        let mut gains = PidGains::default();
        for register in PidGains::REGISTERS {
            gains.set(register, self.bus.read(id, register)?);
        }
        self.motor_mut(id)?.gains = Some(gains);
        Ok(gains)
    }

    /// Validates then writes the gains register by register; the cache only
    /// reflects registers the bus accepted.
    pub fn set_pid_gains(&mut self, id: MotorId, gains: PidGains) -> Result<(), ControlError> {
        self.motor(id)?;
        gains.validate()?;
        for register in PidGains::REGISTERS {
            let value = gains.get(register);
            self.bus.write(id, register, value)?;
            let motor = self.motor_mut(id)?;
            motor.gains.get_or_insert_with(PidGains::default).set(register, value);
        }
        debug!("motor {id}: pid gains {gains:?}");
        Ok(())
    }

    /// Runs `write` with torque released, as EEPROM registers require, then
    /// restores the torque state read beforehand. The restore is attempted
    /// even when `write` failed.
    fn with_torque_released<T>(
        &mut self,
        id: MotorId,
        write: impl FnOnce(&mut Self) -> Result<T, ControlError>,
    ) -> Result<T, ControlError> {
        let enabled = self.bus.read(id, Register::TorqueEnable)? != 0;
        if enabled {
            self.bus.write(id, Register::TorqueEnable, 0)?;
        }
        let result = write(self);
        if enabled {
            self.bus.write(id, Register::TorqueEnable, 1)?;
        }
        self.motor_mut(id)?.torque_enabled = Some(enabled);
        result
    }

    /// Writes the configured Current Limit when the servo holds another
    /// value.
    fn apply_current_limit(&mut self, id: MotorId) -> Result<(), ControlError> {
        let Some(&limit) = self.current_limits.get(&id) else {
            return Ok(());
        };
        let limit = u32::from(limit);
        if self.bus.read(id, Register::CurrentLimit)? == limit {
            return Ok(());
        }
        self.with_torque_released(id, |c| Ok(c.bus.write(id, Register::CurrentLimit, limit)?))?;
        info!("motor {id}: current limit set to {limit}");
        Ok(())
    }

    /// Makes the present position of `id` read as zero by adjusting its
    /// Homing Offset. Torque is released for the write; the goal is moved
    /// to the new zero before it is restored, so the motor stays put.
    ///
    /// Returns the offset written.
    pub fn home(&mut self, id: MotorId) -> Result<i32, ControlError> {
        self.motor(id)?;
        let present = self.bus.read(id, Register::PresentPosition)? as i32;
        let previous = self.bus.read(id, Register::HomingOffset)? as i32;
        let offset = previous
            .checked_sub(present)
            .filter(|o| HOMING_OFFSET_RANGE.contains(o))
            .ok_or_else(|| {
                ControlError::invalid(format!(
                    "motor {id}: position {present} is out of homing range (offset {previous})"
                ))
            })?;

        self.with_torque_released(id, |c| {
            c.bus.write(id, Register::HomingOffset, offset as u32)?;
            c.bus.write(id, Register::GoalPosition, 0)?;
            Ok(())
        })?;

        let motor = self.motor_mut(id)?;
        motor.position = Some(0);
        motor.goal = Some(0);
        self.bank.reset_axis(id);
        info!("motor {id}: homed, offset {offset}");
        Ok(offset)
    }

    /// Best-effort read of torque state and gains for every motor, then the
    /// configured current limits.
    pub fn initialize(&mut self) -> Vec<MotorFailure> {
        let mut failures = Vec::new();
        let ids: Vec<MotorId> = self.motor_ids().collect();
        for id in ids {
            let result = self
                .bus
                .read(id, Register::TorqueEnable)
                .map_err(ControlError::from)
                .and_then(|torque| {
                    if let Some(m) = self.motors.get_mut(&id) {
                        m.torque_enabled = Some(torque != 0);
                    }
                    self.read_pid_gains(id)
                })
                .and_then(|_| self.apply_current_limit(id));
            if let Err(e) = result {
                warn!("motor {id}: initial read failed: {e}");
                failures.push(MotorFailure {
                    id,
                    message: e.to_string(),
                });
            }
        }
        failures
    }
}
