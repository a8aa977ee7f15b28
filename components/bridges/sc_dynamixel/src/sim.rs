use crate::gateway::{BusError, BusGateway, MotorId, RawTelemetry, Register};
use cu29_clock::RobotClock;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Profile velocity unit of X-series servos, in rev/min.
const VELOCITY_UNIT_RPM: f64 = 0.229;
const STEPS_PER_REV: f64 = 4096.0;
/// Servo error code for writes to read-only registers.
const ACCESS_ERROR: u8 = 0x07;

/// State of one simulated servo.
#[derive(Debug, Clone)]
pub struct SimMotor {
    pub position: f64,
    pub goal: u32,
    pub profile_velocity: u32,
    pub profile_acceleration: u32,
    pub torque: bool,
    pub temperature: u8,
    pub voltage_raw: u16,
    pub current_ma: i16,
    pub gains: BTreeMap<Register, u32>,
    /// Added to the shaft position in every reported position.
    pub homing_offset: i32,
    pub current_limit: u32,
}

impl SimMotor {
    fn at(position: u32) -> Self {
        let gains = [
            (Register::PositionPGain, 800),
            (Register::PositionIGain, 0),
            (Register::PositionDGain, 0),
            (Register::VelocityPGain, 100),
            (Register::VelocityIGain, 1920),
        ]
        .into_iter()
        .collect();
        Self {
            position: f64::from(position),
            goal: position,
            profile_velocity: 0,
            profile_acceleration: 0,
            torque: true,
            temperature: 35,
            voltage_raw: 120,
            current_ma: 20,
            gains,
            homing_offset: 0,
            current_limit: 1193,
        }
    }

    fn moving(&self) -> bool {
        self.torque && (self.position - f64::from(self.goal)).abs() > 0.5
    }

    /// Constant-speed move toward the goal; velocity 0 means "as fast as
    /// possible", as on the real servo.
    fn step(&mut self, dt: f64) {
        if !self.torque {
            return;
        }
        let goal = f64::from(self.goal);
        let remaining = goal - self.position;
        if self.profile_velocity == 0 {
            self.position = goal;
            return;
        }
        let speed = f64::from(self.profile_velocity) * VELOCITY_UNIT_RPM * STEPS_PER_REV / 60.0;
        let travel = speed * dt;
        if remaining.abs() <= travel {
            self.position = goal;
        } else {
            self.position += travel.copysign(remaining);
        }
    }

    fn telemetry(&self) -> RawTelemetry {
        let moving = self.moving();
        RawTelemetry {
            position: self.position.round() as i32,
            temperature: self.temperature,
            voltage_raw: self.voltage_raw,
            current_ma: if moving { self.current_ma.saturating_add(160) } else { self.current_ma },
            pwm_raw: if moving { 300 } else { 0 },
        }
    }
}

struct SimState {
    clock: RobotClock,
    /// Clock reading the motors were last stepped to, in nanoseconds.
    synced: u64,
    motors: BTreeMap<MotorId, SimMotor>,
    writes: Vec<(MotorId, Register, u32)>,
    failing_bulk_reads: u32,
    failing_writes: BTreeSet<MotorId>,
    bulk_reads: u64,
}

impl SimState {
    /// Steps every motor up to the clock's present reading.
    fn sync(&mut self) {
        let now = self.clock.now().as_nanos();
        let Some(elapsed) = now.checked_sub(self.synced).filter(|&ns| ns > 0) else {
            return;
        };
        self.synced = now;
        let dt = elapsed as f64 * 1e-9;
        for motor in self.motors.values_mut() {
            motor.step(dt);
        }
    }

    fn motor_mut(&mut self, id: MotorId) -> Result<&mut SimMotor, BusError> {
        self.motors.get_mut(&id).ok_or(BusError::UnknownMotor(id))
    }
}

/// In-process servo bus.
///
/// Motors power up holding torque at mid-travel (2048) and move on `clock`:
/// every access first steps them to the clock's present reading. Hand it
/// the rig's clock, or a mock clock to move time from a test.
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new(ids: impl IntoIterator<Item = MotorId>, clock: RobotClock) -> Self {
        let motors = ids.into_iter().map(|id| (id, SimMotor::at(2048))).collect();
        let synced = clock.now().as_nanos();
        Self {
            state: Arc::new(Mutex::new(SimState {
                clock,
                synced,
                motors,
                writes: Vec::new(),
                failing_bulk_reads: 0,
                failing_writes: BTreeSet::new(),
                bulk_reads: 0,
            })),
        }
    }

    /// Shared view for driving and inspecting the bus after it has been
    /// handed to a controller.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl BusGateway for SimBus {
    fn bulk_read(&mut self, ids: &[MotorId]) -> Result<BTreeMap<MotorId, RawTelemetry>, BusError> {
        let mut state = self.state.lock();
        state.sync();
        state.bulk_reads += 1;
        if state.failing_bulk_reads > 0 {
            state.failing_bulk_reads -= 1;
            return Err(BusError::Timeout { id: None });
        }
        ids.iter()
            .map(|&id| {
                state
                    .motors
                    .get(&id)
                    .map(|m| (id, m.telemetry()))
                    .ok_or(BusError::Missing { id })
            })
            .collect()
    }

    fn write(&mut self, id: MotorId, register: Register, value: u32) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.sync();
        if state.failing_writes.contains(&id) {
            return Err(BusError::Fault(format!("injected write failure on motor {id}")));
        }
        if register.encode(value).is_none() {
            return Err(BusError::ValueOutOfRange { register, value });
        }
        let motor = state.motor_mut(id)?;
        if register.is_eeprom() && motor.torque {
            return Err(BusError::Status {
                id,
                code: ACCESS_ERROR,
            });
        }
        match register {
            Register::HomingOffset => {
                // positions are kept in the reported frame
                let offset = value as i32;
                motor.position += f64::from(offset) - f64::from(motor.homing_offset);
                motor.homing_offset = offset;
            }
            Register::CurrentLimit => motor.current_limit = value,
            Register::TorqueEnable => motor.torque = value != 0,
            Register::GoalPosition => motor.goal = value,
            Register::ProfileVelocity => motor.profile_velocity = value,
            Register::ProfileAcceleration => motor.profile_acceleration = value,
            Register::PositionPGain
            | Register::PositionIGain
            | Register::PositionDGain
            | Register::VelocityPGain
            | Register::VelocityIGain => {
                motor.gains.insert(register, value);
            }
            Register::PresentPwm
            | Register::PresentCurrent
            | Register::PresentPosition
            | Register::PresentInputVoltage
            | Register::PresentTemperature => {
                return Err(BusError::Status {
                    id,
                    code: ACCESS_ERROR,
                });
            }
        }
        debug!("sim: motor {id} {register} <- {value}");
        state.writes.push((id, register, value));
        Ok(())
    }

    fn read(&mut self, id: MotorId, register: Register) -> Result<u32, BusError> {
        let mut state = self.state.lock();
        state.sync();
        let motor = state.motor_mut(id)?;
        let t = motor.telemetry();
        Ok(match register {
            Register::HomingOffset => motor.homing_offset as u32,
            Register::CurrentLimit => motor.current_limit,
            Register::TorqueEnable => u32::from(motor.torque),
            Register::GoalPosition => motor.goal,
            Register::ProfileVelocity => motor.profile_velocity,
            Register::ProfileAcceleration => motor.profile_acceleration,
            Register::PositionPGain
            | Register::PositionIGain
            | Register::PositionDGain
            | Register::VelocityPGain
            | Register::VelocityIGain => motor.gains.get(&register).copied().unwrap_or(0),
            Register::PresentPwm => u32::from(t.pwm_raw as u16),
            Register::PresentCurrent => u32::from(t.current_ma as u16),
            Register::PresentPosition => t.position as u32,
            Register::PresentInputVoltage => u32::from(t.voltage_raw),
            Register::PresentTemperature => u32::from(t.temperature),
        })
    }
}

/// Test and tooling access to a [`SimBus`] owned elsewhere.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn motor(&self, id: MotorId) -> Option<SimMotor> {
        let mut state = self.state.lock();
        state.sync();
        state.motors.get(&id).cloned()
    }

    pub fn position(&self, id: MotorId) -> Option<i32> {
        self.motor(id).map(|m| m.position.round() as i32)
    }

    pub fn goal(&self, id: MotorId) -> Option<u32> {
        self.motor(id).map(|m| m.goal)
    }

    /// Puts a motor at `steps` as if moved by hand; the goal follows so a
    /// holding motor stays there.
    pub fn set_position(&self, id: MotorId, steps: u32) {
        let mut state = self.state.lock();
        state.sync();
        if let Some(m) = state.motors.get_mut(&id) {
            m.position = f64::from(steps);
            m.goal = steps;
        }
    }

    pub fn set_telemetry(&self, id: MotorId, temperature: u8, voltage_raw: u16, current_ma: i16) {
        if let Some(m) = self.state.lock().motors.get_mut(&id) {
            m.temperature = temperature;
            m.voltage_raw = voltage_raw;
            m.current_ma = current_ma;
        }
    }

    /// Every successful write so far, in bus order.
    pub fn writes(&self) -> Vec<(MotorId, Register, u32)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, id: MotorId, register: Register) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(i, r, _)| *i == id && *r == register)
            .map(|(_, _, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Makes the next `n` bulk reads time out.
    pub fn fail_bulk_reads(&self, n: u32) {
        self.state.lock().failing_bulk_reads = n;
    }

    pub fn fail_writes(&self, id: MotorId, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_writes.insert(id);
        } else {
            state.failing_writes.remove(&id);
        }
    }

    pub fn bulk_read_count(&self) -> u64 {
        self.state.lock().bulk_reads
    }
}
