use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Bus id of a servo.
pub type MotorId = u8;

/// Control-table entries the controller uses (X-series layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    HomingOffset,
    CurrentLimit,
    TorqueEnable,
    VelocityIGain,
    VelocityPGain,
    PositionDGain,
    PositionIGain,
    PositionPGain,
    ProfileAcceleration,
    ProfileVelocity,
    GoalPosition,
    PresentPwm,
    PresentCurrent,
    PresentPosition,
    PresentInputVoltage,
    PresentTemperature,
}

impl Register {
    pub const fn address(self) -> u16 {
        match self {
            Self::HomingOffset => 20,
            Self::CurrentLimit => 38,
            Self::TorqueEnable => 64,
            Self::VelocityIGain => 76,
            Self::VelocityPGain => 78,
            Self::PositionDGain => 80,
            Self::PositionIGain => 82,
            Self::PositionPGain => 84,
            Self::ProfileAcceleration => 108,
            Self::ProfileVelocity => 112,
            Self::GoalPosition => 116,
            Self::PresentPwm => 124,
            Self::PresentCurrent => 126,
            Self::PresentPosition => 132,
            Self::PresentInputVoltage => 144,
            Self::PresentTemperature => 146,
        }
    }

    /// Width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::TorqueEnable | Self::PresentTemperature => 1,
            Self::CurrentLimit
            | Self::VelocityIGain
            | Self::VelocityPGain
            | Self::PositionDGain
            | Self::PositionIGain
            | Self::PositionPGain
            | Self::PresentPwm
            | Self::PresentCurrent
            | Self::PresentInputVoltage => 2,
            Self::HomingOffset
            | Self::ProfileAcceleration
            | Self::ProfileVelocity
            | Self::GoalPosition
            | Self::PresentPosition => 4,
        }
    }

    /// Largest value the register can hold.
    pub const fn max_value(self) -> u32 {
        match self.width() {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        }
    }

    /// Little-endian encoding, `None` if `value` does not fit.
    pub fn encode(self, value: u32) -> Option<Vec<u8>> {
        (value <= self.max_value()).then(|| value.to_le_bytes()[..self.width()].to_vec())
    }

    /// EEPROM area; the servo only accepts writes with torque off.
    pub const fn is_eeprom(self) -> bool {
        self.address() < Self::TorqueEnable.address()
    }

    pub fn decode(self, bytes: &[u8]) -> Option<u32> {
        let bytes = bytes.get(..self.width())?;
        let mut buf = [0u8; 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf))
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{}", self.address())
    }
}

/// Contiguous control-table block covering every telemetry register:
/// Present PWM (124) through Present Temperature (146).
pub const TELEMETRY_BLOCK: (u16, usize) = (124, 23);

/// One motor's reading from a bulk status transaction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RawTelemetry {
    /// Present position in steps, as reported (may be outside 0..4095 in
    /// multi-turn mode).
    pub position: i32,
    /// °C
    pub temperature: u8,
    /// Input voltage in 0.1 V units.
    pub voltage_raw: u16,
    /// Signed present current in mA.
    pub current_ma: i16,
    /// Signed present PWM, ±885 at full duty.
    pub pwm_raw: i16,
}

impl RawTelemetry {
    const PWM_FULL_SCALE: f64 = 885.0;

    /// Decodes the [`TELEMETRY_BLOCK`] bytes of one motor.
    pub fn from_block(block: &[u8]) -> Option<Self> {
        if block.len() < TELEMETRY_BLOCK.1 {
            return None;
        }
        let i16_at = |o: usize| i16::from_le_bytes([block[o], block[o + 1]]);
        Some(Self {
            pwm_raw: i16_at(0),
            current_ma: i16_at(2),
            position: i32::from_le_bytes([block[8], block[9], block[10], block[11]]),
            voltage_raw: u16::from_le_bytes([block[20], block[21]]),
            temperature: block[22],
        })
    }

    /// Inverse of [`RawTelemetry::from_block`]; fields outside the five
    /// telemetry values are zero.
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; TELEMETRY_BLOCK.1];
        block[0..2].copy_from_slice(&self.pwm_raw.to_le_bytes());
        block[2..4].copy_from_slice(&self.current_ma.to_le_bytes());
        block[8..12].copy_from_slice(&self.position.to_le_bytes());
        block[20..22].copy_from_slice(&self.voltage_raw.to_le_bytes());
        block[22] = self.temperature;
        block
    }

    pub fn voltage(&self) -> f64 {
        f64::from(self.voltage_raw) / 10.0
    }

    pub fn current(&self) -> f64 {
        f64::from(self.current_ma)
    }

    /// Load as a percentage of full PWM duty, signed by direction.
    pub fn load_percent(&self) -> f64 {
        f64::from(self.pwm_raw) * 100.0 / Self::PWM_FULL_SCALE
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("timeout waiting for motor {id:?}")]
    Timeout { id: Option<MotorId> },
    #[error("crc mismatch: packet says {expected:#06x}, computed {actual:#06x}")]
    Crc { expected: u16, actual: u16 },
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("motor {id} reported error status {code:#04x}")]
    Status { id: MotorId, code: u8 },
    #[error("no response from motor {id} in bulk read")]
    Missing { id: MotorId },
    #[error("value {value} does not fit register {register}")]
    ValueOutOfRange { register: Register, value: u32 },
    #[error("motor {0} is not on the bus")]
    UnknownMotor(MotorId),
    #[error("bus fault: {0}")]
    Fault(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

/// Raw register access to a servo bus.
///
/// Every call is bounded in time by the implementation (serial timeouts).
/// `bulk_read` is all-or-nothing: a missing or corrupt reply for any id
/// fails the whole call.
pub trait BusGateway: Send {
    fn bulk_read(&mut self, ids: &[MotorId]) -> Result<BTreeMap<MotorId, RawTelemetry>, BusError>;

    fn write(&mut self, id: MotorId, register: Register, value: u32) -> Result<(), BusError>;

    fn read(&mut self, id: MotorId, register: Register) -> Result<u32, BusError>;
}

impl<G: BusGateway + ?Sized> BusGateway for Box<G> {
    fn bulk_read(&mut self, ids: &[MotorId]) -> Result<BTreeMap<MotorId, RawTelemetry>, BusError> {
        (**self).bulk_read(ids)
    }

    fn write(&mut self, id: MotorId, register: Register, value: u32) -> Result<(), BusError> {
        (**self).write(id, register, value)
    }

    fn read(&mut self, id: MotorId, register: Register) -> Result<u32, BusError> {
        (**self).read(id, register)
    }
}
