//! Servo bus access for the slider rig.
//!
//! The controller only ever talks to a [`BusGateway`]. Two gateways ship here:
//!
//! - [`DxlPort`] speaks Dynamixel Protocol 2.0 over any `Read + Write` byte
//!   stream; [`open_serial`] wraps a real serial device (2 Mbaud by default).
//! - [`SimBus`] is an in-process bus with a constant-speed motion model
//!   clocked by a `cu29_clock::RobotClock`. It also injects faults and logs
//!   writes, and backs the tests and `--sim` runs.
//!
//! Run the `dxl-calibrate` binary to record per-motor travel limits into a
//! `calibration.json` that the controller can load.

pub mod calibration;
mod gateway;
pub mod protocol;
mod serial;
mod sim;

pub use gateway::{BusError, BusGateway, MotorId, RawTelemetry, Register, TELEMETRY_BLOCK};
pub use serial::{DEFAULT_BAUD, DxlPort, SerialGateway, open_serial};
pub use sim::{SimBus, SimHandle, SimMotor};
