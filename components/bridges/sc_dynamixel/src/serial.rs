use crate::gateway::{BusError, BusGateway, MotorId, RawTelemetry, Register, TELEMETRY_BLOCK};
use crate::protocol::{self, Status};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

pub const DEFAULT_BAUD: u32 = 2_000_000;

/// Protocol 2.0 master over a byte stream.
pub struct DxlPort<T> {
    io: T,
}

/// Gateway bound to a real serial device.
pub type SerialGateway = DxlPort<Box<dyn serialport::SerialPort>>;

/// Opens `device` with a bounded read timeout.
pub fn open_serial(device: &str, baud: u32, timeout: Duration) -> Result<SerialGateway, BusError> {
    let port = serialport::new(device, baud).timeout(timeout).open()?;
    debug!("dynamixel: opened {device} at {baud} baud, timeout {timeout:?}");
    Ok(DxlPort::new(port))
}

impl<T: Read + Write> DxlPort<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), BusError> {
        trace!("dynamixel tx {packet:02X?}");
        self.io.write_all(packet)?;
        self.io.flush()?;
        Ok(())
    }

    fn receive(&mut self, id: MotorId) -> Result<Status, BusError> {
        let status = protocol::read_status(&mut self.io, Some(id))?;
        trace!("dynamixel rx id={} err={:#04x} {:02X?}", status.id, status.error, status.params);
        if status.error_code() != 0 {
            return Err(BusError::Status {
                id,
                code: status.error,
            });
        }
        Ok(status)
    }

    pub fn ping(&mut self, id: MotorId) -> Result<(), BusError> {
        self.send(&protocol::instruction(id, protocol::INST_PING, &[]))?;
        self.receive(id).map(|_| ())
    }

    pub fn read_bytes(&mut self, id: MotorId, address: u16, len: usize) -> Result<Vec<u8>, BusError> {
        self.send(&protocol::read_request(id, address, len as u16))?;
        let status = self.receive(id)?;
        if status.params.len() != len {
            return Err(BusError::Malformed(format!(
                "motor {id} returned {} bytes, asked for {len}",
                status.params.len()
            )));
        }
        Ok(status.params)
    }

    pub fn write_bytes(&mut self, id: MotorId, address: u16, data: &[u8]) -> Result<(), BusError> {
        self.send(&protocol::write_request(id, address, data))?;
        self.receive(id).map(|_| ())
    }

    /// One Sync Read transaction; replies arrive in request order.
    pub fn sync_read(
        &mut self,
        address: u16,
        len: usize,
        ids: &[MotorId],
    ) -> Result<BTreeMap<MotorId, Vec<u8>>, BusError> {
        self.send(&protocol::sync_read_request(address, len as u16, ids))?;
        let mut out = BTreeMap::new();
        for &id in ids {
            let status = self.receive(id).map_err(|e| match e {
                BusError::Timeout { .. } => BusError::Missing { id },
                other => other,
            })?;
            if status.params.len() != len {
                return Err(BusError::Malformed(format!(
                    "motor {id} returned {} bytes in sync read",
                    status.params.len()
                )));
            }
            out.insert(id, status.params);
        }
        Ok(out)
    }
}

impl<T: Read + Write + Send> BusGateway for DxlPort<T> {
    fn bulk_read(&mut self, ids: &[MotorId]) -> Result<BTreeMap<MotorId, RawTelemetry>, BusError> {
        let (address, len) = TELEMETRY_BLOCK;
        self.sync_read(address, len, ids)?
            .into_iter()
            .map(|(id, block)| {
                RawTelemetry::from_block(&block)
                    .map(|t| (id, t))
                    .ok_or_else(|| BusError::Malformed(format!("short telemetry block from {id}")))
            })
            .collect()
    }

    fn write(&mut self, id: MotorId, register: Register, value: u32) -> Result<(), BusError> {
        let data = register
            .encode(value)
            .ok_or(BusError::ValueOutOfRange { register, value })?;
        self.write_bytes(id, register.address(), &data)
    }

    fn read(&mut self, id: MotorId, register: Register) -> Result<u32, BusError> {
        let data = self.read_bytes(id, register.address(), register.width())?;
        register
            .decode(&data)
            .ok_or_else(|| BusError::Malformed(format!("short {register} from {id}")))
    }
}
