//! Dynamixel Protocol 2.0 framing.
//!
//! ```text
//! FF FF FD 00 | ID | LEN_L LEN_H | INST | PARAMS... | CRC_L CRC_H
//! ```
//!
//! `LEN` counts INST + stuffed PARAMS + CRC. Any `FF FF FD` sequence inside
//! the parameters gets an extra `FD` appended on the wire.

use crate::gateway::{BusError, MotorId};
use std::io::Read;

pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];
pub const BROADCAST_ID: MotorId = 0xFE;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_STATUS: u8 = 0x55;
pub const INST_SYNC_READ: u8 = 0x82;

/// Upper bound on a status packet body we are willing to buffer.
const MAX_BODY: usize = 1024;

/// CRC-16 (polynomial 0x8005, init 0, no reflection) over the whole packet
/// up to, not including, the CRC itself.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn stuff(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len() + params.len() / 3);
    for &b in params {
        out.push(b);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) {
            out.push(0xFD);
        }
    }
    out
}

pub fn unstuff(params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(params.len());
    let mut i = 0;
    while i < params.len() {
        out.push(params[i]);
        if out.ends_with(&[0xFF, 0xFF, 0xFD]) && params.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// Builds a complete instruction packet.
pub fn instruction(id: MotorId, inst: u8, params: &[u8]) -> Vec<u8> {
    let body = stuff(params);
    let len = (body.len() + 3) as u16;
    let mut pkt = Vec::with_capacity(HEADER.len() + 3 + len as usize);
    pkt.extend_from_slice(&HEADER);
    pkt.push(id);
    pkt.extend_from_slice(&len.to_le_bytes());
    pkt.push(inst);
    pkt.extend_from_slice(&body);
    let crc = crc16(&pkt);
    pkt.extend_from_slice(&crc.to_le_bytes());
    pkt
}

pub fn read_request(id: MotorId, address: u16, len: u16) -> Vec<u8> {
    let mut params = address.to_le_bytes().to_vec();
    params.extend_from_slice(&len.to_le_bytes());
    instruction(id, INST_READ, &params)
}

pub fn write_request(id: MotorId, address: u16, data: &[u8]) -> Vec<u8> {
    let mut params = address.to_le_bytes().to_vec();
    params.extend_from_slice(data);
    instruction(id, INST_WRITE, &params)
}

pub fn sync_read_request(address: u16, len: u16, ids: &[MotorId]) -> Vec<u8> {
    let mut params = address.to_le_bytes().to_vec();
    params.extend_from_slice(&len.to_le_bytes());
    params.extend_from_slice(ids);
    instruction(BROADCAST_ID, INST_SYNC_READ, &params)
}

/// A decoded status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: MotorId,
    /// Error byte; bit 7 is the hardware-alert flag, bits 0..6 the error code.
    pub error: u8,
    pub params: Vec<u8>,
}

impl Status {
    const ALERT_BIT: u8 = 0x80;

    /// Error code with the hardware-alert flag masked out.
    pub fn error_code(&self) -> u8 {
        self.error & !Self::ALERT_BIT
    }

    pub fn hardware_alert(&self) -> bool {
        self.error & Self::ALERT_BIT != 0
    }

    /// Builds the wire bytes of this status, as a servo would send them.
    pub fn encode(&self) -> Vec<u8> {
        let mut params = vec![self.error];
        params.extend_from_slice(&stuff(&self.params));
        let len = (params.len() + 3) as u16;
        let mut pkt = HEADER.to_vec();
        pkt.push(self.id);
        pkt.extend_from_slice(&len.to_le_bytes());
        pkt.push(INST_STATUS);
        pkt.extend_from_slice(&params);
        let crc = crc16(&pkt);
        pkt.extend_from_slice(&crc.to_le_bytes());
        pkt
    }
}

/// Reads one status packet, skipping any bytes before the header.
///
/// I/O timeouts and short reads surface as [`BusError::Timeout`].
pub fn read_status<R: Read + ?Sized>(reader: &mut R, expected: Option<MotorId>) -> Result<Status, BusError> {
    let map_io = |e: std::io::Error| match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::UnexpectedEof => BusError::Timeout { id: expected },
        _ => BusError::Io(e),
    };

    let mut window = [0u8; 4];
    let mut seen = 0usize;
    while window != HEADER {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(map_io)?;
        window.rotate_left(1);
        window[3] = byte[0];
        seen += 1;
        if seen > MAX_BODY {
            return Err(BusError::Malformed("no packet header in stream".into()));
        }
    }

    let mut fixed = [0u8; 3];
    reader.read_exact(&mut fixed).map_err(map_io)?;
    let id = fixed[0];
    let len = usize::from(u16::from_le_bytes([fixed[1], fixed[2]]));
    if !(4..=MAX_BODY).contains(&len) {
        return Err(BusError::Malformed(format!("status length {len}")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(map_io)?;

    let mut packet = HEADER.to_vec();
    packet.extend_from_slice(&fixed);
    packet.extend_from_slice(&body[..len - 2]);
    let expected_crc = u16::from_le_bytes([body[len - 2], body[len - 1]]);
    let actual = crc16(&packet);
    if expected_crc != actual {
        return Err(BusError::Crc {
            expected: expected_crc,
            actual,
        });
    }

    if body[0] != INST_STATUS {
        return Err(BusError::Malformed(format!("instruction {:#04x} in status", body[0])));
    }
    if let Some(want) = expected
        && want != id
    {
        return Err(BusError::Malformed(format!("reply from motor {id}, expected {want}")));
    }

    Ok(Status {
        id,
        error: body[1],
        params: unstuff(&body[2..len - 2]),
    })
}
