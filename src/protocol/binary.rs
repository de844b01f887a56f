//! Fixed-length binary frames.
//!
//! Request layout:
//!
//! ```text
//! [0xCC][addr][opcode][p1][p2][0xDD][sum & 0xFF][(sum >> 8) & 0xFF]
//! ```
//!
//! where `sum` is the 16-bit wrapping sum of the first six bytes. Responses share the layout,
//! with the device status in place of the opcode. Multi-byte parameters travel little-endian.

use crate::error::{AppResult, FluidicsError};

/// Total frame length in bytes.
pub const FRAME_LEN: usize = 8;
/// First byte of every frame.
pub const HEADER: u8 = 0xCC;
/// Byte following the parameters.
pub const TERMINATOR: u8 = 0xDD;

/// 16-bit wrapping sum of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// One outgoing command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Bus address of the target device
    pub address: u8,
    /// Function code
    pub opcode: u8,
    /// Parameter bytes (p1, p2)
    pub params: [u8; 2],
}

impl BinaryFrame {
    /// Frame with both parameter bytes zero.
    #[must_use]
    pub fn new(address: u8, opcode: u8) -> Self {
        Self {
            address,
            opcode,
            params: [0, 0],
        }
    }

    /// Set p1, leaving p2 zero.
    #[must_use]
    pub fn with_byte(mut self, value: u8) -> Self {
        self.params = [value, 0];
        self
    }

    /// Set p1/p2 from a little-endian 16-bit value.
    #[must_use]
    pub fn with_word(mut self, value: u16) -> Self {
        self.params = value.to_le_bytes();
        self
    }

    /// Serialize with trailing checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [
            HEADER,
            self.address,
            self.opcode,
            self.params[0],
            self.params[1],
            TERMINATOR,
            0,
            0,
        ];
        let [lo, hi] = checksum(&frame[..6]).to_le_bytes();
        frame[6] = lo;
        frame[7] = hi;
        frame
    }
}

/// Decoded reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryResponse {
    /// Address the reply came from
    pub address: u8,
    /// Raw status byte (index 2)
    pub status: u8,
    /// Parameter bytes (index 3 and 4)
    pub params: [u8; 2],
}

impl BinaryResponse {
    /// Parse a reply. `device` labels errors.
    ///
    /// With `verify_checksum` set, a checksum mismatch is a protocol error. Without it only the
    /// length, header and terminator are checked.
    pub fn decode(device: &str, bytes: &[u8], verify_checksum: bool) -> AppResult<Self> {
        if bytes.len() != FRAME_LEN {
            return Err(FluidicsError::protocol(
                device,
                format!("expected {FRAME_LEN} byte frame, got {}", bytes.len()),
            ));
        }
        if bytes[0] != HEADER || bytes[5] != TERMINATOR {
            return Err(FluidicsError::protocol(
                device,
                format!("malformed frame {}", crate::transport::hex(bytes)),
            ));
        }
        if verify_checksum {
            let expected = checksum(&bytes[..6]);
            let received = u16::from_le_bytes([bytes[6], bytes[7]]);
            if expected != received {
                return Err(FluidicsError::protocol(
                    device,
                    format!("checksum mismatch: expected {expected:#06x}, received {received:#06x}"),
                ));
            }
        }

        Ok(Self {
            address: bytes[1],
            status: bytes[2],
            params: [bytes[3], bytes[4]],
        })
    }

    /// Parameters as a little-endian word.
    #[must_use]
    pub fn word(&self) -> u16 {
        u16::from_le_bytes(self.params)
    }

    /// Classified status byte.
    #[must_use]
    pub fn status(&self) -> BinaryStatus {
        BinaryStatus::from_code(self.status)
    }
}

/// Meaning of the status byte in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryStatus {
    /// `0x00`: command accepted, motor idle
    Idle,
    /// `0x04` (motor busy) or `0xFE` (task executing)
    Busy(u8),
    /// Any other code
    Fault(u8),
}

impl BinaryStatus {
    /// Motor busy.
    pub const MOTOR_BUSY: u8 = 0x04;
    /// Task still executing.
    pub const EXECUTING: u8 = 0xFE;

    /// Classify a raw status byte.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => BinaryStatus::Idle,
            Self::MOTOR_BUSY | Self::EXECUTING => BinaryStatus::Busy(code),
            other => BinaryStatus::Fault(other),
        }
    }

    /// Convert a fault into a [`FluidicsError::DeviceFault`].
    pub fn into_result(self, device: &str) -> AppResult<Self> {
        match self {
            BinaryStatus::Fault(code) => Err(FluidicsError::DeviceFault {
                device: device.to_string(),
                code,
                description: describe_status(code),
            }),
            other => Ok(other),
        }
    }
}

/// Human readable meaning of a status byte.
#[must_use]
pub fn describe_status(code: u8) -> &'static str {
    match code {
        0x00 => "normal",
        0x01 => "frame error",
        0x02 => "parameter error",
        0x03 => "optocoupler error",
        0x04 => "motor busy",
        0x05 => "motor stalled",
        0x06 => "unknown position",
        0xFE => "task executing",
        0xFF => "unknown error",
        _ => "unrecognised status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_port_frame_matches_device_manual() {
        // 0xCC + 0x44 + 0x03 + 0xDD = 0x01F0
        let frame = BinaryFrame::new(0x00, 0x44).with_byte(3).encode();
        assert_eq!(frame, [0xCC, 0x00, 0x44, 0x03, 0x00, 0xDD, 0xF0, 0x01]);
    }

    #[test]
    fn word_parameters_are_little_endian() {
        let frame = BinaryFrame::new(0x00, 0x4D).with_word(4800).encode();
        assert_eq!(frame[3], 0xC0);
        assert_eq!(frame[4], 0x12);
        let sum = checksum(&frame[..6]);
        assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), sum);
    }

    #[test]
    fn checksum_wraps_at_sixteen_bits() {
        let bytes = [0xFF; 300];
        assert_eq!(checksum(&bytes), (300u32 * 0xFF % 0x1_0000) as u16);
    }

    #[test]
    fn decodes_position_reply() {
        let mut reply = [0xCC, 0x00, 0x00, 0xE0, 0x2E, 0xDD, 0, 0];
        let [lo, hi] = checksum(&reply[..6]).to_le_bytes();
        reply[6] = lo;
        reply[7] = hi;

        let response = BinaryResponse::decode("SY08", &reply, true).unwrap();
        assert_eq!(response.word(), 12000);
        assert_eq!(response.status(), BinaryStatus::Idle);
    }

    #[test]
    fn checksum_mismatch_is_protocol_error_only_when_verifying() {
        let reply = [0xCC, 0x00, 0x00, 0x00, 0x00, 0xDD, 0x00, 0x00];
        let err = BinaryResponse::decode("SV07", &reply, true).unwrap_err();
        assert!(matches!(err, FluidicsError::Protocol { .. }));
        assert!(err.to_string().contains("checksum"));

        assert!(BinaryResponse::decode("SV07", &reply, false).is_ok());
    }

    #[test]
    fn short_and_malformed_frames_are_rejected() {
        assert!(BinaryResponse::decode("SV07", &[0xCC, 0x00], false).is_err());
        let no_header = [0xAA, 0x00, 0x00, 0x00, 0x00, 0xDD, 0x00, 0x00];
        assert!(BinaryResponse::decode("SV07", &no_header, false).is_err());
    }

    #[test]
    fn status_classification() {
        assert_eq!(BinaryStatus::from_code(0x00), BinaryStatus::Idle);
        assert_eq!(BinaryStatus::from_code(0xFE), BinaryStatus::Busy(0xFE));
        assert_eq!(BinaryStatus::from_code(0x05), BinaryStatus::Fault(0x05));

        let err = BinaryStatus::Fault(0x05).into_result("SY08").unwrap_err();
        assert!(err.to_string().contains("motor stalled"));
    }
}
