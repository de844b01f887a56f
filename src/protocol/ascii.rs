//! DT text protocol.
//!
//! Commands are `/` + address + command string + optional `R` (execute) + carriage return.
//! Replies look like `/0` + status byte + data + ETX + CR LF, where `0` is the master address.
//! Bit 5 of the status byte is set while the device is idle; the low nibble carries an error
//! code (zero on success).

use crate::error::{AppResult, FluidicsError};

/// Status byte bit that reads 1 while the device is ready.
const READY_BIT: u8 = 0x20;
/// Low nibble of the status byte.
const ERROR_MASK: u8 = 0x0F;

/// One outgoing DT command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiCommand {
    address: u8,
    body: String,
    execute: bool,
}

impl AsciiCommand {
    /// Command that runs immediately (`R` suffix).
    pub fn execute(address: u8, body: impl Into<String>) -> Self {
        Self {
            address,
            body: body.into(),
            execute: true,
        }
    }

    /// Query or buffered command (no `R` suffix).
    pub fn query(address: u8, body: impl Into<String>) -> Self {
        Self {
            address,
            body: body.into(),
            execute: false,
        }
    }

    /// Command string without framing.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.body.len() + 4);
        out.push('/');
        out.push(address_char(self.address));
        out.push_str(&self.body);
        if self.execute {
            out.push('R');
        }
        out.push('\r');
        out.into_bytes()
    }
}

/// DT addresses run '1'..'9' then continue up the ASCII table (':' is 10).
#[must_use]
pub fn address_char(address: u8) -> char {
    char::from(b'0'.wrapping_add(address))
}

/// Status byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtStatus(pub u8);

impl DtStatus {
    /// Device is ready for a new command.
    #[must_use]
    pub fn is_idle(self) -> bool {
        self.0 & READY_BIT != 0
    }

    /// Error code in the low nibble (0 = none).
    #[must_use]
    pub fn error_code(self) -> u8 {
        self.0 & ERROR_MASK
    }
}

/// Decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtReply {
    /// Status byte
    pub status: DtStatus,
    /// Payload following the status byte, possibly empty
    pub data: String,
}

impl DtReply {
    /// Parse the payload as an unsigned integer.
    pub fn data_as_u32(&self, device: &str) -> AppResult<u32> {
        self.data.trim().parse::<u32>().map_err(|_| {
            FluidicsError::protocol(device, format!("expected integer, got '{}'", self.data))
        })
    }

    /// Turn a non-zero error nibble into a [`FluidicsError::DeviceFault`].
    pub fn check(self, device: &str) -> AppResult<Self> {
        match self.status.error_code() {
            0 => Ok(self),
            code => Err(FluidicsError::DeviceFault {
                device: device.to_string(),
                code,
                description: describe_error(code),
            }),
        }
    }
}

/// Keep printable ASCII only.
#[must_use]
pub fn clean_response(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|&b| char::from(b))
        .collect()
}

/// Parse a raw reply. Anything before the leading `/` is ignored as line noise.
pub fn parse_reply(device: &str, bytes: &[u8]) -> AppResult<DtReply> {
    let text = clean_response(bytes);
    let start = text
        .find('/')
        .ok_or_else(|| FluidicsError::protocol(device, format!("no reply marker in '{text}'")))?;
    let mut chars = text[start + 1..].chars();

    match chars.next() {
        Some('0') => {}
        other => {
            return Err(FluidicsError::protocol(
                device,
                format!("reply not addressed to master: {other:?}"),
            ));
        }
    }

    let status = chars
        .next()
        .ok_or_else(|| FluidicsError::protocol(device, "reply has no status byte"))?;
    let status = u8::try_from(u32::from(status))
        .ok()
        .filter(|b| b & 0x40 != 0)
        .ok_or_else(|| {
            FluidicsError::protocol(device, format!("invalid status byte '{status}'"))
        })?;

    Ok(DtReply {
        status: DtStatus(status),
        data: chars.as_str().trim().to_string(),
    })
}

/// Meaning of a DT error code.
#[must_use]
pub fn describe_error(code: u8) -> &'static str {
    match code {
        0 => "no error",
        1 => "initialization error",
        2 => "invalid command",
        3 => "invalid operand",
        4 => "invalid command sequence",
        6 => "EEPROM failure",
        7 => "device not initialized",
        8 | 12 => "internal failure",
        9 => "plunger overload",
        10 => "valve overload",
        11 => "plunger move not allowed",
        14 => "A/D converter failure",
        15 => "command overflow",
        _ => "unrecognised error",
    }
}
