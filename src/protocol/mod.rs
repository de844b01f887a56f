//! Wire formats spoken by the supported devices.
//!
//! - [`binary`]: fixed 8-byte frames with a 16-bit additive checksum (SV07 valve, SY08 pump)
//! - [`ascii`]: the DT text protocol with status-byte replies (SY01B pump-valve)

pub mod ascii;
pub mod binary;
