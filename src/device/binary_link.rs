//! Request/response exchange over the binary frame protocol.
//!
//! Shared by every device that speaks 8-byte frames. Each exchange writes one frame and reads
//! one fixed-length reply. An empty reply is read once more before giving up, since these
//! devices occasionally answer late right after a motion command.

use crate::device::{DeviceHandle, PollPolicy};
use crate::error::{AppResult, FluidicsError};
use crate::protocol::binary::{BinaryFrame, BinaryResponse, BinaryStatus, FRAME_LEN};
use crate::transport::{hex, Transport};
use tracing::{debug, trace};

/// Status query function code, common to SV07 and SY08.
pub const QUERY_STATUS: u8 = 0x4A;

/// A transport plus the device identity and exchange options.
#[derive(Debug)]
pub struct BinaryLink<T> {
    transport: T,
    handle: DeviceHandle,
    verify_checksum: bool,
    poll: PollPolicy,
}

impl<T: Transport> BinaryLink<T> {
    /// Wrap `transport` for the device described by `handle`.
    pub fn new(transport: T, handle: DeviceHandle, verify_checksum: bool, poll: PollPolicy) -> Self {
        Self {
            transport,
            handle,
            verify_checksum,
            poll,
        }
    }

    /// Device identity.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Mutable device identity, for recording positions.
    pub fn handle_mut(&mut self) -> &mut DeviceHandle {
        &mut self.handle
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the link, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Build a frame addressed to this device.
    #[must_use]
    pub fn frame(&self, opcode: u8) -> BinaryFrame {
        BinaryFrame::new(self.handle.address, opcode)
    }

    /// Send one frame and decode the reply. Fault statuses become [`FluidicsError::DeviceFault`].
    pub fn exchange(&mut self, frame: BinaryFrame) -> AppResult<BinaryResponse> {
        let label = self.handle.label();
        let bytes = frame.encode();
        trace!(device = %label, tx = %hex(&bytes), "Binary request");
        self.transport.write(&bytes)?;

        let mut reply = self.transport.read(FRAME_LEN)?;
        if reply.is_empty() {
            debug!(device = %label, "Empty reply, reading again");
            reply = self.transport.read(FRAME_LEN)?;
        }
        if reply.is_empty() {
            return Err(FluidicsError::transport(&label, "no response"));
        }
        trace!(device = %label, rx = %hex(&reply), "Binary reply");

        let response = BinaryResponse::decode(&label, &reply, self.verify_checksum)?;
        response.status().into_result(&label)?;
        Ok(response)
    }

    /// Poll the status function until the device reports idle.
    pub fn wait_idle(&mut self) -> AppResult<u32> {
        let label = self.handle.label();
        let policy = self.poll;
        let status_frame = self.frame(QUERY_STATUS);
        policy.wait_until(&label, || {
            let response = self.exchange(status_frame)?;
            Ok(response.status() == BinaryStatus::Idle)
        })
    }

    /// Release the transport.
    pub fn close(&mut self) -> AppResult<()> {
        self.transport.close()
    }
}
