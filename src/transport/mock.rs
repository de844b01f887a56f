//! Scripted transport for testing drivers without hardware
//!
//! `MockTransport` replays a queue of canned responses and records every frame written to it,
//! so tests can assert both on what a driver sent and on what it did with the reply. It also
//! supports failure injection for the next write.

use super::Transport;
use crate::error::{AppResult, FluidicsError};
use std::collections::VecDeque;

/// Transport that answers from a script.
///
/// # Example
///
/// ```
/// use rust_fluidics::transport::{MockTransport, Transport};
///
/// let mut port = MockTransport::new().with_responses([b"/0`\x03\r\n".to_vec()]);
/// port.write(b"/1Q\r").unwrap();
/// assert_eq!(port.read_until_timeout().unwrap(), b"/0`\x03\r\n".to_vec());
/// assert_eq!(port.write_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: VecDeque<Vec<u8>>,
    fallback: Option<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    fail_next_write: bool,
    closed: bool,
}

impl MockTransport {
    /// Empty script: every read times out with no data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses in the order they should be read.
    pub fn with_responses<I>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.responses.extend(responses);
        self
    }

    /// Response returned once the queue runs dry.
    pub fn with_fallback(mut self, response: Vec<u8>) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Append one response to the queue.
    pub fn push_response(&mut self, response: Vec<u8>) {
        self.responses.push_back(response);
    }

    /// Make the next write fail with a transport error.
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    /// Every frame written so far.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Number of frames written so far.
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Responses still waiting to be read.
    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    fn next_response(&mut self) -> Vec<u8> {
        self.responses
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(FluidicsError::transport("mock", "port is closed"));
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.ensure_open()?;
        if std::mem::take(&mut self.fail_next_write) {
            return Err(FluidicsError::transport("mock", "injected write failure"));
        }
        self.writes.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>> {
        self.ensure_open()?;
        let mut response = self.next_response();
        if response.len() > max_len {
            // Leave the tail for the next read, like bytes still sitting in the UART.
            let tail = response.split_off(max_len);
            self.responses.push_front(tail);
        }
        Ok(response)
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        self.ensure_open()?;
        Ok(self.next_response())
    }

    fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}
