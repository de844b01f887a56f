//! Binary-frame simulators.

use super::ReplyBuffer;
use crate::device::sv07::Sv07Opcode;
use crate::device::sy08::{Sy08Opcode, MAX_SPEED};
use crate::error::AppResult;
use crate::protocol::binary::{checksum, BinaryFrame, BinaryStatus, FRAME_LEN, HEADER, TERMINATOR};
use crate::transport::Transport;
use tracing::trace;

const PARAMETER_ERROR: u8 = 0x02;

/// Parse a request frame. Malformed frames are ignored by the firmware.
fn parse_request(bytes: &[u8]) -> Option<BinaryFrame> {
    if bytes.len() != FRAME_LEN || bytes[0] != HEADER || bytes[5] != TERMINATOR {
        return None;
    }
    if checksum(&bytes[..6]) != u16::from_le_bytes([bytes[6], bytes[7]]) {
        return None;
    }
    Some(BinaryFrame {
        address: bytes[1],
        opcode: bytes[2],
        params: [bytes[3], bytes[4]],
    })
}

/// Encode a reply: status in place of the opcode.
fn reply(address: u8, status: u8, word: u16) -> Vec<u8> {
    BinaryFrame::new(address, status)
        .with_word(word)
        .encode()
        .to_vec()
}

/// Busy countdown shared by both binary devices.
#[derive(Debug, Default)]
struct Motion {
    busy_polls: u32,
    remaining: u32,
}

impl Motion {
    fn start(&mut self) {
        self.remaining = self.busy_polls;
    }

    fn poll(&mut self) -> u8 {
        if self.remaining > 0 {
            self.remaining -= 1;
            BinaryStatus::EXECUTING
        } else {
            0x00
        }
    }
}

/// Simulated SV07 selector valve.
#[derive(Debug)]
pub struct SimulatedSv07 {
    address: u8,
    ports: u8,
    port: u8,
    motion: Motion,
    injected: Option<u8>,
    requests: Vec<BinaryFrame>,
    buffer: ReplyBuffer,
}

impl SimulatedSv07 {
    /// Valve at `address` with 16 ports, resting on port 1.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ports: 16,
            port: 1,
            motion: Motion::default(),
            injected: None,
            requests: Vec::new(),
            buffer: ReplyBuffer::default(),
        }
    }

    /// Number of ports on the head.
    #[must_use]
    pub fn with_ports(mut self, ports: u8) -> Self {
        self.ports = ports;
        self
    }

    /// Status polls answered "executing" after each move.
    #[must_use]
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.motion.busy_polls = polls;
        self
    }

    /// Answer the next request with this status code.
    pub fn inject_status(&mut self, code: u8) {
        self.injected = Some(code);
    }

    /// Port the valve is on.
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Every valid request received.
    pub fn requests(&self) -> &[BinaryFrame] {
        &self.requests
    }

    fn handle(&mut self, frame: BinaryFrame) -> (u8, u16) {
        match Sv07Opcode::from_code(frame.opcode) {
            Some(Sv07Opcode::ChangePort) => {
                let port = frame.params[0];
                if (1..=self.ports).contains(&port) {
                    self.port = port;
                    self.motion.start();
                    (0x00, 0)
                } else {
                    (PARAMETER_ERROR, 0)
                }
            }
            Some(Sv07Opcode::Reset | Sv07Opcode::OriginReset) => {
                self.port = 1;
                self.motion.start();
                (0x00, 0)
            }
            Some(Sv07Opcode::QueryPosition) => (0x00, u16::from(self.port)),
            Some(Sv07Opcode::QueryVersion) => (0x00, 0x0107),
            Some(Sv07Opcode::QueryAddress) => (0x00, u16::from(self.address)),
            Some(Sv07Opcode::StrongStop) => {
                self.motion.remaining = 0;
                (0x00, 0)
            }
            None if frame.opcode == crate::device::binary_link::QUERY_STATUS => {
                (self.motion.poll(), 0)
            }
            None => (PARAMETER_ERROR, 0),
        }
    }
}

impl Transport for SimulatedSv07 {
    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.buffer.ensure_open("sim SV07")?;
        self.buffer.clear();
        let Some(frame) = parse_request(bytes) else {
            trace!("SV07 sim ignored malformed frame");
            return Ok(());
        };
        if frame.address != self.address {
            return Ok(());
        }
        self.requests.push(frame);
        let (status, word) = match self.injected.take() {
            Some(code) => (code, 0),
            None => self.handle(frame),
        };
        self.buffer.replace(reply(self.address, status, word));
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>> {
        self.buffer.ensure_open("sim SV07")?;
        Ok(self.buffer.take(max_len))
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        self.buffer.ensure_open("sim SV07")?;
        Ok(self.buffer.take_all())
    }

    fn close(&mut self) -> AppResult<()> {
        self.buffer.close();
        Ok(())
    }
}

/// Simulated SY08 syringe pump.
#[derive(Debug)]
pub struct SimulatedSy08 {
    address: u8,
    stroke: u16,
    position: u16,
    speed: u16,
    motion: Motion,
    injected: Option<u8>,
    requests: Vec<BinaryFrame>,
    buffer: ReplyBuffer,
}

impl SimulatedSy08 {
    /// Empty pump at `address` with a 12000 step stroke.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            stroke: 12000,
            position: 0,
            speed: 0,
            motion: Motion::default(),
            injected: None,
            requests: Vec::new(),
            buffer: ReplyBuffer::default(),
        }
    }

    /// Full-stroke step count.
    #[must_use]
    pub fn with_stroke(mut self, stroke: u16) -> Self {
        self.stroke = stroke;
        self
    }

    /// Status polls answered "executing" after each move.
    #[must_use]
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.motion.busy_polls = polls;
        self
    }

    /// Answer the next request with this status code.
    pub fn inject_status(&mut self, code: u8) {
        self.injected = Some(code);
    }

    /// Plunger position in steps.
    pub fn position(&self) -> u16 {
        self.position
    }

    /// Last speed set.
    pub fn speed(&self) -> u16 {
        self.speed
    }

    /// Every valid request received.
    pub fn requests(&self) -> &[BinaryFrame] {
        &self.requests
    }

    fn move_to(&mut self, target: Option<u16>) -> (u8, u16) {
        match target.filter(|t| *t <= self.stroke) {
            Some(target) => {
                self.position = target;
                self.motion.start();
                (0x00, 0)
            }
            None => (PARAMETER_ERROR, 0),
        }
    }

    fn handle(&mut self, frame: BinaryFrame) -> (u8, u16) {
        let word = u16::from_le_bytes(frame.params);
        match Sy08Opcode::from_code(frame.opcode) {
            Some(Sy08Opcode::Aspirate) => self.move_to(self.position.checked_add(word)),
            Some(Sy08Opcode::Discharge) => self.move_to(self.position.checked_sub(word)),
            Some(Sy08Opcode::SetPosition) => self.move_to(Some(word)),
            Some(Sy08Opcode::Reset | Sy08Opcode::ForcedReset) => self.move_to(Some(0)),
            Some(Sy08Opcode::SetSpeed) => {
                if u32::from(word) <= MAX_SPEED {
                    self.speed = word;
                    (0x00, 0)
                } else {
                    (PARAMETER_ERROR, 0)
                }
            }
            Some(Sy08Opcode::QueryPosition) => (0x00, self.position),
            Some(Sy08Opcode::QueryMaxSpeed) => (0x00, 600),
            Some(Sy08Opcode::QuerySubdivision) => (0x00, 8),
            Some(Sy08Opcode::QueryVersion) => (0x00, 0x0102),
            Some(Sy08Opcode::QueryAddress) => (0x00, u16::from(self.address)),
            Some(Sy08Opcode::StrongStop) => {
                self.motion.remaining = 0;
                (0x00, 0)
            }
            None if frame.opcode == crate::device::binary_link::QUERY_STATUS => {
                (self.motion.poll(), 0)
            }
            None => (PARAMETER_ERROR, 0),
        }
    }
}

impl Transport for SimulatedSy08 {
    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.buffer.ensure_open("sim SY08")?;
        self.buffer.clear();
        let Some(frame) = parse_request(bytes) else {
            trace!("SY08 sim ignored malformed frame");
            return Ok(());
        };
        if frame.address != self.address {
            return Ok(());
        }
        self.requests.push(frame);
        let (status, word) = match self.injected.take() {
            Some(code) => (code, 0),
            None => self.handle(frame),
        };
        self.buffer.replace(reply(self.address, status, word));
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>> {
        self.buffer.ensure_open("sim SY08")?;
        Ok(self.buffer.take(max_len))
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        self.buffer.ensure_open("sim SY08")?;
        Ok(self.buffer.take_all())
    }

    fn close(&mut self) -> AppResult<()> {
        self.buffer.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(sim: &mut impl Transport, frame: BinaryFrame) -> Vec<u8> {
        sim.write(&frame.encode()).unwrap();
        sim.read(FRAME_LEN).unwrap()
    }

    #[test]
    fn valve_rejects_port_beyond_head() {
        let mut sim = SimulatedSv07::new(0).with_ports(6);
        let reply = send(&mut sim, BinaryFrame::new(0, 0x44).with_byte(7));
        assert_eq!(reply[2], PARAMETER_ERROR);
        assert_eq!(sim.port(), 1);
    }

    #[test]
    fn valve_reports_busy_then_idle() {
        let mut sim = SimulatedSv07::new(0).with_busy_polls(1);
        send(&mut sim, BinaryFrame::new(0, 0x44).with_byte(5));
        assert_eq!(send(&mut sim, BinaryFrame::new(0, 0x4A))[2], 0xFE);
        assert_eq!(send(&mut sim, BinaryFrame::new(0, 0x4A))[2], 0x00);
        assert_eq!(send(&mut sim, BinaryFrame::new(0, 0x3E))[3], 5);
    }

    #[test]
    fn pump_ignores_corrupt_frames() {
        let mut sim = SimulatedSy08::new(0);
        let mut frame = BinaryFrame::new(0, 0x66).encode();
        frame[7] ^= 0x01;
        sim.write(&frame).unwrap();
        assert!(sim.read(FRAME_LEN).unwrap().is_empty());
    }

    #[test]
    fn pump_refuses_to_overfill() {
        let mut sim = SimulatedSy08::new(0);
        let reply = send(&mut sim, BinaryFrame::new(0, 0x4D).with_word(12001));
        assert_eq!(reply[2], PARAMETER_ERROR);
        assert_eq!(sim.position(), 0);
    }

    #[test]
    fn other_addresses_are_ignored() {
        let mut sim = SimulatedSy08::new(0);
        sim.write(&BinaryFrame::new(3, 0x66).encode()).unwrap();
        assert!(sim.read(FRAME_LEN).unwrap().is_empty());
    }
}
