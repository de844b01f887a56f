//! DT ASCII simulator.

use super::ReplyBuffer;
use crate::device::sy01b::{StepMode, MAX_SPEED};
use crate::error::AppResult;
use crate::protocol::ascii::address_char;
use crate::transport::Transport;
use tracing::trace;

const INVALID_COMMAND: u8 = 2;
const INVALID_OPERAND: u8 = 3;

/// Simulated SY01B pump-valve.
#[derive(Debug)]
pub struct SimulatedSy01b {
    address: u8,
    ports: u8,
    port: u8,
    mode: StepMode,
    position: u32,
    speed: u32,
    busy_polls: u32,
    busy_remaining: u32,
    injected: Option<u8>,
    commands: Vec<String>,
    buffer: ReplyBuffer,
}

impl SimulatedSy01b {
    /// Empty pump-valve at `address`, normal step mode, 9 ports.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ports: 9,
            port: 1,
            mode: StepMode::Normal,
            position: 0,
            speed: 4000,
            busy_polls: 0,
            busy_remaining: 0,
            injected: None,
            commands: Vec::new(),
            buffer: ReplyBuffer::default(),
        }
    }

    /// Number of valve ports.
    #[must_use]
    pub fn with_ports(mut self, ports: u8) -> Self {
        self.ports = ports;
        self
    }

    /// Replies answered "busy" after each motion.
    #[must_use]
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Put this error code in the next reply.
    pub fn inject_error(&mut self, code: u8) {
        self.injected = Some(code & 0x0F);
    }

    /// Plunger position in steps.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Valve port.
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Command bodies received, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    fn start_motion(&mut self) {
        self.busy_remaining = self.busy_polls;
    }

    fn move_plunger(&mut self, target: Option<u32>) -> Result<(), u8> {
        match target.filter(|t| *t <= self.mode.stroke()) {
            Some(target) => {
                self.position = target;
                self.start_motion();
                Ok(())
            }
            None => Err(INVALID_OPERAND),
        }
    }

    /// Execute a command string, returning reply data or an error code.
    fn run(&mut self, body: &str) -> Result<String, u8> {
        let mut data = String::new();
        let mut chars = body.chars().peekable();

        while let Some(letter) = chars.next() {
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            let operand = if digits.is_empty() {
                None
            } else {
                Some(digits.parse::<u32>().map_err(|_| INVALID_OPERAND)?)
            };

            match letter {
                'Q' => {}
                '?' => {
                    let value = match operand {
                        None => self.position,
                        Some(2) => self.speed,
                        Some(6) => u32::from(self.port),
                        Some(28) => u32::from(self.mode.code()),
                        Some(_) => 0,
                    };
                    data = value.to_string();
                }
                '#' => data = "SY01B-SIM".to_string(),
                'N' => {
                    self.mode = match operand {
                        Some(0) => StepMode::Normal,
                        Some(1) => StepMode::Fine,
                        Some(2) => StepMode::Micro,
                        _ => return Err(INVALID_OPERAND),
                    };
                    self.position = self.position.min(self.mode.stroke());
                }
                'Z' => {
                    self.position = 0;
                    self.port = 1;
                    self.start_motion();
                }
                'I' => match operand.and_then(|p| u8::try_from(p).ok()) {
                    Some(port) if (1..=self.ports).contains(&port) => {
                        self.port = port;
                        self.start_motion();
                    }
                    _ => return Err(INVALID_OPERAND),
                },
                'A' => self.move_plunger(operand)?,
                'P' => {
                    let step = operand.ok_or(INVALID_OPERAND)?;
                    self.move_plunger(self.position.checked_add(step))?;
                }
                'D' => {
                    let step = operand.ok_or(INVALID_OPERAND)?;
                    self.move_plunger(self.position.checked_sub(step))?;
                }
                'V' => match operand {
                    Some(speed) if speed <= MAX_SPEED => self.speed = speed,
                    _ => return Err(INVALID_OPERAND),
                },
                'H' | 'T' => self.busy_remaining = 0,
                'K' | 'L' | 'v' | 'c' | 'S' | 'M' | 'G' | 'X' => {}
                _ => return Err(INVALID_COMMAND),
            }
        }
        Ok(data)
    }

    fn status_byte(&mut self, error: u8) -> u8 {
        let ready = if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            0x00
        } else {
            0x20
        };
        0x40 | ready | error
    }
}

impl Transport for SimulatedSy01b {
    fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.buffer.ensure_open("sim SY01B")?;
        self.buffer.clear();

        let text = String::from_utf8_lossy(bytes);
        let Some(frame) = text.strip_prefix('/').and_then(|t| t.strip_suffix('\r')) else {
            trace!("SY01B sim ignored malformed command");
            return Ok(());
        };
        let mut chars = frame.chars();
        if chars.next() != Some(address_char(self.address)) {
            return Ok(());
        }
        let body = chars.as_str();
        let body = body.strip_suffix('R').unwrap_or(body);
        self.commands.push(body.to_string());

        let (error, data) = match self.injected.take() {
            Some(code) => (code, String::new()),
            None => match self.run(body) {
                Ok(data) => (0, data),
                Err(code) => (code, String::new()),
            },
        };
        let status = self.status_byte(error);

        let mut reply = vec![0xFF, b'/', b'0', status];
        reply.extend_from_slice(data.as_bytes());
        reply.extend_from_slice(b"\x03\r\n");
        self.buffer.replace(reply);
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> AppResult<Vec<u8>> {
        self.buffer.ensure_open("sim SY01B")?;
        Ok(self.buffer.take(max_len))
    }

    fn read_until_timeout(&mut self) -> AppResult<Vec<u8>> {
        self.buffer.ensure_open("sim SY01B")?;
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
    use crate::protocol::ascii::parse_reply;

    fn send(sim: &mut SimulatedSy01b, command: &str) -> String {
        sim.write(command.as_bytes()).unwrap();
        let raw = sim.read_until_timeout().unwrap();
        let reply = parse_reply("sim", &raw).unwrap();
        format!("{}{}", char::from(reply.status.0), reply.data)
    }

    #[test]
    fn chained_commands_run_in_order() {
        let mut sim = SimulatedSy01b::new(1);
        send(&mut sim, "/1N2Z1R\r");
        assert_eq!(sim.mode, StepMode::Micro);
        send(&mut sim, "/1A90000R\r");
        assert_eq!(sim.position(), 90000);
    }

    #[test]
    fn queries_report_data() {
        let mut sim = SimulatedSy01b::new(1);
        assert_eq!(send(&mut sim, "/1?\r"), "`0");
        assert_eq!(send(&mut sim, "/1?6\r"), "`1");
    }

    #[test]
    fn bad_operand_sets_error_nibble() {
        let mut sim = SimulatedSy01b::new(1);
        assert_eq!(send(&mut sim, "/1A12001R\r"), "c");
        assert_eq!(send(&mut sim, "/1I0R\r"), "c");
        assert_eq!(send(&mut sim, "/1WR\r"), "b");
        assert_eq!(sim.position(), 0);
    }

    #[test]
    fn motion_reports_busy_for_configured_polls() {
        let mut sim = SimulatedSy01b::new(1).with_busy_polls(2);
        assert_eq!(send(&mut sim, "/1P100R\r"), "@");
        assert_eq!(send(&mut sim, "/1Q\r"), "@");
        assert_eq!(send(&mut sim, "/1Q\r"), "`");
    }

    #[test]
    fn other_addresses_get_no_reply() {
        let mut sim = SimulatedSy01b::new(1);
        sim.write(b"/2?\r").unwrap();
        assert!(sim.read_until_timeout().unwrap().is_empty());
    }
}
