//! # PowerMaster-8121 Simulator
//!
//! A software stand-in for the ZIF socket. It keeps the state the real hardware exposes
//! (serial number, firmware version, status bits, relay configuration), answers command
//! frames exactly like the device does, and can be wired to the driver in memory through
//! [`SimulatedTransport`].

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::driver::{opcode, status, Version};
use crate::error::Result;
use crate::frame::{self, ByteSource, Receiver, ACK, NAK};
use crate::transport::{Exchange, Port, Transport};
use crate::wiring::{PORT_MASKS, SLOTS};

// Reasons the simulated device refuses a command. Sent back as the NAK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The frame carried no opcode.
    Empty = 0x01,
    /// The opcode is not part of the catalogue.
    UnknownOpcode = 0x02,
    /// The argument count does not match the opcode.
    WrongArgumentCount = 0x03,
    /// An argument has a value the command does not accept.
    InvalidParameter = 0x04,
}

// Commands understood by the device.
#[derive(Debug, PartialEq)]
enum Command {
    GetSerial,
    GetVersion,
    GetStatus,
    SetActive(bool),
    SetMeter([u8; SLOTS]),
}

// The state of a simulated socket.
#[derive(Debug, Clone)]
pub struct Simulator {
    pub serial: u16,
    pub version: Version,
    pub active: bool,
    pub meter_present: bool,
    // Relay bytes last applied by a set-meter command.
    pub relays: [u8; SLOTS],
    receiver: Receiver,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(27370)
    }
}

impl Simulator {
    /// Creates a socket with the given serial number, inactive and empty.
    pub fn new(serial: u16) -> Self {
        Self {
            serial,
            version: Version { major: 2, minor: 22 },
            active: false,
            meter_present: false,
            relays: [0; SLOTS],
            receiver: Receiver::new(),
        }
    }

    pub fn status_byte(&self) -> u8 {
        let mut byte = 0;
        if self.active {
            byte |= status::ACTIVE;
        }
        if self.meter_present {
            byte |= status::HAS_METER;
        }
        byte
    }

    /// Feeds raw line bytes and returns the reply frames for every complete command.
    pub fn process_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut replies = Vec::new();
        for &b in bytes {
            if let Some(data) = self.receiver.push(b) {
                // data[0] is the length byte
                match self.process_payload(&data[1..]) {
                    Ok(reply) => replies.push(reply),
                    Err(e) => debug!("simulator could not frame reply: {e}"),
                }
            }
        }
        replies
    }

    /// Executes one command payload (`OPCODE · ARGS`) and frames the ACK or NAK.
    pub fn process_payload(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let opcode = payload.first().copied().unwrap_or_default();
        match self.parse_command(payload) {
            Ok(command) => {
                let mut reply = vec![ACK, opcode];
                reply.extend(self.execute_command(command));
                frame::frame(&reply)
            }
            Err(e) => {
                trace!(opcode, error = ?e, "simulator refusing command");
                frame::frame(&[NAK, opcode, e as u8])
            }
        }
    }

    fn parse_command(&self, payload: &[u8]) -> std::result::Result<Command, CommandError> {
        let (&op, args) = payload.split_first().ok_or(CommandError::Empty)?;
        let expect_args = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(CommandError::WrongArgumentCount)
            }
        };

        match op {
            opcode::GET_SERIAL => expect_args(0).map(|_| Command::GetSerial),
            opcode::GET_VERSION => expect_args(0).map(|_| Command::GetVersion),
            opcode::GET_STATUS => expect_args(0).map(|_| Command::GetStatus),
            opcode::SET_ACTIVE => {
                expect_args(1)?;
                match args[0] {
                    0 => Ok(Command::SetActive(false)),
                    1 => Ok(Command::SetActive(true)),
                    _ => Err(CommandError::InvalidParameter),
                }
            }
            opcode::SET_METER => {
                expect_args(SLOTS * 2)?;
                let mut relays = [0u8; SLOTS];
                for (slot, pair) in args.chunks_exact(2).enumerate() {
                    let (mask, value) = (pair[0], pair[1]);
                    if mask != PORT_MASKS[slot] || value & !mask != 0 {
                        return Err(CommandError::InvalidParameter);
                    }
                    relays[slot] = value;
                }
                Ok(Command::SetMeter(relays))
            }
            _ => Err(CommandError::UnknownOpcode),
        }
    }

    fn execute_command(&mut self, command: Command) -> Vec<u8> {
        match command {
            Command::GetSerial => self.serial.to_be_bytes().to_vec(),
            Command::GetVersion => {
                let mut data = self.version.major.to_le_bytes().to_vec();
                data.push(self.version.minor);
                data
            }
            Command::GetStatus => vec![self.status_byte()],
            Command::SetActive(on) => {
                self.active = on;
                Vec::new()
            }
            Command::SetMeter(relays) => {
                self.relays = relays;
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Default)]
struct Line {
    device: Option<Simulator>,
    noise: Vec<u8>,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

impl ByteSource for Line {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        Ok(self.rx.pop_front())
    }
}

impl Port for Line {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.push(bytes.to_vec());
        if let Some(device) = self.device.as_mut() {
            for reply in device.process_bytes(bytes) {
                self.rx.extend(self.noise.iter().copied());
                self.rx.extend(reply);
            }
        }
        Ok(())
    }
}

/// In-memory transport: either a [`Simulator`] answering each written frame, or a fixed
/// script of bytes handed out regardless of what was written.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    line: Mutex<Line>,
}

impl SimulatedTransport {
    pub fn new(device: Simulator) -> Self {
        Self {
            line: Mutex::new(Line {
                device: Some(device),
                ..Line::default()
            }),
        }
    }

    /// Replays `bytes` as the incoming stream.
    pub fn scripted(bytes: Vec<u8>) -> Self {
        Self {
            line: Mutex::new(Line {
                rx: bytes.into(),
                ..Line::default()
            }),
        }
    }

    /// Prefixes every device reply with `noise`.
    pub fn with_noise(self, noise: Vec<u8>) -> Self {
        let mut line = self.line.into_inner().unwrap_or_else(|p| p.into_inner());
        line.noise = noise;
        Self {
            line: Mutex::new(line),
        }
    }

    /// Every frame written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Snapshot of the simulated device.
    pub fn device(&self) -> Option<Simulator> {
        self.lock().device.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Line> {
        self.line.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Transport for SimulatedTransport {
    fn transact(&self, exchange: &mut Exchange<'_>) -> Result<Vec<u8>> {
        let mut line = self.lock();
        exchange(&mut *line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode, encode};

    // set-meter arguments for a 2S meter on 1P3W service
    const WIRED_2S: [u8; 14] = [
        0x0C, 0x04, 0x3F, 0x03, 0x3F, 0x0C, 0x9F, 0x00, 0xFF, 0x00, 0xE0, 0x20, 0x00, 0x00,
    ];

    fn reply_to(sim: &mut Simulator, op: u8, args: &[u8]) -> Vec<u8> {
        let replies = sim.process_bytes(&encode(op, args).unwrap());
        assert_eq!(replies.len(), 1);
        replies.into_iter().next().unwrap()
    }

    #[test]
    fn simulator_creation() {
        let sim = Simulator::new(0x1234);
        assert_eq!(sim.serial, 0x1234);
        assert_eq!(sim.status_byte(), 0);
    }

    #[test]
    fn answers_serial_like_the_device() {
        let mut sim = Simulator::default();
        assert_eq!(
            reply_to(&mut sim, opcode::GET_SERIAL, &[]),
            vec![0xA5, 0x05, 0x06, 0xC1, 0x6A, 0xEA, 0x09, 0x5A]
        );
    }

    #[test]
    fn answers_version_like_the_device() {
        let mut sim = Simulator::default();
        assert_eq!(
            reply_to(&mut sim, opcode::GET_VERSION, &[]),
            vec![0xA5, 0x08, 0x06, 0xC2, 0x02, 0x00, 0x00, 0x00, 0x16, 0x96, 0x5A]
        );
    }

    #[test]
    fn set_active_then_status() {
        let mut sim = Simulator::default();
        sim.meter_present = true;
        assert_eq!(
            reply_to(&mut sim, opcode::SET_ACTIVE, &[1]),
            vec![0xA5, 0x03, 0x06, 0x8D, 0x3F, 0x5A]
        );
        assert_eq!(
            reply_to(&mut sim, opcode::GET_STATUS, &[]),
            vec![0xA5, 0x04, 0x06, 0xC4, 0x03, 0xB2, 0x5A]
        );
    }

    #[test]
    fn set_meter_applies_relays() {
        let mut sim = Simulator::default();
        let mut rx: VecDeque<u8> = reply_to(&mut sim, opcode::SET_METER, &WIRED_2S).into();
        assert_eq!(decode(&mut rx, opcode::SET_METER).unwrap(), Vec::<u8>::new());
        assert_eq!(sim.relays, [0x04, 0x03, 0x0C, 0x00, 0x00, 0x20, 0x00]);
    }

    #[test]
    fn set_meter_rejects_value_outside_mask() {
        let mut sim = Simulator::default();
        let mut args = WIRED_2S;
        args[13] = 0x01;
        let mut rx: VecDeque<u8> = reply_to(&mut sim, opcode::SET_METER, &args).into();
        assert!(matches!(
            decode(&mut rx, opcode::SET_METER),
            Err(crate::ZifError::Nak(payload))
                if payload == vec![CommandError::InvalidParameter as u8]
        ));
        assert_eq!(sim.relays, [0; SLOTS]);
    }

    #[test]
    fn unknown_opcode_is_refused() {
        let mut sim = Simulator::default();
        assert_eq!(
            reply_to(&mut sim, 0x42, &[]),
            frame::frame(&[NAK, 0x42, CommandError::UnknownOpcode as u8]).unwrap()
        );
    }

    #[test]
    fn wrong_argument_count_is_refused() {
        let mut sim = Simulator::default();
        let reply = reply_to(&mut sim, opcode::SET_ACTIVE, &[]);
        assert_eq!(reply[4], CommandError::WrongArgumentCount as u8);
        assert!(!sim.active);
    }

    #[test]
    fn ignores_noise_between_commands() {
        let mut sim = Simulator::default();
        let mut bytes = vec![0x00, 0x13];
        bytes.extend(encode(opcode::GET_STATUS, &[]).unwrap());
        bytes.push(0x77);
        bytes.extend(encode(opcode::GET_SERIAL, &[]).unwrap());
        assert_eq!(sim.process_bytes(&bytes).len(), 2);
    }

    #[test]
    fn frame_split_across_writes() {
        let mut sim = Simulator::default();
        let bytes = encode(opcode::GET_SERIAL, &[]).unwrap();
        assert!(sim.process_bytes(&bytes[..2]).is_empty());
        assert_eq!(sim.process_bytes(&bytes[2..]).len(), 1);
    }
}
