//! Wire framing of the PowerMaster-8121 protocol.
//!
//! A frame on the wire is `STX · LEN · PAYLOAD · CRC · ETX`, where `LEN = 1 + len(PAYLOAD)`
//! and the CRC-8/MAXIM runs over `LEN ‖ PAYLOAD`. Commands carry `OPCODE · ARGS` as payload,
//! replies carry `CTRL · ECHO_OPCODE · DATA`.

use std::collections::VecDeque;
use std::io;

use tracing::trace;

use crate::crc8;
use crate::error::{Result, ZifError};

pub const STX: u8 = 0xA5;
pub const ETX: u8 = 0x5A;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Largest payload a one-byte length field can describe.
pub const MAX_PAYLOAD: usize = u8::MAX as usize - 1;

/// Something that hands out received bytes one at a time.
///
/// `Ok(None)` means the stream has nothing more to give (end of stream, or the
/// transport gave up waiting).
pub trait ByteSource {
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
}

impl ByteSource for VecDeque<u8> {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        Ok(self.pop_front())
    }
}

/// Wraps `payload` into a complete frame.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ZifError::FrameTooLong(payload.len()));
    }
    let len = (payload.len() + 1) as u8;

    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(STX);
    out.push(len);
    out.extend_from_slice(payload);
    let crc = crc8::compute(&out[1..]);
    out.push(crc);
    out.push(ETX);
    Ok(out)
}

/// Builds the frame for a command: `opcode` followed by `args`.
pub fn encode(opcode: u8, args: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(args.len() + 1);
    payload.push(opcode);
    payload.extend_from_slice(args);
    frame(&payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Length,
    Data,
    Checksum,
    End,
}

/// Byte-at-a-time frame parser.
///
/// Any framing fault (zero length byte, CRC mismatch, missing ETX) drops the partial
/// frame and goes back to hunting for STX. There is no limit on how many bytes may be
/// skipped; the transport bounds that through its read timeout.
#[derive(Debug, Clone)]
pub struct Receiver {
    state: State,
    // LEN followed by the payload received so far
    data: Vec<u8>,
    remaining: usize,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            data: Vec::new(),
            remaining: 0,
        }
    }

    /// Feeds one byte. Returns `LEN ‖ PAYLOAD` once a frame with a valid checksum and
    /// trailer has been read.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            State::Start => {
                if byte == STX {
                    self.state = State::Length;
                } else {
                    trace!("skipping byte {byte:#04x} outside frame");
                }
            }
            State::Length => {
                if byte < 1 {
                    self.resync("zero length byte");
                } else {
                    self.data.clear();
                    self.data.push(byte);
                    self.remaining = byte as usize - 1;
                    self.state = if self.remaining == 0 {
                        State::Checksum
                    } else {
                        State::Data
                    };
                }
            }
            State::Data => {
                self.data.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = State::Checksum;
                }
            }
            State::Checksum => {
                if byte == crc8::compute(&self.data) {
                    self.state = State::End;
                } else {
                    self.resync("checksum mismatch");
                }
            }
            State::End => {
                if byte == ETX {
                    self.state = State::Start;
                    return Some(std::mem::take(&mut self.data));
                }
                self.resync("missing end of frame");
            }
        }
        None
    }

    fn resync(&mut self, reason: &'static str) {
        trace!(reason, discarded = self.data.len(), "resynchronizing receiver");
        self.state = State::Start;
        self.data.clear();
        self.remaining = 0;
    }
}

/// Reads bytes from `source` until one complete frame arrives, then interprets it as
/// the reply to `sent_opcode`. Returns the reply DATA.
pub fn decode<S: ByteSource + ?Sized>(source: &mut S, sent_opcode: u8) -> Result<Vec<u8>> {
    let mut receiver = Receiver::new();
    loop {
        let byte = source
            .read_byte()
            .map_err(ZifError::ReceiveFailure)?
            .ok_or(ZifError::NoMoreData)?;
        if let Some(data) = receiver.push(byte) {
            return dispatch(&data, sent_opcode);
        }
    }
}

/// Interprets a validated `LEN ‖ CTRL · ECHO · DATA` frame.
fn dispatch(data: &[u8], sent_opcode: u8) -> Result<Vec<u8>> {
    let ctrl = *data.get(1).ok_or(ZifError::ReplyTooShort)?;
    let rest = data.get(3..).unwrap_or_default();
    match ctrl {
        ACK => {
            let echo = *data.get(2).ok_or(ZifError::ReplyTooShort)?;
            if echo != sent_opcode {
                return Err(ZifError::OutOfBand {
                    expected: sent_opcode,
                    actual: echo,
                });
            }
            Ok(rest.to_vec())
        }
        NAK => Err(ZifError::Nak(rest.to_vec())),
        other => Err(ZifError::UnrecognizedControl(other)),
    }
}
