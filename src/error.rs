//! Error types for the PowerMaster-8121 driver.

use std::io;

use thiserror::Error;

/// Every way a ZIF socket transaction can fail.
///
/// Framing faults (bad length byte, CRC mismatch, missing ETX) never show up here: the
/// receiver resynchronizes on them. Only the stream running dry surfaces, as `NoMoreData`.
#[derive(Error, Debug)]
pub enum ZifError {
    /// The reply DATA did not have the size the operation expects.
    #[error("reply data has {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },

    /// The transport yielded no byte before a complete frame was read.
    #[error("no more data from the socket before a complete frame arrived")]
    NoMoreData,

    /// An ACK frame too short to carry the echoed opcode.
    #[error("acknowledge reply too short to carry an opcode echo")]
    ReplyTooShort,

    /// The reply echoed a different opcode than the one just sent.
    #[error("out of band reply: sent opcode {expected:#04x}, device echoed {actual:#04x}")]
    OutOfBand { expected: u8, actual: u8 },

    /// The device refused the command.
    #[error("device replied NAK (payload: {})", hex::encode_upper(.0))]
    Nak(Vec<u8>),

    #[error("unrecognized control byte {0:#04x}")]
    UnrecognizedControl(u8),

    #[error("failed to send command")]
    SendFailure(#[source] io::Error),

    #[error("failed to receive reply")]
    ReceiveFailure(#[source] io::Error),

    /// No wiring configuration exists for the pair.
    #[error("no wiring configuration for meter form {meter_form:?} with service type {service_type:?}")]
    UnknownMeterWiring {
        meter_form: String,
        service_type: String,
    },

    /// The command does not fit into a single frame (the length byte is one byte wide).
    #[error("command of {0} bytes does not fit into a frame")]
    FrameTooLong(usize),

    /// A wiring byte sets bits outside its slot mask.
    #[error("wiring {meter_form}/{service_type}: slot {slot} value {value:#04x} outside mask {mask:#04x}")]
    InvalidWiring {
        meter_form: String,
        service_type: String,
        slot: usize,
        value: u8,
        mask: u8,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ZifError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for faults raised by the device's answer rather than by the line or the caller.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            Self::BadLength { .. }
                | Self::ReplyTooShort
                | Self::OutOfBand { .. }
                | Self::Nak(_)
                | Self::UnrecognizedControl(_)
        )
    }
}

impl From<serde_json::Error> for ZifError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ZifError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nak_message_shows_payload_in_hex() {
        let err = ZifError::Nak(vec![0x01, 0xAB]);
        assert_eq!(err.to_string(), "device replied NAK (payload: 01AB)");
    }

    #[test]
    fn out_of_band_message_names_both_opcodes() {
        let err = ZifError::OutOfBand { expected: 0xC1, actual: 0xC2 };
        assert_eq!(
            err.to_string(),
            "out of band reply: sent opcode 0xc1, device echoed 0xc2"
        );
    }

    #[test]
    fn transport_failures_keep_their_cause() {
        use std::error::Error as _;
        let err = ZifError::ReceiveFailure(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.source().map(|s| s.to_string()), Some("gone".to_string()));
        assert!(!err.is_protocol_fault());
        assert!(ZifError::UnrecognizedControl(0x42).is_protocol_fault());
    }
}
