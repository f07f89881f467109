//! The PowerMaster-8121 command catalogue.
//!
//! Each operation is exactly one transaction: encode the command, write it, read one reply
//! frame, decode. Nothing is retried here.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ZifError};
use crate::frame;
use crate::iface_log::{Direction, EntryGuard, InterfaceLog, TracingInterfaceLog};
use crate::transport::{Port, Transport};
use crate::wiring::MeterWiringTable;

/// Command opcodes understood by the socket.
pub mod opcode {
    pub const GET_SERIAL: u8 = 0xC1;
    pub const GET_VERSION: u8 = 0xC2;
    pub const GET_STATUS: u8 = 0xC4;
    pub const SET_ACTIVE: u8 = 0x8D;
    pub const SET_METER: u8 = 0x8E;
}

/// Status byte bits.
pub mod status {
    pub const ACTIVE: u8 = 0x01;
    pub const HAS_METER: u8 = 0x02;
}

/// Firmware version reported by the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: i32,
    pub minor: u8,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Driver for one PowerMaster-8121 ZIF socket.
pub struct PowerMaster {
    transport: Arc<dyn Transport>,
    log: Arc<dyn InterfaceLog>,
    wiring: MeterWiringTable,
}

impl PowerMaster {
    /// Uses the builtin wiring table and logs the interface through `tracing`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            log: Arc::new(TracingInterfaceLog),
            wiring: MeterWiringTable::builtin().clone(),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn InterfaceLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_wiring(mut self, wiring: MeterWiringTable) -> Self {
        self.wiring = wiring;
        self
    }

    pub fn wiring(&self) -> &MeterWiringTable {
        &self.wiring
    }

    pub fn get_version(&self) -> Result<Version> {
        let data = self.execute(opcode::GET_VERSION, &[])?;
        expect_len(&data, 5)?;
        Ok(Version {
            major: i32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            minor: data[4],
        })
    }

    pub fn get_serial(&self) -> Result<u16> {
        let data = self.execute(opcode::GET_SERIAL, &[])?;
        expect_len(&data, 2)?;
        Ok(u16::from(data[1]) + 256 * u16::from(data[0]))
    }

    /// Raw status byte.
    pub fn get_status(&self) -> Result<u8> {
        let data = self.execute(opcode::GET_STATUS, &[])?;
        expect_len(&data, 1)?;
        Ok(data[0])
    }

    pub fn get_active(&self) -> Result<bool> {
        Ok(self.get_status()? & status::ACTIVE == status::ACTIVE)
    }

    pub fn get_has_meter(&self) -> Result<bool> {
        Ok(self.get_status()? & status::HAS_METER == status::HAS_METER)
    }

    /// Error flag of the status byte.
    ///
    /// Kept bit-for-bit with the deployed service: `(status & 0x40A) == 0x40`. On a single
    /// byte that compares bits 1 and 3 against 0x40, so it can never be true. Owners of
    /// behavioral parity should decide on the intended mask before this changes.
    pub fn get_has_error(&self) -> Result<bool> {
        let status = u32::from(self.get_status()?);
        Ok(status & 0x40A == 0x40)
    }

    pub fn set_active(&self, on: bool) -> Result<()> {
        self.execute(opcode::SET_ACTIVE, &[u8::from(on)])?;
        Ok(())
    }

    /// Configures the socket relays for a meter. Fails with `UnknownMeterWiring`
    /// before any I/O if the pair is not in the wiring table.
    pub fn set_meter(&self, meter_form: &str, service_type: &str) -> Result<()> {
        let config = self.wiring.resolve(meter_form, service_type)?;
        self.execute(opcode::SET_METER, &config.command_args())?;
        Ok(())
    }

    /// Runs one command and returns the reply DATA.
    pub fn execute(&self, opcode: u8, args: &[u8]) -> Result<Vec<u8>> {
        let request = frame::encode(opcode, args)?;
        let correlation_id = Uuid::new_v4();
        debug!(
            %correlation_id,
            opcode,
            request = %hex::encode_upper(&request),
            "sending command"
        );

        let log = self.log.as_ref();
        let result = self.transport.transact(&mut |port: &mut dyn Port| {
            send(log, correlation_id, port, &request)?;
            receive(log, correlation_id, port, opcode)
        });

        match &result {
            Ok(data) => {
                debug!(%correlation_id, data = %hex::encode_upper(data), "command completed")
            }
            Err(err) if err.is_protocol_fault() => {
                warn!(%correlation_id, opcode, "device rejected command: {err}")
            }
            Err(err) => warn!(%correlation_id, opcode, "transaction failed: {err}"),
        }
        result
    }
}

fn send(
    log: &dyn InterfaceLog,
    correlation_id: Uuid,
    port: &mut dyn Port,
    request: &[u8],
) -> Result<()> {
    let entry = EntryGuard::open(log, Direction::Outgoing, correlation_id);
    match port.write(request) {
        Ok(()) => {
            entry.succeed(request);
            Ok(())
        }
        Err(e) => {
            let err = ZifError::SendFailure(e);
            entry.fail(request, &err);
            Err(err)
        }
    }
}

fn receive(
    log: &dyn InterfaceLog,
    correlation_id: Uuid,
    port: &mut dyn Port,
    opcode: u8,
) -> Result<Vec<u8>> {
    let entry = EntryGuard::open(log, Direction::Incoming, correlation_id);
    match frame::decode(port, opcode) {
        Ok(data) => {
            entry.succeed(&data);
            Ok(data)
        }
        Err(err) => {
            // a NAK still carries what the socket sent
            let payload: &[u8] = match &err {
                ZifError::Nak(payload) => payload.as_slice(),
                _ => &[],
            };
            entry.fail(payload, &err);
            Err(err)
        }
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(ZifError::BadLength {
            expected,
            actual: data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface_log::RecordingInterfaceLog;
    use crate::frame::ByteSource;
    use crate::simulator::SimulatedTransport;
    use crate::transport::Exchange;
    use std::io;

    // A line whose writes always fail.
    struct Unplugged;

    impl ByteSource for Unplugged {
        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(None)
        }
    }

    impl Port for Unplugged {
        fn write(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled"))
        }
    }

    struct UnpluggedTransport;

    impl Transport for UnpluggedTransport {
        fn transact(&self, exchange: &mut Exchange<'_>) -> Result<Vec<u8>> {
            exchange(&mut Unplugged)
        }
    }

    fn scripted(reply: &[u8]) -> (Arc<SimulatedTransport>, PowerMaster) {
        let transport = Arc::new(SimulatedTransport::scripted(reply.to_vec()));
        let driver = PowerMaster::new(transport.clone());
        (transport, driver)
    }

    #[test]
    fn serial_from_wire_example() {
        let (transport, driver) = scripted(&[0xA5, 0x05, 0x06, 0xC1, 0x6A, 0xEA, 0x09, 0x5A]);
        assert_eq!(driver.get_serial().unwrap(), 27370);
        assert_eq!(transport.written(), vec![vec![0xA5, 0x02, 0xC1, 0x05, 0x5A]]);
    }

    #[test]
    fn version_from_wire_example() {
        let (_, driver) =
            scripted(&[0xA5, 0x08, 0x06, 0xC2, 0x02, 0x00, 0x00, 0x00, 0x16, 0x96, 0x5A]);
        assert_eq!(driver.get_version().unwrap(), Version { major: 2, minor: 22 });
    }

    #[test]
    fn status_from_wire_example() {
        let reply = [0xA5, 0x04, 0x06, 0xC4, 0x03, 0xB2, 0x5A];
        assert!(scripted(&reply).1.get_active().unwrap());
        assert!(scripted(&reply).1.get_has_meter().unwrap());
        assert!(!scripted(&reply).1.get_has_error().unwrap());
    }

    #[test]
    fn set_active_from_wire_example() {
        let (transport, driver) = scripted(&[0xA5, 0x03, 0x06, 0x8D, 0x3F, 0x5A]);
        driver.set_active(true).unwrap();
        assert_eq!(transport.written(), vec![vec![0xA5, 0x03, 0x8D, 0x01, 0x1C, 0x5A]]);
    }

    #[test]
    fn has_error_never_reports_true() {
        for status in 0..=255u8 {
            let reply = frame::frame(&[frame::ACK, opcode::GET_STATUS, status]).unwrap();
            assert!(!scripted(&reply).1.get_has_error().unwrap(), "status {status:#04x}");
        }
    }

    #[test]
    fn wrong_data_length_is_bad_length() {
        let reply = frame::frame(&[frame::ACK, opcode::GET_SERIAL, 0x01]).unwrap();
        assert!(matches!(
            scripted(&reply).1.get_serial(),
            Err(ZifError::BadLength { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn unknown_wiring_never_touches_the_line() {
        let log = RecordingInterfaceLog::new();
        let (transport, driver) = scripted(&[]);
        let driver = driver.with_log(Arc::new(log.clone()));
        assert!(matches!(
            driver.set_meter("2S", "bogus"),
            Err(ZifError::UnknownMeterWiring { .. })
        ));
        assert!(transport.written().is_empty());
        assert!(log.records().is_empty());
    }

    #[test]
    fn both_log_entries_close_on_failure() {
        let log = RecordingInterfaceLog::new();
        let (_, driver) = scripted(&[0xA5, 0x05]);
        let driver = driver.with_log(Arc::new(log.clone()));
        assert!(matches!(driver.get_serial(), Err(ZifError::NoMoreData)));

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, Direction::Outgoing);
        assert_eq!(records[0].payload_hex, "A502C1055A");
        assert_eq!(records[0].error, None);
        assert_eq!(records[1].direction, Direction::Incoming);
        assert!(records[1].error.is_some());
        assert_eq!(records[0].correlation_id, records[1].correlation_id);
    }

    #[test]
    fn write_failure_is_send_failure_and_closes_send_entry() {
        let log = RecordingInterfaceLog::new();
        let driver =
            PowerMaster::new(Arc::new(UnpluggedTransport)).with_log(Arc::new(log.clone()));
        assert!(matches!(driver.get_serial(), Err(ZifError::SendFailure(_))));

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, Direction::Outgoing);
        assert_eq!(records[0].payload_hex, "A502C1055A");
        assert_eq!(records[0].error.as_deref(), Some("failed to send command"));
        assert!(records.iter().all(|r| r.direction != Direction::Incoming));
    }

    #[test]
    fn nak_payload_is_kept_in_receive_entry() {
        let log = RecordingInterfaceLog::new();
        let reply = frame::frame(&[frame::NAK, opcode::SET_ACTIVE, 0x04, 0x01]).unwrap();
        let (_, driver) = scripted(&reply);
        let driver = driver.with_log(Arc::new(log.clone()));
        assert!(matches!(driver.set_active(true), Err(ZifError::Nak(_))));

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].direction, Direction::Incoming);
        assert_eq!(records[1].payload_hex, "0401");
        assert!(records[1].error.is_some());
    }
}
