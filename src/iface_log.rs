//! Interface logging: a record of every payload sent to and received from the socket.
//!
//! Each phase of a transaction opens an entry before touching the line and finishes it
//! right after, with the payload in hex and the failure message if there was one.
//! [`EntryGuard`] makes sure an entry is finished on every exit path.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ZifError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => f.write_str("out"),
            Direction::Incoming => f.write_str("in"),
        }
    }
}

/// Sink for interface log entries.
pub trait InterfaceLog: Send + Sync {
    fn prepare(&self, direction: Direction, correlation_id: Uuid) -> Box<dyn LogEntry>;
}

/// An open log entry. Finishing consumes it.
pub trait LogEntry: Send {
    fn finish(self: Box<Self>, payload_hex: &str, error: Option<&str>);
}

/// Message recorded when an entry is dropped without being finished.
pub const ABANDONED: &str = "entry abandoned before completion";

/// Finishes its entry exactly once: through [`EntryGuard::succeed`], [`EntryGuard::fail`],
/// or on drop.
pub struct EntryGuard {
    entry: Option<Box<dyn LogEntry>>,
}

impl EntryGuard {
    pub fn open(log: &dyn InterfaceLog, direction: Direction, correlation_id: Uuid) -> Self {
        Self {
            entry: Some(log.prepare(direction, correlation_id)),
        }
    }

    pub fn succeed(mut self, payload: &[u8]) {
        if let Some(entry) = self.entry.take() {
            entry.finish(&hex::encode_upper(payload), None);
        }
    }

    pub fn fail(mut self, payload: &[u8], error: &ZifError) {
        if let Some(entry) = self.entry.take() {
            entry.finish(&hex::encode_upper(payload), Some(&error.to_string()));
        }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.finish("", Some(ABANDONED));
        }
    }
}

/// Writes entries as `tracing` events under the `pm8121::interface` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterfaceLog;

struct TracingEntry {
    direction: Direction,
    correlation_id: Uuid,
    started: Instant,
}

impl InterfaceLog for TracingInterfaceLog {
    fn prepare(&self, direction: Direction, correlation_id: Uuid) -> Box<dyn LogEntry> {
        Box::new(TracingEntry {
            direction,
            correlation_id,
            started: Instant::now(),
        })
    }
}

impl LogEntry for TracingEntry {
    fn finish(self: Box<Self>, payload_hex: &str, error: Option<&str>) {
        let elapsed_us = self.started.elapsed().as_micros() as u64;
        match error {
            None => info!(
                target: "pm8121::interface",
                direction = %self.direction,
                correlation_id = %self.correlation_id,
                elapsed_us,
                payload = payload_hex,
                "interface"
            ),
            Some(error) => warn!(
                target: "pm8121::interface",
                direction = %self.direction,
                correlation_id = %self.correlation_id,
                elapsed_us,
                payload = payload_hex,
                error,
                "interface"
            ),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInterfaceLog;

struct NullEntry;

impl InterfaceLog for NullInterfaceLog {
    fn prepare(&self, _direction: Direction, _correlation_id: Uuid) -> Box<dyn LogEntry> {
        Box::new(NullEntry)
    }
}

impl LogEntry for NullEntry {
    fn finish(self: Box<Self>, _payload_hex: &str, _error: Option<&str>) {}
}

/// A finished entry as kept by [`RecordingInterfaceLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub direction: Direction,
    pub correlation_id: Uuid,
    pub payload_hex: String,
    pub error: Option<String>,
}

/// Keeps finished entries in memory, in completion order.
#[derive(Debug, Default, Clone)]
pub struct RecordingInterfaceLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

struct RecordingEntry {
    direction: Direction,
    correlation_id: Uuid,
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingInterfaceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl InterfaceLog for RecordingInterfaceLog {
    fn prepare(&self, direction: Direction, correlation_id: Uuid) -> Box<dyn LogEntry> {
        Box::new(RecordingEntry {
            direction,
            correlation_id,
            records: Arc::clone(&self.records),
        })
    }
}

impl LogEntry for RecordingEntry {
    fn finish(self: Box<Self>, payload_hex: &str, error: Option<&str>) {
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                direction: self.direction,
                correlation_id: self.correlation_id,
                payload_hex: payload_hex.to_string(),
                error: error.map(str::to_string),
            });
        }
    }
}
