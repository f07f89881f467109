//! # PowerMaster-8121 ZIF Socket Driver
//!
//! This library drives the PowerMaster-8121 zero-insertion-force test socket over its binary
//! serial protocol. It builds and checks frames, resynchronizes on line noise, correlates
//! replies with the command just sent, and exposes the socket's command catalogue as typed
//! operations. A simulated socket is included so the protocol can be exercised without hardware.

pub mod config;
pub mod crc8;
pub mod driver;
pub mod error;
pub mod frame;
pub mod iface_log;
pub mod simulator;
pub mod transport;
pub mod wiring;

pub use driver::{PowerMaster, Version};
pub use error::{Result, ZifError};
pub use iface_log::{InterfaceLog, NullInterfaceLog, TracingInterfaceLog};
pub use simulator::{SimulatedTransport, Simulator};
pub use transport::{SerialTransport, Transport};
pub use wiring::{MeterWiringConfig, MeterWiringTable, PortKey, PORT_MASKS};
