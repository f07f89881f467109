//! Settings for the command-line front end.
//!
//! Values come from an optional JSON file and are then overridden by command-line flags.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ZifError};
use crate::wiring::MeterWiringTable;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// Serial port the socket is attached to.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Upper bound for waiting on a single byte.
    pub timeout_ms: u64,
    /// Wiring file replacing the builtin table.
    pub wiring: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            wiring: None,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ZifError::config(format!("cannot open settings {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn port_name(&self) -> Result<&str> {
        self.port
            .as_deref()
            .ok_or_else(|| ZifError::config("no serial port configured"))
    }

    /// The wiring file's table when one is configured, the builtin one otherwise.
    pub fn wiring_table(&self) -> Result<MeterWiringTable> {
        match &self.wiring {
            Some(path) => MeterWiringTable::from_path(path),
            None => Ok(MeterWiringTable::builtin().clone()),
        }
    }
}
