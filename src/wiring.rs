//! Meter wiring lookup for the "set meter" command.
//!
//! Every supported combination of meter form and service type maps to seven relay bytes,
//! one per phase slot A..G. Each byte may only use the bits its slot mask allows.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, ZifError};

/// Number of phase slots on the socket.
pub const SLOTS: usize = 7;

/// Bits each slot is allowed to drive. Slot G is unused.
pub const PORT_MASKS: [u8; SLOTS] = [0x0C, 0x3F, 0x3F, 0x9F, 0xFF, 0xE0, 0x00];

/// Lookup key: meter form plus service type, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey {
    pub meter_form: String,
    pub service_type: String,
}

impl PortKey {
    pub fn new(meter_form: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            meter_form: meter_form.into(),
            service_type: service_type.into(),
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.meter_form, self.service_type)
    }
}

/// Relay values for slots A..G.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterWiringConfig([u8; SLOTS]);

impl MeterWiringConfig {
    /// Index of the first slot whose value strays outside its mask.
    const fn first_violation(values: &[u8; SLOTS]) -> Option<usize> {
        let mut slot = 0;
        while slot < SLOTS {
            if values[slot] & !PORT_MASKS[slot] != 0 {
                return Some(slot);
            }
            slot += 1;
        }
        None
    }

    /// Used for the builtin table; an invalid entry fails compilation.
    const fn wired(values: [u8; SLOTS]) -> Self {
        assert!(
            Self::first_violation(&values).is_none(),
            "wiring value outside slot mask"
        );
        Self(values)
    }

    /// Validates `values` against [`PORT_MASKS`].
    pub fn new(key: &PortKey, values: [u8; SLOTS]) -> Result<Self> {
        match Self::first_violation(&values) {
            None => Ok(Self(values)),
            Some(slot) => Err(ZifError::InvalidWiring {
                meter_form: key.meter_form.clone(),
                service_type: key.service_type.clone(),
                slot,
                value: values[slot],
                mask: PORT_MASKS[slot],
            }),
        }
    }

    pub fn values(&self) -> &[u8; SLOTS] {
        &self.0
    }

    /// Argument bytes of the set-meter command: mask and value for each slot in order.
    pub fn command_args(&self) -> [u8; SLOTS * 2] {
        let mut args = [0u8; SLOTS * 2];
        for (slot, (&mask, &value)) in PORT_MASKS.iter().zip(self.0.iter()).enumerate() {
            args[slot * 2] = mask;
            args[slot * 2 + 1] = value;
        }
        args
    }
}

const BUILTIN: &[(&str, &str, MeterWiringConfig)] = &[
    ("1S", "1P2W", MeterWiringConfig::wired([0x04, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00])),
    ("2S", "1P3W", MeterWiringConfig::wired([0x04, 0x03, 0x0C, 0x00, 0x00, 0x20, 0x00])),
    ("3S", "1P2W", MeterWiringConfig::wired([0x08, 0x01, 0x02, 0x80, 0x00, 0x00, 0x00])),
    ("4S", "1P3W", MeterWiringConfig::wired([0x08, 0x03, 0x0C, 0x80, 0x00, 0x20, 0x00])),
    ("5S", "3P3W", MeterWiringConfig::wired([0x0C, 0x11, 0x22, 0x05, 0x41, 0x60, 0x00])),
    ("5S", "3P4W-Delta", MeterWiringConfig::wired([0x0C, 0x13, 0x2A, 0x07, 0x43, 0x60, 0x00])),
    ("6S", "3P4W-Wye", MeterWiringConfig::wired([0x0C, 0x15, 0x2C, 0x09, 0x85, 0x80, 0x00])),
    ("8S", "3P4W-Delta", MeterWiringConfig::wired([0x0C, 0x17, 0x2E, 0x8B, 0x87, 0x80, 0x00])),
    ("9S", "3P4W-Wye", MeterWiringConfig::wired([0x0C, 0x1F, 0x3E, 0x8F, 0xC7, 0xA0, 0x00])),
    ("12S", "1P3W", MeterWiringConfig::wired([0x04, 0x05, 0x14, 0x01, 0x10, 0x20, 0x00])),
    ("12S", "Network", MeterWiringConfig::wired([0x04, 0x05, 0x14, 0x03, 0x30, 0x40, 0x00])),
    ("16S", "3P4W-Delta", MeterWiringConfig::wired([0x0C, 0x3D, 0x3B, 0x1D, 0xEF, 0xC0, 0x00])),
    ("16S", "3P4W-Wye", MeterWiringConfig::wired([0x0C, 0x3F, 0x3F, 0x1F, 0xFF, 0xE0, 0x00])),
    ("25S", "Network", MeterWiringConfig::wired([0x04, 0x09, 0x24, 0x03, 0x30, 0x40, 0x00])),
    ("45S", "3P3W", MeterWiringConfig::wired([0x08, 0x21, 0x12, 0x84, 0x21, 0xA0, 0x00])),
    ("66S", "3P4W-Wye", MeterWiringConfig::wired([0x0C, 0x2B, 0x36, 0x9A, 0x9B, 0xE0, 0x00])),
];

static BUILTIN_TABLE: LazyLock<MeterWiringTable> = LazyLock::new(|| MeterWiringTable {
    entries: BUILTIN
        .iter()
        .map(|&(form, service, config)| (PortKey::new(form, service), config))
        .collect(),
});

/// One record of a wiring file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WiringRecord {
    meter_form: String,
    service_type: String,
    config: [u8; SLOTS],
}

/// Immutable map from [`PortKey`] to [`MeterWiringConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterWiringTable {
    entries: BTreeMap<PortKey, MeterWiringConfig>,
}

impl MeterWiringTable {
    /// The wiring shipped with the driver.
    pub fn builtin() -> &'static MeterWiringTable {
        &BUILTIN_TABLE
    }

    /// Loads a table from a JSON array of
    /// `{"meterForm": .., "serviceType": .., "config": [7 bytes]}` records.
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        let records: Vec<WiringRecord> = serde_json::from_reader(reader)?;
        let mut entries = BTreeMap::new();
        for record in records {
            let key = PortKey::new(record.meter_form, record.service_type);
            let config = MeterWiringConfig::new(&key, record.config)?;
            if entries.insert(key.clone(), config).is_some() {
                return Err(ZifError::config(format!("duplicate wiring entry {key}")));
            }
        }
        debug!(entries = entries.len(), "loaded meter wiring table");
        Ok(Self { entries })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ZifError::config(format!("cannot open wiring file {}: {e}", path.display()))
        })?;
        Self::from_json(BufReader::new(file))
    }

    pub fn get(&self, key: &PortKey) -> Option<&MeterWiringConfig> {
        self.entries.get(key)
    }

    /// Resolves a pair, failing with `UnknownMeterWiring` if it is not supported.
    pub fn resolve(&self, meter_form: &str, service_type: &str) -> Result<MeterWiringConfig> {
        self.get(&PortKey::new(meter_form, service_type))
            .copied()
            .ok_or_else(|| ZifError::UnknownMeterWiring {
                meter_form: meter_form.to_string(),
                service_type: service_type.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PortKey, &MeterWiringConfig)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compare_by_value() {
        let a = PortKey::new("2S", "1P3W");
        let b = PortKey::new(String::from("2S"), String::from("1P3W"));
        assert_eq!(a, b);
        assert_ne!(a, PortKey::new("2S", "1P2W"));
        assert!(MeterWiringTable::builtin().get(&b).is_some());
    }

    #[test]
    fn builtin_table_respects_masks() {
        let table = MeterWiringTable::builtin();
        assert_eq!(table.len(), BUILTIN.len());
        for (key, config) in table.iter() {
            let slots = config.values().iter().zip(PORT_MASKS.iter());
            for (slot, (&value, &mask)) in slots.enumerate() {
                assert_eq!(value & !mask, 0, "{key} slot {slot}");
            }
            assert_eq!(config.values()[6], 0, "{key} drives unused slot G");
        }
    }

    #[test]
    fn command_args_interleave_masks_and_values() {
        let config = MeterWiringTable::builtin().resolve("2S", "1P3W").unwrap();
        assert_eq!(
            config.command_args(),
            [0x0C, 0x04, 0x3F, 0x03, 0x3F, 0x0C, 0x9F, 0x00, 0xFF, 0x00, 0xE0, 0x20, 0x00, 0x00]
        );
    }

    #[test]
    fn unknown_pair_is_reported() {
        match MeterWiringTable::builtin().resolve("2S", "3P4W-Wye") {
            Err(ZifError::UnknownMeterWiring { meter_form, service_type }) => {
                assert_eq!(meter_form, "2S");
                assert_eq!(service_type, "3P4W-Wye");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn new_rejects_bits_outside_mask() {
        let key = PortKey::new("X", "Y");
        match MeterWiringConfig::new(&key, [0x0C, 0x3F, 0x40, 0, 0, 0, 0]) {
            Err(ZifError::InvalidWiring { slot, value, mask, .. }) => {
                assert_eq!((slot, value, mask), (2, 0x40, 0x3F));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn load_from_json() {
        let json = r#"[
            {"meterForm": "2S", "serviceType": "1P3W", "config": [4, 3, 12, 0, 0, 32, 0]},
            {"meterForm": "9S", "serviceType": "3P4W-Wye", "config": [12, 31, 62, 143, 199, 160, 0]}
        ]"#;
        let table = MeterWiringTable::from_json(json.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.resolve("9S", "3P4W-Wye").unwrap(),
            MeterWiringTable::builtin().resolve("9S", "3P4W-Wye").unwrap()
        );
    }

    #[test]
    fn load_rejects_masked_out_slot_g() {
        let json = r#"[{"meterForm": "2S", "serviceType": "1P3W", "config": [4, 3, 12, 0, 0, 32, 1]}]"#;
        assert!(matches!(
            MeterWiringTable::from_json(json.as_bytes()),
            Err(ZifError::InvalidWiring { slot: 6, .. })
        ));
    }

    #[test]
    fn load_rejects_duplicates() {
        let json = r#"[
            {"meterForm": "2S", "serviceType": "1P3W", "config": [4, 3, 12, 0, 0, 32, 0]},
            {"meterForm": "2S", "serviceType": "1P3W", "config": [4, 3, 12, 0, 0, 0, 0]}
        ]"#;
        assert!(matches!(
            MeterWiringTable::from_json(json.as_bytes()),
            Err(ZifError::Config(_))
        ));
    }

    #[test]
    fn load_rejects_short_config() {
        let json = r#"[{"meterForm": "2S", "serviceType": "1P3W", "config": [4, 3]}]"#;
        assert!(matches!(
            MeterWiringTable::from_json(json.as_bytes()),
            Err(ZifError::Config(_))
        ));
    }
}
