//! Stratagems: ordered plans of roundabout target-side operations.
//!
//! Some write operations cannot place bytes directly; they achieve the
//! desired effect through a sequence of side-effects (repeated `crc32`
//! invocations, `cp` of existing data). A [`Stratagem`] captures such a
//! plan, tagged with the operation that executes it, and round-trips
//! through JSON for offline construction.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{HunterError, Result};

/// Operation names used by the built-in stratagem producers.
pub mod ops {
    pub const CRC32_MEMORY_WRITER: &str = "CRC32MemoryWriter";
    pub const CP_MEMORY_WRITER: &str = "CpMemoryWriter";
}

/// Which optional entry keys an operation's stratagems carry.
#[derive(Clone, Copy, Debug)]
pub struct EntrySpec {
    pub name: &'static str,
    /// Entries must carry an `iterations` count.
    pub iterations: bool,
    /// Entries may source data from the in-progress target buffer.
    pub tsrc_off: bool,
}

const SPECS: &[EntrySpec] = &[
    EntrySpec {
        name: ops::CRC32_MEMORY_WRITER,
        iterations: true,
        tsrc_off: true,
    },
    EntrySpec {
        name: ops::CP_MEMORY_WRITER,
        iterations: false,
        tsrc_off: false,
    },
];

/// Look up the entry specification for a stratagem-consuming operation.
pub fn entry_spec(operation: &str) -> Option<&'static EntrySpec> {
    SPECS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(operation))
}

// Accept JSON integers or "0x"-prefixed strings for integer fields
fn int_from_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    int_from_value(&value).ok_or_else(|| D::Error::custom("expected integer or hex string"))
}

fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    de_i64(deserializer)?
        .try_into()
        .map_err(|_| D::Error::custom("expected non-negative integer"))
}

fn de_opt_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    Ok(Some(de_u64(deserializer)?))
}

/// One step of a stratagem.
///
/// `src_addr` is `-1` exactly when `tsrc_off` is present: the step then
/// sources its input from the in-progress target buffer rather than from an
/// absolute address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratagemEntry {
    #[serde(deserialize_with = "de_i64")]
    pub src_addr: i64,
    #[serde(deserialize_with = "de_u64")]
    pub src_size: u64,
    #[serde(deserialize_with = "de_u64")]
    pub dst_off: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_u64"
    )]
    pub iterations: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_u64"
    )]
    pub tsrc_off: Option<u64>,
}

impl StratagemEntry {
    /// Number of target-side operations this entry expands to.
    pub fn operation_count(&self) -> u64 {
        self.iterations.unwrap_or(1)
    }
}

/// An ordered, operation-tagged plan of target-side operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stratagem {
    operation: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub comment: String,
    #[serde(rename = "depthcharge_version", default)]
    version: String,
    entries: Vec<StratagemEntry>,
}

impl Stratagem {
    /// Create an empty stratagem for the named operation, which must have a
    /// registered entry specification.
    pub fn new(operation: &str) -> Result<Self> {
        let spec = entry_spec(operation).ok_or_else(|| {
            HunterError::InvalidArgument(format!("Invalid Operation name: {operation}"))
        })?;

        Ok(Self {
            operation: spec.name.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            comment: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            entries: Vec::new(),
        })
    }

    /// Name of the operation this stratagem is intended for.
    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    /// Append an entry, validating it against the operation's spec.
    pub fn append(&mut self, entry: StratagemEntry) -> Result<()> {
        self.validate_entry(&entry)?;
        self.entries.push(entry);
        Ok(())
    }

    fn validate_entry(&self, entry: &StratagemEntry) -> Result<()> {
        let spec = entry_spec(&self.operation).expect("constructor validated operation");

        if spec.iterations != entry.iterations.is_some() {
            return Err(HunterError::InvalidArgument(format!(
                "{} entries {} an iteration count",
                self.operation,
                if spec.iterations { "require" } else { "do not take" },
            )));
        }

        if entry.tsrc_off.is_some() && !spec.tsrc_off {
            return Err(HunterError::InvalidArgument(format!(
                "{} entries do not take a tsrc_off key",
                self.operation
            )));
        }

        // A target-buffer source is denoted by src_addr == -1, exclusively
        if (entry.src_addr == -1) != entry.tsrc_off.is_some() || entry.src_addr < -1 {
            return Err(HunterError::InvalidArgument(
                "src_addr must be -1 exactly when tsrc_off is present".to_string(),
            ));
        }

        Ok(())
    }

    pub fn entries(&self) -> &[StratagemEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of target-side operations performed when executing this
    /// stratagem; larger than [`Self::len`] when entries iterate.
    pub fn total_operations(&self) -> u64 {
        self.entries.iter().map(StratagemEntry::operation_count).sum()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let ret: Self = serde_json::from_str(json)?;

        if entry_spec(&ret.operation).is_none() {
            return Err(HunterError::InvalidArgument(format!(
                "Invalid Operation name: {}",
                ret.operation
            )));
        }

        for entry in &ret.entries {
            ret.validate_entry(entry)?;
        }

        Ok(ret)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl fmt::Display for Stratagem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_entry(src_addr: i64, dst_off: u64, iterations: u64) -> StratagemEntry {
        StratagemEntry {
            src_addr,
            src_size: 4,
            dst_off,
            iterations: Some(iterations),
            tsrc_off: None,
        }
    }

    #[test]
    fn test_append_validation() {
        let mut s = Stratagem::new(ops::CRC32_MEMORY_WRITER).unwrap();

        s.append(direct_entry(0x8000_0000, 0, 17)).unwrap();
        s.append(StratagemEntry {
            src_addr: -1,
            src_size: 4,
            dst_off: 4,
            iterations: Some(1),
            tsrc_off: Some(0),
        })
        .unwrap();

        // Missing iterations
        assert!(s
            .append(StratagemEntry {
                src_addr: 0x8000_0000,
                src_size: 4,
                dst_off: 8,
                iterations: None,
                tsrc_off: None,
            })
            .is_err());

        // tsrc_off without src_addr == -1
        assert!(s
            .append(StratagemEntry {
                src_addr: 0x8000_0000,
                src_size: 4,
                dst_off: 8,
                iterations: Some(1),
                tsrc_off: Some(0),
            })
            .is_err());

        assert_eq!(s.len(), 2);
        assert_eq!(s.total_operations(), 18);
    }

    #[test]
    fn test_unknown_operation() {
        assert!(Stratagem::new("TeleportMemoryWriter").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let mut s = Stratagem::new(ops::CRC32_MEMORY_WRITER).unwrap();
        s.comment = "example".to_string();
        s.append(direct_entry(0x8000_1000, 0, 3)).unwrap();
        s.append(direct_entry(0x8000_2000, 4, 250)).unwrap();
        s.append(StratagemEntry {
            src_addr: -1,
            src_size: 4,
            dst_off: 8,
            iterations: Some(1),
            tsrc_off: Some(0),
        })
        .unwrap();

        let json = s.to_json().unwrap();
        let loaded = Stratagem::from_json(&json).unwrap();

        assert_eq!(loaded.operation_name(), s.operation_name());
        assert_eq!(loaded.comment, "example");
        assert_eq!(loaded.entries(), s.entries());
        assert_eq!(loaded.total_operations(), 254);
    }

    #[test]
    fn test_json_hex_string_coercion() {
        let json = r#"{
            "operation": "CRC32MemoryWriter",
            "depthcharge_version": "0.1.0",
            "timestamp": "2020-07-22T11:40:00",
            "comment": "",
            "entries": [
                {"src_addr": "0x87800000", "src_size": "0x20", "dst_off": 0, "iterations": "4095"},
                {"src_addr": -1, "src_size": 4, "dst_off": "0x04", "iterations": 1, "tsrc_off": "0x0"}
            ]
        }"#;

        let s = Stratagem::from_json(json).unwrap();
        assert_eq!(s.entries()[0].src_addr, 0x8780_0000);
        assert_eq!(s.entries()[0].src_size, 0x20);
        assert_eq!(s.entries()[0].iterations, Some(4095));
        assert_eq!(s.entries()[1].tsrc_off, Some(0));
        assert_eq!(s.entries()[1].dst_off, 4);
    }

    #[test]
    fn test_json_rejects_bogus_operation() {
        let json = r#"{"operation": "NopWriter", "entries": []}"#;
        assert!(Stratagem::from_json(json).is_err());
    }
}
