//! Parsing of board/platform data reported by the `bdinfo` command.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static BDINFO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<name>[\w\d<>\s-]+)=\s*(?P<value>(0x)?[\w\d:\./@#$%-]+)\s*(?P<suffix>[\w\d-]+)?",
    )
    .unwrap()
});

/// One parsed `bdinfo` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BdinfoEntry {
    /// Field name as printed by the target.
    pub name: String,
    pub value: BdinfoValue,
    /// Unit or annotation following the value, if any.
    pub suffix: String,
}

/// A `bdinfo` value; numeric where the text permits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BdinfoValue {
    Int(u64),
    Text(String),
}

impl BdinfoValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

fn parse_int(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Convert `bdinfo` command output (`name = value [suffix]` lines) to a map
/// keyed by the lower-cased, space-stripped field name.
///
/// Individual items may originate from `gd`, `gd->bd`, or elsewhere; no
/// attempt is made to distinguish them.
pub fn bdinfo_dict(output: &str) -> BTreeMap<String, BdinfoEntry> {
    let mut ret = BTreeMap::new();
    let mut dram_bank = false;

    for line in output.lines() {
        let Some(caps) = BDINFO_RE.captures(line) else {
            debug!("Skipping unmatched bdinfo item: {line}");
            continue;
        };

        let mut name = caps["name"].trim().to_string();
        let value_str = caps["value"].trim();
        let suffix = caps
            .name("suffix")
            .map_or(String::new(), |m| m.as_str().to_string());

        // "-> start"/"-> size" lines continue the preceding "DRAM bank" entry
        if name == "DRAM bank" {
            dram_bank = true;
        } else if dram_bank {
            name = name.replace("->", "DRAM bank");
        }

        let value = parse_int(value_str)
            .map_or_else(|| BdinfoValue::Text(value_str.to_string()), BdinfoValue::Int);

        let key = name.replace(' ', "").to_lowercase();
        ret.insert(key, BdinfoEntry { name, value, suffix });
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    const BDINFO: &str = "\
arch_number = 0x00000000
boot_params = 0x80000100
DRAM bank   = 0x00000000
-> start    = 0x80000000
-> size     = 0x20000000
baudrate    = 115200 bps
TLB addr    = 0x9FFF0000
relocaddr   = 0x9FF47000
reloc off   = 0x18747000
irq_sp      = 0x9EF44EA0
sp start    = 0x9EF44E90
Early malloc usage: 2c0 / 400
fdt_blob    = 0x9ef44eb8
";

    #[test]
    fn test_bdinfo_dict() {
        let info = bdinfo_dict(BDINFO);

        assert_eq!(info["boot_params"].value.as_int(), Some(0x80000100));
        assert_eq!(info["relocaddr"].value.as_int(), Some(0x9FF47000));
        assert_eq!(info["relocoff"].value.as_int(), Some(0x18747000));
        assert_eq!(info["baudrate"].value.as_int(), Some(115200));
        assert_eq!(info["baudrate"].suffix, "bps");
        assert_eq!(info["spstart"].value.as_int(), Some(0x9EF44E90));
    }

    #[test]
    fn test_bdinfo_dram_banks() {
        let info = bdinfo_dict(BDINFO);
        assert_eq!(info["drambankstart"].value.as_int(), Some(0x80000000));
        assert_eq!(info["drambanksize"].value.as_int(), Some(0x20000000));
    }

    #[test]
    fn test_bdinfo_empty() {
        assert!(bdinfo_dict("nothing to see").is_empty());
    }
}
