//! Miscellaneous string conversion and parsing helpers.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

// Uppercased for case-insensitivity
const BYTE_LENGTH_SUFFIXES: &[(&str, u64)] = &[
    ("KIB", 1024),
    ("KB", 1000),
    ("MIB", 1024 * 1024),
    ("MB", 1000 * 1000),
    ("GIB", 1024 * 1024 * 1024),
    ("GB", 1000 * 1000 * 1000),
    ("K", 1024),
    ("M", 1024 * 1024),
    ("G", 1024 * 1024 * 1024),
];

/// Parse an integer, accepting a `0x` prefix for hexadecimal values.
pub fn parse_int(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| Error::InvalidArgument(format!("Invalid integer value: {s}")))
}

/// Parse a byte length with an optional suffix (kB, K, KiB, MB, M, MiB, GB,
/// G, GiB), case-insensitively.
pub fn length_to_int(len_str: &str) -> Result<u64> {
    // No suffix? No problem.
    if let Ok(value) = parse_int(len_str) {
        return Ok(value);
    }

    let normalized = len_str.replace(' ', "").to_uppercase();
    for (suffix, factor) in BYTE_LENGTH_SUFFIXES {
        if let Some(value_str) = normalized.strip_suffix(suffix) {
            return Ok(parse_int(value_str)? * factor);
        }
    }

    Err(Error::InvalidArgument(format!("Invalid length: {len_str}")))
}

/// A value parsed from a `key=value` argument list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyVal {
    /// A bare key, e.g. the `flag` in `flag,count=3`.
    Flag,
    Int(u64),
    Text(String),
}

impl KeyVal {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Parse `key1=val1,key2=val2,...` argument strings into a map. Keys given
/// without a value become flags; integer-looking values are converted.
pub fn keyval_list_to_map(args: &[&str]) -> Result<BTreeMap<String, KeyVal>> {
    let mut map = BTreeMap::new();

    for arg in args {
        for keyval in arg.split(',') {
            let mut fields = keyval.splitn(2, '=');
            let key = fields.next().unwrap_or("").trim();
            if key.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "Invalid argument. Expected key=val syntax: {}",
                    if keyval.is_empty() { "<empty>" } else { keyval }
                )));
            }

            let value = match fields.next() {
                None => KeyVal::Flag,
                Some(v) => {
                    let v = v.trim();
                    parse_int(v).map_or_else(|_| KeyVal::Text(v.to_string()), KeyVal::Int)
                }
            };
            map.insert(key.to_string(), value);
        }
    }

    Ok(map)
}

/// Split a `<property>[:<key>=<value>,...]` argument into the property and
/// its keyword map. Used for console device strings such as
/// `/dev/ttyUSB0:115200,intrachar=0.002`.
pub fn str_to_property_keyval(arg: &str) -> Result<(String, BTreeMap<String, KeyVal>)> {
    match arg.split_once(':') {
        None => Ok((arg.to_string(), BTreeMap::new())),
        Some((main, keyvals)) => Ok((
            main.trim().to_string(),
            keyval_list_to_map(&[keyvals])?,
        )),
    }
}

/// Locate an executable program on the host `PATH`.
pub fn find_program(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Render `data` as a hex dump in the style of `xxd -g1`, with `address` as
/// the base address.
pub fn xxd(address: u64, data: &[u8]) -> String {
    let mut ret = String::new();

    for (line_no, chunk) in data.chunks(16).enumerate() {
        if line_no != 0 {
            ret.push('\n');
        }

        ret.push_str(&format!("{:08x}: ", address + (line_no * 16) as u64));

        for &byte in chunk {
            ret.push_str(&format!("{byte:02x} "));
        }
        for _ in chunk.len()..16 {
            ret.push_str("   ");
        }

        ret.push(' ');
        for &byte in chunk {
            if (0x20..0x7f).contains(&byte) {
                ret.push(byte as char);
            } else {
                ret.push('.');
            }
        }
    }

    ret
}

static XXD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<addr>[0-9a-fA-F]{8,}):\s*(?P<data>([0-9a-fA-F]{2}\s?){1,16})").unwrap()
});

/// Convert a well-formed [`xxd`] hex dump back to `(address, data)`. No
/// formatting error recovery is attempted.
pub fn xxd_reverse(hexdump: &str) -> Result<(u64, Vec<u8>)> {
    let mut address = None;
    let mut data = Vec::new();

    for line in hexdump.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let caps = XXD_RE
            .captures(line)
            .ok_or_else(|| Error::InvalidArgument(format!("Encountered malformed line: {line}")))?;

        if address.is_none() {
            address = Some(u64::from_str_radix(&caps["addr"], 16).unwrap_or(0));
        }

        for byte in caps["data"].split_ascii_whitespace() {
            data.push(
                u8::from_str_radix(byte, 16)
                    .map_err(|_| Error::InvalidArgument(format!("Malformed byte: {byte}")))?,
            );
        }
    }

    Ok((address.unwrap_or(0), data))
}

/// [`xxd_reverse`] over the contents of a file.
pub fn xxd_reverse_file(path: &Path) -> Result<(u64, Vec<u8>)> {
    xxd_reverse(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42").unwrap(), 42);
        assert_eq!(parse_int("0x2a").unwrap(), 0x2a);
        assert_eq!(parse_int("0X2A").unwrap(), 0x2a);
        assert!(parse_int("nope").is_err());
    }

    #[test]
    fn test_length_to_int() {
        assert_eq!(length_to_int("4096").unwrap(), 4096);
        assert_eq!(length_to_int("0x1000").unwrap(), 4096);
        assert_eq!(length_to_int("4K").unwrap(), 4096);
        assert_eq!(length_to_int("4 KiB").unwrap(), 4096);
        assert_eq!(length_to_int("4kB").unwrap(), 4000);
        assert_eq!(length_to_int("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(length_to_int("1GiB").unwrap(), 1 << 30);
        assert!(length_to_int("4Q").is_err());
    }

    #[test]
    fn test_keyval_parsing() {
        let map = keyval_list_to_map(&["baudrate=115200,flag,name=dev"]).unwrap();
        assert_eq!(map["baudrate"], KeyVal::Int(115_200));
        assert_eq!(map["flag"], KeyVal::Flag);
        assert_eq!(map["name"], KeyVal::Text("dev".to_string()));
    }

    #[test]
    fn test_str_to_property_keyval() {
        let (dev, map) = str_to_property_keyval("/dev/ttyUSB0:115200,timeout=1").unwrap();
        assert_eq!(dev, "/dev/ttyUSB0");
        assert_eq!(map["115200"], KeyVal::Flag);
        assert_eq!(map["timeout"], KeyVal::Int(1));

        let (dev, map) = str_to_property_keyval("/dev/ttyUSB1").unwrap();
        assert_eq!(dev, "/dev/ttyUSB1");
        assert!(map.is_empty());
    }

    #[test]
    fn test_xxd_round_trip() {
        let addr = 0x8780_0000;
        let data: Vec<u8> = (0u16..256).map(|v| (v & 0xff) as u8).collect();

        let dump = xxd(addr, &data);
        let (raddr, rdata) = xxd_reverse(&dump).unwrap();

        assert_eq!(raddr, addr);
        assert_eq!(rdata, data);
    }

    #[test]
    fn test_xxd_round_trip_partial_line() {
        let addr = 0x1000;
        let data = b"hello world, not a multiple of sixteen".to_vec();

        let dump = xxd(addr, &data);
        let (raddr, rdata) = xxd_reverse(&dump).unwrap();

        assert_eq!(raddr, addr);
        assert_eq!(rdata, data);
    }

    #[test]
    fn test_xxd_format() {
        let dump = xxd(0x1000, b"AB\x00CD");
        assert!(dump.starts_with("00001000: 41 42 00 43 44 "));
        assert!(dump.ends_with("AB.CD"));
    }

    #[test]
    fn test_xxd_reverse_malformed() {
        assert!(xxd_reverse("not a hexdump").is_err());
    }
}
