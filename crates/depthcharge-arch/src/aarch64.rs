//! AArch64 (ARMv8-A) support.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    ArchError, Architecture, DataAbort, Endianness, Register, Result, parse_code_line,
};

// Except for exclusive and ordered accesses, AArch64 loads and stores
// tolerate unaligned addresses to normal memory, hence alignment 1.
pub static AARCH64: Architecture = Architecture {
    name: "AARCH64",
    description: "ARMv8 64-bit, little-endian",
    word_size: 8,
    phys_size: 8,
    alignment: 1,
    endianness: Endianness::Little,
    supports_64bit_data: true,
    registers: AARCH64_REGS,
    data_abort_address: Some(0xFFFF_FFFF),
    da_parser: Some(parse_data_abort),
};

const AARCH64_REGS: &[Register] = &[
    Register::ident("elr", 0x5e),
    Register::ident("lr", 0x5f),
    Register::ident("x0", 0x60),
    Register::ident("x1", 0x61),
    Register::ident("x2", 0x62),
    Register::ident("x3", 0x63),
    Register::ident("x4", 0x64),
    Register::ident("x5", 0x65),
    Register::ident("x6", 0x66),
    Register::ident("x7", 0x67),
    Register::ident("x8", 0x68),
    Register::ident("x9", 0x69),
    Register::ident("x10", 0x6a),
    Register::ident("x11", 0x6b),
    Register::ident("x12", 0x6c),
    Register::ident("x13", 0x6d),
    Register::ident("x14", 0x6e),
    Register::ident("x15", 0x6f),
    Register::ident("x16", 0x70),
    Register::ident("x17", 0x71),
    Register::ident("x18", 0x72),
    Register::ident("x19", 0x73),
    Register::ident("x20", 0x74),
    Register::ident("x21", 0x75),
    Register::ident("x22", 0x76),
    Register::ident("x23", 0x77),
    Register::ident("x24", 0x78),
    Register::ident("x25", 0x79),
    Register::ident("x26", 0x7a),
    Register::ident("x27", 0x7b),
    Register::ident("x28", 0x7c),
    Register::ident("x29", 0x7d),
];

static DA_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<name>[a-zA-Z][a-zA-Z0-9]+)\s?:\s?(?P<value>[0-9a-fA-F]{16})").unwrap()
});

static ESR_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"esr\s+0x(?P<value>[0-9a-fA-F]+)").unwrap());

/// Parse an AArch64 "Synchronous Abort" dump:
///
/// ```text
/// ffffffff:"Synchronous Abort" handler, esr 0x96000005
/// elr: 00000000000ccc18 lr : 00000000000ccb10 (reloc)
/// elr: 000000003b3a3c18 lr : 000000003b3a3b10
/// x0 : 0000000000000009 x1 : 000000003ebfa800
/// ...
/// Code: 12003ca5 78237b65 92403ca2 17ffffe9 (39400085)
/// Resetting CPU ...
/// ```
fn parse_data_abort(arch: &Architecture, text: &str) -> Result<DataAbort> {
    let mut ret = DataAbort::default();

    for line in text.lines() {
        let line = line.trim();

        if let Some(caps) = ESR_ENTRY.captures(line) {
            ret.esr = u64::from_str_radix(&caps["value"], 16).ok();
        } else if line.starts_with("Code:") {
            ret.code = parse_code_line(line);
        } else {
            let (pfx, line) = match line.strip_suffix("(reloc)") {
                Some(rest) => ("reloc ", rest),
                None => ("", line),
            };

            for caps in DA_ENTRY.captures_iter(line) {
                let Ok(reg) = arch.register(&caps["name"]) else {
                    continue;
                };
                let value = u64::from_str_radix(&caps["value"], 16).unwrap_or(0);
                ret.registers.insert(format!("{pfx}{}", reg.name), value);
            }
        }
    }

    if ret.registers.is_empty() && ret.esr.is_none() && ret.code.is_empty() {
        return Err(ArchError::NoDataAbortContent);
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DA_TEXT: &str = "\
ffffffff:\"Synchronous Abort\" handler, esr 0x96000005
elr: 00000000000ccc18 lr : 00000000000ccb10 (reloc)
elr: 000000003b3a3c18 lr : 000000003b3a3b10
x0 : 0000000000000009 x1 : 000000003ebfa800
x2 : 0000000000000040 x3 : 0000000000000000
x28: 0000000000000004 x29: 000000003af52a50

Code: 12003ca5 78237b65 92403ca2 17ffffe9 (39400085)
Resetting CPU ...
";

    #[test]
    fn test_parse_data_abort() {
        let da = AARCH64.parse_data_abort(DA_TEXT).unwrap();

        assert_eq!(da.esr, Some(0x96000005));
        assert_eq!(da.registers["reloc elr"], 0xccc18);
        assert_eq!(da.registers["reloc lr"], 0xccb10);
        assert_eq!(da.registers["elr"], 0x3b3a3c18);
        assert_eq!(da.registers["x0"], 9);
        assert_eq!(da.registers["x29"], 0x3af52a50);
        assert_eq!(da.code.last(), Some(&0x39400085));
    }

    #[test]
    fn test_register_idents() {
        assert_eq!(AARCH64.register("x9").unwrap().ident, Some(0x69));
        assert_eq!(AARCH64.register("ELR").unwrap().ident, Some(0x5e));
    }
}
