//! ARMv7 (and earlier) 32-bit little-endian support.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    ArchError, Architecture, DataAbort, Endianness, Register, Result, parse_code_line,
};

pub static ARM: Architecture = Architecture {
    name: "ARM",
    description: "ARM 32-bit, little-endian",
    word_size: 4,
    phys_size: 4,
    alignment: 4,
    endianness: Endianness::Little,
    supports_64bit_data: false,
    registers: ARM_REGS,
    data_abort_address: Some(1),
    da_parser: Some(parse_data_abort),
};

const ARM_REGS: &[Register] = &[
    Register {
        da_data: true,
        ..Register::new("r0")
    },
    Register::new("r1"),
    Register::new("r2"),
    Register::new("r3"),
    Register::new("r4"),
    Register::new("r5"),
    Register::new("r6"),
    Register::new("r7"),
    Register::new("r8"),
    Register {
        gd: true,
        ..Register::aliased("r9", "sb")
    },
    Register::new("r10"),
    Register::aliased("r11", "fp"),
    Register::aliased("r12", "ip"),
    Register::aliased("r13", "sp"),
    Register::aliased("r14", "lr"),
    Register::aliased("r15", "pc"),
];

static DA_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<name>[a-zA-Z][a-zA-Z0-9]+)\s?:\s?(\[<)?(?P<value>[0-9a-fA-F]{8})(>\])?")
        .unwrap()
});

/// Parse an ARM data abort dump of the form:
///
/// ```text
/// 00000001:data abort
/// pc : [<8f7d8858>]     lr : [<8f7d8801>]
/// reloc pc : [<17835858>]    lr : [<17835801>]
/// sp : 8ed99718  ip : 00000000     fp : 00000001
/// r10: 00000001  r9 : 8eda2ea8     r8 : 00000001
/// r7 : 00000000  r6 : 00000004     r5 : 00000004  r4 : 00000001
/// r3 : 8ed9972c  r2 : 020200b4     r1 : 8ed994ec  r0 : 00000009
/// Flags: nZCv  IRQs off  FIQs off  Mode SVC_32
/// Code: 2800f915 f04fd0cf e7ce30ff d10a2d04 (2000f8d8)
/// ```
///
/// The "Mode" flag entry carries a " (T)" suffix when the core is in Thumb
/// mode.
fn parse_data_abort(arch: &Architecture, text: &str) -> Result<DataAbort> {
    let mut ret = DataAbort::default();

    for line in text.lines() {
        let line = line.trim();

        if line.starts_with("Flags:") {
            for field in line.split("  ") {
                if let Some((name, value)) = field.trim().split_once(' ') {
                    let name = name.replace("Flags:", "Asserted");
                    ret.flags.insert(name, value.to_string());
                }
            }
        } else if line.starts_with("Code:") {
            ret.code = parse_code_line(line);
        } else {
            let (pfx, line) = match line.strip_prefix("reloc ") {
                Some(rest) => ("reloc ", rest),
                None => ("", line),
            };

            for caps in DA_ENTRY.captures_iter(line) {
                // Canonicalize aliases (pc -> r15, etc.); skip non-registers
                let Ok(reg) = arch.register(&caps["name"]) else {
                    continue;
                };
                let value = u64::from_str_radix(&caps["value"], 16).unwrap_or(0);
                ret.registers.insert(format!("{pfx}{}", reg.name), value);
            }
        }
    }

    if ret.registers.is_empty() && ret.flags.is_empty() && ret.code.is_empty() {
        return Err(ArchError::NoDataAbortContent);
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DA_TEXT: &str = "\
00000001:data abort
pc : [<8f7d8858>]\t   lr : [<8f7d8801>]
reloc pc : [<17835858>]\t   lr : [<17835801>]
sp : 8ed99718  ip : 00000000\t fp : 00000001
r10: 00000001  r9 : 8eda2ea8\t r8 : 00000001
r7 : 00000000  r6 : 00000004\t r5 : 00000004  r4 : 00000001
r3 : 8ed9972c  r2 : 020200b4\t r1 : 8ed994ec  r0 : 00000009
Flags: nZCv  IRQs off  FIQs off  Mode SVC_32
Code: 2800f915 f04fd0cf e7ce30ff d10a2d04 (2000f8d8)
";

    #[test]
    fn test_parse_data_abort() {
        let da = ARM.parse_data_abort(DA_TEXT).unwrap();

        assert_eq!(da.registers["r15"], 0x8f7d8858);
        assert_eq!(da.registers["reloc r15"], 0x17835858);
        assert_eq!(da.registers["r14"], 0x8f7d8801);
        assert_eq!(da.registers["r13"], 0x8ed99718);
        assert_eq!(da.registers["r9"], 0x8eda2ea8);
        assert_eq!(da.registers["r3"], 0x8ed9972c);
        assert_eq!(da.registers["r0"], 0x9);

        assert_eq!(da.flags["Asserted"], "nZCv");
        assert_eq!(da.flags["IRQs"], "off");
        assert_eq!(da.flags["Mode"], "SVC_32");

        assert_eq!(da.code.len(), 5);
        assert_eq!(da.code[4], 0x2000f8d8);
        assert!(da.esr.is_none());
    }

    #[test]
    fn test_parse_data_abort_empty() {
        assert!(ARM.parse_data_abort("no crash here").is_err());
    }
}
