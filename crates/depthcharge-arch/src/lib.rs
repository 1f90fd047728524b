//! Target architecture descriptors.
//!
//! Each supported architecture is described by a static [`Architecture`] value
//! carrying word/pointer properties, the register table used by console
//! payloads and crash handlers, and a parser for the register dump the target
//! prints on a data abort.

mod aarch64;
mod arm;
mod generic;

pub use aarch64::AARCH64;
pub use arm::ARM;
pub use generic::{GENERIC, GENERIC_64, GENERIC_64_BE, GENERIC_BE};

use std::collections::BTreeMap;

use thiserror::Error;

/// Architecture lookup and conversion errors.
#[derive(Error, Debug)]
pub enum ArchError {
    #[error("No such architecture: {0}")]
    UnknownArchitecture(String),
    #[error("Invalid or unknown register: {0}")]
    UnknownRegister(String),
    #[error("Data ends before a full {0}-byte value")]
    TruncatedWord(usize),
    #[error("No data abort content found in console output")]
    NoDataAbortContent,
    #[error("Data abort parsing is not supported for {0}")]
    DataAbortUnsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, ArchError>;

/// Byte order of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn name(self) -> &'static str {
        match self {
            Self::Little => "little",
            Self::Big => "big",
        }
    }
}

/// One entry in an architecture's register table.
///
/// `ident` is the opaque byte identifier consumed by executable payloads.
/// At most one register carries `gd` (the U-Boot global data pointer) and at
/// most one carries `da_data` (the register holding read data after an
/// induced data abort).
#[derive(Clone, Copy, Debug)]
pub struct Register {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub ident: Option<u8>,
    pub gd: bool,
    pub da_data: bool,
}

impl Register {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            alias: None,
            ident: None,
            gd: false,
            da_data: false,
        }
    }

    pub(crate) const fn aliased(name: &'static str, alias: &'static str) -> Self {
        Self {
            alias: Some(alias),
            ..Self::new(name)
        }
    }

    pub(crate) const fn ident(name: &'static str, ident: u8) -> Self {
        Self {
            ident: Some(ident),
            ..Self::new(name)
        }
    }
}

/// Fields recovered from a target's data abort register dump.
#[derive(Clone, Debug, Default)]
pub struct DataAbort {
    /// Register name to value. Relocation-adjusted entries appear under a
    /// `reloc `-prefixed name.
    pub registers: BTreeMap<String, u64>,
    /// CPSR flag summary (32-bit ARM only).
    pub flags: BTreeMap<String, String>,
    /// Exception syndrome register (AArch64 only).
    pub esr: Option<u64>,
    /// Instruction words from the `Code:` line, faulting word last.
    pub code: Vec<u64>,
}

type DataAbortParser = fn(&Architecture, &str) -> Result<DataAbort>;

/// Immutable description of one target architecture.
pub struct Architecture {
    pub name: &'static str,
    pub description: &'static str,
    /// Assumes `word size == sizeof(int) == sizeof(void *)` on the target.
    pub word_size: usize,
    /// Size of the target's `phys_size_t`, in bytes.
    pub phys_size: usize,
    /// Required data address alignment, in bytes. Always a power of two.
    pub alignment: u64,
    pub endianness: Endianness,
    /// Whether U-Boot builds for this architecture support quad-word (`.q`)
    /// data accesses (`CONFIG_SYS_SUPPORT_64BIT_DATA`).
    pub supports_64bit_data: bool,
    pub registers: &'static [Register],
    /// Address whose dereference reliably induces a data abort.
    pub data_abort_address: Option<u64>,
    pub(crate) da_parser: Option<DataAbortParser>,
}

/// All built-in architecture definitions.
pub const SUPPORTED: &[&Architecture] = &[
    &ARM,
    &AARCH64,
    &GENERIC,
    &GENERIC_BE,
    &GENERIC_64,
    &GENERIC_64_BE,
];

impl Architecture {
    /// Look up an architecture definition by case-insensitive name.
    pub fn get(name: &str) -> Result<&'static Self> {
        SUPPORTED
            .iter()
            .copied()
            .find(|arch| arch.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ArchError::UnknownArchitecture(name.to_string()))
    }

    pub fn is_generic(&self) -> bool {
        self.name.to_ascii_lowercase().starts_with("generic")
    }

    /// Returns `true` if `address` is word-aligned.
    pub fn is_word_aligned(&self, address: u64) -> bool {
        address & (self.alignment - 1) == 0
    }

    /// Returns `true` if `value` is a multiple of the word size.
    pub fn multiple_of_word_size(&self, value: usize) -> bool {
        value % self.word_size == 0
    }

    /// Read a pointer from the start of `data` in the target byte order.
    pub fn ptr_value(&self, data: &[u8]) -> Result<u64> {
        read_uint(data, self.word_size, self.endianness)
    }

    /// Like [`Self::ptr_value`], but also returns `data` advanced past the
    /// pointer.
    pub fn ptr_value_adv<'d>(&self, data: &'d [u8]) -> Result<(u64, &'d [u8])> {
        let value = self.ptr_value(data)?;
        Ok((value, &data[self.word_size..]))
    }

    /// Read an unsigned word-sized integer from the start of `data`.
    pub fn to_uint(&self, data: &[u8]) -> Result<u64> {
        read_uint(data, self.word_size, self.endianness)
    }

    pub fn to_uint_adv<'d>(&self, data: &'d [u8]) -> Result<(u64, &'d [u8])> {
        let value = self.to_uint(data)?;
        Ok((value, &data[self.word_size..]))
    }

    /// Read a signed two's complement word-sized integer.
    pub fn to_int(&self, data: &[u8]) -> Result<i64> {
        let value = self.to_uint(data)?;
        let sign_bit = 1u64 << (self.word_size * 8 - 1);
        if value & sign_bit != 0 {
            let mask = sign_bit.wrapping_shl(1).wrapping_sub(1);
            Ok(-(((!value & mask) + 1) as i64))
        } else {
            Ok(value as i64)
        }
    }

    pub fn to_int_adv<'d>(&self, data: &'d [u8]) -> Result<(i64, &'d [u8])> {
        let value = self.to_int(data)?;
        Ok((value, &data[self.word_size..]))
    }

    /// Convert an integer to a word-sized byte string in the target byte
    /// order.
    pub fn int_to_bytes(&self, value: u64) -> Vec<u8> {
        self.value_to_bytes(value, self.word_size)
    }

    /// Read an unsigned integer spanning all of `data` (at most 8 bytes) in
    /// the target byte order.
    pub fn uint_from_bytes(&self, data: &[u8]) -> u64 {
        let size = data.len().min(8);
        let mut buf = [0u8; 8];
        match self.endianness {
            Endianness::Little => {
                buf[..size].copy_from_slice(&data[..size]);
                u64::from_le_bytes(buf)
            }
            Endianness::Big => {
                buf[8 - size..].copy_from_slice(&data[..size]);
                u64::from_be_bytes(buf)
            }
        }
    }

    /// Convert an integer to `size` bytes in the target byte order.
    pub fn value_to_bytes(&self, value: u64, size: usize) -> Vec<u8> {
        match self.endianness {
            Endianness::Little => value.to_le_bytes()[..size].to_vec(),
            Endianness::Big => value.to_be_bytes()[8 - size..].to_vec(),
        }
    }

    /// Access sizes supported by U-Boot memory commands, mapped to their
    /// command suffix letter. The quad-word entry is present only when the
    /// architecture supports 64-bit data.
    pub fn word_sizes(&self) -> Vec<(usize, char)> {
        let mut ret = vec![(1, 'b'), (2, 'w'), (4, 'l')];
        if self.supports_64bit_data {
            ret.push((8, 'q'));
        }
        ret
    }

    /// Command suffix letter for an access of `size` bytes.
    pub fn word_suffix(&self, size: usize) -> Option<char> {
        self.word_sizes()
            .into_iter()
            .find(|&(sz, _)| sz == size)
            .map(|(_, suffix)| suffix)
    }

    /// Name of the register holding the U-Boot global data pointer, if the
    /// architecture keeps it in a register.
    pub fn gd_register(&self) -> Option<&'static str> {
        self.registers.iter().find(|r| r.gd).map(|r| r.name)
    }

    /// Name of the register that receives memory contents loaded by a
    /// crash-inducing read.
    pub fn data_abort_data_reg(&self) -> Option<&'static str> {
        self.registers.iter().find(|r| r.da_data).map(|r| r.name)
    }

    /// Look up a register by case-insensitive name or alias.
    pub fn register(&self, name: &str) -> Result<&'static Register> {
        for reg in self.registers {
            if reg.name.eq_ignore_ascii_case(name) {
                return Ok(reg);
            }
            if reg.alias.is_some_and(|alias| alias.eq_ignore_ascii_case(name)) {
                return Ok(reg);
            }
        }
        Err(ArchError::UnknownRegister(name.to_string()))
    }

    /// Parse the register dump a target emits on a data abort.
    pub fn parse_data_abort(&self, text: &str) -> Result<DataAbort> {
        match self.da_parser {
            Some(parse) => parse(self, text),
            None => Err(ArchError::DataAbortUnsupported(self.name)),
        }
    }
}

fn read_uint(data: &[u8], size: usize, endianness: Endianness) -> Result<u64> {
    if data.len() < size {
        return Err(ArchError::TruncatedWord(size));
    }

    let mut buf = [0u8; 8];
    match endianness {
        Endianness::Little => buf[..size].copy_from_slice(&data[..size]),
        Endianness::Big => buf[8 - size..].copy_from_slice(&data[..size]),
    }

    match endianness {
        Endianness::Little => Ok(u64::from_le_bytes(buf)),
        Endianness::Big => Ok(u64::from_be_bytes(buf)),
    }
}

/// Parse the hex instruction words of a `Code:` crash dump line.
///
/// The faulting word is printed in parentheses and is kept, last.
pub(crate) fn parse_code_line(line: &str) -> Vec<u64> {
    line.trim_start_matches("Code:")
        .split_ascii_whitespace()
        .filter_map(|word| {
            let word = word.trim_matches(|c| c == '(' || c == ')');
            u64::from_str_radix(word, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_case_insensitive() {
        assert_eq!(Architecture::get("arm").unwrap().name, "ARM");
        assert_eq!(Architecture::get("AArch64").unwrap().name, "AARCH64");
        assert!(Architecture::get("mips").is_err());
    }

    #[test]
    fn test_alignment() {
        let arm = Architecture::get("arm").unwrap();
        assert!(arm.is_word_aligned(0x8780_0000));
        assert!(!arm.is_word_aligned(0x8780_0002));

        // AArch64 tolerates unaligned data accesses
        let aarch64 = Architecture::get("aarch64").unwrap();
        assert!(aarch64.is_word_aligned(0x8780_0003));
    }

    #[test]
    fn test_ptr_value_endianness() {
        let le = Architecture::get("generic").unwrap();
        assert_eq!(le.ptr_value(&[0x78, 0x56, 0x34, 0x12]).unwrap(), 0x1234_5678);

        let be = Architecture::get("generic_be").unwrap();
        assert_eq!(be.ptr_value(&[0x12, 0x34, 0x56, 0x78]).unwrap(), 0x1234_5678);

        assert!(le.ptr_value(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_ptr_value_adv() {
        let arch = Architecture::get("generic").unwrap();
        let data = [0x01, 0x00, 0x00, 0x00, 0xaa, 0xbb];
        let (value, rest) = arch.ptr_value_adv(&data).unwrap();
        assert_eq!(value, 1);
        assert_eq!(rest, &[0xaa, 0xbb]);
    }

    #[test]
    fn test_to_int_sign_extension() {
        let arch = Architecture::get("generic").unwrap();
        assert_eq!(arch.to_int(&[0xff, 0xff, 0xff, 0xff]).unwrap(), -1);
        assert_eq!(arch.to_int(&[0xfe, 0xff, 0xff, 0xff]).unwrap(), -2);
        assert_eq!(arch.to_int(&[0x2a, 0x00, 0x00, 0x00]).unwrap(), 42);
    }

    #[test]
    fn test_int_to_bytes_round_trip() {
        for arch in SUPPORTED {
            let encoded = arch.int_to_bytes(0x1234);
            assert_eq!(encoded.len(), arch.word_size);
            assert_eq!(arch.to_uint(&encoded).unwrap(), 0x1234);
        }
    }

    #[test]
    fn test_word_sizes() {
        let arm = Architecture::get("arm").unwrap();
        assert_eq!(arm.word_sizes(), vec![(1, 'b'), (2, 'w'), (4, 'l')]);
        assert_eq!(arm.word_suffix(4), Some('l'));
        assert_eq!(arm.word_suffix(8), None);

        let aarch64 = Architecture::get("aarch64").unwrap();
        assert_eq!(aarch64.word_suffix(8), Some('q'));
    }

    #[test]
    fn test_register_lookup() {
        let arm = Architecture::get("arm").unwrap();
        assert_eq!(arm.register("r9").unwrap().name, "r9");
        assert_eq!(arm.register("SB").unwrap().name, "r9");
        assert_eq!(arm.register("pc").unwrap().name, "r15");
        assert!(arm.register("x0").is_err());

        assert_eq!(arm.gd_register(), Some("r9"));
        assert_eq!(arm.data_abort_data_reg(), Some("r0"));
    }

    #[test]
    fn test_parse_code_line() {
        let code = parse_code_line("Code: 2800f915 f04fd0cf e7ce30ff d10a2d04 (2000f8d8)");
        assert_eq!(
            code,
            vec![0x2800f915, 0xf04fd0cf, 0xe7ce30ff, 0xd10a2d04, 0x2000f8d8]
        );
    }
}
