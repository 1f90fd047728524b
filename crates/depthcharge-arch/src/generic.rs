//! Generic fallback architectures, used before a target has been identified.

use crate::{Architecture, Endianness, Register};

const NO_REGS: &[Register] = &[];

const GENERIC_32: Architecture = Architecture {
    name: "Generic",
    description: "Generic 32-bit, little-endian",
    word_size: 4,
    phys_size: 4,
    alignment: 4,
    endianness: Endianness::Little,
    supports_64bit_data: false,
    registers: NO_REGS,
    data_abort_address: None,
    da_parser: None,
};

const GENERIC_64_LE: Architecture = Architecture {
    name: "Generic_64",
    description: "Generic 64-bit, little-endian",
    word_size: 8,
    phys_size: 8,
    alignment: 8,
    supports_64bit_data: true,
    ..GENERIC_32
};

pub static GENERIC: Architecture = GENERIC_32;

pub static GENERIC_BE: Architecture = Architecture {
    name: "Generic_BE",
    description: "Generic 32-bit, big-endian",
    endianness: Endianness::Big,
    ..GENERIC_32
};

pub static GENERIC_64: Architecture = GENERIC_64_LE;

pub static GENERIC_64_BE: Architecture = Architecture {
    name: "Generic_64_BE",
    description: "Generic 64-bit, big-endian",
    endianness: Endianness::Big,
    ..GENERIC_64_LE
};
