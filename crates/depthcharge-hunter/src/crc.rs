//! Reversal of CRC32 over 4-byte inputs.
//!
//! A simplification of Listing 6 from "Reversing CRC - Theory and Practice"
//! (Stigge, Plötz, Müller, Redlich; HU Berlin SAR-PR-2006-05): computing a
//! chosen CRC32 by "appending" 4 bytes to a zero-length input.

/// Standard CRC32 (IEEE 802.3) reflected polynomial.
pub const CRC32_POLY: u32 = 0xedb8_8320;

/// Multiplicative inverse of `x^32` modulo [`CRC32_POLY`].
pub const CRC32_INV_POLY: u32 = 0x5b35_8fd3;

/// Initial and final XOR value of the standard parameterization.
pub const CRC32_XOR: u32 = 0xffff_ffff;

/// Non-standard CRC32 parameters for [`reverse_crc32_4bytes_with`].
#[derive(Clone, Copy, Debug)]
pub struct Crc32Params {
    pub poly: u32,
    pub invpoly: u32,
    pub initxor: u32,
    pub finalxor: u32,
}

impl Default for Crc32Params {
    fn default() -> Self {
        Self {
            poly: CRC32_POLY,
            invpoly: CRC32_INV_POLY,
            initxor: CRC32_XOR,
            finalxor: CRC32_XOR,
        }
    }
}

/// Return the 4-byte little-endian input whose CRC32 equals `crc`, under the
/// standard parameters used by U-Boot's `crc32` command.
pub fn reverse_crc32_4bytes(crc: u32) -> u32 {
    reverse_crc32_4bytes_with(crc, &Crc32Params::default())
}

/// [`reverse_crc32_4bytes`] with explicit parameters. Only needed if a
/// target uses a non-standard CRC32 variant.
pub fn reverse_crc32_4bytes_with(crc: u32, params: &Crc32Params) -> u32 {
    let mut tcrcreg = crc ^ params.finalxor;
    let mut data: u32 = 0;

    for _ in 0..32 {
        // Reduce modulo the polynomial
        if data & 1 != 0 {
            data = (data >> 1) ^ params.poly;
        } else {
            data >>= 1;
        }

        // Add the inverse polynomial when the corresponding operand bit is set
        if tcrcreg & 1 != 0 {
            data ^= params.invpoly;
        }

        tcrcreg >>= 1;
    }

    data ^ params.initxor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for crc in [0u32, 1, 0xdead_beef, 0xffff_ffff, 0x0badc0de, 0x1234_5678] {
            let preimage = reverse_crc32_4bytes(crc);
            assert_eq!(crc32fast::hash(&preimage.to_le_bytes()), crc);
        }
    }

    #[test]
    fn test_round_trip_sweep() {
        // Cheap xorshift32 to cover a spread of values deterministically
        let mut state = 0x1357_9bdfu32;
        for _ in 0..10_000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;

            let preimage = reverse_crc32_4bytes(state);
            assert_eq!(crc32fast::hash(&preimage.to_le_bytes()), state);
        }
    }
}
