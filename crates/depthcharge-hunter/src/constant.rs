//! Fixed byte pattern searches.

use crate::hunter::{HunterCore, HunterOptions, HunterResult, find_iter};
use crate::Result;

/// Searches for fixed data values: file format magics, checksum LUTs, or
/// opcodes near code of interest.
pub struct ConstantHunter<'d> {
    core: HunterCore<'d>,
}

impl<'d> ConstantHunter<'d> {
    pub fn new(data: &'d [u8], address: u64, opts: &HunterOptions) -> Result<Self> {
        Ok(Self {
            core: HunterCore::new(data, address, opts)?,
        })
    }

    /// Locate the first occurrence of `target` within `[start, end]`.
    pub fn find(
        &self,
        target: &[u8],
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<HunterResult> {
        let data = self.core.data;
        let tlen = target.len();

        let (off, size, ()) = self.core.find_at_each(
            start,
            end,
            Some(tlen),
            "Searching for constant",
            |i, upper| {
                if i + tlen > upper || i + tlen > data.len() {
                    return Ok(None);
                }
                if &data[i..i + tlen] == target {
                    return Ok(Some((i, tlen, ())));
                }
                Ok(None)
            },
        )?;

        Ok(HunterResult {
            src_off: off,
            src_addr: self.core.address + off as u64,
            src_size: size,
        })
    }

    /// Iterate over every occurrence of `target`.
    pub fn finditer<'h>(
        &'h self,
        target: &'h [u8],
        start: Option<usize>,
        end: Option<usize>,
    ) -> impl Iterator<Item = HunterResult> + 'h {
        let begin = start.unwrap_or(self.core.start_offset);
        find_iter(begin, end, move |s, e| self.find(target, Some(s), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunter::gap;

    #[test]
    fn test_find() {
        let data = b"0123456789needle678901234";
        let base = 0x8780_4ef0;

        let hunter = ConstantHunter::new(data, base, &HunterOptions::default()).unwrap();
        let result = hunter.find(b"needle", None, None).unwrap();

        assert_eq!(result.src_off, 10);
        assert_eq!(result.src_addr, base + 10);
        assert_eq!(result.src_size, 6);
    }

    #[test]
    fn test_find_bounded_with_gaps() {
        let data = b"0123456789needle678901234";
        let base = 0x8780_4ef0;

        let opts = HunterOptions {
            gaps: vec![gap(base + 4, 3), gap(base + 19, 10)],
            ..HunterOptions::default()
        };
        let hunter = ConstantHunter::new(data, base, &opts).unwrap();

        let result = hunter.find(b"needle", Some(6), Some(15)).unwrap();
        assert_eq!(result.src_off, 10);
        assert_eq!(result.src_addr, base + 10);
        assert_eq!(result.src_size, 6);
    }

    #[test]
    fn test_result_never_intersects_gap() {
        let data = b"xxneedlexxneedlexx";
        let base = 0x1000;

        // First occurrence lands inside the gap; only the second is valid
        let opts = HunterOptions {
            gaps: vec![gap(base + 1, 4)],
            ..HunterOptions::default()
        };
        let hunter = ConstantHunter::new(data, base, &opts).unwrap();

        let result = hunter.find(b"needle", None, None).unwrap();
        assert_eq!(result.src_off, 10);
    }

    #[test]
    fn test_not_found() {
        let data = b"0123456789";
        let hunter = ConstantHunter::new(data, 0, &HunterOptions::default()).unwrap();
        assert!(hunter.find(b"needle", None, None).is_err());
    }

    #[test]
    fn test_finditer() {
        let data = b"ab..ab..ab";
        let hunter = ConstantHunter::new(data, 0x100, &HunterOptions::default()).unwrap();

        let offsets: Vec<usize> = hunter
            .finditer(b"ab", None, None)
            .map(|r| r.src_off)
            .collect();
        assert_eq!(offsets, vec![0, 4, 8]);
    }
}
