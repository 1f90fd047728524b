//! NUL-terminated ASCII string searches.

use regex::bytes::Regex;

use crate::hunter::{HunterCore, HunterOptions, HunterResult, find_iter};
use crate::{HunterError, Result};

/// Length constraints for string searches. Lengths count string characters,
/// excluding the NUL terminator.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringOptions {
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    /// Match only at the provided offset instead of searching forward.
    pub match_only: bool,
}

/// Builds the default string pattern: a bounded run of printable characters
/// (plus tab/CR/LF) followed by a NUL terminator.
fn default_regex(min_len: Option<usize>, max_len: Option<usize>) -> Regex {
    let min = min_len.map_or(1, |len| len.max(1));
    let max = max_len
        .filter(|&max| max >= min)
        .map_or(String::new(), |max| max.to_string());

    let pattern = format!(r"(?s-u)[\x09\x0a\x0d\x20-\x7e]{{{min},{max}}}\x00");
    Regex::new(&pattern).unwrap()
}

fn target_regex(pattern: &str) -> Result<Regex> {
    let mut pattern = format!("(?s-u){pattern}");
    if !pattern.ends_with("\\x00") && !pattern.ends_with('\x00') {
        pattern.push_str("\\x00");
    }
    Regex::new(&pattern)
        .map_err(|e| HunterError::InvalidArgument(format!("Invalid string pattern: {e}")))
}

/// Searches for NUL-terminated ASCII strings via regular expressions.
///
/// Strings can be very telling about the nature of nearby code; this hunter
/// also backs the pointer-dereference checks used when validating command
/// tables.
pub struct StringHunter<'d> {
    core: HunterCore<'d>,
}

impl<'d> StringHunter<'d> {
    pub fn new(data: &'d [u8], address: u64, opts: &HunterOptions) -> Result<Self> {
        Ok(Self {
            core: HunterCore::new(data, address, opts)?,
        })
    }

    fn regex_for(target: Option<&str>, opts: &StringOptions) -> Result<Regex> {
        match target {
            None | Some("") => Ok(default_regex(opts.min_len, opts.max_len)),
            Some(pattern) => target_regex(pattern),
        }
    }

    fn search_at(
        &self,
        regex: &Regex,
        start: usize,
        end: usize,
        match_only: bool,
    ) -> Result<Option<(usize, usize)>> {
        let haystack = &self.core.data[start..end.min(self.core.data.len())];

        let m = if match_only {
            // Match only at this exact location
            regex.find(haystack).filter(|m| m.start() == 0)
        } else {
            regex.find(haystack)
        };

        match m {
            Some(m) => Ok(Some((start + m.start(), m.len()))),
            // The search covered the full remaining range
            None if !match_only => Err(HunterError::not_found()),
            None => Ok(None),
        }
    }

    /// Locate the first string matching `target` (a byte-regex pattern), or
    /// any printable string satisfying the length bounds when `target` is
    /// `None`.
    pub fn find(
        &self,
        target: Option<&str>,
        start: Option<usize>,
        end: Option<usize>,
        opts: &StringOptions,
    ) -> Result<HunterResult> {
        let regex = Self::regex_for(target, opts)?;
        let match_only = opts.match_only;

        let (off, size, ()) = self.core.find_at_each(
            start,
            end,
            None,
            "Searching for string",
            |i, upper| {
                Ok(self
                    .search_at(&regex, i, upper, match_only)?
                    .map(|(off, size)| (off, size, ())))
            },
        )?;

        Ok(HunterResult {
            src_off: off,
            src_addr: self.core.address + off as u64,
            src_size: size,
        })
    }

    /// Iterate over all matching strings.
    pub fn finditer<'h>(
        &'h self,
        target: Option<&'h str>,
        start: Option<usize>,
        end: Option<usize>,
        opts: StringOptions,
    ) -> impl Iterator<Item = HunterResult> + 'h {
        let begin = start.unwrap_or(self.core.start_offset);
        find_iter(begin, end, move |s, e| self.find(target, Some(s), e, &opts))
    }

    /// Return the NUL-terminated ASCII string at `address`, if one is there.
    ///
    /// Fails with an offset error when `address` falls outside the data, and
    /// with a not-found error when the location does not hold a string
    /// satisfying the constraints.
    pub fn string_at(
        &self,
        address: u64,
        min_len: Option<usize>,
        max_len: Option<usize>,
        allow_empty: bool,
    ) -> Result<String> {
        if address < self.core.address {
            return Err(HunterError::InvalidOffset {
                index: address as i64 - self.core.address as i64,
                min: 0,
                max: self.core.end_offset,
            });
        }

        let offset = (address - self.core.address) as usize;
        if offset > self.core.end_offset {
            return Err(HunterError::InvalidOffset {
                index: offset as i64,
                min: 0,
                max: self.core.end_offset,
            });
        }

        if allow_empty && self.core.data[offset] == 0 {
            return Ok(String::new());
        }

        let regex = default_regex(min_len, max_len);
        let result = self
            .search_at(&regex, offset, self.core.end_offset + 1, true)?
            .ok_or_else(HunterError::not_found)?;

        let (off, size) = result;
        let bytes = &self.core.data[off..off + size];
        let s = String::from_utf8_lossy(bytes).into_owned();
        Ok(s.trim_end_matches('\0').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_any_string() {
        let mut data = vec![0xffu8; 32];
        data[10..16].copy_from_slice(b"hello\0");

        let hunter = StringHunter::new(&data, 0x2000, &HunterOptions::default()).unwrap();
        let result = hunter
            .find(None, None, None, &StringOptions::default())
            .unwrap();

        assert_eq!(result.src_off, 10);
        assert_eq!(result.src_size, 6);
    }

    #[test]
    fn test_find_pattern() {
        let data = b"\xff\xffuboot-spl\0more text\0";
        let hunter = StringHunter::new(data, 0, &HunterOptions::default()).unwrap();

        let result = hunter
            .find(Some("uboot-[a-z]+"), None, None, &StringOptions::default())
            .unwrap();
        assert_eq!(result.src_off, 2);
        assert_eq!(result.src_size, 10);
    }

    #[test]
    fn test_string_at() {
        let base = 0x8780_0000u64;
        let mut data = vec![0xaau8; 512];
        data[501..512].copy_from_slice(b"0123456789\0");

        let hunter = StringHunter::new(&data, base, &HunterOptions::default()).unwrap();

        let s = hunter.string_at(base + 501, None, None, false).unwrap();
        assert_eq!(s, "0123456789");

        assert_eq!(
            hunter.string_at(base + 501, Some(10), Some(10), false).unwrap(),
            "0123456789"
        );

        // Over-constrained minimum length
        assert!(hunter.string_at(base + 501, Some(11), None, false).is_err());

        // Out of bounds
        assert!(hunter.string_at(base + 512, None, None, false).is_err());
        assert!(hunter.string_at(base - 1, None, None, false).is_err());
    }

    #[test]
    fn test_string_at_allow_empty() {
        let base = 0x1000u64;
        let data = b"\0abc\0";
        let hunter = StringHunter::new(data, base, &HunterOptions::default()).unwrap();

        assert_eq!(hunter.string_at(base, None, None, true).unwrap(), "");
        assert!(hunter.string_at(base, None, None, false).is_err());
        assert_eq!(hunter.string_at(base + 1, None, None, false).unwrap(), "abc");
    }

    #[test]
    fn test_finditer() {
        let data = b"one\0\xff\xfftwo\0\xffthree\0";
        let hunter = StringHunter::new(data, 0, &HunterOptions::default()).unwrap();

        let strings: Vec<usize> = hunter
            .finditer(None, None, None, StringOptions::default())
            .map(|r| r.src_off)
            .collect();
        assert_eq!(strings, vec![0, 6, 11]);
    }
}
