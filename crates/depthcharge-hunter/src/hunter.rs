//! Shared search machinery: offset validation, gap-aware iteration, and the
//! find/finditer driver used by the concrete hunters.

use std::ops::Range;

use crate::progress::progress_bar;
use crate::{HunterError, Result};

/// Convenience constructor for an address-space gap of `length` bytes.
pub fn gap(address: u64, length: u64) -> Range<u64> {
    address..address + length
}

/// Common hunter construction parameters.
///
/// Offsets are relative to the start of the data blob; `end_offset` is
/// inclusive. Gaps are expressed in *address* space (callers think in terms
/// of memory maps) and must not overlap one another.
#[derive(Clone, Debug, Default)]
pub struct HunterOptions {
    pub start_offset: Option<usize>,
    pub end_offset: Option<usize>,
    pub gaps: Vec<Range<u64>>,
    pub show_progress: bool,
}

/// Base fields of every search result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HunterResult {
    /// Offset of the result within the searched data.
    pub src_off: usize,
    /// Absolute address of the result (`base address + src_off`).
    pub src_addr: u64,
    /// Size of the result, in bytes.
    pub src_size: usize,
}

/// Implemented by all hunter result types so that the shared `finditer`
/// machinery can advance past each returned item.
pub trait SearchResult {
    fn src_off(&self) -> usize;
    fn src_size(&self) -> usize;
}

impl SearchResult for HunterResult {
    fn src_off(&self) -> usize {
        self.src_off
    }

    fn src_size(&self) -> usize {
        self.src_size
    }
}

pub(crate) struct HunterCore<'d> {
    pub(crate) data: &'d [u8],
    pub(crate) address: u64,
    pub(crate) start_offset: usize,
    pub(crate) end_offset: usize,
    /// Offset-space gaps, sorted by start.
    pub(crate) gaps: Vec<Range<usize>>,
    pub(crate) show_progress: bool,
}

impl<'d> HunterCore<'d> {
    pub(crate) fn new(data: &'d [u8], address: u64, opts: &HunterOptions) -> Result<Self> {
        if data.is_empty() {
            return Err(HunterError::InvalidArgument(
                "Search data must not be empty".to_string(),
            ));
        }

        let start_offset = opts.start_offset.unwrap_or(0);
        let end_offset = opts.end_offset.unwrap_or(data.len() - 1);

        // Normalize gaps from address space to sorted offset ranges
        let mut gaps = Vec::with_capacity(opts.gaps.len());
        for g in &opts.gaps {
            let start = g.start.saturating_sub(address) as usize;
            let stop = (g.end.saturating_sub(address) as usize).min(data.len());
            if start < stop {
                gaps.push(start..stop);
            }
        }
        gaps.sort_by_key(|g| g.start);

        let core = Self {
            data,
            address,
            start_offset,
            end_offset,
            gaps,
            show_progress: opts.show_progress,
        };
        core.validate_offsets(None, start_offset, end_offset)?;
        Ok(core)
    }

    pub(crate) fn validate_offsets(
        &self,
        target_len: Option<usize>,
        start: usize,
        end: usize,
    ) -> Result<()> {
        let dlen = self.data.len();

        if start > end {
            return Err(HunterError::InvalidArgument(format!(
                "Start index ({start}) must be <= end ({end})"
            )));
        }

        if start >= dlen {
            return Err(HunterError::InvalidOffset {
                index: start as i64,
                min: 0,
                max: dlen - 1,
            });
        }

        if end >= dlen {
            return Err(HunterError::InvalidOffset {
                index: end as i64,
                min: start,
                max: dlen - 1,
            });
        }

        if let Some(tlen) = target_len {
            if (end - start + 1) < tlen {
                return Err(HunterError::InvalidArgument(format!(
                    "Target size ({tlen}) exceeds size of search range ([{start}, {end}])"
                )));
            }
        }

        Ok(())
    }

    /// Resolve caller-provided overrides against the constructor bounds.
    pub(crate) fn bounds(&self, start: Option<usize>, end: Option<usize>) -> (usize, usize) {
        (
            start.unwrap_or(self.start_offset),
            end.unwrap_or(self.end_offset),
        )
    }

    /// Does `[offset, offset + length)` intersect any declared gap?
    pub(crate) fn in_gap(&self, offset: usize, length: usize) -> bool {
        let end = offset + length;
        self.gaps.iter().any(|g| offset < g.end && g.start < end)
    }

    /// The data split into contiguous offset ranges, excluding gaps.
    pub(crate) fn split_data_offsets(&self) -> Vec<Range<usize>> {
        if self.gaps.is_empty() {
            return vec![0..self.data.len()];
        }

        let mut ret = Vec::new();
        let mut start = 0;

        for g in &self.gaps {
            if start < g.start {
                ret.push(start..g.start);
            }
            start = start.max(g.end);
        }

        if start < self.data.len() {
            ret.push(start..self.data.len());
        }

        ret
    }

    /// Drive a per-offset search over `[start, end]`, skipping gaps.
    ///
    /// `search_at(offset, upper)` returns `Ok(None)` to continue at the next
    /// offset, a result tuple `(found_off, found_len, extra)` to stop, or an
    /// error to abort the scan (implementations that search their whole
    /// remaining range in one call abort with `ResultNotFound`).
    pub(crate) fn find_at_each<T>(
        &self,
        start: Option<usize>,
        end: Option<usize>,
        target_len: Option<usize>,
        desc: &str,
        mut search_at: impl FnMut(usize, usize) -> Result<Option<(usize, usize, T)>>,
    ) -> Result<(usize, usize, T)> {
        let (start, end) = self.bounds(start, end);
        self.validate_offsets(target_len, start, end)?;

        let bar = progress_bar((end - start + 1) as u64, desc, self.show_progress);
        let upper = end + 1;

        let result = (|| -> Result<(usize, usize, T)> {
            for i in self.gapped_offsets(start, upper) {
                match search_at(i, upper)? {
                    None => bar.inc(1),
                    Some((off, len, extra)) => {
                        if self.in_gap(off, len) {
                            bar.inc(1);
                            continue;
                        }
                        return Ok((off, len, extra));
                    }
                }
            }
            Err(HunterError::not_found())
        })();

        bar.finish_and_clear();
        result
    }

    fn gapped_offsets(&self, start: usize, stop: usize) -> GappedOffsets<'_> {
        GappedOffsets {
            i: start,
            stop,
            gaps: &self.gaps,
        }
    }
}

/// Iterator over `[start, stop)` that steps over gap ranges.
struct GappedOffsets<'a> {
    i: usize,
    stop: usize,
    gaps: &'a [Range<usize>],
}

impl Iterator for GappedOffsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let prev = self.i;
            for g in self.gaps {
                if g.contains(&self.i) {
                    self.i = g.end;
                    break;
                }
            }
            if prev == self.i {
                break;
            }
        }

        if self.i >= self.stop {
            return None;
        }

        let ret = self.i;
        self.i += 1;
        Some(ret)
    }
}

/// Shared `finditer` plumbing: repeatedly invoke `find`, advancing the start
/// offset past each result. Iteration ends at the first failed search.
pub(crate) fn find_iter<T, F>(start: usize, end: Option<usize>, mut find: F) -> impl Iterator<Item = T>
where
    T: SearchResult,
    F: FnMut(usize, Option<usize>) -> Result<T>,
{
    let mut cur = Some(start);
    std::iter::from_fn(move || {
        let start = cur?;
        match find(start, end) {
            Ok(result) => {
                cur = Some(result.src_off() + result.src_size().max(1));
                Some(result)
            }
            Err(_) => {
                cur = None;
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core<'d>(data: &'d [u8], opts: &HunterOptions) -> HunterCore<'d> {
        HunterCore::new(data, 0x1000, opts).unwrap()
    }

    #[test]
    fn test_bounds_default() {
        let data = [0u8; 64];
        let c = core(&data, &HunterOptions::default());
        assert_eq!(c.bounds(None, None), (0, 63));
        assert_eq!(c.bounds(Some(8), Some(15)), (8, 15));
    }

    #[test]
    fn test_validate_offsets() {
        let data = [0u8; 16];
        let c = core(&data, &HunterOptions::default());

        assert!(c.validate_offsets(None, 0, 15).is_ok());
        assert!(c.validate_offsets(None, 4, 2).is_err());
        assert!(c.validate_offsets(None, 0, 16).is_err());
        assert!(c.validate_offsets(Some(20), 0, 15).is_err());
    }

    #[test]
    fn test_gapped_offsets() {
        let data = [0u8; 16];
        let opts = HunterOptions {
            gaps: vec![gap(0x1004, 2), gap(0x100a, 3)],
            ..HunterOptions::default()
        };
        let c = core(&data, &opts);

        let offsets: Vec<usize> = c.gapped_offsets(0, 16).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 6, 7, 8, 9, 13, 14, 15]);
    }

    #[test]
    fn test_in_gap() {
        let data = [0u8; 32];
        let opts = HunterOptions {
            gaps: vec![gap(0x1008, 4)],
            ..HunterOptions::default()
        };
        let c = core(&data, &opts);

        assert!(c.in_gap(8, 1));
        assert!(c.in_gap(6, 4));
        assert!(c.in_gap(11, 2));
        assert!(c.in_gap(4, 20));
        assert!(!c.in_gap(4, 4));
        assert!(!c.in_gap(12, 4));
    }

    #[test]
    fn test_split_data_offsets() {
        let data = [0u8; 32];
        let opts = HunterOptions {
            gaps: vec![gap(0x1008, 4), gap(0x1010, 8)],
            ..HunterOptions::default()
        };
        let c = core(&data, &opts);

        assert_eq!(c.split_data_offsets(), vec![0..8, 12..16, 24..32]);
    }
}
