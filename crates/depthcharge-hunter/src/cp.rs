//! Stratagem construction for the `cp`-based memory writer.

use std::collections::VecDeque;
use std::ops::Range;

use tracing::debug;

use crate::hunter::{HunterCore, HunterOptions};
use crate::progress::progress_bar;
use crate::stratagem::{Stratagem, StratagemEntry, ops};
use crate::{HunterError, Result};

/// Builds plans that reproduce a payload purely by copying bytes already
/// present in the source data, minimizing `cp` invocations via repeated
/// longest-common-substring extraction.
pub struct CpHunter<'d> {
    core: HunterCore<'d>,
}

/// Longest substring common to `data` and `target`, as
/// `(data index, target index, length)`.
fn lcss(data: &[u8], target: &[u8]) -> Option<(usize, usize, usize)> {
    // Classic dynamic programming formulation, keeping only the previous row
    let mut prev = vec![0usize; target.len() + 1];
    let mut curr = vec![0usize; target.len() + 1];

    let mut best_len = 0;
    let mut best = (0, 0);

    for (i, &d) in data.iter().enumerate() {
        for (j, &t) in target.iter().enumerate() {
            if d == t {
                let len = prev[j] + 1;
                curr[j + 1] = len;
                if len > best_len {
                    best_len = len;
                    best = (i + 1, j + 1);
                }
            } else {
                curr[j + 1] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut curr);
        curr.fill(0);
    }

    if best_len == 0 {
        return None;
    }

    Some((best.0 - best_len, best.1 - best_len, best_len))
}

impl<'d> CpHunter<'d> {
    pub fn new(data: &'d [u8], address: u64, opts: &HunterOptions) -> Result<Self> {
        Ok(Self {
            core: HunterCore::new(data, address, opts)?,
        })
    }

    /// Produce a [`Stratagem`] for the cp-based memory writer.
    ///
    /// A work queue of contiguous destination ranges is reduced by emitting
    /// one entry for the longest substring common to the payload slice and
    /// an available source range, then re-queueing the remainders. Fails if
    /// some destination byte value occurs nowhere in the source data.
    pub fn build_stratagem(&self, target_payload: &[u8]) -> Result<Stratagem> {
        if target_payload.is_empty() {
            return Err(HunterError::StratagemCreationFailed(
                "Target payload must not be empty".to_string(),
            ));
        }

        // Prefer longer source ranges
        let mut data_ranges = self.core.split_data_offsets();
        data_ranges.sort_by_key(|r| std::cmp::Reverse(r.len()));

        let mut workload: VecDeque<Range<usize>> = VecDeque::new();
        workload.push_back(0..target_payload.len());

        let mut stratagem = Stratagem::new(ops::CP_MEMORY_WRITER)?;
        let bar = progress_bar(
            target_payload.len() as u64,
            "Creating CpMemoryWriter Stratagem",
            self.core.show_progress,
        );

        while let Some(twork) = workload.pop_front() {
            debug!("Current work: [{}, {})", twork.start, twork.end);
            let tslice = &target_payload[twork.clone()];

            let mut solved = false;
            for r in &data_ranges {
                let dslice = &self.core.data[r.clone()];

                // Don't run the full LCSS for a single byte
                if tslice.len() == 1 {
                    let Some(src_off) = dslice.iter().position(|&b| b == tslice[0]) else {
                        continue;
                    };

                    stratagem.append(StratagemEntry {
                        src_addr: (self.core.address + (r.start + src_off) as u64) as i64,
                        src_size: 1,
                        dst_off: twork.start as u64,
                        iterations: None,
                        tsrc_off: None,
                    })?;
                    bar.inc(1);
                    solved = true;
                    break;
                }

                let Some((di, ti, size)) = lcss(dslice, tslice) else {
                    continue;
                };

                let di = di + r.start;
                let ti = ti + twork.start;

                stratagem.append(StratagemEntry {
                    src_addr: (self.core.address + di as u64) as i64,
                    src_size: size as u64,
                    dst_off: ti as u64,
                    iterations: None,
                    tsrc_off: None,
                })?;
                bar.inc(size as u64);
                debug!("Found substr len={size}: src={di}, dst={ti}");

                // Carve out any remaining work
                if twork.start < ti {
                    workload.push_back(twork.start..ti);
                }
                if ti + size < twork.end {
                    workload.push_back(ti + size..twork.end);
                }

                solved = true;
                break;
            }

            if !solved {
                bar.finish_and_clear();
                return Err(HunterError::StratagemCreationFailed(format!(
                    "No common substring found for destination range [{}, {})",
                    twork.start, twork.end
                )));
            }
        }

        bar.finish_and_clear();
        Ok(stratagem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replay a cp stratagem over a zeroed buffer.
    fn simulate(stratagem: &Stratagem, data: &[u8], base: u64, out_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; out_len];
        for entry in stratagem.entries() {
            let src = (entry.src_addr as u64 - base) as usize;
            let dst = entry.dst_off as usize;
            let size = entry.src_size as usize;
            out[dst..dst + size].copy_from_slice(&data[src..src + size]);
        }
        out
    }

    #[test]
    fn test_lcss() {
        let (di, ti, len) = lcss(b"xxhello worldxx", b"__world__").unwrap();
        assert_eq!((di, ti, len), (8, 2, 5));

        assert!(lcss(b"abc", b"xyz").is_none());
    }

    #[test]
    fn test_build_stratagem() {
        let data = b"The quick brown fox jumps over the lazy dog 0123456789";
        let payload = b"lazy fox 42";
        let base = 0x8000_0000;

        let hunter = CpHunter::new(data, base, &HunterOptions::default()).unwrap();
        let stratagem = hunter.build_stratagem(payload).unwrap();

        assert_eq!(stratagem.operation_name(), ops::CP_MEMORY_WRITER);
        assert_eq!(
            simulate(&stratagem, data, base, payload.len()),
            payload.to_vec()
        );

        // LCSS decomposition beats byte-at-a-time copying
        assert!(stratagem.len() < payload.len());
    }

    #[test]
    fn test_build_stratagem_with_gaps() {
        let data = b"abcdefghij0123456789";
        let base = 0x100;

        // Carve out the digits; they must not be used as a source
        let opts = HunterOptions {
            gaps: vec![crate::hunter::gap(base + 10, 10)],
            ..HunterOptions::default()
        };
        let hunter = CpHunter::new(data, base, &opts).unwrap();

        let stratagem = hunter.build_stratagem(b"fedcba").unwrap();
        for entry in stratagem.entries() {
            let off = entry.src_addr as u64 - base;
            assert!(off < 10, "entry sourced from gap: offset {off}");
        }

        assert!(hunter.build_stratagem(b"555").is_err());
    }

    #[test]
    fn test_unsatisfiable() {
        let data = b"aaaa";
        let hunter = CpHunter::new(data, 0, &HunterOptions::default()).unwrap();
        assert!(matches!(
            hunter.build_stratagem(b"ab"),
            Err(HunterError::StratagemCreationFailed(_))
        ));
    }
}
