//! CRC32 preimage searches: turning the `crc32` console command into an
//! arbitrary memory write primitive.
//!
//! The search answers "what series of CRC32 operations produces my desired
//! payload, 4 bytes at a time?". A reverse lookup table (RLUT) maps CRC32
//! values to the shortest input window in the source data producing them;
//! each desired word is then walked backward with
//! [`reverse_crc32_4bytes`](crate::crc::reverse_crc32_4bytes) until the
//! chain lands on an RLUT entry. Larger `revlut_maxlen` values trade host
//! memory for fewer on-target CRC operations.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use depthcharge_arch::Endianness;

use crate::crc::reverse_crc32_4bytes;
use crate::hunter::{HunterCore, HunterOptions};
use crate::progress::progress_bar;
use crate::stratagem::{Stratagem, StratagemEntry, ops};
use crate::{HunterError, Result};

/// Construction parameters for [`ReverseCrc32Hunter`].
#[derive(Clone, Copy, Debug)]
pub struct ReverseCrc32Options {
    /// Maximum RLUT input window length. Memory consumption grows steeply
    /// with this value; success rates improve with it.
    pub revlut_maxlen: usize,
    /// Byte order the target uses when storing CRC32 results.
    pub endianness: Endianness,
    /// Worker threads for the per-word search. Defaults to the host CPU
    /// count.
    pub num_threads: Option<usize>,
}

impl Default for ReverseCrc32Options {
    fn default() -> Self {
        Self {
            revlut_maxlen: 256,
            endianness: Endianness::Little,
            num_threads: None,
        }
    }
}

/// A chain of CRC32 operations ending in the desired 4-byte value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevCrc32Result {
    pub src_off: usize,
    pub src_addr: u64,
    pub src_size: usize,
    /// Number of on-target CRC32 operations required.
    pub iterations: u64,
}

/// Searches for CRC32 preimages over a source data blob, producing
/// stratagems for the CRC32-based memory writer.
///
/// Two assumptions are made: the source data is static at runtime, and the
/// payload destination does not overlap it. Carve the input or declare gaps
/// accordingly.
pub struct ReverseCrc32Hunter<'d> {
    core: HunterCore<'d>,
    opts: ReverseCrc32Options,
    /// CRC32 value -> (offset, length) of the shortest producing window.
    revlut: FxHashMap<u32, (u32, u32)>,
}

impl<'d> ReverseCrc32Hunter<'d> {
    /// Builds the RLUT over the non-gap portion of `data`, which takes a
    /// while for large inputs; a progress bar is shown if enabled.
    pub fn new(
        data: &'d [u8],
        address: u64,
        opts: &HunterOptions,
        rev_opts: ReverseCrc32Options,
    ) -> Result<Self> {
        if rev_opts.revlut_maxlen == 0 {
            return Err(HunterError::InvalidArgument(
                "revlut_maxlen must be > 0".to_string(),
            ));
        }

        let core = HunterCore::new(data, address, opts)?;
        let revlut = Self::build_revlut(&core, rev_opts.revlut_maxlen);
        debug!("Reverse CRC32 LUT holds {} entries", revlut.len());

        Ok(Self {
            core,
            opts: rev_opts,
            revlut,
        })
    }

    fn build_revlut(core: &HunterCore<'_>, maxlen: usize) -> FxHashMap<u32, (u32, u32)> {
        let mut revlut = FxHashMap::default();

        // Contiguous non-gap ranges, clipped to the search bounds; windows
        // never cross a gap.
        let ranges: Vec<_> = core
            .split_data_offsets()
            .into_iter()
            .filter_map(|r| {
                let start = r.start.max(core.start_offset);
                let end = r.end.min(core.end_offset + 1);
                (start < end).then_some(start..end)
            })
            .collect();

        let total: usize = ranges.iter().map(|r| r.len()).sum();
        let bar = progress_bar(total as u64, "Creating reverse CRC32 LUT", core.show_progress);

        for range in ranges {
            for i in range.clone() {
                let window_max = maxlen.min(range.end - i);
                let mut hasher = crc32fast::Hasher::new();

                for len in 1..=window_max {
                    hasher.update(&core.data[i + len - 1..i + len]);
                    let crc = hasher.clone().finalize();

                    // Keep the mapping requiring the least input data;
                    // earliest offset wins ties.
                    let entry = revlut.entry(crc).or_insert((i as u32, len as u32));
                    if (len as u32) < entry.1 {
                        *entry = (i as u32, len as u32);
                    }
                }
                bar.inc(1);
            }
        }

        bar.finish_and_clear();
        revlut
    }

    /// Search for a CRC32 operation chain producing the 4-byte value
    /// `target`, walking backward at most `max_iterations` times.
    pub fn find(&self, target: u32, max_iterations: u64) -> Result<RevCrc32Result> {
        let mut value = target;

        for iterations in 1..=max_iterations {
            if let Some(&(off, len)) = self.revlut.get(&value) {
                return Ok(RevCrc32Result {
                    src_off: off as usize,
                    src_addr: self.core.address + u64::from(off),
                    src_size: len as usize,
                    iterations,
                });
            }
            value = reverse_crc32_4bytes(value);
        }

        Err(HunterError::ResultNotFound(format!(
            "No results for target=0x{target:08x}, revlut_maxlen={} after {max_iterations} \
             iterations. Try increasing revlut_maxlen and/or max_iterations.",
            self.opts.revlut_maxlen
        )))
    }

    /// [`Self::find`] for a 4-byte word in the target byte order.
    pub fn find_word(&self, word: [u8; 4], max_iterations: u64) -> Result<RevCrc32Result> {
        self.find(self.word_value(word), max_iterations)
    }

    fn word_value(&self, word: [u8; 4]) -> u32 {
        match self.opts.endianness {
            Endianness::Little => u32::from_le_bytes(word),
            Endianness::Big => u32::from_be_bytes(word),
        }
    }

    /// Produce a [`Stratagem`] whose execution writes `target_payload`,
    /// 4 bytes at a time. The payload length must be a non-zero multiple
    /// of 4.
    ///
    /// Only the *unique* words of the payload are searched (in parallel);
    /// repeated words are handled by copying the first occurrence's
    /// intermediate result, cutting the total number of on-target
    /// operations substantially.
    pub fn build_stratagem(&self, target_payload: &[u8], max_iterations: u64) -> Result<Stratagem> {
        let t_start = std::time::Instant::now();

        if target_payload.is_empty() || target_payload.len() % 4 != 0 {
            return Err(HunterError::StratagemCreationFailed(format!(
                "Target payload size must be a non-zero multiple of 4, got {} bytes",
                target_payload.len()
            )));
        }

        // Reduce the workload to unique words, in first-occurrence order
        let mut order: Vec<[u8; 4]> = Vec::new();
        let mut occurrences: FxHashMap<[u8; 4], Vec<u64>> = FxHashMap::default();

        for (index, chunk) in target_payload.chunks_exact(4).enumerate() {
            let word: [u8; 4] = chunk.try_into().unwrap();
            let offsets = occurrences.entry(word).or_insert_with(|| {
                order.push(word);
                Vec::new()
            });
            offsets.push((index * 4) as u64);
        }

        let bar = progress_bar(
            order.len() as u64,
            "Creating CRC32 Stratagem",
            self.core.show_progress,
        );

        let num_threads = self.opts.num_threads.unwrap_or_else(num_cpus::get);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| HunterError::InvalidArgument(e.to_string()))?;

        // Each word's search is independent once the RLUT is built; the
        // first failure cancels the remaining work.
        let results: Result<Vec<RevCrc32Result>> = pool.install(|| {
            order
                .par_iter()
                .map(|&word| {
                    let result = self.find(self.word_value(word), max_iterations);
                    bar.inc(1);
                    result
                })
                .collect()
        });
        bar.finish_and_clear();
        let results = results?;

        let mut stratagem = Stratagem::new(ops::CRC32_MEMORY_WRITER)?;

        for (word, result) in order.iter().zip(&results) {
            let dst_offsets = &occurrences[word];
            let direct = |dst_off: u64, iterations: u64| StratagemEntry {
                src_addr: result.src_addr as i64,
                src_size: result.src_size as u64,
                dst_off,
                iterations: Some(iterations),
                tsrc_off: None,
            };
            let from_target = |dst_off: u64, tsrc_off: u64| StratagemEntry {
                src_addr: -1,
                src_size: 4,
                dst_off,
                iterations: Some(1),
                tsrc_off: Some(tsrc_off),
            };

            if dst_offsets.len() == 1 {
                // Word occurs once; nothing special to do
                stratagem.append(direct(dst_offsets[0], result.iterations))?;
            } else if result.iterations == 1 {
                // Multiple occurrences, but only one operation each
                for &dst_off in dst_offsets {
                    stratagem.append(direct(dst_off, 1))?;
                }
            } else {
                // Repeated word: run all but the last iteration at the first
                // occurrence, copy its intermediate result to the others
                // with a single operation each, then finalize in place.
                let first = dst_offsets[0];
                stratagem.append(direct(first, result.iterations - 1))?;

                for &dst_off in &dst_offsets[1..] {
                    stratagem.append(from_target(dst_off, first))?;
                }
                stratagem.append(from_target(first, first))?;
            }
        }

        let total_ops = stratagem.total_operations();
        let max_iter = stratagem
            .entries()
            .iter()
            .map(StratagemEntry::operation_count)
            .max()
            .unwrap_or(0);

        let msg = format!(
            "CRC32 Stratagem created in {:.2?}: {} entries, {} total operations, \
             largest operation is {} iterations",
            t_start.elapsed(),
            stratagem.len(),
            total_ops,
            max_iter
        );
        info!("{msg}");
        stratagem.comment = msg;

        Ok(stratagem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_data(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9e37_79b9) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 8) as u8
            })
            .collect()
    }

    fn hunter<'d>(data: &'d [u8], maxlen: usize) -> ReverseCrc32Hunter<'d> {
        ReverseCrc32Hunter::new(
            data,
            0x8000_0000,
            &HunterOptions::default(),
            ReverseCrc32Options {
                revlut_maxlen: maxlen,
                num_threads: Some(2),
                ..ReverseCrc32Options::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_find_direct_hit() {
        let data = random_data(512, 7);
        let h = hunter(&data, 64);

        // A value whose CRC is by construction in the RLUT
        let crc = crc32fast::hash(&data[100..110]);
        let result = h.find(crc, 16).unwrap();

        assert_eq!(result.iterations, 1);
        let window = &data[result.src_off..result.src_off + result.src_size];
        assert_eq!(crc32fast::hash(window), crc);
        assert_eq!(result.src_addr, 0x8000_0000 + result.src_off as u64);
    }

    #[test]
    fn test_rlut_entries_consistent() {
        let data = random_data(512, 3);
        let h = hunter(&data, 64);

        for (&crc, &(off, len)) in h.revlut.iter().take(100) {
            let window = &data[off as usize..(off + len) as usize];
            assert_eq!(crc32fast::hash(window), crc);
        }
    }

    #[test]
    fn test_gaps_excluded_from_rlut() {
        let data = random_data(256, 5);
        let h = ReverseCrc32Hunter::new(
            &data,
            0x1000,
            &HunterOptions {
                gaps: vec![crate::hunter::gap(0x1000 + 64, 64)],
                ..HunterOptions::default()
            },
            ReverseCrc32Options {
                revlut_maxlen: 32,
                num_threads: Some(1),
                ..ReverseCrc32Options::default()
            },
        )
        .unwrap();

        for &(off, len) in h.revlut.values() {
            let (off, end) = (off as usize, (off + len) as usize);
            assert!(end <= 64 || off >= 128, "window {off}..{end} crosses gap");
        }
    }

    #[test]
    fn test_build_stratagem_rejects_bad_length() {
        let data = random_data(256, 9);
        let h = hunter(&data, 32);

        assert!(h.build_stratagem(b"", 100).is_err());
        assert!(h.build_stratagem(b"abc", 100).is_err());
    }

    #[test]
    fn test_duplicate_word_entry_structure() {
        let data = random_data(4096, 11);
        let h = hunter(&data, 128);

        // One word, repeated three times
        let payload = b"fizzfizzfizz";
        let stratagem = h.build_stratagem(payload, 200_000).unwrap();

        let entries = stratagem.entries();
        let k = h
            .find(u32::from_le_bytes(*b"fizz"), 200_000)
            .unwrap()
            .iterations;

        if k == 1 {
            // Degenerate case: one direct entry per occurrence
            assert_eq!(entries.len(), 3);
            assert!(entries.iter().all(|e| e.iterations == Some(1)));
        } else {
            // N-1 iterations at the first occurrence, one copy per other
            // occurrence, then a finalizing operation
            assert_eq!(entries.len(), 4);
            assert_eq!(entries[0].iterations, Some(k - 1));
            assert_eq!(entries[0].dst_off, 0);

            for (entry, dst) in entries[1..3].iter().zip([4u64, 8]) {
                assert_eq!(entry.src_addr, -1);
                assert_eq!(entry.tsrc_off, Some(0));
                assert_eq!(entry.iterations, Some(1));
                assert_eq!(entry.dst_off, dst);
            }

            assert_eq!(entries[3].tsrc_off, Some(0));
            assert_eq!(entries[3].dst_off, 0);

            assert_eq!(stratagem.total_operations(), k + 3);
        }
    }
}
