//! Memory access built on the `crc32` console command.
//!
//! Reads recover input data from checksums: 1- and 2-byte reads via
//! precomputed reverse LUTs, 4-byte reads via the algebraic reverse
//! transform. Writes exploit the command's ability to store its result at a
//! chosen address, executing a preimage plan built by
//! [`ReverseCrc32Hunter`](depthcharge_hunter::ReverseCrc32Hunter).

use std::sync::LazyLock;

use regex::Regex;
use rustc_hash::FxHashMap;

use depthcharge_hunter::Stratagem;
use depthcharge_hunter::crc::reverse_crc32_4bytes;
use depthcharge_hunter::stratagem::{EntrySpec, entry_spec, ops};

use crate::memory::reader::MemoryWordReader;
use crate::memory::writer::{MemoryWriter, WriteOptions, drive_stratagem};
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::target::Target;
use crate::{Error, Result};

static CRC_RESP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)CRC32 for [0-9a-f]+\s+\.\.\.\s+[0-9a-f]+\s+==>\s+(?P<result>[0-9a-f]+)",
    )
    .unwrap()
});

/// Issue `crc32 <addr> <len>` and parse the checksum from the response.
fn crc32_of(target: &mut Target, addr: u64, size: usize) -> Result<u32> {
    let resp = target.send_command(&format!("crc32 {addr:x} {size:x}"))?;
    let caps = CRC_RESP.captures(&resp).ok_or_else(|| {
        Error::OperationFailed(format!(
            "Response to crc32 command did not match expected output: {resp}"
        ))
    })?;

    // The textual output is human-readable big-endian
    u32::from_str_radix(&caps["result"], 16)
        .map_err(|_| Error::OperationFailed(format!("Malformed crc32 result: {resp}")))
}

/// Reads memory by checksumming 1, 2, or 4 bytes at a time and inverting
/// the result.
pub struct Crc32MemoryReader {
    resolved: Resolved,
    // CRC -> input for all 1- and 2-byte values; built on first use
    revlut: FxHashMap<u32, Vec<u8>>,
}

impl Crc32MemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["crc32"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("CRC32MemoryReader", &Self::REQUIRED, target)?,
            revlut: FxHashMap::default(),
        })
    }

    fn read_via_crc(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        let checksum = crc32_of(target, addr, size)?;

        let data = match size {
            4 => reverse_crc32_4bytes(checksum).to_le_bytes().to_vec(),
            1 | 2 => self
                .revlut
                .get(&checksum)
                .cloned()
                .ok_or_else(|| {
                    Error::OperationFailed(format!(
                        "No reverse LUT entry for checksum 0x{checksum:08x}"
                    ))
                })?,
            _ => {
                return Err(Error::OperationFailed(format!(
                    "Unexpected word read size: {size}"
                )));
            }
        };

        if data.len() != size {
            return Err(Error::OperationFailed(format!(
                "Data and read size mismatch @ 0x{addr:08x}: \
                 {size}-byte CRC32 -> {}-byte data",
                data.len()
            )));
        }

        Ok(data)
    }
}

impl Operation for Crc32MemoryReader {
    fn name(&self) -> &'static str {
        "CRC32MemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        // This is slow
        20
    }
}

impl MemoryWordReader for Crc32MemoryReader {
    fn word_setup(&mut self, _target: &mut Target, _addr: u64, _size: usize) -> Result<()> {
        // Nothing to do if the LUTs are already built
        if !self.revlut.is_empty() {
            return Ok(());
        }

        // Chained CRC states cover all two-byte sequences; a collision is
        // impossible with the standard polynomial and would indicate a code
        // defect.
        for i in 0..=255u8 {
            let state = crc32fast::hash(&[i]);
            if self.revlut.insert(state, vec![i]).is_some() {
                return Err(Error::OperationFailed(format!(
                    "Unexpected reverse LUT collision @ i={i}"
                )));
            }

            for j in 0..=255u8 {
                let crc = crc32fast::hash(&[i, j]);
                if self.revlut.insert(crc, vec![i, j]).is_some() {
                    return Err(Error::OperationFailed(format!(
                        "Unexpected reverse LUT collision @ i={i}, j={j}"
                    )));
                }
            }
        }

        Ok(())
    }

    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        if size == 8 {
            // 64-bit platforms: split into two 4-byte accesses
            let mut data = self.read_via_crc(target, addr, 4)?;
            data.extend(self.read_via_crc(target, addr + 4, 4)?);
            return Ok(data);
        }

        self.read_via_crc(target, addr, size)
    }
}

/// Writes memory by executing a CRC32 preimage Stratagem: each entry
/// checksums source data into place, then re-checksums the 4-byte output in
/// place until the desired word emerges.
pub struct Crc32MemoryWriter {
    resolved: Resolved,
}

impl Crc32MemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["crc32"]],
        stratagem: true,
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("CRC32MemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for Crc32MemoryWriter {
    fn name(&self) -> &'static str {
        "CRC32MemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        // Stratagem computation takes quite a bit of time
        5
    }
}

impl MemoryWriter for Crc32MemoryWriter {
    fn write_impl(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::StratagemRequired(self.name().to_string()))
    }

    fn stratagem_spec(&self) -> Option<&'static EntrySpec> {
        entry_spec(ops::CRC32_MEMORY_WRITER)
    }

    fn write_stratagem(
        &mut self,
        target: &mut Target,
        addr: u64,
        stratagem: &Stratagem,
        opts: &WriteOptions,
    ) -> Result<()> {
        if addr % target.arch.alignment != 0 {
            return Err(Error::OperationAlignment {
                op: self.name().to_string(),
                alignment: target.arch.alignment,
            });
        }

        drive_stratagem(
            "CRC32MemoryWriter",
            target,
            addr,
            stratagem,
            opts,
            |target, wr_addr, stratagem, progress| {
                for entry in stratagem.entries() {
                    target.check_cancel()?;

                    // Source data lives either at an absolute address or in
                    // the in-progress target buffer
                    let src_addr = match entry.tsrc_off {
                        None => entry.src_addr as u64,
                        Some(tsrc_off) => wr_addr + tsrc_off,
                    };

                    let dst_addr = wr_addr + entry.dst_off;

                    // First iteration consumes the full input window
                    let cmd =
                        format!("crc32 0x{src_addr:x} 0x{:x} 0x{dst_addr:x}", entry.src_size);
                    target.send_command_checked(&cmd)?;
                    progress.inc(1);

                    // The rest re-checksum the prior 4-byte output
                    let cmd = format!("crc32 0x{dst_addr:x} 0x4 0x{dst_addr:x}");
                    for _ in 1..entry.iterations.unwrap_or(1) {
                        target.check_cancel()?;
                        target.send_command_checked(&cmd)?;
                        progress.inc(1);
                    }
                }
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_response_regex() {
        let resp = "CRC32 for 82000000 ... 8200000f ==> 414fa339";
        let caps = CRC_RESP.captures(resp).unwrap();
        assert_eq!(&caps["result"], "414fa339");
    }
}
