//! Stratagem-based memory writes using the `cp` console command.

use depthcharge_hunter::Stratagem;
use depthcharge_hunter::stratagem::{EntrySpec, entry_spec, ops};

use crate::memory::writer::{MemoryWriter, WriteOptions, drive_stratagem};
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::target::Target;
use crate::{Error, Result};

/// Reproduces a payload by copying fragments of data already present on the
/// target, following a plan built by
/// [`CpHunter`](depthcharge_hunter::CpHunter). Each entry uses the widest
/// `cp` mode for which source, destination, and size are co-aligned.
pub struct CpMemoryWriter {
    resolved: Resolved,
}

impl CpMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["cp"]],
        stratagem: true,
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("CpMemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

fn aligned(n: u64, src: u64, dst: u64, size: u64) -> bool {
    size % n == 0 && src % n == 0 && dst % n == 0
}

impl Operation for CpMemoryWriter {
    fn name(&self) -> &'static str {
        "CpMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        9
    }
}

impl MemoryWriter for CpMemoryWriter {
    fn write_impl(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::StratagemRequired(self.name().to_string()))
    }

    fn stratagem_spec(&self) -> Option<&'static EntrySpec> {
        entry_spec(ops::CP_MEMORY_WRITER)
    }

    fn write_stratagem(
        &mut self,
        target: &mut Target,
        addr: u64,
        stratagem: &Stratagem,
        opts: &WriteOptions,
    ) -> Result<()> {
        drive_stratagem(
            "CpMemoryWriter",
            target,
            addr,
            stratagem,
            opts,
            |target, wr_addr, stratagem, progress| {
                for entry in stratagem.entries() {
                    target.check_cancel()?;

                    let src_addr = entry.src_addr as u64;
                    let dst_addr = wr_addr + entry.dst_off;
                    let size = entry.src_size;

                    let (mode, count) = if target.arch.supports_64bit_data
                        && aligned(8, src_addr, dst_addr, size)
                    {
                        ('q', size / 8)
                    } else if aligned(4, src_addr, dst_addr, size) {
                        ('l', size / 4)
                    } else if aligned(2, src_addr, dst_addr, size) {
                        ('w', size / 2)
                    } else {
                        ('b', size)
                    };

                    let cmd = format!("cp.{mode} {src_addr:x} {dst_addr:x} {count:x}");
                    target.send_command_checked(&cmd)?;
                    progress.inc(1);
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
    fn test_mode_alignment() {
        assert!(aligned(4, 0x8000_0000, 0x8400_0000, 64));
        assert!(!aligned(4, 0x8000_0002, 0x8400_0000, 64));
        assert!(!aligned(4, 0x8000_0000, 0x8400_0000, 66));
        assert!(aligned(2, 0x8000_0002, 0x8400_0002, 66));
    }
}
