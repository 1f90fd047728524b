//! Memory reads built on the `itest` console command.

use crate::memory::reader::MemoryWordReader;
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::target::Target;
use crate::Result;

/// Reads memory one byte at a time by binary-searching `[0, 255]` with
/// `itest.b *ADDR <op> VAL` comparisons (8 per byte, plus two quick
/// equality probes for the common all-zeroes/all-ones cases).
pub struct ItestMemoryReader {
    resolved: Resolved,
}

impl ItestMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["itest"], &["echo"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("ItestMemoryReader", &Self::REQUIRED, target)?,
        })
    }

    fn check_value(
        &mut self,
        target: &mut Target,
        addr: u64,
        value: u8,
        operator: &str,
    ) -> Result<bool> {
        let cmd = format!("if itest.b *{addr:x} {operator} {value:x};then echo 1;fi");
        let resp = target.send_command(&cmd)?;
        Ok(!resp.trim().is_empty())
    }
}

impl Operation for ItestMemoryReader {
    fn name(&self) -> &'static str {
        "ItestMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        // Slow: a binary search per byte
        25
    }
}

impl MemoryWordReader for ItestMemoryReader {
    fn word_size(&self, _target: &Target) -> usize {
        // Byte-wise regardless of the largest available word size
        1
    }

    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        debug_assert_eq!(size, 1);

        if self.check_value(target, addr, 0x00, "==")? {
            return Ok(vec![0x00]);
        }
        if self.check_value(target, addr, 0xff, "==")? {
            return Ok(vec![0xff]);
        }

        let mut min = 0u16;
        let mut max = 0xffu16;

        while max != min {
            let probe = (min + max + 1) / 2;
            if self.check_value(target, addr, probe as u8, "<")? {
                max = probe - 1;
            } else {
                min = probe;
            }
        }

        Ok(vec![max as u8])
    }
}
