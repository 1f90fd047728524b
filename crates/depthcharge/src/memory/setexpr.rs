//! Memory reads built on the `setexpr` console command.

use std::sync::LazyLock;

use regex::Regex;
use tracing::error;

use crate::memory::memcmds::md_rank;
use crate::memory::reader::MemoryWordReader;
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::strutil::parse_int;
use crate::target::Target;
use crate::{Error, Result};

static PRINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<var>[\.a-zA-Z0-9_]+)=(?P<data>[0-9a-fA-F]+)").unwrap());

// "Depthcharge setexpr" scratch variable; the dot prefix hides it from
// printenv listings.
const SCRATCH_VAR: &str = ".dcse";

/// Reads memory through `setexpr`'s dereference expression syntax:
/// `setexpr.<size> .dcse *ADDR` followed by `print .dcse`.
pub struct SetexprMemoryReader {
    resolved: Resolved,
}

impl SetexprMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["setexpr"], &["printenv"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("SetexprMemoryReader", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for SetexprMemoryReader {
    fn name(&self) -> &'static str {
        "SetexprMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // Inferior to md: one word per access, with extra round trips
        md_rank(hints) / 3
    }
}

impl MemoryWordReader for SetexprMemoryReader {
    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mode = target
            .arch
            .word_suffix(size)
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported word size: {size}")))?;

        target.send_command(&format!("setexpr.{mode} {SCRATCH_VAR} *{addr:x}"))?;
        let resp = target.send_command(&format!("print {SCRATCH_VAR}"))?;

        let Some(caps) = PRINT_RE.captures(&resp) else {
            error!("Did not receive expected print output. Got: {resp}");
            target.interrupt()?;
            return Err(Error::OperationFailed(format!(
                "Failed to read {size} byte(s) @ 0x{addr:08x}"
            )));
        };

        let data = &caps["data"];

        // setexpr.l happily returns 8 bytes when asked for 4; tolerate the
        // over-length reply and truncate
        let reply_size = size.max(data.len().div_ceil(2));
        let value = parse_int(&format!("0x{data}"))?;
        let mut bytes = target.arch.value_to_bytes(value, reply_size.min(8));
        bytes.truncate(size);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_regex() {
        let caps = PRINT_RE.captures(".dcse=deadbeef").unwrap();
        assert_eq!(&caps["var"], ".dcse");
        assert_eq!(&caps["data"], "deadbeef");
    }
}
