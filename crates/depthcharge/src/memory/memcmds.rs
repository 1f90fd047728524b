//! Memory operations built on U-Boot's memory display/modify commands:
//! `md`, `mm`, `nm`, and `mw`.

use std::sync::LazyLock;

use regex::Regex;
use tracing::error;

use crate::memory::reader::{DataSink, MemoryReader, MemoryWordReader};
use crate::memory::writer::MemoryWordWriter;
use crate::operation::{
    Operation, RankHints, Requirements, Resolved, check_requirements,
};
use crate::strutil::parse_int;
use crate::target::{Target, check_response_for_error};
use crate::{Error, Result};

// Match the prompt (address: data) printed by the interactive mm and nm
// commands.
static MM_NM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<addr>[0-9a-fA-F]+)\s*:\s(?P<data>[0-9a-fA-F]+)\s*").unwrap());

// Match md[.b|.w|.l|.q] output without strict formatting expectations:
// address prefix, data words, then the ASCII rendering.
static MD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<addr>[0-9a-fA-F]{8,}):\s+(?P<data>([0-9a-fA-F]+\s)+)\s+.{1,16}").unwrap()
});

/// Validate an `mm`/`nm` sub-prompt response, returning the displayed data.
fn verify_mm_nm_resp(
    target: &mut Target,
    resp: &str,
    expected_addr: u64,
    cmd: &str,
    op: &str,
) -> Result<String> {
    let failed = |target: &mut Target, msg: String| {
        error!("{msg}");
        let _ = target.interrupt();
        Err(Error::Protocol(format!(
            "Failed to start {cmd}-based memory {op}"
        )))
    };

    let Some(caps) = MM_NM_RE.captures(resp) else {
        return failed(
            target,
            format!("Did not receive expected {cmd} prompt. Got: {resp}"),
        );
    };

    let prompt_addr = u64::from_str_radix(&caps["addr"], 16).unwrap_or(0);
    if prompt_addr != expected_addr {
        return failed(
            target,
            format!("Got {cmd} prompt with address={prompt_addr:08x}, expected {expected_addr:08x}"),
        );
    }

    Ok(caps["data"].to_string())
}

pub(crate) fn md_rank(hints: &RankHints) -> u8 {
    // Favored for smaller amounts of data, less so as it grows
    match hints.data_len.unwrap_or(0) {
        0..=256 => 95,
        257..=1024 => 75,
        1025..=4095 => 65,
        4096..=16384 => 50,
        _ => 35,
    }
}

/// Reads memory with the `md` (memory display) command, parsing its textual
/// hex dump.
pub struct MdMemoryReader {
    resolved: Resolved,
}

impl MdMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["md"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("MdMemoryReader", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for MdMemoryReader {
    fn name(&self) -> &'static str {
        "MdMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        md_rank(hints)
    }
}

impl MemoryReader for MdMemoryReader {
    fn read_impl(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()> {
        let (mode, count) = if target.arch.supports_64bit_data && size >= 8 && addr % 8 == 0 {
            ('q', size.div_ceil(8))
        } else if size >= 4 && addr % 4 == 0 {
            ('l', size.div_ceil(4))
        } else if size >= 2 && addr % 2 == 0 {
            ('w', size.div_ceil(2))
        } else {
            ('b', size)
        };

        let cmd = format!("md.{mode} {addr:x} {count:x}");
        target.send_command_no_response(&cmd)?;

        // Some builds prefix hex dump lines with a stray CR; strip leading
        // whitespace before parsing rather than trusting the format.
        let mut line = target.console.readline()?.trim_start().to_string();
        line = crate::console::strip_echoed_input(&cmd, &line);
        if line.is_empty() {
            line = target.console.readline()?.trim_start().to_string();
        }

        check_response_for_error(&line)?;

        let prompt = target.console.prompt.clone().unwrap_or_default();
        let mut n_read = 0usize;

        loop {
            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed == prompt {
                break;
            }

            target.check_cancel()?;

            let Some(caps) = MD_RE.captures(&line) else {
                return Err(Error::OperationFailed(format!(
                    "Failed to parse line: {line}"
                )));
            };

            for word in caps["data"].split_ascii_whitespace() {
                let value = parse_int(&format!("0x{word}"))?;
                let data = target.arch.value_to_bytes(value, word.len() / 2);

                let take = data.len().min(size - n_read);
                sink(&data[..take])?;
                n_read += take;
            }

            line = target.console.readline()?.trim_start().to_string();
        }

        Ok(())
    }
}

/// Reads memory through the interactive `mm` (memory modify) sub-prompt,
/// exploiting "empty line means no change" to view words without altering
/// them.
pub struct MmMemoryReader {
    resolved: Resolved,
    setup_requested: bool,
    perform_setup: bool,
}

impl MmMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["mm"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("MmMemoryReader", &Self::REQUIRED, target)?,
            setup_requested: false,
            perform_setup: false,
        })
    }

    fn enter_prompt(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<String> {
        self.setup_requested = false;
        let mode = target
            .arch
            .word_suffix(size)
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported word size: {size}")))?;

        let resp = target.send_command(&format!("mm.{mode} {addr:x}"))?;
        verify_mm_nm_resp(target, &resp, addr, "mm", "read")
    }
}

impl Operation for MmMemoryReader {
    fn name(&self) -> &'static str {
        "MmMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // MdMemoryReader is always a better option
        md_rank(hints) / 2
    }
}

impl MemoryWordReader for MmMemoryReader {
    fn word_setup(&mut self, _target: &mut Target, _addr: u64, _size: usize) -> Result<()> {
        // Defer until the first read_word(): the mm prompt displays the
        // current data at the selected address, which would be lost here.
        self.setup_requested = true;
        self.perform_setup = false;
        Ok(())
    }

    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        let data = if self.setup_requested {
            self.perform_setup = true;
            self.enter_prompt(target, addr, size)?
        } else {
            // Empty line: no change to the current value, advance
            target.console.write_str("\n")?;
            let resp = target.console.read()?.trim_start().to_string();
            verify_mm_nm_resp(target, &resp, addr, "mm", "read")?
        };

        let value = parse_int(&format!("0x{data}"))?;
        Ok(target.arch.value_to_bytes(value, size))
    }

    fn word_teardown(&mut self, target: &mut Target) -> Result<()> {
        // Exit the mm sub-prompt
        self.setup_requested = false;
        target.interrupt()
    }
}

/// Writes memory through the interactive `mm` sub-prompt.
pub struct MmMemoryWriter {
    resolved: Resolved,
    curr_word_size: usize,
    update_word_size: bool,
}

impl MmMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["mm"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("MmMemoryWriter", &Self::REQUIRED, target)?,
            curr_word_size: 0,
            update_word_size: false,
        })
    }
}

impl Operation for MmMemoryWriter {
    fn name(&self) -> &'static str {
        "MmMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // One word at a time through interactive prompts
        if hints.data_len.unwrap_or(0) > 64 { 25 } else { 35 }
    }
}

impl MemoryWordWriter for MmMemoryWriter {
    fn word_setup(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        let word_size = if self.update_word_size {
            data.len()
        } else {
            self.word_size(target)
        };

        let mode = target
            .arch
            .word_suffix(word_size)
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported word size: {word_size}")))?;
        self.curr_word_size = word_size;
        self.update_word_size = false;

        let resp = target.send_command(&format!("mm.{mode} {addr:x}"))?;
        verify_mm_nm_resp(target, &resp, addr, "mm", "write")?;
        Ok(())
    }

    fn write_word(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        // Winding down onto the remainder that is not divisible by the
        // current word size: break back into the console and restart
        if data.len() != self.curr_word_size {
            self.word_teardown(target)?;
            self.update_word_size = true;
            self.word_setup(target, addr, data)?;
        }

        let value = target.arch.uint_from_bytes(data);
        let input = format!("{value:x}\n");
        target.console.write_str(&input)?;

        let mut resp = target.console.read()?;
        resp = crate::console::strip_echoed_input(&input, &resp);

        // mm auto-increments the address
        verify_mm_nm_resp(target, &resp, addr + data.len() as u64, "mm", "write")?;
        Ok(())
    }

    fn word_teardown(&mut self, target: &mut Target) -> Result<()> {
        self.curr_word_size = self.word_size(target);
        target.interrupt()
    }
}

/// Writes memory one word per `mw` (memory write) invocation.
pub struct MwMemoryWriter {
    resolved: Resolved,
}

impl MwMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["mw"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("MwMemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for MwMemoryWriter {
    fn name(&self) -> &'static str {
        "MwMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // One word per invocation
        if hints.data_len.unwrap_or(0) > 64 { 35 } else { 40 }
    }
}

impl MemoryWordWriter for MwMemoryWriter {
    fn write_word(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        let mode = target
            .arch
            .word_suffix(data.len())
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported word size: {}", data.len())))?;
        let value = target.arch.uint_from_bytes(data);

        target.send_command_checked(&format!("mw.{mode} {addr:x} {value:x}"))?;
        Ok(())
    }
}

/// Reads memory through the interactive `nm` (memory modify, constant
/// address) command, one word at a time.
pub struct NmMemoryReader {
    resolved: Resolved,
}

impl NmMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["nm"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("NmMemoryReader", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for NmMemoryReader {
    fn name(&self) -> &'static str {
        "NmMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // Pretty much the same as mm
        md_rank(hints) / 2
    }
}

impl MemoryWordReader for NmMemoryReader {
    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mode = target
            .arch
            .word_suffix(size)
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported word size: {size}")))?;

        let resp = target.send_command(&format!("nm.{mode} {addr:x}"))?;
        let data = verify_mm_nm_resp(target, &resp, addr, "nm", "read")?;

        // Leave the sub-prompt cleanly before the next access
        target.interrupt()?;

        let value = parse_int(&format!("0x{data}"))?;
        Ok(target.arch.value_to_bytes(value, size))
    }
}

/// Writes memory through the interactive `nm` command, one word at a time.
pub struct NmMemoryWriter {
    resolved: Resolved,
}

impl NmMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["nm"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("NmMemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for NmMemoryWriter {
    fn name(&self) -> &'static str {
        "NmMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        if hints.data_len.unwrap_or(0) > 64 { 25 } else { 35 }
    }
}

impl MemoryWordWriter for NmMemoryWriter {
    fn write_word(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        let mode = target
            .arch
            .word_suffix(data.len())
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported word size: {}", data.len())))?;

        let resp = target.send_command(&format!("nm.{mode} {addr:x}"))?;

        // nm is "constant address": no increment across prompts
        verify_mm_nm_resp(target, &resp, addr, "nm", "write")?;

        let value = target.arch.uint_from_bytes(data);
        let input = format!("{value:x}\n");
        target.console.write_str(&input)?;

        let mut resp = target.console.read()?;
        resp = crate::console::strip_echoed_input(&input, &resp);
        verify_mm_nm_resp(target, &resp, addr, "nm", "write")?;

        target.interrupt()
    }

    fn word_teardown(&mut self, target: &mut Target) -> Result<()> {
        target.interrupt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md_regex() {
        let line = "9ff47000: 05050505 05050505 00000000 00000000    ................";
        let caps = MD_RE.captures(line).unwrap();
        assert_eq!(&caps["addr"], "9ff47000");

        let words: Vec<&str> = caps["data"].split_ascii_whitespace().collect();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], "05050505");
    }

    #[test]
    fn test_mm_nm_regex() {
        let caps = MM_NM_RE.captures("82000000: deadbeef ? ").unwrap();
        assert_eq!(&caps["addr"], "82000000");
        assert_eq!(&caps["data"], "deadbeef");
    }

    #[test]
    fn test_md_rank_scaling() {
        let rank = |len| {
            md_rank(&RankHints {
                data_len: Some(len),
            })
        };
        assert_eq!(rank(64), 95);
        assert_eq!(rank(1024), 75);
        assert_eq!(rank(4000), 65);
        assert_eq!(rank(16384), 50);
        assert_eq!(rank(1 << 20), 35);
    }
}
