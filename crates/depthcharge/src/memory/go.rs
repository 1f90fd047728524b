//! Payload-based bulk memory reads via the `go` command.

use tracing::debug;

use crate::memory::reader::{DataSink, MemoryReader};
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::payloads;
use crate::target::Target;
use crate::{Error, Result};

pub(crate) const START_SENTINEL: &[u8] = b"-:[START]:-";
pub(crate) const END_SENTINEL: &[u8] = b"-:[|END|]:-";

/// Map the CR-LF pairs U-Boot's serial output layer inserts (NL -> CR-NL,
/// akin to ONLCR) back to plain NL.
fn unescape_crlf(data: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) == Some(&b'\n') {
            ret.push(b'\n');
            i += 2;
        } else {
            ret.push(data[i]);
            i += 1;
        }
    }

    ret
}

/// Dumps memory with a deployed binary payload that streams raw bytes
/// between sentinels, far faster than any text-based reader for large
/// regions.
///
/// The streaming payload calls console routines through the U-Boot jump
/// table; until `gd->jt` has been located, a slower word-at-a-time payload
/// is used instead.
pub struct GoMemoryReader {
    resolved: Resolved,
    jt_addr: Option<u64>,
}

impl GoMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["go"]],
        payloads: &[payloads::RETURN_MEMORY_WORD, payloads::READ_MEMORY],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("GoMemoryReader", &Self::REQUIRED, target)?,
            jt_addr: None,
        })
    }

    fn fallback_read(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()> {
        let word_size = target.arch.word_size;
        let mut addr = addr;
        let mut remaining = size;

        while remaining > 0 {
            target.check_cancel()?;
            let (rc, _) = target
                .execute_payload(
                    payloads::RETURN_MEMORY_WORD,
                    &[format!("0x{addr:08x}")],
                    true,
                )?
                .ok_or_else(|| Error::OperationFailed("No payload return code".to_string()))?;

            let data = target.arch.int_to_bytes(rc);
            let take = word_size.min(remaining);
            sink(&data[..take])?;

            addr += take as u64;
            remaining -= take;
        }

        Ok(())
    }

    fn streamed_read(
        &mut self,
        target: &mut Target,
        jt_addr: u64,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()> {
        debug!("Payload read of {size} bytes @ 0x{addr:08x}");

        target.execute_payload(
            payloads::READ_MEMORY,
            &[
                format!("0x{jt_addr:08x}"),
                format!("0x{addr:08x}"),
                format!("0x{size:08x}"),
            ],
            false,
        )?;

        let resp = target.console.read_raw()?;
        if !resp.ends_with(START_SENTINEL) {
            return Err(Error::Protocol(
                "Did not receive expected start sentinel".to_string(),
            ));
        }

        target.console.write_str("\n")?;

        let data = target.console.read_raw()?;
        let endpos = data
            .windows(END_SENTINEL.len())
            .rposition(|w| w == END_SENTINEL)
            .ok_or_else(|| {
                Error::Protocol("Did not receive expected end sentinel".to_string())
            })?;
        debug!("Found end sentinel @ byte {endpos}");

        sink(&unescape_crlf(&data[..endpos]))?;
        Ok(())
    }
}

impl Operation for GoMemoryReader {
    fn name(&self) -> &'static str {
        "GoMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // Deploying a payload incurs overhead only worthwhile for larger
        // amounts of data
        match hints.data_len.unwrap_or(0) {
            65536.. => 90,
            16384.. => 75,
            4096.. => 25,
            _ => 5,
        }
    }
}

impl MemoryReader for GoMemoryReader {
    fn setup(&mut self, target: &mut Target, _addr: u64, _size: usize) -> Result<()> {
        self.jt_addr = target.gd.jt.as_ref().map(|jt| jt.address);
        if self.jt_addr.is_some() {
            debug!("(GoMemoryReader) Using payload-based read implementation");
        } else {
            debug!("(GoMemoryReader) U-Boot jump table location unknown. Using fallback reader.");
        }
        Ok(())
    }

    fn read_impl(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()> {
        let block_size = if self.jt_addr.is_some() { 16384 } else { 1024 };

        let mut offset = 0usize;
        while offset < size {
            target.check_cancel()?;
            let to_read = (size - offset).min(block_size);

            match self.jt_addr {
                Some(jt_addr) => {
                    self.streamed_read(target, jt_addr, addr + offset as u64, to_read, sink)?;
                }
                None => self.fallback_read(target, addr + offset as u64, to_read, sink)?,
            }

            offset += to_read;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_crlf() {
        assert_eq!(unescape_crlf(b"ab\r\ncd"), b"ab\ncd");
        assert_eq!(unescape_crlf(b"\r\n\r\n"), b"\n\n");
        // Lone CRs are data, not line endings
        assert_eq!(unescape_crlf(b"ab\rcd"), b"ab\rcd");
        assert_eq!(unescape_crlf(b"trailing\r"), b"trailing\r");
    }
}
