//! Flattened Device Tree (DTB) searches.

use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;

use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::hunter::{HunterCore, HunterOptions, SearchResult, find_iter};
use crate::{HunterError, Result};

/// FDT header magic (`d00dfeed`), stored big-endian.
pub const FDT_MAGIC: &[u8] = b"\xd0\x0d\xfe\xed";

// FDT header per the v17 specification: magic followed by nine big-endian
// 32-bit fields.
static FDT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s-u)\xd0\x0d\xfe\xed.{36}").unwrap());

/// A located device tree blob.
#[derive(Clone, Debug)]
pub struct FdtResult {
    pub src_off: usize,
    pub src_addr: u64,
    pub src_size: usize,
    /// The device tree blob bytes.
    pub dtb: Vec<u8>,
    /// Source representation, if the host `dtc` program was available.
    pub dts: Option<String>,
}

impl SearchResult for FdtResult {
    fn src_off(&self) -> usize {
        self.src_off
    }

    fn src_size(&self) -> usize {
        self.src_size
    }
}

/// Locate the Device Tree Compiler on the host, if installed.
fn find_dtc() -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join("dtc"))
        .find(|candidate| candidate.is_file())
}

/// Searches for Flattened Device Tree instances in a memory or flash dump.
///
/// When `dtc` is installed on the host, results also carry the decompiled
/// source (DTS) form.
pub struct FdtHunter<'d> {
    core: HunterCore<'d>,
    dtc: Option<PathBuf>,
}

impl<'d> FdtHunter<'d> {
    pub fn new(data: &'d [u8], address: u64, opts: &HunterOptions) -> Result<Self> {
        let dtc = find_dtc();
        if dtc.is_none() {
            warn!("The \"dtc\" program was not found. DTS will not be provided in results.");
        }

        Ok(Self {
            core: HunterCore::new(data, address, opts)?,
            dtc,
        })
    }

    fn header_field(data: &[u8], index: usize) -> u64 {
        let off = 4 + index * 4;
        u64::from(u32::from_be_bytes(data[off..off + 4].try_into().unwrap()))
    }

    /// Validate header offsets against the remaining blob size, ruling out
    /// false positives, and return the DTB bytes on success.
    fn device_tree(&self, offset: usize, end: usize) -> Option<Vec<u8>> {
        debug!("Inspecting potential DTB @ 0x{offset:08x}");
        let header = &self.core.data[offset..];

        let totalsize = Self::header_field(header, 0);
        let off_dt_struct = Self::header_field(header, 1);
        let off_dt_strings = Self::header_field(header, 2);
        let off_mem_rsvmap = Self::header_field(header, 3);
        let size_dt_strings = Self::header_field(header, 7);
        let size_dt_struct = Self::header_field(header, 8);

        let end = end as u64;
        let start = offset as u64;

        let checks = [
            ("totalsize", totalsize, end - (start + 4)),
            ("off_dt_struct", off_dt_struct, end - (start + 8)),
            ("off_dt_strings", off_dt_strings, end - (start + 12)),
            ("off_mem_rsvmap", off_mem_rsvmap, end - (start + 16)),
            ("size_dt_strings", size_dt_strings, end.saturating_sub(off_dt_strings)),
            ("size_dt_struct", size_dt_struct, end.saturating_sub(off_dt_struct)),
        ];

        for (name, value, limit) in checks {
            if value > limit {
                debug!("Invalid FDT @ 0x{start:08x} - {name} too large (0x{value:08x})");
                return None;
            }
        }

        debug!("Returning DTB @ 0x{start:08x}, size={totalsize} bytes");
        Some(self.core.data[offset..offset + totalsize as usize].to_vec())
    }

    /// Run the host `dtc` to convert a DTB to DTS text.
    fn create_dts(&self, dtb: &[u8]) -> Result<String> {
        let dtc = self.dtc.as_ref().expect("caller checked dtc presence");

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(dtb)?;

        let output = Command::new(dtc)
            .args(["-q", "-I", "dtb", "-O", "dts"])
            .arg(file.path())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HunterError::InvalidArgument(format!(
                "DTB -> DTS conversion failed: {}",
                stderr.replace("FATAL ERROR: ", "").trim_end()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn search_at(
        &self,
        target: Option<&[u8]>,
        start: usize,
        end: usize,
        no_dts: bool,
    ) -> Result<Option<(usize, usize, FdtResult)>> {
        let data = self.core.data;
        let mut start = start;

        while start < end {
            let Some(m) = FDT_HEADER.find(&data[start..end.min(data.len())]) else {
                return Err(HunterError::not_found());
            };

            let offset = start + m.start();
            if let Some(dtb) = self.device_tree(offset, end) {
                let dts = if self.dtc.is_some() && !no_dts {
                    Some(self.create_dts(&dtb)?)
                } else {
                    None
                };

                let matches_target = match target {
                    None => true,
                    Some(t) => {
                        contains(&dtb, t)
                            || dts.as_ref().is_some_and(|s| {
                                std::str::from_utf8(t).is_ok_and(|t| s.contains(t))
                            })
                    }
                };

                if matches_target {
                    let size = dtb.len();
                    let result = FdtResult {
                        src_off: offset,
                        src_addr: self.core.address + offset as u64,
                        src_size: size,
                        dtb,
                        dts,
                    };
                    return Ok(Some((offset, size, result)));
                }
            }

            // False positive or mismatch; continue past this magic word
            start = offset + 4;
        }

        Err(HunterError::not_found())
    }

    /// Locate the next valid device tree. A `target` byte string restricts
    /// results to DTBs containing it (or whose DTS text contains it).
    pub fn find(
        &self,
        target: Option<&[u8]>,
        start: Option<usize>,
        end: Option<usize>,
        no_dts: bool,
    ) -> Result<FdtResult> {
        let (_, _, result) = self.core.find_at_each(
            start,
            end,
            None,
            "Searching for device tree",
            |i, upper| self.search_at(target, i, upper, no_dts),
        )?;
        Ok(result)
    }

    /// Iterate over all device trees in the data.
    pub fn finditer<'h>(
        &'h self,
        target: Option<&'h [u8]>,
        start: Option<usize>,
        end: Option<usize>,
        no_dts: bool,
    ) -> impl Iterator<Item = FdtResult> + 'h {
        let begin = start.unwrap_or(self.core.start_offset);
        find_iter(begin, end, move |s, e| self.find(target, Some(s), e, no_dts))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len().max(1))
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunter::HunterOptions;

    /// Minimal structurally-valid FDT: header plus empty rsvmap, struct, and
    /// strings sections.
    fn minimal_dtb() -> Vec<u8> {
        let mut dtb = Vec::new();
        let totalsize: u32 = 72;

        dtb.extend_from_slice(FDT_MAGIC);
        dtb.extend_from_slice(&totalsize.to_be_bytes()); // totalsize
        dtb.extend_from_slice(&56u32.to_be_bytes()); // off_dt_struct
        dtb.extend_from_slice(&68u32.to_be_bytes()); // off_dt_strings
        dtb.extend_from_slice(&40u32.to_be_bytes()); // off_mem_rsvmap
        dtb.extend_from_slice(&17u32.to_be_bytes()); // version
        dtb.extend_from_slice(&16u32.to_be_bytes()); // last_comp_version
        dtb.extend_from_slice(&0u32.to_be_bytes()); // boot_cpuid_phys
        dtb.extend_from_slice(&4u32.to_be_bytes()); // size_dt_strings
        dtb.extend_from_slice(&12u32.to_be_bytes()); // size_dt_struct

        dtb.extend_from_slice(&[0u8; 16]); // empty rsvmap terminator
        dtb.extend_from_slice(&1u32.to_be_bytes()); // FDT_BEGIN_NODE
        dtb.extend_from_slice(&[0u8; 4]); // root node name ""
        dtb.extend_from_slice(&2u32.to_be_bytes()); // FDT_END_NODE
        dtb.extend_from_slice(&9u32.to_be_bytes()); // FDT_END  (at off 68: strings)

        assert_eq!(dtb.len(), totalsize as usize);
        dtb
    }

    #[test]
    fn test_find() {
        let dtb = minimal_dtb();
        let mut data = vec![0x5au8; 256];
        data[100..100 + dtb.len()].copy_from_slice(&dtb);

        let hunter = FdtHunter::new(&data, 0x4000_0000, &HunterOptions::default()).unwrap();
        let result = hunter.find(None, None, None, true).unwrap();

        assert_eq!(result.src_off, 100);
        assert_eq!(result.src_addr, 0x4000_0064);
        assert_eq!(result.src_size, dtb.len());
        assert_eq!(result.dtb, dtb);
    }

    #[test]
    fn test_rejects_bogus_header() {
        // Magic present, but totalsize runs far past the data
        let mut data = vec![0u8; 128];
        data[0..4].copy_from_slice(FDT_MAGIC);
        data[4..8].copy_from_slice(&0xffff_0000u32.to_be_bytes());

        let hunter = FdtHunter::new(&data, 0, &HunterOptions::default()).unwrap();
        assert!(hunter.find(None, None, None, true).is_err());
    }

    #[test]
    fn test_skips_false_positive_to_real_dtb() {
        let dtb = minimal_dtb();
        let mut data = vec![0u8; 256];

        // Bogus instance first
        data[8..12].copy_from_slice(FDT_MAGIC);
        data[12..16].copy_from_slice(&0xffff_0000u32.to_be_bytes());

        data[128..128 + dtb.len()].copy_from_slice(&dtb);

        let hunter = FdtHunter::new(&data, 0, &HunterOptions::default()).unwrap();
        let result = hunter.find(None, None, None, true).unwrap();
        assert_eq!(result.src_off, 128);
    }
}
