//! Crash-and-recover memory reads.
//!
//! These readers extract memory contents from the register dump U-Boot
//! prints when a command dereferences an unmapped "crash address": the
//! value loaded from the read location lands in a known register before the
//! abort. Each word read costs a full reset, so these rank as last resorts.

use std::env;

use crate::memory::reader::MemoryWordReader;
use crate::operation::{Operation, Resolved};
use crate::strutil::parse_int;
use crate::target::Target;
use crate::{Error, Result};

/// Crash parameters shared by the data-abort readers: the address whose
/// dereference faults, and the register holding the data of interest
/// afterwards.
///
/// Both default to architecture-specific values, overridable by the
/// `DEPTHCHARGE_DA_ADDR` and `DEPTHCHARGE_DA_DATA_REG` environment
/// variables.
#[derive(Clone, Debug)]
pub(crate) struct DataAbortParams {
    pub crash_addr: u64,
    pub data_reg: &'static str,
}

impl DataAbortParams {
    pub(crate) fn new(op: &str, target: &Target) -> Result<Self> {
        let crash_addr = match env::var("DEPTHCHARGE_DA_ADDR") {
            Ok(value) => parse_int(&value)?,
            Err(_) => target.arch.data_abort_address.ok_or_else(|| {
                Error::not_supported(
                    op,
                    format!(
                        "No data abort address is defined for {}",
                        target.arch.description
                    ),
                )
            })?,
        };

        let data_reg = match env::var("DEPTHCHARGE_DA_DATA_REG") {
            Ok(name) => target.arch.register(&name)?.name,
            Err(_) => target.arch.data_abort_data_reg().ok_or_else(|| {
                Error::not_supported(
                    op,
                    format!(
                        "No data abort register target is defined for {}",
                        target.arch.description
                    ),
                )
            })?,
        };

        Ok(Self {
            crash_addr,
            data_reg,
        })
    }

    /// Crash-address-only variant, for register readers that parse the full
    /// dump rather than one data register.
    pub(crate) fn crash_addr_only(op: &str, target: &Target) -> Result<u64> {
        match env::var("DEPTHCHARGE_DA_ADDR") {
            Ok(value) => parse_int(&value),
            Err(_) => target.arch.data_abort_address.ok_or_else(|| {
                Error::not_supported(
                    op,
                    format!(
                        "No data abort address is defined for {}",
                        target.arch.description
                    ),
                )
            }),
        }
    }
}

/// Common word-read flow for data-abort readers: trigger the crash with the
/// implementation's command, re-synchronize with the console, then parse
/// the data register out of the abort text.
pub(crate) fn data_abort_read_word(
    target: &mut Target,
    params: &DataAbortParams,
    trigger_cmd: &str,
    size: usize,
) -> Result<Vec<u8>> {
    let da_text = target.send_command(trigger_cmd)?;

    target.recover_after_reboot()?;

    let da = target.arch.parse_data_abort(&da_text)?;
    let value = da.registers.get(params.data_reg).copied().ok_or_else(|| {
        Error::OperationFailed(format!(
            "Register {} not present in data abort dump",
            params.data_reg
        ))
    })?;

    let mut data = value.to_le_bytes().to_vec();
    data.truncate(size.min(target.arch.word_size));
    Ok(data)
}

/// Commands executed before each crash-inducing word read, e.g. to restore
/// state the reset destroys.
#[derive(Clone, Debug, Default)]
pub struct DataAbortReadOptions {
    pub pre_commands: Vec<String>,
}

/// Crashes the platform by copying a word from the read location to the
/// crash address; the loaded value is recovered from the register dump.
/// One reset per word. ARM family only.
pub struct CpCrashMemoryReader {
    resolved: Resolved,
    params: DataAbortParams,
    pre_commands: Vec<String>,
}

impl CpCrashMemoryReader {
    pub const REQUIRED: crate::operation::Requirements = crate::operation::Requirements {
        arch: &["ARM", "AARCH64"],
        commands: &[&["cp"]],
        crash_or_reboot: true,
        ..crate::operation::Requirements::NONE
    };

    pub fn new(target: &Target, opts: &DataAbortReadOptions) -> Result<Self> {
        let resolved =
            crate::operation::check_requirements("CpCrashMemoryReader", &Self::REQUIRED, target)?;
        Ok(Self {
            resolved,
            params: DataAbortParams::new("CpCrashMemoryReader", target)?,
            pre_commands: opts.pre_commands.clone(),
        })
    }
}

impl Operation for CpCrashMemoryReader {
    fn name(&self) -> &'static str {
        "CpCrashMemoryReader"
    }

    fn required(&self) -> &'static crate::operation::Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &crate::operation::RankHints) -> u8 {
        3
    }
}

impl MemoryWordReader for CpCrashMemoryReader {
    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>> {
        for cmd in &self.pre_commands.clone() {
            target.send_command(cmd)?;
        }

        let mode = if target.arch.supports_64bit_data { 'q' } else { 'l' };
        let cmd = format!("cp.{mode} {addr:x} {:x} 1", self.params.crash_addr);
        data_abort_read_word(target, &self.params, &cmd, size)
    }
}
