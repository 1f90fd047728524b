//! Crash-and-recover register reads.
//!
//! Each variant issues one console command that dereferences the configured
//! crash address, captures the register dump U-Boot prints during the data
//! abort, re-synchronizes with the console, and extracts the requested
//! register. The platform must reset and re-enter the console on its own;
//! callers opt in via `allow_reboot`.

use depthcharge_arch::Register;

use crate::memory::data_abort::DataAbortParams;
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::register::reader::RegisterReader;
use crate::target::Target;
use crate::{Error, Result};

static MD_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["md"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static MM_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["mm"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static MW_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["mw"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static NM_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["nm"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static CRC32_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["crc32"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static CP_REQ: Requirements = Requirements {
    arch: &["ARM"],
    commands: &[&["cp"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static FDT_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["fdt"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static ITEST_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["itest"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

static SETEXPR_REQ: Requirements = Requirements {
    arch: &["ARM", "AARCH64"],
    commands: &[&["setexpr"]],
    crash_or_reboot: true,
    ..Requirements::NONE
};

/// One crash-inducing register reader variant: the family differs only in
/// which console command triggers the abort and how desirable it is.
pub struct CrashRegisterReader {
    name: &'static str,
    required: &'static Requirements,
    rank: u8,
    resolved: Resolved,
    crash_addr: u64,
    command: fn(u64) -> String,
}

impl CrashRegisterReader {
    fn create(
        target: &Target,
        name: &'static str,
        required: &'static Requirements,
        rank: u8,
        command: fn(u64) -> String,
    ) -> Result<Self> {
        let resolved = check_requirements(name, required, target)?;
        let crash_addr = DataAbortParams::crash_addr_only(name, target)?;

        Ok(Self {
            name,
            required,
            rank,
            resolved,
            crash_addr,
            command,
        })
    }

    /// Triggers the abort with `md.l`. Preferred: read-only side effects.
    pub fn md(target: &Target) -> Result<Self> {
        Self::create(target, "MdCrashRegisterReader", &MD_REQ, 21, |addr| {
            format!("md.l {addr:x} 1")
        })
    }

    pub fn mm(target: &Target) -> Result<Self> {
        Self::create(target, "MmCrashRegisterReader", &MM_REQ, 20, |addr| {
            format!("mm.l {addr:x}")
        })
    }

    pub fn mw(target: &Target) -> Result<Self> {
        Self::create(target, "MwCrashRegisterReader", &MW_REQ, 20, |addr| {
            format!("mw.l {addr:x} 0")
        })
    }

    pub fn nm(target: &Target) -> Result<Self> {
        Self::create(target, "NmCrashRegisterReader", &NM_REQ, 20, |addr| {
            format!("nm.l {addr:x}")
        })
    }

    pub fn crc32(target: &Target) -> Result<Self> {
        Self::create(target, "CRC32CrashRegisterReader", &CRC32_REQ, 20, |addr| {
            format!("crc32 {addr:x} 0 {addr:x}")
        })
    }

    pub fn cp(target: &Target) -> Result<Self> {
        Self::create(target, "CpCrashRegisterReader", &CP_REQ, 10, |addr| {
            format!("cp.l {addr:x} {addr:x} 1")
        })
    }

    /// Seems to taint quite a bit of register state.
    pub fn fdt(target: &Target) -> Result<Self> {
        Self::create(target, "FDTCrashRegisterReader", &FDT_REQ, 15, |addr| {
            format!("fdt addr {addr:x}")
        })
    }

    pub fn itest(target: &Target) -> Result<Self> {
        Self::create(target, "ItestCrashRegisterReader", &ITEST_REQ, 20, |addr| {
            format!("itest.l *{addr:x} == 0")
        })
    }

    pub fn setexpr(target: &Target) -> Result<Self> {
        Self::create(
            target,
            "SetexprCrashRegisterReader",
            &SETEXPR_REQ,
            20,
            |addr| format!("setexpr.l _ *{addr:x}"),
        )
    }
}

impl Operation for CrashRegisterReader {
    fn name(&self) -> &'static str {
        self.name
    }

    fn required(&self) -> &'static Requirements {
        self.required
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        // Rebooting the platform isn't ideal, but beats requiring a write
        // operation
        self.rank
    }
}

impl RegisterReader for CrashRegisterReader {
    fn read_register(&mut self, target: &mut Target, reg: &'static Register) -> Result<u64> {
        let da_text = target.send_command(&(self.command)(self.crash_addr))?;

        target.recover_after_reboot()?;

        let da = target.arch.parse_data_abort(&da_text)?;
        da.registers.get(reg.name).copied().ok_or_else(|| {
            Error::OperationFailed(format!(
                "Register {} not present in data abort dump",
                reg.name
            ))
        })
    }
}
