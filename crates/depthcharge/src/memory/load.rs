//! Large-payload memory writers built on U-Boot's serial file transfer
//! commands (`loadb`, `loadx`, `loady`) and their host-side counterparts
//! from the age of modems.
//!
//! Each issues the matching console command, hands the serial device to an
//! external transfer program, then reopens the console and interrupts back
//! to the prompt.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use crate::memory::writer::{MemoryWriter, WriteOptions};
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::target::Target;
use crate::{Error, Result};

fn load_rank(hints: &RankHints) -> u8 {
    // Transfer setup overhead is not worthwhile for small payloads
    match hints.data_len.unwrap_or(0) {
        0..=256 => 35,
        257..=1024 => 55,
        1025..=4095 => 75,
        4096..=16384 => 85,
        _ => 95,
    }
}

/// Issue the load command, release the serial port to `run`, then restore
/// the console no matter how the transfer went.
fn transfer(
    target: &mut Target,
    cmd: &str,
    addr: u64,
    run: impl FnOnce(&str, u32) -> Result<()>,
) -> Result<()> {
    target.send_command_checked(&format!("{cmd} 0x{addr:08x}"))?;

    let device = target.console.device().to_string();
    let baudrate = target.console.baudrate();

    target.console.close();
    let result = run(&device, baudrate);

    // Even on failure, try to return to a known state
    target.console.reopen()?;
    target.interrupt()?;

    result
}

fn check_status(program: &str, status: std::process::ExitStatus) -> Result<()> {
    if !status.success() {
        return Err(Error::OperationFailed(format!(
            "{program} failed with status {}",
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}

fn write_via_tempfile<W: MemoryWriter + ?Sized>(
    writer: &mut W,
    target: &mut Target,
    addr: u64,
    data: &[u8],
    opts: &WriteOptions,
) -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(data)?;
    file.flush()?;
    writer.write_from_file(target, addr, file.path(), opts)
}

/// Kermit-protocol writer for the `loadb` command, using the host `ckermit`
/// program.
pub struct LoadbMemoryWriter {
    resolved: Resolved,
}

impl LoadbMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["loadb"]],
        host_programs: &["ckermit"],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("LoadbMemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for LoadbMemoryWriter {
    fn name(&self) -> &'static str {
        "LoadbMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        // kermit is a bit slower than the alternatives
        load_rank(hints).saturating_sub(10)
    }
}

impl MemoryWriter for LoadbMemoryWriter {
    fn write_impl(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::OperationFailed(
            "LoadbMemoryWriter transfers whole files".to_string(),
        ))
    }

    fn write(
        &mut self,
        target: &mut Target,
        addr: u64,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<()> {
        write_via_tempfile(self, target, addr, data, opts)
    }

    fn write_from_file(
        &mut self,
        target: &mut Target,
        addr: u64,
        path: &Path,
        _opts: &WriteOptions,
    ) -> Result<()> {
        let kermit = self.resolved.host_programs["ckermit"].clone();
        let path = path.to_path_buf();

        transfer(target, "loadb", addr, move |device, baudrate| {
            let status = Command::new(&kermit)
                .arg("-i")
                .args(["-l", device])
                .args(["-b", &baudrate.to_string()])
                .args(["-m", "none"])
                .args(["-C", "set carrier-watch off,set prefixing all"])
                .arg("-s")
                .arg(&path)
                .status()?;
            check_status("ckermit", status)
        })
    }
}

/// Run an XMODEM/YMODEM-style sender with the serial device as its stdio.
fn run_modem_transfer(program: &Path, device: &str, file: &Path) -> Result<()> {
    let port_in = OpenOptions::new().read(true).write(true).open(device)?;
    let port_out = port_in.try_clone()?;

    let status = Command::new(program)
        .arg(file)
        .stdin(port_in)
        .stdout(port_out)
        .status()?;
    check_status(&program.display().to_string(), status)
}

/// XMODEM writer for the `loadx` command, using the host `sx` program.
pub struct LoadxMemoryWriter {
    resolved: Resolved,
}

impl LoadxMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["loadx"]],
        host_programs: &["sx"],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("LoadxMemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for LoadxMemoryWriter {
    fn name(&self) -> &'static str {
        "LoadxMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        load_rank(hints)
    }
}

impl MemoryWriter for LoadxMemoryWriter {
    fn write_impl(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::OperationFailed(
            "LoadxMemoryWriter transfers whole files".to_string(),
        ))
    }

    fn write(
        &mut self,
        target: &mut Target,
        addr: u64,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<()> {
        write_via_tempfile(self, target, addr, data, opts)
    }

    fn write_from_file(
        &mut self,
        target: &mut Target,
        addr: u64,
        path: &Path,
        _opts: &WriteOptions,
    ) -> Result<()> {
        let sx = self.resolved.host_programs["sx"].clone();
        let path = path.to_path_buf();

        transfer(target, "loadx", addr, move |device, _baudrate| {
            run_modem_transfer(&sx, device, &path)
        })
    }
}

/// YMODEM writer for the `loady` command, using the host `sb` program.
pub struct LoadyMemoryWriter {
    resolved: Resolved,
}

impl LoadyMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["loady"]],
        host_programs: &["sb"],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("LoadyMemoryWriter", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for LoadyMemoryWriter {
    fn name(&self) -> &'static str {
        "LoadyMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, hints: &RankHints) -> u8 {
        load_rank(hints)
    }
}

impl MemoryWriter for LoadyMemoryWriter {
    fn write_impl(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::OperationFailed(
            "LoadyMemoryWriter transfers whole files".to_string(),
        ))
    }

    fn write(
        &mut self,
        target: &mut Target,
        addr: u64,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<()> {
        write_via_tempfile(self, target, addr, data, opts)
    }

    fn write_from_file(
        &mut self,
        target: &mut Target,
        addr: u64,
        path: &Path,
        _opts: &WriteOptions,
    ) -> Result<()> {
        let sb = self.resolved.host_programs["sb"].clone();
        let path = path.to_path_buf();

        transfer(target, "loady", addr, move |device, _baudrate| {
            run_modem_transfer(&sb, device, &path)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rank_scaling() {
        let rank = |len| {
            load_rank(&RankHints {
                data_len: Some(len),
            })
        };
        assert_eq!(rank(100), 35);
        assert_eq!(rank(2048), 75);
        assert_eq!(rank(1 << 20), 95);

        // Larger payloads make these the preferred writers
        assert!(rank(1 << 20) > rank(128));
    }
}
