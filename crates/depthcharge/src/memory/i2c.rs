//! Memory access relayed through a companion device on the target's I2C
//! bus.
//!
//! A read is achieved with `i2c write`: U-Boot writes memory contents out
//! to our fake peripheral, which hands them back to the host. A write is
//! the reverse: the companion serves prepared bytes that `i2c read` copies
//! into target memory.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error};

use crate::memory::reader::{DataSink, MemoryReader};
use crate::memory::writer::MemoryWriter;
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::target::Target;
use crate::{Error, Result};

// The companion firmware caps transactions at its 32-byte buffers, and one
// byte is lost to the bus stop/NACK timing on reads.
const READ_CHUNK: usize = 31;
const WRITE_CHUNK: usize = 32;

static BUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bus is (?P<busno>[0-9]+)").unwrap());
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=(?P<speed>[0-9]+)").unwrap());

/// Query the target's current I2C (bus, speed) so it can be restored after
/// we are done re-pointing it at the companion.
fn get_i2c_bus_state(target: &mut Target) -> Result<(Option<u32>, Option<u32>)> {
    let resp = target.send_command("i2c dev")?;
    let busno = BUS_RE
        .captures(&resp)
        .and_then(|caps| caps["busno"].parse().ok());
    if busno.is_none() {
        error!("Failed to determine current I2C bus");
        debug!("Device replied with: {resp}");
    }

    let resp = target.send_command("i2c speed")?;
    let speed = SPEED_RE
        .captures(&resp)
        .and_then(|caps| caps["speed"].parse().ok());
    if speed.is_none() {
        error!("Failed to determine current I2C bus speed");
        debug!("Device replied with: {resp}");
    }

    Ok((busno, speed))
}

fn restore_i2c_bus_state(target: &mut Target, state: (Option<u32>, Option<u32>)) -> Result<()> {
    let (busno, speed) = state;

    if let Some(speed) = speed {
        target.send_command_checked(&format!("i2c speed {speed}"))?;
    }
    if let Some(busno) = busno {
        target.send_command_checked(&format!("i2c dev {busno}"))?;
    }

    Ok(())
}

fn validate_response(resp: &str, expected: &str) -> Result<()> {
    let resp = resp.trim();
    if resp != expected {
        if resp.contains("Usage:") {
            return Err(Error::OperationFailed(
                "U-Boot responded to I2C command with usage text. \
                 Does it not support the subcommands in use?"
                    .to_string(),
            ));
        }
        return Err(Error::OperationFailed(format!("Unexpected response:\n{resp}")));
    }
    Ok(())
}

/// Point the target at the companion's bus and speed, verifying the
/// long-stable confirmation strings.
fn select_companion_bus(target: &mut Target) -> Result<()> {
    let (bus, speed) = {
        let companion = target
            .companion
            .as_ref()
            .ok_or_else(|| Error::Protocol("No companion device attached".to_string()))?;
        (companion.i2c_bus(), companion.i2c_speed())
    };

    let resp = target.send_command(&format!("i2c dev {bus}"))?;
    validate_response(&resp, &format!("Setting bus to {bus}"))?;

    let resp = target.send_command(&format!("i2c speed {speed}"))?;
    validate_response(&resp, &format!("Setting bus speed to {speed} Hz"))?;

    Ok(())
}

/// Reads target memory via `i2c write` transactions captured by the
/// companion device.
pub struct I2cMemoryReader {
    resolved: Resolved,
    backup_state: (Option<u32>, Option<u32>),
}

impl I2cMemoryReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["i2c"]],
        companion: true,
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("I2CMemoryReader", &Self::REQUIRED, target)?,
            backup_state: (None, None),
        })
    }
}

impl Operation for I2cMemoryReader {
    fn name(&self) -> &'static str {
        "I2CMemoryReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        // Requires a companion device and is very slow
        2
    }
}

impl MemoryReader for I2cMemoryReader {
    fn setup(&mut self, target: &mut Target, _addr: u64, _size: usize) -> Result<()> {
        self.backup_state = get_i2c_bus_state(target)?;
        select_companion_bus(target)
    }

    fn teardown(&mut self, target: &mut Target) -> Result<()> {
        restore_i2c_bus_state(target, self.backup_state)
    }

    fn read_impl(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()> {
        let i2c_addr = target
            .companion
            .as_ref()
            .ok_or_else(|| Error::Protocol("No companion device attached".to_string()))?
            .i2c_addr();

        let mut addr = addr;
        let mut remaining = size;

        while remaining > 0 {
            target.check_cancel()?;
            let to_read = remaining.min(READ_CHUNK);

            let cmd = format!("i2c write 0x{addr:08x} 0x{i2c_addr:02x} 0 0x{to_read:02x} -s");
            let resp = target.send_command(&cmd)?;
            validate_response(&resp, "")?;

            let data = target
                .companion
                .as_mut()
                .expect("companion checked above")
                .i2c_write_buffer()?;

            // An extra byte can arrive on the bus stop/NACK; truncate to
            // what was asked for
            if data.len() != to_read && data.len() != to_read + 1 {
                return Err(Error::Protocol(format!(
                    "Expected {to_read} bytes of data, got {}",
                    data.len()
                )));
            }
            sink(&data[..to_read])?;

            addr += to_read as u64;
            remaining -= to_read;
        }

        Ok(())
    }
}

/// Writes target memory via `i2c read` transactions served by the
/// companion device.
pub struct I2cMemoryWriter {
    resolved: Resolved,
    backup_state: (Option<u32>, Option<u32>),
}

impl I2cMemoryWriter {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["i2c"]],
        companion: true,
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("I2CMemoryWriter", &Self::REQUIRED, target)?,
            backup_state: (None, None),
        })
    }
}

impl Operation for I2cMemoryWriter {
    fn name(&self) -> &'static str {
        "I2CMemoryWriter"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        2
    }
}

impl MemoryWriter for I2cMemoryWriter {
    fn setup(&mut self, target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        self.backup_state = get_i2c_bus_state(target)?;
        select_companion_bus(target)
    }

    fn teardown(&mut self, target: &mut Target) -> Result<()> {
        restore_i2c_bus_state(target, self.backup_state)
    }

    fn block_size(&self, _target: &Target) -> usize {
        // Dictated by the companion firmware's buffer size
        WRITE_CHUNK
    }

    fn allow_block_size_override(&self) -> bool {
        false
    }

    fn write_impl(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        let i2c_addr = {
            let companion = target
                .companion
                .as_mut()
                .ok_or_else(|| Error::Protocol("No companion device attached".to_string()))?;
            companion.set_i2c_read_buffer(data)?;
            companion.i2c_addr()
        };

        let cmd = format!(
            "i2c read 0x{i2c_addr:02x} 0 0x{:02x} 0x{addr:08x}",
            data.len()
        );
        let resp = target.send_command(&cmd)?;
        validate_response(&resp, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_state_regexes() {
        let caps = BUS_RE.captures("Current bus is 2").unwrap();
        assert_eq!(&caps["busno"], "2");

        let caps = SPEED_RE.captures("Current bus speed=100000").unwrap();
        assert_eq!(&caps["speed"], "100000");
    }

    #[test]
    fn test_validate_response() {
        assert!(validate_response("", "").is_ok());
        assert!(validate_response("Setting bus to 0", "Setting bus to 0").is_ok());
        assert!(validate_response("Usage:\ni2c ...", "").is_err());
        assert!(validate_response("i2c: error", "").is_err());
    }
}
