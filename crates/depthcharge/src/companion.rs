//! Host-side client for the Depthcharge companion device.
//!
//! The companion is a microcontroller acting as a peripheral (currently an
//! I2C target) under host control, used to relay target memory through bus
//! commands. Requests and responses are length-prefixed frames:
//! `[cmd:1][len:1][payload:len<=64]`, with the response echoing the request
//! command byte.

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use crate::{Error, Result};

mod opcode {
    pub const GET_VERSION: u8 = 0x00;
    pub const GET_CAPABILITIES: u8 = 0x01;
    pub const I2C_GET_ADDR: u8 = 0x08;
    pub const I2C_SET_ADDR: u8 = 0x09;
    pub const I2C_GET_SPEED: u8 = 0x0a;
    pub const I2C_SET_SPEED: u8 = 0x0b;
    pub const I2C_GET_SUBADDR_LEN: u8 = 0x0c;
    pub const I2C_SET_SUBADDR_LEN: u8 = 0x0d;
    pub const I2C_GET_MODE_FLAGS: u8 = 0x0e;
    pub const I2C_SET_MODE_FLAGS: u8 = 0x0f;
    pub const I2C_SET_READ_BUFFER: u8 = 0x10;
    pub const I2C_GET_WRITE_BUFFER: u8 = 0x11;
}

const MAX_PAYLOAD: usize = 64;
const MAX_I2C_BUFFER: usize = 32;
const STATUS_OK: &[u8] = &[0x00];

/// Companion firmware version: major.minor.patch, with an optional extra
/// (pre-release) field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub extra: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.extra != 0 {
            write!(f, "-{:02}", self.extra)?;
        }
        Ok(())
    }
}

/// Feature bits reported by the firmware. Immutable once the device is
/// opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub i2c_periph: bool,
    pub spi_periph: bool,
}

/// Companion construction parameters.
#[derive(Clone, Debug)]
pub struct CompanionOptions {
    pub baudrate: u32,
    /// I2C bus index the companion is attached to, as used by the target's
    /// `i2c dev [n]` command.
    pub i2c_bus: u32,
    /// I2C address the companion should respond to. 0x78 is a reserved
    /// address unlikely to collide with real peripherals.
    pub i2c_addr: u8,
    /// I2C bus speed, in Hz.
    pub i2c_speed: u32,
}

impl Default for CompanionOptions {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            i2c_bus: 0,
            i2c_addr: 0x78,
            i2c_speed: 100_000,
        }
    }
}

/// Handle to a device running the companion firmware.
pub struct Companion {
    port: Box<dyn SerialPort>,
    version: FirmwareVersion,
    capabilities: Capabilities,
    i2c_bus: u32,
    i2c_addr: u8,
    i2c_speed: u32,
}

impl Companion {
    /// Open the companion device and configure its I2C peripheral role.
    pub fn open(device: &str, opts: &CompanionOptions) -> Result<Self> {
        if opts.i2c_addr > 0x7f {
            return Err(Error::InvalidArgument(format!(
                "Invalid I2C address: 0x{:02x}",
                opts.i2c_addr
            )));
        }

        if opts.i2c_speed == 0 {
            return Err(Error::InvalidArgument("Invalid I2C speed: 0".to_string()));
        }

        let port = serialport::new(device, opts.baudrate)
            .timeout(Duration::from_millis(500))
            .open()?;

        let mut companion = Self {
            port,
            version: FirmwareVersion {
                major: 0,
                minor: 0,
                patch: 0,
                extra: 0,
            },
            capabilities: Capabilities::default(),
            i2c_bus: opts.i2c_bus,
            i2c_addr: opts.i2c_addr,
            i2c_speed: opts.i2c_speed,
        };

        companion.version = companion.read_version()?;
        companion.capabilities = companion.read_capabilities()?;

        info!(
            "Opened Companion @ {device}: Firmware Version {}. i2c_periph: {}, spi_periph: {}",
            companion.version, companion.capabilities.i2c_periph, companion.capabilities.spi_periph,
        );

        if companion.capabilities.i2c_periph {
            companion.set_i2c_addr(opts.i2c_addr)?;
            companion.set_i2c_speed(opts.i2c_speed)?;
        }

        Ok(companion)
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn require_i2c(&self) -> Result<()> {
        if !self.capabilities.i2c_periph {
            return Err(Error::Protocol(
                "This firmware does not implement I2C peripheral functionality".to_string(),
            ));
        }
        Ok(())
    }

    fn read_version(&mut self) -> Result<FirmwareVersion> {
        let resp = self.send_cmd(opcode::GET_VERSION, &[], Some(4..=4), None)?;
        Ok(FirmwareVersion {
            major: resp[0],
            minor: resp[1],
            patch: resp[2],
            extra: resp[3],
        })
    }

    fn read_capabilities(&mut self) -> Result<Capabilities> {
        let resp = self.send_cmd(opcode::GET_CAPABILITIES, &[], Some(4..=4), None)?;
        let bits = u32::from_le_bytes(resp[..4].try_into().unwrap());
        Ok(Capabilities {
            i2c_periph: bits & (1 << 0) != 0,
            spi_periph: bits & (1 << 1) != 0,
        })
    }

    /// I2C bus index the companion is associated with.
    pub fn i2c_bus(&self) -> u32 {
        self.i2c_bus
    }

    /// Cached I2C address the companion responds to.
    pub fn i2c_addr(&self) -> u8 {
        self.i2c_addr
    }

    /// Read the I2C address back from the device.
    pub fn read_i2c_addr(&mut self) -> Result<u8> {
        self.require_i2c()?;
        let resp = self.send_cmd(opcode::I2C_GET_ADDR, &[], Some(1..=1), None)?;
        self.i2c_addr = resp[0];
        Ok(self.i2c_addr)
    }

    /// Configure the I2C address the companion responds to (0x00 - 0x7f).
    pub fn set_i2c_addr(&mut self, addr: u8) -> Result<()> {
        self.require_i2c()?;
        if addr > 0x7f {
            return Err(Error::InvalidArgument(format!(
                "Invalid address: 0x{addr:02x}"
            )));
        }

        info!("Setting Companion I2C device address to 0x{addr:02x}");
        self.send_cmd(opcode::I2C_SET_ADDR, &[addr], Some(1..=1), Some(STATUS_OK))?;
        self.i2c_addr = addr;
        Ok(())
    }

    /// Cached I2C bus clock rate, in Hz.
    pub fn i2c_speed(&self) -> u32 {
        self.i2c_speed
    }

    /// Read the bus clock rate back from the device.
    pub fn read_i2c_speed(&mut self) -> Result<u32> {
        self.require_i2c()?;
        let resp = self.send_cmd(opcode::I2C_GET_SPEED, &[], Some(4..=4), None)?;
        self.i2c_speed = u32::from_le_bytes(resp[..4].try_into().unwrap());
        Ok(self.i2c_speed)
    }

    /// Configure the I2C bus clock rate, in Hz.
    pub fn set_i2c_speed(&mut self, speed: u32) -> Result<()> {
        self.require_i2c()?;
        if speed == 0 {
            return Err(Error::InvalidArgument(
                "Speed outside of supported range: 0 Hz".to_string(),
            ));
        }

        info!("Setting Companion I2C bus speed to {speed} Hz");
        self.send_cmd(
            opcode::I2C_SET_SPEED,
            &speed.to_le_bytes(),
            Some(1..=1),
            Some(STATUS_OK),
        )?;
        self.i2c_speed = speed;
        Ok(())
    }

    /// Read the configured subaddress length.
    pub fn i2c_subaddr_len(&mut self) -> Result<u8> {
        self.require_i2c()?;
        let resp = self.send_cmd(opcode::I2C_GET_SUBADDR_LEN, &[], Some(1..=1), None)?;
        Ok(resp[0])
    }

    pub fn set_i2c_subaddr_len(&mut self, len: u8) -> Result<()> {
        self.require_i2c()?;
        self.send_cmd(
            opcode::I2C_SET_SUBADDR_LEN,
            &[len],
            Some(1..=1),
            Some(STATUS_OK),
        )?;
        Ok(())
    }

    /// Read the firmware's I2C mode flags.
    pub fn i2c_mode_flags(&mut self) -> Result<u32> {
        self.require_i2c()?;
        let resp = self.send_cmd(opcode::I2C_GET_MODE_FLAGS, &[], Some(4..=4), None)?;
        Ok(u32::from_le_bytes(resp[..4].try_into().unwrap()))
    }

    pub fn set_i2c_mode_flags(&mut self, flags: u32) -> Result<()> {
        self.require_i2c()?;
        self.send_cmd(
            opcode::I2C_SET_MODE_FLAGS,
            &flags.to_le_bytes(),
            Some(1..=1),
            Some(STATUS_OK),
        )?;
        Ok(())
    }

    /// Retrieve the I2C write buffer: data the target SoC wrote to our
    /// peripheral, i.e. memory relayed out of the target.
    ///
    /// Firmware is free to share one buffer for reads and writes; don't
    /// assume this returns what [`Self::set_i2c_read_buffer`] stored.
    pub fn i2c_write_buffer(&mut self) -> Result<Vec<u8>> {
        self.require_i2c()?;
        self.send_cmd(
            opcode::I2C_GET_WRITE_BUFFER,
            &[],
            Some(0..=MAX_I2C_BUFFER),
            None,
        )
    }

    /// Stage the I2C read buffer: data the target SoC will read from our
    /// peripheral into its memory space.
    pub fn set_i2c_read_buffer(&mut self, data: &[u8]) -> Result<()> {
        self.require_i2c()?;
        if data.len() > MAX_I2C_BUFFER {
            return Err(Error::InvalidArgument(format!(
                "I2C data buffer exceeds maximum size of {MAX_I2C_BUFFER} bytes"
            )));
        }

        self.send_cmd(opcode::I2C_SET_READ_BUFFER, data, Some(1..=1), Some(STATUS_OK))?;
        Ok(())
    }

    /// Send a raw command frame and return the response payload, optionally
    /// validating its size range and contents.
    pub fn send_cmd(
        &mut self,
        cmd: u8,
        data: &[u8],
        expected_size: Option<std::ops::RangeInclusive<usize>>,
        expected_resp: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if data.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "cmd 0x{cmd:02x} / Data payload is too large"
            )));
        }

        let mut request = Vec::with_capacity(2 + data.len());
        request.push(cmd);
        request.push(data.len() as u8);
        request.extend_from_slice(data);

        debug!("Companion request: cmd=0x{cmd:02x}, len={}", data.len());
        self.port.write_all(&request)?;

        let mut header = [0u8; 2];
        self.port.read_exact(&mut header)?;

        if header[0] != cmd {
            return Err(Error::Protocol(format!(
                "Sent cmd=0x{cmd:02x}, got response for cmd=0x{:02x}",
                header[0]
            )));
        }

        let size = header[1] as usize;
        if size > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "cmd 0x{cmd:02x} / Received bogus payload size from device: 0x{size:02x}"
            )));
        }

        if let Some(range) = &expected_size {
            if !range.contains(&size) {
                return Err(Error::Protocol(format!(
                    "cmd 0x{cmd:02x} / Expected {} to {} byte response, got {size}-byte payload",
                    range.start(),
                    range.end()
                )));
            }
        }

        let mut payload = vec![0u8; size];
        self.port.read_exact(&mut payload)?;

        if let Some(expected) = expected_resp {
            if expected != payload {
                return Err(Error::Protocol(format!(
                    "cmd 0x{cmd:02x} / Expected response = {expected:02x?}, got {payload:02x?}"
                )));
            }
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_version_display() {
        let released = FirmwareVersion {
            major: 1,
            minor: 2,
            patch: 3,
            extra: 0,
        };
        assert_eq!(released.to_string(), "1.2.3");

        let pre = FirmwareVersion {
            major: 0,
            minor: 1,
            patch: 0,
            extra: 7,
        };
        assert_eq!(pre.to_string(), "0.1.0-07");
    }
}
