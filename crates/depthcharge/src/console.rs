//! Serial console interaction with a U-Boot target.

use std::env;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serialport::SerialPort;
use tracing::{debug, info};

use crate::strutil::{self, KeyVal};
use crate::{Error, Result};

/// Marker U-Boot echoes when input interrupts an operation.
const INTERRUPT_IND: &str = "<INTERRUPT>";

/// Consecutive identical prompt lines required during prompt discovery.
const PROMPT_DISCOVERY_COUNT: usize = 10;

/// Console construction parameters beyond the device string.
#[derive(Clone, Debug)]
pub struct ConsoleOptions {
    pub baudrate: u32,
    /// Per-poll read timeout. Lowering it speeds up console-based dumps but
    /// risks truncating slow responses. Overridden by the
    /// `DEPTHCHARGE_CONSOLE_TIMEOUT` environment variable.
    pub timeout: Duration,
    /// Minimum delay between successive transmitted bytes, for targets whose
    /// UART FIFOs drop characters. Overridden by
    /// `DEPTHCHARGE_CONSOLE_INTRACHAR`.
    pub intrachar: Option<Duration>,
    /// Expected prompt, if already known. Discovered otherwise.
    pub prompt: Option<String>,
    /// If a discovered prompt matches this pattern, the target is in the
    /// wrong OS (e.g. a Linux shell); issue `reboot_cmd` and keep trying.
    pub reboot_re: Option<String>,
    pub reboot_cmd: String,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            baudrate: 115_200,
            timeout: Duration::from_millis(150),
            intrachar: None,
            prompt: None,
            reboot_re: None,
            reboot_cmd: "reboot || shutdown -r now".to_string(),
        }
    }
}

/// A line-oriented serial console attached to a U-Boot target.
///
/// Character data is treated as Latin-1; normalized reads map `\r\n` to
/// `\n` while raw reads preserve bytes verbatim.
pub struct Console {
    port: Option<Box<dyn SerialPort>>,
    device: String,
    baudrate: u32,
    timeout: Duration,
    intrachar: Option<Duration>,
    pub prompt: Option<String>,
    reboot_re: Option<Regex>,
    reboot_cmd: String,
}

fn env_duration(name: &str) -> Option<Duration> {
    let value: f64 = env::var(name).ok()?.parse().ok()?;
    Some(Duration::from_secs_f64(value))
}

impl Console {
    /// Open a console. The `device` string may carry the baudrate and extra
    /// settings: `/dev/ttyUSB0:115200`.
    pub fn open(device: &str, mut opts: ConsoleOptions) -> Result<Self> {
        let (device, keyvals) = strutil::str_to_property_keyval(device)?;

        for (key, value) in &keyvals {
            match (key.as_str(), value) {
                // Bare integer: the baudrate, for convenience
                (_, KeyVal::Flag) => {
                    if let Ok(baud) = key.parse() {
                        opts.baudrate = baud;
                    }
                }
                ("baudrate", KeyVal::Int(baud)) => opts.baudrate = *baud as u32,
                ("timeout", KeyVal::Int(secs)) => opts.timeout = Duration::from_secs(*secs),
                ("timeout", KeyVal::Text(secs)) => {
                    opts.timeout = Duration::from_secs_f64(secs.parse().map_err(|_| {
                        Error::InvalidArgument(format!("Invalid timeout: {secs}"))
                    })?);
                }
                ("intrachar", KeyVal::Text(secs)) => {
                    opts.intrachar = Some(Duration::from_secs_f64(secs.parse().map_err(
                        |_| Error::InvalidArgument(format!("Invalid intrachar: {secs}")),
                    )?));
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "Unrecognized console setting: {key}"
                    )));
                }
            }
        }

        if let Some(timeout) = env_duration("DEPTHCHARGE_CONSOLE_TIMEOUT") {
            opts.timeout = timeout;
        }
        if let Some(intrachar) = env_duration("DEPTHCHARGE_CONSOLE_INTRACHAR") {
            opts.intrachar = Some(intrachar);
        }

        let reboot_re = match &opts.reboot_re {
            None => None,
            Some(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| Error::InvalidArgument(format!("Invalid reboot regex: {e}")))?;
                info!(
                    "Using reboot match trigger: {pattern}; will use command: {}",
                    opts.reboot_cmd
                );
                Some(re)
            }
        };

        let port = serialport::new(&device, opts.baudrate)
            .timeout(opts.timeout)
            .open()?;

        Ok(Self {
            port: Some(port),
            device,
            baudrate: opts.baudrate,
            timeout: opts.timeout,
            intrachar: opts.intrachar,
            prompt: opts.prompt,
            reboot_re,
            reboot_cmd: opts.reboot_cmd,
        })
    }

    /// Device path used to communicate with the target.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Protocol("Console is closed".to_string()))
    }

    /// Send `cmd` to the console. With `read_response`, the echoed input and
    /// trailing prompt are stripped from the returned response. Callers not
    /// using the response should still read it to drain the buffers.
    pub fn send_command(&mut self, cmd: &str, read_response: bool) -> Result<Option<String>> {
        let mut line = cmd.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        self.write_str(&line)?;
        self.port()?.flush()?;

        if !read_response {
            return Ok(None);
        }

        let mut resp = self.read()?;
        resp = strip_echoed_input(&line, &resp);

        if let Some(prompt) = &self.prompt {
            if let Some(stripped) = resp.strip_suffix(prompt.as_str()) {
                resp = stripped.to_string();
            }
        }

        Ok(Some(resp))
    }

    /// Read one Latin-1 line (through `\n`), or whatever arrives before the
    /// read timeout.
    pub fn readline(&mut self) -> Result<String> {
        let port = self.port()?;
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    bytes.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(latin1(&bytes))
    }

    /// Read all pending data, normalized (`\r\n` becomes `\n`).
    pub fn read(&mut self) -> Result<String> {
        let raw = self.read_raw()?;
        Ok(latin1(&raw).replace("\r\n", "\n"))
    }

    /// Read all pending data verbatim. Reads continue until the underlying
    /// port reports no further data within the configured timeout.
    pub fn read_raw(&mut self) -> Result<Vec<u8>> {
        let port = self.port()?;
        let mut ret = Vec::new();
        let mut buf = [0u8; 64];

        loop {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => ret.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ret)
    }

    /// Write a Latin-1 string to the console.
    pub fn write_str(&mut self, data: &str) -> Result<()> {
        let bytes: Vec<u8> = data.chars().map(|c| c as u8).collect();
        self.write_raw(&bytes)
    }

    /// Write raw bytes, honoring any configured intra-character delay.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let intrachar = self.intrachar;
        let port = self.port()?;

        match intrachar {
            None => port.write_all(data)?,
            Some(delay) => {
                for &byte in data {
                    // Even a zero delay incurs the per-byte write + flush
                    // overhead, which is the point for FIFO-limited targets.
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    port.write_all(&[byte])?;
                    port.flush()?;
                }
            }
        }

        Ok(())
    }

    /// Attempt to interrupt U-Boot and land at a console prompt, sending
    /// `interrupt_str` (Ctrl-C by default elsewhere) until a line ending in
    /// the prompt is observed or the wall-clock budget expires.
    ///
    /// Note that within the autoboot grace period a configured "stop string"
    /// may be required instead (`CONFIG_AUTOBOOT_KEYED`,
    /// `CONFIG_AUTOBOOT_STOP_STR`).
    pub fn interrupt(&mut self, interrupt_str: &str, timeout: Duration) -> Result<String> {
        self.port()?.flush()?;

        let prompt = match &self.prompt {
            Some(p) if !p.is_empty() => p.clone(),
            _ => {
                info!("No user-specified prompt provided. Attempting to determine this.");
                return self.discover_prompt(interrupt_str, timeout, PROMPT_DISCOVERY_COUNT);
            }
        };

        let mut ret = String::new();
        let start = Instant::now();

        while start.elapsed() < timeout {
            self.write_str(interrupt_str)?;
            self.port()?.flush()?;

            let response = self.read()?;
            ret.push_str(&response);
            if response.ends_with(&prompt) {
                return Ok(ret);
            }
        }

        Err(Error::Timeout(
            "return to U-Boot console prompt".to_string(),
        ))
    }

    /// Deduce the U-Boot prompt by interrupting repeatedly until `count`
    /// consecutive identical single-line responses are observed.
    pub fn discover_prompt(
        &mut self,
        interrupt_str: &str,
        timeout: Duration,
        count: usize,
    ) -> Result<String> {
        let start = Instant::now();

        let mut ret = String::new();
        let mut candidate = String::new();
        let mut candidate_count = 0usize;

        while start.elapsed() < timeout {
            self.write_str(interrupt_str)?;
            self.port()?.flush()?;

            let response = self.read()?.replace(INTERRUPT_IND, "");
            ret.push_str(&response);

            // The same line must repeat with no other output in between
            let lines: Vec<&str> = response.trim_start().lines().collect();
            let [line] = lines.as_slice() else {
                candidate.clear();
                candidate_count = 0;
                continue;
            };

            if candidate.is_empty() || candidate == *line {
                candidate = (*line).to_string();
                candidate_count += 1;

                if candidate_count >= count {
                    // A prompt indicative of a state we don't want to be in
                    // (e.g. a Linux shell)? Attempt to reboot out of it.
                    let trimmed = line.trim();
                    if self.reboot_re.as_ref().is_some_and(|re| re.is_match(trimmed)) {
                        info!("Attempting reboot. Matched reboot regex: {trimmed}");
                        candidate.clear();
                        candidate_count = 0;

                        let cmd = format!("{}\n", self.reboot_cmd);
                        self.write_str(&cmd)?;
                        self.port()?.flush()?;
                        continue;
                    }

                    info!("Identified prompt: {line}");
                    self.prompt = Some((*line).to_string());
                    return Ok(ret);
                }
            } else {
                candidate.clear();
                candidate_count = 0;
            }
        }

        Err(Error::Timeout(
            "identify U-Boot console prompt".to_string(),
        ))
    }

    /// Close the serial connection, e.g. to hand the device to an external
    /// file-transfer program. Only [`Self::reopen`] may be used afterwards.
    pub fn close(&mut self) {
        self.port = None;
    }

    /// Re-open a closed console with its original settings.
    pub fn reopen(&mut self) -> Result<()> {
        if self.port.is_none() {
            debug!("Reopening console @ {}", self.device);
            let port = serialport::new(&self.device, self.baudrate)
                .timeout(self.timeout)
                .open()?;
            self.port = Some(port);
        }
        Ok(())
    }
}

/// Decode Latin-1 bytes: every byte maps to the code point of equal value.
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Remove echoed input from data read back from the console.
pub fn strip_echoed_input(input: &str, output: &str) -> String {
    let input = input.trim_end();
    match output.strip_prefix(input) {
        Some(rest) => rest.trim_start().to_string(),
        None => output.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_echoed_input() {
        let out = strip_echoed_input("md.l 82000000 4\n", "md.l 82000000 4\r\n82000000: aa\n");
        assert_eq!(out, "82000000: aa\n");

        // Unechoed output is left untouched
        let out = strip_echoed_input("printenv\n", "bootdelay=2\n");
        assert_eq!(out, "bootdelay=2\n");
    }

    #[test]
    fn test_latin1() {
        assert_eq!(latin1(b"abc\xff"), "abc\u{ff}");
        // Round-trips back to the same bytes
        let bytes: Vec<u8> = latin1(b"\x00\x7f\x80\xfe").chars().map(|c| c as u8).collect();
        assert_eq!(bytes, b"\x00\x7f\x80\xfe");
    }
}
