//! The shared target state operated on by every Operation: console,
//! companion, architecture, and cached snapshots of the device.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use depthcharge_arch::Architecture;
use depthcharge_uboot::env::Environment;

use crate::companion::Companion;
use crate::console::Console;
use crate::payload_map::PayloadMap;
use crate::progress::{Progress, ProgressTracker};
use crate::{Error, Result};

/// Response content indicating a failed console command.
const FAILURE_STRINGS: &[&str] = &[
    "data abort",
    "## Error",
    " ERROR",
    "Unknown command",
    "Usage:",
];

/// Default interrupt byte: Ctrl-C.
pub const DEFAULT_INTERRUPT: &str = "\x03";

/// Wall-clock budget for interrupt attempts.
pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Information about one console command reported by `help`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandInfo {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// One jump table entry, as recorded in device configuration files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JumpTableEntryInfo {
    pub address: u64,
    pub name: String,
    pub return_type: String,
    pub arg_types: Vec<String>,
}

/// The located jump table plus global-data fields found along the way.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JumpTable {
    pub address: u64,
    pub entries: Vec<JumpTableEntryInfo>,
    pub extras: BTreeMap<String, u64>,
}

/// What is known of the target's post-relocation global data structure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalData {
    /// `bdinfo` output, one value per field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bd: Option<BTreeMap<String, serde_json::Value>>,
    /// Address of `gd` itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jt: Option<JumpTable>,
    /// Inspection has been performed (whether or not it succeeded fully).
    #[serde(skip)]
    pub inspected: bool,
}

/// Invoked after each crash-induced reset instead of the default
/// [`Target::interrupt`], so callers can send autoboot "stop strings" or
/// perform any other handshake before catching the prompt.
pub type PostRebootHook = Box<dyn FnMut(&mut Console) -> Result<()> + Send>;

/// Mutable target-interaction core.
///
/// Operations receive `&mut Target` on every call rather than holding a
/// reference to the owning Context; the serial console is a shared, stateful
/// resource and all interaction with it is serialized through here.
pub struct Target {
    pub console: Console,
    pub companion: Option<Companion>,
    pub arch: &'static Architecture,
    /// Console commands reported by `help`.
    pub cmds: BTreeMap<String, CommandInfo>,
    /// Environment variables reported by `printenv`.
    pub env: Environment,
    /// `version` command output lines.
    pub version: Vec<String>,
    pub gd: GlobalData,
    pub payloads: PayloadMap,
    /// Whether crash/reboot-inducing operations were opted into.
    pub allow_reboot: bool,
    /// Whether payload deployment and execution were opted into.
    pub allow_deploy_exec: bool,
    pub(crate) post_reboot: Option<PostRebootHook>,
    pub(crate) progress: ProgressTracker,
    cancel: Arc<AtomicBool>,
}

impl Target {
    pub(crate) fn new(
        console: Console,
        companion: Option<Companion>,
        arch: &'static Architecture,
        payloads: PayloadMap,
    ) -> Self {
        Self {
            console,
            companion,
            arch,
            cmds: BTreeMap::new(),
            env: Environment::new(),
            version: Vec::new(),
            gd: GlobalData::default(),
            payloads,
            allow_reboot: false,
            allow_deploy_exec: false,
            post_reboot: None,
            progress: ProgressTracker::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Is the named console command available on the target?
    pub fn has_command(&self, name: &str) -> bool {
        self.cmds.contains_key(name)
    }

    /// Send a command and return its response.
    pub fn send_command(&mut self, cmd: &str) -> Result<String> {
        Ok(self
            .console
            .send_command(cmd, true)?
            .unwrap_or_default())
    }

    /// Send a command without reading back a response. The caller is
    /// responsible for draining the console.
    pub fn send_command_no_response(&mut self, cmd: &str) -> Result<()> {
        self.console.send_command(cmd, false)?;
        Ok(())
    }

    /// Send a command and fail if the response looks like a U-Boot error.
    pub fn send_command_checked(&mut self, cmd: &str) -> Result<String> {
        let resp = self.send_command(cmd)?;
        check_response_for_error(&resp)?;
        Ok(resp)
    }

    /// Send a command, requiring the (case-insensitively trimmed) response
    /// to equal `expected`.
    pub fn send_command_expected(&mut self, cmd: &str, expected: &str) -> Result<String> {
        let resp = self.send_command(cmd)?;
        if !resp.trim().eq_ignore_ascii_case(expected.trim()) {
            return Err(Error::Protocol(format!(
                "Did not receive expected response. Got: {resp}"
            )));
        }
        Ok(resp)
    }

    /// Send a command, requiring the trimmed response to match `expected`.
    pub fn send_command_matching(&mut self, cmd: &str, expected: &Regex) -> Result<String> {
        let resp = self.send_command(cmd)?;
        if !expected.is_match(resp.trim()) {
            return Err(Error::Protocol(format!(
                "Did not receive expected response. Got: {resp}"
            )));
        }
        Ok(resp)
    }

    /// Interrupt the console and wait for a prompt.
    pub fn interrupt(&mut self) -> Result<()> {
        self.console
            .interrupt(DEFAULT_INTERRUPT, DEFAULT_INTERRUPT_TIMEOUT)?;
        Ok(())
    }

    /// Re-synchronize with the console after a crash-induced reset, either
    /// via the user's post-reboot hook or a plain interrupt.
    pub fn recover_after_reboot(&mut self) -> Result<()> {
        match self.post_reboot.take() {
            Some(mut hook) => {
                // The hook owns the interrupt() call, if it wants one
                let result = hook(&mut self.console);
                self.post_reboot = Some(hook);
                result
            }
            None => self.interrupt(),
        }
    }

    /// Execute an already-deployed payload by name, via the `go` command.
    ///
    /// Positional `args` pass through to the payload. Returns the standalone
    /// application return code and response text, or `None` when
    /// `read_response` is false and the caller drains the console itself.
    pub fn execute_payload(
        &mut self,
        name: &str,
        args: &[String],
        read_response: bool,
    ) -> Result<Option<(u64, String)>> {
        if !self.allow_deploy_exec {
            return Err(Error::OperationFailed(
                "Not attempting payload execution. \
                 Requires opt-in of payload deployment and execution."
                    .to_string(),
            ));
        }

        let entry = self.payloads.get(name)?;
        if !entry.deployed {
            return Err(Error::OperationFailed(format!(
                "Payload \"{name}\" has not been deployed"
            )));
        }

        let address = entry.address;
        crate::executor::go::go_execute(self, address, args, read_response)
    }

    /// Handle used by front-ends to request cancellation of long-running
    /// operations (e.g. from a Ctrl-C handler).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub(crate) fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }

    /// Create a progress indicator; only the outermost requester's bar is
    /// shown.
    pub fn create_progress(&mut self, total: u64, desc: &str, unit: &str, show: bool) -> Progress {
        self.progress.create(total, desc, unit, show)
    }

    pub fn close_progress(&mut self, progress: &Progress) {
        self.progress.close(progress);
    }
}

/// Fail if `resp` contains content indicative of a command failure.
pub fn check_response_for_error(resp: &str) -> Result<()> {
    for failure in FAILURE_STRINGS {
        if resp.contains(failure) {
            return Err(Error::OperationFailed(resp.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_response_for_error() {
        assert!(check_response_for_error("82000000: deadbeef").is_ok());
        assert!(check_response_for_error("Unknown command 'frob'").is_err());
        assert!(check_response_for_error("Usage:\nmd - memory display").is_err());
        assert!(check_response_for_error("00000001:data abort").is_err());
    }
}
