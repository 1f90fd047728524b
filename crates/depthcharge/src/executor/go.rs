//! Execution of U-Boot "standalone" programs via the `go` command.

use std::sync::LazyLock;

use regex::Regex;

use crate::executor::Executor;
use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::target::Target;
use crate::{Error, Result};

static GO_RC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##[\w\s,]+rc = 0x(?P<rc>[0-9a-fA-F]+)").unwrap());

/// Issue a `go` command and, optionally, parse the standalone application's
/// return code out of the response.
pub(crate) fn go_execute(
    target: &mut Target,
    address: u64,
    args: &[String],
    read_response: bool,
) -> Result<Option<(u64, String)>> {
    let mut cmd = format!("go 0x{address:08x}");
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg);
    }

    if !read_response {
        target.send_command_no_response(&cmd)?;
        return Ok(None);
    }

    let resp = target.send_command(&cmd)?;
    for line in resp.lines().rev() {
        if let Some(caps) = GO_RC_RE.captures(line) {
            let rc = u64::from_str_radix(&caps["rc"], 16).unwrap_or(0);
            return Ok(Some((rc, resp)));
        }
    }

    Err(Error::OperationFailed(
        "Did not find standalone application return code.".to_string(),
    ))
}

/// Executes code through U-Boot's built-in support for standalone programs.
pub struct GoExecutor {
    resolved: Resolved,
}

impl GoExecutor {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["go"]],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("GoExecutor", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for GoExecutor {
    fn name(&self) -> &'static str {
        "GoExecutor"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        90
    }
}

impl Executor for GoExecutor {
    fn execute_at(
        &mut self,
        target: &mut Target,
        address: u64,
        args: &[String],
        read_response: bool,
    ) -> Result<Option<(u64, String)>> {
        go_execute(target, address, args, read_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc_regex() {
        let line = "## Application terminated, rc = 0x2a";
        let caps = GO_RC_RE.captures(line).unwrap();
        assert_eq!(&caps["rc"], "2a");
    }
}
