//! Register reads via an executable payload.

use depthcharge_arch::Register;

use crate::operation::{Operation, RankHints, Requirements, Resolved, check_requirements};
use crate::payloads;
use crate::register::reader::RegisterReader;
use crate::target::Target;
use crate::{Error, Result};

/// Executes a small payload that returns the register selected by an
/// identifier byte passed as a command argument.
///
/// Some registers are inherently tainted by the `go` invocation itself; not
/// every register is readable this way.
pub struct GoRegisterReader {
    resolved: Resolved,
}

impl GoRegisterReader {
    pub const REQUIRED: Requirements = Requirements {
        commands: &[&["go"]],
        payloads: &[payloads::RETURN_REGISTER],
        ..Requirements::NONE
    };

    pub fn new(target: &Target) -> Result<Self> {
        Ok(Self {
            resolved: check_requirements("GoRegisterReader", &Self::REQUIRED, target)?,
        })
    }
}

impl Operation for GoRegisterReader {
    fn name(&self) -> &'static str {
        "GoRegisterReader"
    }

    fn required(&self) -> &'static Requirements {
        &Self::REQUIRED
    }

    fn resolved(&self) -> &Resolved {
        &self.resolved
    }

    fn rank(&self, _hints: &RankHints) -> u8 {
        // Not ideal: requires payload deployment (a write operation)
        10
    }
}

impl RegisterReader for GoRegisterReader {
    fn read_register(&mut self, target: &mut Target, reg: &'static Register) -> Result<u64> {
        let ident = reg.ident.ok_or_else(|| {
            Error::OperationFailed(format!(
                "Register {} has no payload identifier on {}",
                reg.name, target.arch.name
            ))
        })?;

        let (rc, _) = target
            .execute_payload(
                payloads::RETURN_REGISTER,
                &[(ident as char).to_string()],
                true,
            )?
            .ok_or_else(|| Error::OperationFailed("No payload return code".to_string()))?;

        Ok(rc)
    }
}
