//! Register read base contract.

use depthcharge_arch::Register;

use crate::operation::Operation;
use crate::target::Target;
use crate::Result;

/// A register read primitive. The register is resolved (by name or alias)
/// through the architecture's register table before dispatch.
pub trait RegisterReader: Operation {
    fn read_register(&mut self, target: &mut Target, reg: &'static Register) -> Result<u64>;
}
