//! Code execution operations.

pub mod go;

pub use go::GoExecutor;

use crate::operation::Operation;
use crate::target::Target;
use crate::Result;

/// A primitive for executing code on the target.
pub trait Executor: Operation {
    /// Begin execution at `address`, passing `args` through to the invoked
    /// code. With `read_response`, returns the return code and response
    /// text; otherwise the caller reads the console directly and `None` is
    /// returned.
    ///
    /// No prerequisite validation is performed; prefer executing registered
    /// payloads through the Context.
    fn execute_at(
        &mut self,
        target: &mut Target,
        address: u64,
        args: &[String],
        read_response: bool,
    ) -> Result<Option<(u64, String)>>;
}
