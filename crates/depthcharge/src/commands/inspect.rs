//! The `inspect` command: interrogate a target and save its configuration.

use std::path::Path;

use depthcharge::Result;

use crate::cli::TargetArgs;
use crate::commands::attach;
use crate::terminal;

pub fn cmd_inspect(
    target: &TargetArgs,
    outfile: &Path,
    detailed_help: bool,
    comment: Option<&str>,
) -> Result<()> {
    let ctx = attach(target, detailed_help)?;

    terminal::info(&format!(
        "Memory readers:   {}",
        ctx.memory_reader_names().join(", ")
    ));
    terminal::info(&format!(
        "Memory writers:   {}",
        ctx.memory_writer_names().join(", ")
    ));
    terminal::info(&format!(
        "Register readers: {}",
        ctx.register_reader_names().join(", ")
    ));
    terminal::info(&format!(
        "Executors:        {}",
        ctx.executor_names().join(", ")
    ));

    ctx.save(outfile, true, comment)?;
    terminal::success("Device configuration saved");
    terminal::path_output(outfile);
    Ok(())
}
