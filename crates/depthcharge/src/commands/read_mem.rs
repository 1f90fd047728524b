//! The `read-mem` command.

use std::path::Path;

use depthcharge::Result;
use depthcharge::memory::ReadOptions;
use depthcharge::strutil::xxd;

use crate::cli::TargetArgs;
use crate::commands::{attach, impl_spec};
use crate::terminal;

pub fn cmd_read_mem(
    target: &TargetArgs,
    address: u64,
    length: u64,
    outfile: Option<&Path>,
) -> Result<()> {
    let mut ctx = attach(target, false)?;

    let spec = impl_spec(target);
    let opts = ReadOptions::default();

    match outfile {
        Some(path) => {
            ctx.read_memory_to_file(address, length as usize, path, spec.as_deref(), &opts)?;
            terminal::success(&format!("Read {length} bytes @ 0x{address:08x}"));
            terminal::path_output(path);
        }
        None => {
            let data = ctx.read_memory(address, length as usize, spec.as_deref(), &opts)?;
            println!("{}", xxd(address, &data));
        }
    }

    Ok(())
}
