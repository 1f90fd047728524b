//! Command implementations.
//!
//! Each submodule handles one CLI command; `run_command` dispatches and
//! maps errors onto exit codes.

mod find;
mod inspect;
mod read_mem;
mod stratagem;
mod write_mem;

use std::sync::atomic::Ordering;

use depthcharge::{
    Companion, CompanionOptions, Console, ConsoleOptions, Context, ContextOptions, Error,
    Result,
};

use crate::cli::{Cli, Commands, EXIT_BAD_USAGE, EXIT_FAILURE, EXIT_SUCCESS, TargetArgs};
use crate::terminal;

/// Dispatch a CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    let result = match &cli.command {
        Commands::ReadMem {
            target,
            address,
            length,
            outfile,
        } => read_mem::cmd_read_mem(target, *address, *length, outfile.as_deref()),
        Commands::WriteMem {
            target,
            address,
            infile,
            data,
            stratagem,
        } => write_mem::cmd_write_mem(target, *address, infile.as_deref(), data.as_deref(), *stratagem),
        Commands::Stratagem {
            hunt,
            payload,
            outfile,
            stratagem_type,
            revlut_maxlen,
            max_iterations,
        } => stratagem::cmd_stratagem(
            hunt,
            payload,
            outfile,
            *stratagem_type,
            *revlut_maxlen as usize,
            *max_iterations,
        ),
        Commands::FindEnv {
            hunt,
            with_var,
            details,
        } => find::cmd_find_env(hunt, with_var.as_deref(), *details),
        Commands::FindFdt {
            hunt,
            outdir,
            no_dts,
        } => find::cmd_find_fdt(hunt, outdir.as_deref(), *no_dts),
        Commands::FindCmdTable {
            hunt,
            threshold,
            no_check_ptrs,
            details,
        } => find::cmd_find_cmd_table(hunt, *threshold as usize, *no_check_ptrs, *details),
        Commands::Inspect {
            target,
            outfile,
            detailed_help,
            comment,
        } => inspect::cmd_inspect(target, outfile, *detailed_help, comment.as_deref()),
    };

    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            terminal::error(&e.to_string());
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::InvalidArgument(_) | Error::Json(_) => EXIT_BAD_USAGE,
        _ => EXIT_FAILURE,
    }
}

/// Open the console (and companion, if requested) and construct a Context,
/// loading a device configuration file when one is available.
pub(crate) fn attach(args: &TargetArgs, detailed_help: bool) -> Result<Context> {
    let console_opts = ConsoleOptions {
        prompt: args.prompt.clone(),
        ..ConsoleOptions::default()
    };
    let console = Console::open(&args.iface, console_opts)?;

    let companion = match &args.companion {
        Some(device) => Some(Companion::open(device, &CompanionOptions::default())?),
        None => None,
    };

    let opts = ContextOptions {
        arch: Some(args.arch.name().to_string()),
        allow_reboot: args.allow_reboot,
        allow_deploy: args.allow_deploy,
        skip_deploy: args.skip_deploy,
        detailed_help,
        ..ContextOptions::default()
    };

    let ctx = match &args.config {
        Some(path) if path.exists() => Context::load(path, console, companion, opts)?,
        _ => Context::new(console, companion, opts)?,
    };

    // Ctrl-C requests cooperative cancellation; loops then return partial
    // results rather than dying mid-transaction
    let cancel = ctx.target.cancel_flag();
    let _ = ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed));

    Ok(ctx)
}

/// The `--op` list as the `&[&str]` the dispatch API expects.
pub(crate) fn impl_spec(args: &TargetArgs) -> Option<Vec<&str>> {
    if args.op.is_empty() {
        None
    } else {
        Some(args.op.iter().map(String::as_str).collect())
    }
}
