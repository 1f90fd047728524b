//! Depthcharge CLI.

mod cli;
mod commands;
mod terminal;

use std::env;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Map `DEPTHCHARGE_LOG_LEVEL` onto a tracing filter directive.
fn log_directive(cli: &Cli) -> &'static str {
    if cli.verbose {
        return "depthcharge=debug";
    }
    if cli.silent {
        return "depthcharge=error";
    }

    match env::var("DEPTHCHARGE_LOG_LEVEL").as_deref() {
        Ok("debug") => "depthcharge=debug",
        Ok("note") | Ok("info") => "depthcharge=info",
        Ok("warning") => "depthcharge=warn",
        Ok("error") => "depthcharge=error",
        Ok("silent") => "depthcharge=off",
        _ => "depthcharge=info",
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(log_directive(&cli).parse().unwrap()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = commands::run_command(&cli);
    std::process::exit(exit_code);
}
