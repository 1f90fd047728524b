//! The offline `find-*` commands: hunts over a memory or flash dump.

use std::fs;
use std::path::Path;

use depthcharge::Result;
use depthcharge::arch::Architecture;
use depthcharge::hunter::cmdtbl::{CmdTableOptions, CommandTableHunter};
use depthcharge::hunter::env::{EnvOptions, EnvironmentHunter};
use depthcharge::hunter::fdt::FdtHunter;
use depthcharge::hunter::hunter::HunterOptions;

use crate::cli::HuntArgs;
use crate::terminal;

fn hunt_options() -> HunterOptions {
    HunterOptions {
        show_progress: true,
        ..HunterOptions::default()
    }
}

pub fn cmd_find_env(hunt: &HuntArgs, with_var: Option<&str>, details: bool) -> Result<()> {
    let data = fs::read(&hunt.file)?;
    let arch = Architecture::get(hunt.arch.name())?;

    let hunter =
        EnvironmentHunter::new(&data, hunt.address, arch, &hunt_options(), EnvOptions::default())?;

    let mut count = 0usize;
    for result in hunter.finditer(with_var, None, None) {
        count += 1;

        let mut line = format!(
            "{} @ 0x{:08x} (file offset 0x{:08x}) - {} bytes, {} variables",
            result.env_type,
            result.src_addr,
            result.src_off,
            result.src_size,
            result.vars.len(),
        );
        if let Some(crc) = result.crc {
            line.push_str(&format!(", CRC32 0x{crc:08x}"));
        }
        if let Some(flags) = result.flags {
            line.push_str(&format!(", flags 0x{flags:02x}"));
        }
        println!("{line}");

        if details {
            for (name, value) in &result.vars {
                println!("    {name}={value}");
            }
            println!();
        }
    }

    if count == 0 {
        terminal::info("No environments found.");
    }
    Ok(())
}

pub fn cmd_find_fdt(hunt: &HuntArgs, outdir: Option<&Path>, no_dts: bool) -> Result<()> {
    let data = fs::read(&hunt.file)?;
    let hunter = FdtHunter::new(&data, hunt.address, &hunt_options())?;

    if let Some(outdir) = outdir {
        fs::create_dir_all(outdir)?;
    }

    let mut count = 0usize;
    for result in hunter.finditer(None, None, None, no_dts) {
        count += 1;
        println!(
            "Device tree @ 0x{:08x} (file offset 0x{:08x}) - {} bytes",
            result.src_addr, result.src_off, result.src_size,
        );

        if let Some(outdir) = outdir {
            let dtb_path = outdir.join(format!("{:08x}.dtb", result.src_addr));
            fs::write(&dtb_path, &result.dtb)?;
            terminal::path_output(&dtb_path);

            if let Some(dts) = &result.dts {
                let dts_path = outdir.join(format!("{:08x}.dts", result.src_addr));
                fs::write(&dts_path, dts)?;
                terminal::path_output(&dts_path);
            }
        }
    }

    if count == 0 {
        terminal::info("No device trees found.");
    }
    Ok(())
}

pub fn cmd_find_cmd_table(
    hunt: &HuntArgs,
    threshold: usize,
    no_check_ptrs: bool,
    details: bool,
) -> Result<()> {
    let data = fs::read(&hunt.file)?;
    let arch = Architecture::get(hunt.arch.name())?;

    let table_opts = CmdTableOptions {
        threshold,
        check_ptrs: !no_check_ptrs,
        ..CmdTableOptions::default()
    };
    let hunter = CommandTableHunter::new(&data, hunt.address, arch, &hunt_options(), table_opts)?;

    let mut count = 0usize;
    for result in hunter.finditer(None, None, None) {
        count += 1;
        if details {
            println!("{}", CommandTableHunter::result_str(&result));
        } else {
            println!("{}", CommandTableHunter::result_summary_str(&result));
        }
    }

    if count == 0 {
        terminal::info("No command tables found.");
    }
    Ok(())
}
