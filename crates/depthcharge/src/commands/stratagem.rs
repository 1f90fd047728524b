//! The `stratagem` command: offline construction of write plans.

use std::fs;
use std::path::Path;

use depthcharge::Result;
use depthcharge::arch::Architecture;
use depthcharge::hunter::cp::CpHunter;
use depthcharge::hunter::hunter::HunterOptions;
use depthcharge::hunter::revcrc32::{ReverseCrc32Hunter, ReverseCrc32Options};

use crate::cli::{HuntArgs, StratagemTypeArg};
use crate::terminal;

pub fn cmd_stratagem(
    hunt: &HuntArgs,
    payload: &Path,
    outfile: &Path,
    stratagem_type: StratagemTypeArg,
    revlut_maxlen: usize,
    max_iterations: u64,
) -> Result<()> {
    let data = fs::read(&hunt.file)?;
    let payload_data = fs::read(payload)?;
    let arch = Architecture::get(hunt.arch.name())?;

    let opts = HunterOptions {
        show_progress: true,
        ..HunterOptions::default()
    };

    let stratagem = match stratagem_type {
        StratagemTypeArg::Crc32 => {
            let hunter = ReverseCrc32Hunter::new(
                &data,
                hunt.address,
                &opts,
                ReverseCrc32Options {
                    revlut_maxlen,
                    endianness: arch.endianness,
                    num_threads: None,
                },
            )?;
            hunter.build_stratagem(&payload_data, max_iterations)?
        }
        StratagemTypeArg::Cp => {
            let hunter = CpHunter::new(&data, hunt.address, &opts)?;
            hunter.build_stratagem(&payload_data)?
        }
    };

    stratagem.to_json_file(outfile)?;

    terminal::success(&format!(
        "{} stratagem: {} entries, {} total operations",
        stratagem.operation_name(),
        stratagem.len(),
        stratagem.total_operations(),
    ));
    terminal::path_output(outfile);
    Ok(())
}
