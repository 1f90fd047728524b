//! The `write-mem` command.

use std::path::Path;

use depthcharge::memory::WriteOptions;
use depthcharge::{Error, Result};

use crate::cli::TargetArgs;
use crate::commands::{attach, impl_spec};
use crate::terminal;

fn parse_hex_data(s: &str) -> Result<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if s.len() % 2 != 0 {
        return Err(Error::InvalidArgument(
            "Hex data must contain an even number of digits".to_string(),
        ));
    }

    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| Error::InvalidArgument(format!("Invalid hex data: {s}")))
        })
        .collect()
}

pub fn cmd_write_mem(
    target: &TargetArgs,
    address: u64,
    infile: Option<&Path>,
    data: Option<&str>,
    stratagem: bool,
) -> Result<()> {
    let mut ctx = attach(target, false)?;
    let spec = impl_spec(target);
    let opts = WriteOptions::default();

    match (infile, data) {
        (Some(path), None) => {
            ctx.write_memory_from_file(address, path, stratagem, spec.as_deref(), &opts)?;
        }
        (None, Some(hex)) => {
            let data = parse_hex_data(hex)?;
            ctx.write_memory(address, &data, spec.as_deref(), &opts)?;
        }
        _ => {
            return Err(Error::InvalidArgument(
                "Specify exactly one of --infile or --data".to_string(),
            ));
        }
    }

    terminal::success(&format!("Write to 0x{address:08x} complete"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_data() {
        assert_eq!(parse_hex_data("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_data("de ad be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex_data("abc").is_err());
        assert!(parse_hex_data("zz").is_err());
    }
}
