//! CLI definitions and argument types.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for recoverable failures, including interrupt timeouts.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for malformed user input.
pub const EXIT_BAD_USAGE: i32 = 2;

#[derive(Parser)]
#[command(name = "depthcharge")]
#[command(about = "U-Boot interaction toolkit - memory access over a serial console")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that attaches to a live target.
#[derive(clap::Args)]
pub struct TargetArgs {
    /// Serial console device, optionally with baudrate (dev:baud)
    #[arg(short = 'i', long, default_value = "/dev/ttyUSB0:115200")]
    pub iface: String,

    /// Target architecture
    #[arg(long, value_enum, default_value = "generic")]
    pub arch: ArchArg,

    /// Expected console prompt, if already known
    #[arg(long)]
    pub prompt: Option<String>,

    /// Device configuration file to load and update
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Permit operations that crash or reboot the target
    #[arg(short = 'R', long)]
    pub allow_reboot: bool,

    /// Permit payload deployment and execution
    #[arg(short = 'D', long)]
    pub allow_deploy: bool,

    /// Assume payloads are already deployed (implies execution opt-in)
    #[arg(long, conflicts_with = "allow_deploy")]
    pub skip_deploy: bool,

    /// Companion device, optionally with baudrate (dev:baud)
    #[arg(short = 'C', long)]
    pub companion: Option<String>,

    /// Memory operation implementation(s) to use, in preference order
    #[arg(long, value_delimiter = ',')]
    pub op: Vec<String>,
}

/// Options shared by the offline hunters operating on a dump file.
#[derive(clap::Args)]
pub struct HuntArgs {
    /// Memory or flash dump to search
    #[arg(short, long, value_name = "FILE")]
    pub file: PathBuf,

    /// Address the data was dumped from
    #[arg(short, long, value_parser = parse_num, default_value = "0")]
    pub address: u64,

    /// Target architecture
    #[arg(long, value_enum, default_value = "arm")]
    pub arch: ArchArg,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read target memory to a file or hex dump
    ReadMem {
        #[command(flatten)]
        target: TargetArgs,

        /// Address to read from
        #[arg(short, long, value_parser = parse_num)]
        address: u64,

        /// Number of bytes to read (suffixes: K, KiB, M, MiB, ...)
        #[arg(short, long, value_parser = parse_len)]
        length: u64,

        /// Output file; memory is hex dumped to stdout if omitted
        #[arg(short = 'o', long)]
        outfile: Option<PathBuf>,
    },
    /// Write a file or hex string to target memory
    WriteMem {
        #[command(flatten)]
        target: TargetArgs,

        /// Address to write to
        #[arg(short, long, value_parser = parse_num)]
        address: u64,

        /// Input file to write
        #[arg(short = 'f', long, conflicts_with = "data")]
        infile: Option<PathBuf>,

        /// Hex string to write (e.g. "deadbeef")
        #[arg(short = 'd', long)]
        data: Option<String>,

        /// Treat the input file as a stratagem rather than raw data
        #[arg(long)]
        stratagem: bool,
    },
    /// Build a stratagem that produces a payload from existing data
    Stratagem {
        #[command(flatten)]
        hunt: HuntArgs,

        /// File containing the desired payload
        #[arg(short, long)]
        payload: PathBuf,

        /// Output stratagem file
        #[arg(short = 'o', long)]
        outfile: PathBuf,

        /// Stratagem-producing operation to target
        #[arg(long, value_enum, default_value = "crc32")]
        stratagem_type: StratagemTypeArg,

        /// Maximum reverse LUT entry length
        #[arg(long, value_parser = parse_len, default_value = "256")]
        revlut_maxlen: u64,

        /// Maximum CRC32 operations per 4-byte word
        #[arg(long, value_parser = parse_num, default_value = "4096")]
        max_iterations: u64,
    },
    /// Search a dump for U-Boot environments
    FindEnv {
        #[command(flatten)]
        hunt: HuntArgs,

        /// Only report environments defining this variable
        #[arg(long)]
        with_var: Option<String>,

        /// Print variable definitions, not just locations
        #[arg(long)]
        details: bool,
    },
    /// Search a dump for flattened device trees
    FindFdt {
        #[command(flatten)]
        hunt: HuntArgs,

        /// Write each located DTB (and DTS, if dtc is present) here
        #[arg(short = 'o', long)]
        outdir: Option<PathBuf>,

        /// Skip DTB -> DTS conversion
        #[arg(long)]
        no_dts: bool,
    },
    /// Search a dump for U-Boot command tables
    FindCmdTable {
        #[command(flatten)]
        hunt: HuntArgs,

        /// Consecutive valid entries required for a match
        #[arg(long, value_parser = parse_num, default_value = "5")]
        threshold: u64,

        /// Skip pointer validation (use when the load address is unknown)
        #[arg(long)]
        no_check_ptrs: bool,

        /// Print each entry in full
        #[arg(long)]
        details: bool,
    },
    /// Inspect a target and save a device configuration file
    Inspect {
        #[command(flatten)]
        target: TargetArgs,

        /// Output device configuration file
        #[arg(short = 'o', long)]
        outfile: PathBuf,

        /// Also collect detailed per-command help text
        #[arg(long)]
        detailed_help: bool,

        /// Comment recorded in the configuration file
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ArchArg {
    Arm,
    Aarch64,
    Generic,
    GenericBe,
    Generic64,
    Generic64Be,
}

impl ArchArg {
    pub fn name(self) -> &'static str {
        match self {
            Self::Arm => "ARM",
            Self::Aarch64 => "AARCH64",
            Self::Generic => "Generic",
            Self::GenericBe => "Generic_BE",
            Self::Generic64 => "Generic_64",
            Self::Generic64Be => "Generic_64_BE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StratagemTypeArg {
    /// CRC32 preimage plan for CRC32MemoryWriter
    Crc32,
    /// Copy plan for CpMemoryWriter
    Cp,
}

fn parse_num(s: &str) -> Result<u64, String> {
    depthcharge::strutil::parse_int(s).map_err(|e| e.to_string())
}

fn parse_len(s: &str) -> Result<u64, String> {
    depthcharge::strutil::length_to_int(s).map_err(|e| e.to_string())
}
