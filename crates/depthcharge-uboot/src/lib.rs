//! U-Boot data format handling: environments, version strings, board info,
//! command tables, and the exported jump table.

pub mod board;
pub mod cmd_table;
pub mod env;
pub mod jump_table;
pub mod version;

pub use version::UBootVersion;

use thiserror::Error;

/// U-Boot data parsing and conversion errors.
#[derive(Error, Debug)]
pub enum UBootError {
    #[error("No environment variables found")]
    NoEnvironment,
    #[error("No definition for environment variable \"{0}\"")]
    UndefinedVariable(String),
    #[error("Variable expansion iteration limit reached for \"{0}\"")]
    ExpansionLimit(String),
    #[error("Environment contents ({contents} bytes) exceed storage size ({size} bytes)")]
    EnvironmentTooLarge { contents: usize, size: usize },
    #[error("No U-Boot version identified in string: {0}")]
    InvalidVersion(String),
    #[error("Failed to locate {0}")]
    FieldNotFound(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Architecture error: {0}")]
    Arch(#[from] depthcharge_arch::ArchError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UBootError>;
