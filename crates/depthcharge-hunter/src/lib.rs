//! Searches over memory and flash dumps.
//!
//! A [`Hunter`](crate::hunter::HunterCore) walks a binary blob looking for a
//! particular kind of artifact: fixed byte patterns, NUL-terminated strings,
//! U-Boot environments, device trees, or command tables. The reverse-CRC32
//! and cp hunters instead produce [`Stratagem`] write plans for consumption
//! by the corresponding memory writers.

pub mod cmdtbl;
pub mod constant;
pub mod cp;
pub mod crc;
pub mod env;
pub mod fdt;
pub mod hunter;
pub mod revcrc32;
pub mod stratagem;
pub mod string;

mod progress;

pub use cmdtbl::{CommandTableEntry, CommandTableHunter, CommandTableResult};
pub use constant::ConstantHunter;
pub use cp::CpHunter;
pub use crc::reverse_crc32_4bytes;
pub use env::{EnvType, EnvironmentHunter, EnvironmentResult};
pub use fdt::{FdtHunter, FdtResult};
pub use hunter::{HunterOptions, HunterResult, gap};
pub use revcrc32::ReverseCrc32Hunter;
pub use stratagem::{Stratagem, StratagemEntry};
pub use string::StringHunter;

use thiserror::Error;

/// Search and stratagem construction errors.
#[derive(Error, Debug)]
pub enum HunterError {
    /// The search space was exhausted without a result.
    #[error("Hunter result not found: {0}")]
    ResultNotFound(String),
    #[error("Stratagem creation failed: {0}")]
    StratagemCreationFailed(String),
    #[error("{0} does not produce a Stratagem")]
    StratagemNotRequired(String),
    #[error("Index {index} outside of bounds [{min}, {max}]")]
    InvalidOffset { index: i64, min: usize, max: usize },
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Architecture error: {0}")]
    Arch(#[from] depthcharge_arch::ArchError),
    #[error("U-Boot data error: {0}")]
    UBoot(#[from] depthcharge_uboot::UBootError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HunterError {
    pub(crate) fn not_found() -> Self {
        Self::ResultNotFound("search exhausted".to_string())
    }
}

pub type Result<T> = std::result::Result<T, HunterError>;
