//! Memory read and write operations.
//!
//! Each implementation wraps one U-Boot console command (or command family)
//! as an arbitrary-address access primitive, with base drivers handling
//! word-size windowing, block splitting, progress, and partial-result
//! preservation.

pub mod cp;
pub mod crc32;
pub mod data_abort;
pub mod go;
pub mod i2c;
pub mod itest;
pub mod load;
pub mod memcmds;
pub mod patch;
pub mod reader;
pub mod setexpr;
pub mod writer;

pub use cp::CpMemoryWriter;
pub use crc32::{Crc32MemoryReader, Crc32MemoryWriter};
pub use data_abort::{CpCrashMemoryReader, DataAbortReadOptions};
pub use go::GoMemoryReader;
pub use i2c::{I2cMemoryReader, I2cMemoryWriter};
pub use itest::ItestMemoryReader;
pub use load::{LoadbMemoryWriter, LoadxMemoryWriter, LoadyMemoryWriter};
pub use memcmds::{
    MdMemoryReader, MmMemoryReader, MmMemoryWriter, MwMemoryWriter, NmMemoryReader,
    NmMemoryWriter,
};
pub use patch::{MemoryPatch, MemoryPatchList};
pub use reader::{MemoryReader, MemoryWordReader, ReadOptions};
pub use setexpr::SetexprMemoryReader;
pub use writer::{MemoryWordWriter, MemoryWriter, WriteOptions};
