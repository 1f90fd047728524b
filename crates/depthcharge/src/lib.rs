//! Depthcharge - a U-Boot interaction toolkit.
//!
//! Builds memory read/write, register read, and code execution primitives
//! out of whatever console commands an embedded bootloader happens to
//! expose, over a serial connection.
//!
//! # Example
//!
//! ```ignore
//! use depthcharge::{Console, ConsoleOptions, Context, ContextOptions};
//!
//! let console = Console::open("/dev/ttyUSB0:115200", ConsoleOptions::default())?;
//! let mut ctx = Context::new(console, None, ContextOptions::default())?;
//! let data = ctx.read_memory(0x8780_0000, 16384, None, &Default::default())?;
//! ```

pub mod companion;
pub mod console;
pub mod context;
pub mod executor;
pub mod memory;
pub mod operation;
pub mod payload_map;
pub mod payloads;
pub mod progress;
pub mod register;
pub mod strutil;
pub mod target;

mod error;

pub use companion::{Companion, CompanionOptions};
pub use console::{Console, ConsoleOptions};
pub use context::{CATALOG, Context, ContextOptions, DeviceConfig, OpKind, PayloadBase};
pub use error::{Error, Result};
pub use target::Target;

// Re-export the sibling crates under their natural names
pub use depthcharge_arch as arch;
pub use depthcharge_hunter as hunter;
pub use depthcharge_uboot as uboot;
