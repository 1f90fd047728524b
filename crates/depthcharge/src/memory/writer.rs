//! Memory write base contracts.

use std::fs;
use std::path::Path;

use depthcharge_hunter::Stratagem;
use depthcharge_hunter::stratagem::EntrySpec;

use crate::operation::Operation;
use crate::progress::Progress;
use crate::target::Target;
use crate::{Error, Result};

/// Per-call write behavior tweaks.
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    pub suppress_setup: bool,
    pub suppress_teardown: bool,
    pub show_progress: bool,
    /// Block size override; honored only by writers that permit it.
    pub block_size: Option<usize>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            suppress_setup: false,
            suppress_teardown: false,
            show_progress: true,
            block_size: None,
        }
    }
}

/// A memory write primitive.
///
/// Direct writers provide `write_impl` for one block of data; writers that
/// can only operate through a Stratagem override `write_stratagem` instead
/// and refuse raw data.
pub trait MemoryWriter: Operation {
    fn setup(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self, _target: &mut Target) -> Result<()> {
        Ok(())
    }

    /// Write one block. Not used by Stratagem-based writers.
    fn write_impl(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()>;

    /// Bytes written per block between progress updates.
    fn block_size(&self, _target: &Target) -> usize {
        128
    }

    /// Word-oriented writers pin their block size and refuse overrides.
    fn allow_block_size_override(&self) -> bool {
        true
    }

    /// Write `data` to `addr`, splitting it into blocks.
    fn write(
        &mut self,
        target: &mut Target,
        addr: u64,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<()> {
        if self.required().stratagem {
            return Err(Error::StratagemRequired(self.name().to_string()));
        }

        let block_size = match opts.block_size {
            Some(requested) if self.allow_block_size_override() => requested.max(1),
            _ => self.block_size(target),
        };

        let size = data.len();
        let desc = format!("({}) Writing {size} bytes @ 0x{addr:08x}", self.name());
        let progress = target.create_progress(size as u64, &desc, "B", opts.show_progress);

        if !opts.suppress_setup {
            if let Err(e) = self.setup(target, addr, data) {
                target.close_progress(&progress);
                return Err(e);
            }
        }

        let result = (|| -> Result<()> {
            for (i, block) in data.chunks(block_size).enumerate() {
                target.check_cancel()?;
                self.write_impl(target, addr + (i * block_size) as u64, block)?;
                progress.inc(block.len() as u64);
            }
            Ok(())
        })();

        if !opts.suppress_teardown {
            let teardown_result = self.teardown(target);
            if result.is_ok() {
                teardown_result?;
            }
        }
        target.close_progress(&progress);

        result
    }

    /// Write the contents of a file to `addr`.
    fn write_from_file(
        &mut self,
        target: &mut Target,
        addr: u64,
        path: &Path,
        opts: &WriteOptions,
    ) -> Result<()> {
        let data = fs::read(path)?;
        self.write(target, addr, &data, opts)
    }

    /// Entry layout of the stratagems this writer consumes, if any.
    fn stratagem_spec(&self) -> Option<&'static EntrySpec> {
        None
    }

    /// Execute a [`Stratagem`] to produce the desired payload at `addr`.
    fn write_stratagem(
        &mut self,
        _target: &mut Target,
        _addr: u64,
        _stratagem: &Stratagem,
        _opts: &WriteOptions,
    ) -> Result<()> {
        Err(Error::StratagemNotRequired(self.name().to_string()))
    }
}

/// Shared validation and progress handling for Stratagem-based writers.
///
/// Refuses stratagems built for some other operation, then invokes
/// `execute` with a progress indicator sized to the plan's total operation
/// count.
pub(crate) fn drive_stratagem(
    op_name: &'static str,
    target: &mut Target,
    addr: u64,
    stratagem: &Stratagem,
    opts: &WriteOptions,
    execute: impl FnOnce(&mut Target, u64, &Stratagem, &Progress) -> Result<()>,
) -> Result<()> {
    if !stratagem.operation_name().eq_ignore_ascii_case(op_name) {
        return Err(Error::InvalidArgument(format!(
            "Stratagem is for {}, but {op_name} is being used",
            stratagem.operation_name()
        )));
    }

    let total_len = stratagem.len() * 4;
    let desc = format!("({op_name}) Writing {total_len} bytes @ 0x{addr:08x}");
    let progress = target.create_progress(
        stratagem.total_operations(),
        &desc,
        "op",
        opts.show_progress,
    );

    let result = execute(target, addr, stratagem, &progress);
    target.close_progress(&progress);
    result
}

/// A [`MemoryWriter`] restricted to word-sized accesses. The blanket driver
/// writes byte-wise up to an aligned boundary, then in descending access
/// widths.
pub trait MemoryWordWriter: Operation {
    fn word_size(&self, target: &Target) -> usize {
        target.arch.word_size
    }

    fn word_setup(&mut self, _target: &mut Target, _addr: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn word_teardown(&mut self, _target: &mut Target) -> Result<()> {
        Ok(())
    }

    fn write_word(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()>;
}

impl<T: MemoryWordWriter> MemoryWriter for T {
    fn setup(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        self.word_setup(target, addr, data)
    }

    fn teardown(&mut self, target: &mut Target) -> Result<()> {
        self.word_teardown(target)
    }

    fn block_size(&self, target: &Target) -> usize {
        self.word_size(target)
    }

    fn allow_block_size_override(&self) -> bool {
        false
    }

    fn write_impl(&mut self, target: &mut Target, addr: u64, data: &[u8]) -> Result<()> {
        let mut i = 0usize;

        // Byte-by-byte until word-aligned
        while i < data.len() && !target.arch.is_word_aligned(addr + i as u64) {
            self.write_word(target, addr + i as u64, &data[i..i + 1])?;
            i += 1;
        }

        while i < data.len() {
            let remaining = data.len() - i;
            let to_write = if remaining >= 8 && target.arch.supports_64bit_data {
                8
            } else if remaining >= 4 {
                4
            } else if remaining >= 2 {
                2
            } else {
                1
            };

            self.write_word(target, addr + i as u64, &data[i..i + to_write])?;
            i += to_write;
        }

        Ok(())
    }
}
