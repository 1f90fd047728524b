//! Memory read base contracts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::warn;

use crate::operation::Operation;
use crate::target::Target;
use crate::{Error, Result};

/// Per-call read behavior tweaks.
#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Skip the setup step (e.g. when the previous call left state live).
    pub suppress_setup: bool,
    pub suppress_teardown: bool,
    pub show_progress: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            suppress_setup: false,
            suppress_teardown: false,
            show_progress: true,
        }
    }
}

/// Handler receiving data as a read streams it in.
pub type DataSink<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;

/// A memory read primitive.
///
/// Implementations provide `read_impl`, streaming data to the provided sink;
/// the provided `read`/`read_to_file` drivers handle setup/teardown,
/// progress, and preservation of partial output on cancellation.
pub trait MemoryReader: Operation {
    fn setup(&mut self, _target: &mut Target, _addr: u64, _size: usize) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self, _target: &mut Target) -> Result<()> {
        Ok(())
    }

    fn read_impl(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()>;

    /// Read `size` bytes at `addr`. Partial output is returned (with a
    /// warning) if the user cancels mid-read.
    fn read(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        opts: &ReadOptions,
    ) -> Result<Vec<u8>> {
        if !opts.suppress_setup {
            self.setup(target, addr, size)?;
        }

        let desc = format!("({}) Reading {size} bytes @ 0x{addr:08x}", self.name());
        let progress = target.create_progress(size as u64, &desc, "B", opts.show_progress);

        let mut ret = Vec::with_capacity(size);
        let result = {
            let mut sink = |data: &[u8]| -> Result<()> {
                ret.extend_from_slice(data);
                progress.inc(data.len() as u64);
                Ok(())
            };
            self.read_impl(target, addr, size, &mut sink)
        };
        target.close_progress(&progress);

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                warn!("Read operation interrupted. {} / {size} bytes read.", ret.len());
                target.clear_cancel();
            }
            Err(e) => return Err(e),
        }

        if !opts.suppress_teardown {
            self.teardown(target)?;
        }

        Ok(ret)
    }

    /// Read `size` bytes at `addr`, streaming them to a file. On
    /// cancellation the received data is flushed and the file closed
    /// cleanly.
    fn read_to_file(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        path: &Path,
        opts: &ReadOptions,
    ) -> Result<()> {
        if !opts.suppress_setup {
            self.setup(target, addr, size)?;
        }

        let desc = format!("({}) Reading {size} bytes @ 0x{addr:08x}", self.name());
        let progress = target.create_progress(size as u64, &desc, "B", opts.show_progress);

        let mut written = 0usize;
        let mut outfile = BufWriter::new(File::create(path)?);
        let result = {
            let mut sink = |data: &[u8]| -> Result<()> {
                outfile.write_all(data)?;
                written += data.len();
                progress.inc(data.len() as u64);
                Ok(())
            };
            self.read_impl(target, addr, size, &mut sink)
        };
        target.close_progress(&progress);
        outfile.flush()?;

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                warn!("Read operation interrupted. {written} / {size} bytes read.");
                target.clear_cancel();
            }
            Err(e) => return Err(e),
        }

        if !opts.suppress_teardown {
            self.teardown(target)?;
        }

        Ok(())
    }
}

/// A [`MemoryReader`] restricted to byte/word/long-word (and, where
/// supported, quad-word) accesses. The blanket driver covers arbitrary
/// sizes, dropping to smaller access widths for the remainder and cycling
/// teardown/setup across width transitions (several commands operate in a
/// continuation mode for a fixed width).
pub trait MemoryWordReader: Operation {
    /// Preferred access width, in bytes.
    fn word_size(&self, target: &Target) -> usize {
        target.arch.word_size
    }

    fn word_setup(&mut self, _target: &mut Target, _addr: u64, _size: usize) -> Result<()> {
        Ok(())
    }

    fn word_teardown(&mut self, _target: &mut Target) -> Result<()> {
        Ok(())
    }

    fn read_word(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<Vec<u8>>;
}

impl<T: MemoryWordReader> MemoryReader for T {
    fn setup(&mut self, target: &mut Target, addr: u64, size: usize) -> Result<()> {
        self.word_setup(target, addr, size)
    }

    fn teardown(&mut self, target: &mut Target) -> Result<()> {
        self.word_teardown(target)
    }

    fn read_impl(
        &mut self,
        target: &mut Target,
        addr: u64,
        size: usize,
        sink: &mut DataSink<'_>,
    ) -> Result<()> {
        let mut word_size = self.word_size(target);
        let mut addr = addr;
        let mut remaining = size;

        while remaining >= word_size {
            target.check_cancel()?;
            let data = self.read_word(target, addr, word_size)?;
            sink(&data)?;
            addr += word_size as u64;
            remaining -= word_size;
        }

        while remaining > 0 {
            target.check_cancel()?;

            let to_read = if target.arch.supports_64bit_data && remaining >= 8 {
                8
            } else if remaining >= 4 {
                4
            } else if remaining >= 2 {
                2
            } else {
                1
            };

            // Dropping to a smaller word size restarts the operation
            if to_read < word_size {
                word_size = to_read;
                self.word_teardown(target)?;
                self.word_setup(target, addr, word_size)?;
            }

            let data = self.read_word(target, addr, to_read)?;
            sink(&data)?;
            addr += to_read as u64;
            remaining -= to_read;
        }

        Ok(())
    }
}
