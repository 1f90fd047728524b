//! U-Boot command table searches.
//!
//! Locates the "linker lists" of `cmd_tbl_s` structures that define console
//! commands. Their presence indicates `CONFIG_CMDLINE`; multiple distinct
//! tables can indicate vendor authorization tiers worth a closer look.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use depthcharge_arch::Architecture;
use depthcharge_uboot::cmd_table::CmdTableLayout;

use crate::hunter::{HunterCore, HunterOptions, SearchResult, find_iter};
use crate::string::StringHunter;
use crate::{HunterError, Result};

// Command names are typically lowercase alpha, with a few exceptions:
// '?' (help alias), crc32, and product-specific commands using underscores.
static CMD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9_-]{2,}|\?)$").unwrap());

// Known false positive: the "unknown command" string
static CMD_FALSE_POSITIVE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^unknown").unwrap());

// Format-string escapes never belong in usage or help text
static TEXT_FALSE_POSITIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%[0-9]*[a-z]").unwrap());

/// One parsed `cmd_tbl_s` structure.
#[derive(Clone, Debug)]
pub struct CommandTableEntry {
    /// Address of the structure itself.
    pub address: u64,
    pub name: String,
    pub maxargs: i64,
    /// Repeat flag or function pointer, depending on U-Boot version.
    pub cmd_rep: u64,
    /// `do_<command>` handler pointer.
    pub cmd: u64,
    pub usage: String,
    /// Help text, present under `CONFIG_SYS_LONGHELP`.
    pub help: Option<String>,
    /// Completion handler, present under `CONFIG_AUTO_COMPLETE`.
    pub complete: Option<u64>,
    /// Subcommand entries have empty usage (and help) text.
    pub subcmd: bool,
    /// Size of the structure in bytes.
    pub size: usize,
}

/// A located command table.
#[derive(Clone, Debug)]
pub struct CommandTableResult {
    pub src_off: usize,
    pub src_addr: u64,
    pub src_size: usize,
    pub entries: Vec<CommandTableEntry>,
    /// True when every entry looks like a subcommand.
    pub is_subcmd_table: bool,
    /// The layout the table was parsed with.
    pub layout: CmdTableLayout,
}

impl SearchResult for CommandTableResult {
    fn src_off(&self) -> usize {
        self.src_off
    }

    fn src_size(&self) -> usize {
        self.src_size
    }
}

/// Search parameters for [`CommandTableHunter`].
#[derive(Clone, Copy, Debug)]
pub struct CmdTableOptions {
    /// Number of consecutive valid-looking entries required for a match.
    pub threshold: usize,
    /// Validate that pointer fields land within the data. Disable when the
    /// data's load address is unknown, at the cost of false positives.
    pub check_ptrs: bool,
    /// `CONFIG_SYS_LONGHELP` state; `None` probes both.
    pub longhelp: Option<bool>,
    /// `CONFIG_AUTO_COMPLETE` state; `None` probes both.
    pub autocomplete: Option<bool>,
}

impl Default for CmdTableOptions {
    fn default() -> Self {
        Self {
            threshold: 5,
            check_ptrs: true,
            longhelp: None,
            autocomplete: None,
        }
    }
}

/// Searches for runs of consecutive `cmd_tbl_s` structures.
pub struct CommandTableHunter<'d> {
    core: HunterCore<'d>,
    arch: &'static Architecture,
    strings: StringHunter<'d>,
    opts: CmdTableOptions,
}

impl<'d> CommandTableHunter<'d> {
    /// `address` should be the data's post-relocation load address; pointer
    /// validation dereferences `char *` fields within its confines.
    pub fn new(
        data: &'d [u8],
        address: u64,
        arch: &'static Architecture,
        opts: &HunterOptions,
        table_opts: CmdTableOptions,
    ) -> Result<Self> {
        Ok(Self {
            core: HunterCore::new(data, address, opts)?,
            arch,
            strings: StringHunter::new(data, address, opts)?,
            opts: table_opts,
        })
    }

    fn is_valid_ptr(&self, addr: u64, allow_null: bool) -> bool {
        if !self.opts.check_ptrs {
            return true;
        }

        if addr == 0 {
            return allow_null;
        }

        if addr < self.core.address {
            return false;
        }

        let offset = (addr - self.core.address) as usize;
        (self.core.start_offset..=self.core.end_offset).contains(&offset)
    }

    fn string_at(&self, addr: u64, allow_empty: bool) -> Result<String> {
        self.strings.string_at(addr, None, None, allow_empty)
    }

    /// Parse the data at `offset` as one `cmd_tbl_s`, or `None` if it cannot
    /// be one.
    fn parse_entry(
        &self,
        offset: usize,
        end: usize,
        layout: CmdTableLayout,
    ) -> Option<CommandTableEntry> {
        let arch = self.arch;
        let address = self.core.address + offset as u64;

        if !arch.is_word_aligned(address) {
            return None;
        }

        let end = end.min(self.core.data.len());
        if offset >= end {
            return None;
        }
        let data = &self.core.data[offset..end];

        let (name_ptr, data) = arch.ptr_value_adv(data).ok()?;
        let name = self.string_at(name_ptr, false).ok()?;
        if CMD_NAME.find(&name).is_none() || CMD_FALSE_POSITIVE.find(&name).is_some() {
            return None;
        }

        let (maxargs, data) = arch.to_int_adv(data).ok()?;

        // An older ->repeatable int flag became a function pointer in 2018
        // (80a48dd47e3b); either way it is word-sized and not dereferenced.
        let (cmd_rep, data) = arch.ptr_value_adv(data).ok()?;

        let (cmd, data) = arch.ptr_value_adv(data).ok()?;
        if !self.is_valid_ptr(cmd, false) {
            return None;
        }

        let (usage_ptr, data) = arch.ptr_value_adv(data).ok()?;
        let usage = if usage_ptr != 0 {
            let usage = self.string_at(usage_ptr, true).ok()?;
            if TEXT_FALSE_POSITIVE.find(&usage).is_some() {
                return None;
            }
            usage
        } else {
            // Some commands (e.g. mach-imx "bmode") leave usage NULL
            String::new()
        };

        // Subcommands typically point usage at an empty string
        let mut subcmd = usage_ptr != 0 && usage.is_empty();

        let mut help = None;
        let mut data = data;
        if layout.longhelp {
            let (help_ptr, rest) = arch.ptr_value_adv(data).ok()?;
            data = rest;

            let help_text = if help_ptr != 0 {
                let text = self.string_at(help_ptr, true).ok()?;
                if TEXT_FALSE_POSITIVE.find(&text).is_some() {
                    return None;
                }
                subcmd = usage.is_empty() && text.is_empty();
                text
            } else {
                // 'true' and friends leave help NULL
                subcmd = false;
                String::new()
            };
            help = Some(help_text);
        }

        let mut complete = None;
        if layout.autocomplete {
            let (complete_ptr, _) = arch.ptr_value_adv(data).ok()?;
            if !self.is_valid_ptr(complete_ptr, true) {
                return None;
            }
            complete = Some(complete_ptr);
        }

        Some(CommandTableEntry {
            address,
            name,
            maxargs,
            cmd_rep,
            cmd,
            usage,
            help,
            complete,
            subcmd,
            size: layout.entry_size(arch),
        })
    }

    fn attempt_run_at(
        &self,
        target: Option<&str>,
        start: usize,
        end: usize,
        layout: CmdTableLayout,
    ) -> Option<(usize, usize, CommandTableResult)> {
        let mut offset = start;
        let mut total_size = 0;
        let mut entries = Vec::new();

        while let Some(entry) = self.parse_entry(offset, end, layout) {
            debug!(
                "Potential cmd_tbl_s @ 0x{:08x} ({}, {}) => {}",
                entry.address, layout.longhelp, layout.autocomplete, entry.name
            );

            total_size += entry.size;
            offset += entry.size;
            entries.push(entry);
        }

        if entries.len() < self.opts.threshold {
            return None;
        }

        if let Some(target) = target {
            let found = entries
                .iter()
                .any(|e| e.name.eq_ignore_ascii_case(target));
            if !found {
                return None;
            }
        }

        let is_subcmd_table = entries.iter().all(|e| e.subcmd);
        let result = CommandTableResult {
            src_off: start,
            src_addr: self.core.address + start as u64,
            src_size: total_size,
            entries,
            is_subcmd_table,
            layout,
        };

        Some((start, total_size, result))
    }

    fn search_at(
        &self,
        target: Option<&str>,
        start: usize,
        end: usize,
    ) -> Option<(usize, usize, CommandTableResult)> {
        let longhelp_iter: &[bool] = match self.opts.longhelp {
            Some(v) => if v { &[true] } else { &[false] },
            None => &[true, false],
        };
        let autocomp_iter: &[bool] = match self.opts.autocomplete {
            Some(v) => if v { &[true] } else { &[false] },
            None => &[true, false],
        };

        for &longhelp in longhelp_iter {
            for &autocomplete in autocomp_iter {
                let layout = CmdTableLayout { longhelp, autocomplete };
                if let Some(result) = self.attempt_run_at(target, start, end, layout) {
                    return Some(result);
                }
            }
        }

        None
    }

    /// Locate the next command table. A `target` command name restricts
    /// results to tables containing that command.
    pub fn find(
        &self,
        target: Option<&str>,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<CommandTableResult> {
        let (_, _, result) = self.core.find_at_each(
            start,
            end,
            None,
            "Searching for command table",
            |i, upper| Ok(self.search_at(target, i, upper)),
        )?;
        Ok(result)
    }

    /// Iterate over all command tables in the data.
    pub fn finditer<'h>(
        &'h self,
        target: Option<&'h str>,
        start: Option<usize>,
        end: Option<usize>,
    ) -> impl Iterator<Item = CommandTableResult> + 'h {
        let begin = start.unwrap_or(self.core.start_offset);
        find_iter(begin, end, move |s, e| self.find(target, Some(s), e))
    }

    /// Render a result for display, one block per entry.
    pub fn result_str(result: &CommandTableResult) -> String {
        let mut ret = Self::result_header(result);

        for (i, entry) in result.entries.iter().enumerate() {
            ret.push_str(&format!(" [{i:>3}] @ 0x{:08x}\n", entry.address));
            ret.push_str(&format!("        name: {}\n", entry.name));
            ret.push_str(&format!("     maxargs: {}\n", entry.maxargs));
            ret.push_str(&format!("     cmd_rep: 0x{:08x}\n", entry.cmd_rep));
            ret.push_str(&format!("         cmd: 0x{:08x}\n", entry.cmd));

            if let Some(complete) = entry.complete {
                ret.push_str(&format!("    complete: 0x{complete:08x}\n"));
            }

            ret.push_str(&format!("       usage: {}\n", entry.usage.trim()));

            if let Some(help) = &entry.help {
                let help = help.replace('\n', "\n              ");
                ret.push_str(&format!("        help: {} {}\n", entry.name, help.trim()));
            }
        }
        ret
    }

    /// Render a one-line-per-command summary of a result.
    pub fn result_summary_str(result: &CommandTableResult) -> String {
        let mut ret = Self::result_header(result);
        for (i, entry) in result.entries.iter().enumerate() {
            ret.push_str(&format!(
                " [{i:>3}] @ 0x{:08x} - {}\n",
                entry.address, entry.name
            ));
        }
        ret
    }

    fn result_header(result: &CommandTableResult) -> String {
        let tbl_type = if result.is_subcmd_table {
            "Sub-command table"
        } else {
            "Command table"
        };

        format!(
            "{} @ 0x{:08x} (file offset 0x{:08x}) - {} bytes, {} entries\n   \
             CONFIG_SYS_LONGHELP={}, CONFIG_AUTO_COMPLETE={}\n\n",
            tbl_type,
            result.src_addr,
            result.src_off,
            result.src_size,
            result.entries.len(),
            result.layout.longhelp,
            result.layout.autocomplete,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunter::HunterOptions;
    use depthcharge_uboot::cmd_table::{CmdTableFields, entry_to_bytes};

    const BASE: u64 = 0x9ff4_0000;

    /// Build a blob holding a string pool followed by a command table.
    fn build_blob(layout: CmdTableLayout, names: &[&str]) -> Vec<u8> {
        let arch = Architecture::get("arm").unwrap();
        let mut blob = vec![0xf1u8; 16];

        // String pool: name and usage strings
        let mut name_ptrs = Vec::new();
        let mut usage_ptrs = Vec::new();
        for name in names {
            name_ptrs.push(BASE + blob.len() as u64);
            blob.extend_from_slice(name.as_bytes());
            blob.push(0);

            usage_ptrs.push(BASE + blob.len() as u64);
            blob.extend_from_slice(format!("{name} - does {name} things").as_bytes());
            blob.push(0);
        }

        // Align the table itself
        while blob.len() % 4 != 0 {
            blob.push(0xf1);
        }

        for (i, _) in names.iter().enumerate() {
            let entry = CmdTableFields {
                name: name_ptrs[i],
                maxargs: 4,
                cmd_rep: 1,
                cmd: BASE + 8, // anywhere within the data
                usage: usage_ptrs[i],
                help: layout.longhelp.then_some(usage_ptrs[i]),
                // Filler bytes are not a valid string, so a wrong-layout
                // probe cannot misread this pointer as help text
                complete: layout.autocomplete.then_some(BASE + 4),
            };
            blob.extend_from_slice(&entry_to_bytes(arch, &entry));
        }

        blob.extend_from_slice(&[0xf1u8; 32]);
        blob
    }

    #[test]
    fn test_find_table() {
        let layout = CmdTableLayout { longhelp: true, autocomplete: false };
        let names = ["bootm", "crc32", "md", "mw", "printenv", "setenv"];
        let blob = build_blob(layout, &names);

        let arch = Architecture::get("arm").unwrap();
        let hunter = CommandTableHunter::new(
            &blob,
            BASE,
            arch,
            &HunterOptions::default(),
            CmdTableOptions { longhelp: Some(true), autocomplete: Some(false), ..CmdTableOptions::default() },
        )
        .unwrap();

        let result = hunter.find(None, None, None).unwrap();
        assert_eq!(result.entries.len(), names.len());
        assert_eq!(result.src_size, names.len() * layout.entry_size(arch));

        for (entry, name) in result.entries.iter().zip(&names) {
            assert_eq!(&entry.name, name);
            assert_eq!(entry.maxargs, 4);
            assert!(entry.usage.contains(name));
            assert!(!entry.subcmd);
        }
    }

    #[test]
    fn test_layout_inference() {
        let layout = CmdTableLayout { longhelp: false, autocomplete: true };
        let names = ["dhcp", "ping", "tftpboot", "nfs", "mii"];
        let blob = build_blob(layout, &names);

        let arch = Architecture::get("arm").unwrap();
        let hunter = CommandTableHunter::new(
            &blob,
            BASE,
            arch,
            &HunterOptions::default(),
            CmdTableOptions::default(),
        )
        .unwrap();

        let result = hunter.find(None, None, None).unwrap();
        assert_eq!(result.layout, layout);
        assert_eq!(result.entries.len(), names.len());
    }

    #[test]
    fn test_below_threshold() {
        let layout = CmdTableLayout { longhelp: false, autocomplete: false };
        let blob = build_blob(layout, &["md", "mw"]);

        let arch = Architecture::get("arm").unwrap();
        let hunter = CommandTableHunter::new(
            &blob,
            BASE,
            arch,
            &HunterOptions::default(),
            CmdTableOptions::default(),
        )
        .unwrap();

        assert!(hunter.find(None, None, None).is_err());
    }

    #[test]
    fn test_target_name_filter() {
        let layout = CmdTableLayout { longhelp: false, autocomplete: false };
        let names = ["md", "mw", "nm", "mm", "cp"];
        let blob = build_blob(layout, &names);

        let arch = Architecture::get("arm").unwrap();
        let hunter = CommandTableHunter::new(
            &blob,
            BASE,
            arch,
            &HunterOptions::default(),
            CmdTableOptions { longhelp: Some(false), autocomplete: Some(false), ..CmdTableOptions::default() },
        )
        .unwrap();

        assert!(hunter.find(Some("cp"), None, None).is_ok());
        assert!(hunter.find(Some("bootm"), None, None).is_err());
    }
}
