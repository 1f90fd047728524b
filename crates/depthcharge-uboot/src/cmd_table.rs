//! U-Boot command table ("linker list") layout definitions.
//!
//! Console commands are declared with the `U_BOOT_CMD` macro family and laid
//! out as consecutive `cmd_tbl_s` structures:
//!
//! ```c
//! struct cmd_tbl_s {
//!     char *name;
//!     int  maxargs;
//!     int (*cmd_rep)(struct cmd_tbl_s *, ...);
//!     int (*cmd)(struct cmd_tbl_s *, ...);
//!     char *usage;
//! #ifdef CONFIG_SYS_LONGHELP
//!     char *help;
//! #endif
//! #ifdef CONFIG_AUTO_COMPLETE
//!     int (*complete)(int argc, ...);
//! #endif
//! };
//! ```

use depthcharge_arch::Architecture;

/// Which conditionally-compiled fields a command table carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdTableLayout {
    /// `CONFIG_SYS_LONGHELP`: a `help` text pointer follows `usage`.
    pub longhelp: bool,
    /// `CONFIG_AUTO_COMPLETE`: a completion handler pointer ends the entry.
    pub autocomplete: bool,
}

impl CmdTableLayout {
    /// All four possible layout permutations, in the probe order used when
    /// the build configuration is unknown.
    pub const PERMUTATIONS: [Self; 4] = [
        Self { longhelp: true, autocomplete: true },
        Self { longhelp: true, autocomplete: false },
        Self { longhelp: false, autocomplete: true },
        Self { longhelp: false, autocomplete: false },
    ];

    /// Size of one `cmd_tbl_s` entry in bytes, for the given architecture.
    pub fn entry_size(&self, arch: &Architecture) -> usize {
        let words = 5 + usize::from(self.longhelp) + usize::from(self.autocomplete);
        words * arch.word_size
    }
}

/// Field values of one `cmd_tbl_s` entry, for packing into bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct CmdTableFields {
    pub name: u64,
    pub maxargs: u64,
    pub cmd_rep: u64,
    pub cmd: u64,
    pub usage: u64,
    /// Present only under `CONFIG_SYS_LONGHELP`.
    pub help: Option<u64>,
    /// Present only under `CONFIG_AUTO_COMPLETE`.
    pub complete: Option<u64>,
}

/// Pack a `cmd_tbl_s` entry in the target byte order.
pub fn entry_to_bytes(arch: &Architecture, entry: &CmdTableFields) -> Vec<u8> {
    let mut ret = Vec::with_capacity(7 * arch.word_size);

    ret.extend_from_slice(&arch.int_to_bytes(entry.name));
    ret.extend_from_slice(&arch.int_to_bytes(entry.maxargs));
    ret.extend_from_slice(&arch.int_to_bytes(entry.cmd_rep));
    ret.extend_from_slice(&arch.int_to_bytes(entry.cmd));
    ret.extend_from_slice(&arch.int_to_bytes(entry.usage));

    if let Some(help) = entry.help {
        ret.extend_from_slice(&arch.int_to_bytes(help));
    }
    if let Some(complete) = entry.complete {
        ret.extend_from_slice(&arch.int_to_bytes(complete));
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size() {
        let arm = Architecture::get("arm").unwrap();
        let full = CmdTableLayout { longhelp: true, autocomplete: true };
        let minimal = CmdTableLayout { longhelp: false, autocomplete: false };

        assert_eq!(full.entry_size(arm), 28);
        assert_eq!(minimal.entry_size(arm), 20);

        let aarch64 = Architecture::get("aarch64").unwrap();
        assert_eq!(full.entry_size(aarch64), 56);
    }

    #[test]
    fn test_entry_to_bytes() {
        let arm = Architecture::get("arm").unwrap();
        let entry = CmdTableFields {
            name: 0x9ff50000,
            maxargs: 3,
            cmd_rep: 1,
            cmd: 0x9ff41234,
            usage: 0x9ff50010,
            help: Some(0x9ff50020),
            complete: None,
        };

        let packed = entry_to_bytes(arm, &entry);
        assert_eq!(packed.len(), 24);
        assert_eq!(&packed[0..4], &0x9ff50000u32.to_le_bytes());
        assert_eq!(&packed[4..8], &3u32.to_le_bytes());
        assert_eq!(&packed[20..24], &0x9ff50020u32.to_le_bytes());
    }
}
