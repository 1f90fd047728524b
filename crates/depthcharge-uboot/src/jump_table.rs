//! U-Boot's exported jump table and the global-data fields used to find it.
//!
//! The jump table (`gd->jt`) exports bootloader services to "standalone"
//! payloads. Its location is inferred from a read of the global data
//! structure: `gd->env_buf[32]` (a mostly-printable scratch buffer) is a
//! reliable neighbor, and the word directly preceding it is the `jt` pointer.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use depthcharge_arch::Architecture;

use crate::{Result, UBootError};

/// Sanity mask applied to candidate function pointers. See [`JtLocation`].
pub const DEFAULT_JT_ADDR_MASK: u64 = 0xffff_ffff_fc00_0000;

/// Number of bytes of `gd` to read when searching for `gd->jt`.
pub const DEFAULT_GD_READ_SIZE: usize = 384;

/// One function exported via the jump table.
#[derive(Clone, Debug)]
pub struct JumpTableExport {
    pub name: &'static str,
    pub return_type: &'static str,
    pub arg_types: &'static [&'static str],
}

const fn export(
    name: &'static str,
    return_type: &'static str,
    arg_types: &'static [&'static str],
) -> JumpTableExport {
    JumpTableExport { name, return_type, arg_types }
}

/// Functions exported in U-Boot's jump table, in table order.
///
/// Most absent features leave a dummy entry behind, so the order is stable
/// across configurations. `CONFIG_SYS_MALLOC_SIMPLE` builds omit `free()`;
/// `CONFIG_PHY_AQUANTIA` appends entries with no dummies and is not covered.
pub fn exports(sys_malloc_simple: bool) -> Vec<JumpTableExport> {
    let mut ret = vec![
        export("get_version", "unsigned long", &[]),
        export("getc", "int", &[]),
        export("tstc", "int", &[]),
        export("putc", "void", &["const char"]),
        export("puts", "void", &["const char *"]),
        export("printf", "int", &["const char *", "va_list"]),
        export("irq_install_handler", "void", &["int", "void*", "void *"]),
        export("irq_free_handler", "void", &["int"]),
        export("malloc", "void *", &["size_t"]),
    ];

    if !sys_malloc_simple {
        ret.push(export("free", "void", &["void *"]));
    }

    ret.extend([
        export("udelay", "void", &["unsigned long"]),
        export("get_timer", "unsigned long", &["unsigned long"]),
        export("vprintf", "int", &["const char *", "va_list"]),
        export("do_reset", "int", &["void *"]),
        export("env_get", "char  *", &["const char *"]),
        export("env_set", "int", &["const char *", "const char *"]),
        export(
            "simple_strtoul",
            "unsigned long",
            &["const char *", "const char **", "unsigned int"],
        ),
        export(
            "strict_strtoul",
            "int",
            &["const char *", "const char **", "unsigned int", "unsigned long *"],
        ),
        export(
            "simple_strtol",
            "long",
            &["const char *", "const char **", "unsigned int"],
        ),
        export("strcmp", "int", &["const char *", "const char *"]),
        export(
            "i2c_write",
            "int",
            &["unsigned char", "unsigned int", "int", "unsigned char *", "int"],
        ),
        export(
            "i2c_read",
            "int",
            &["unsigned char", "unsigned int", "int", "unsigned char *", "int"],
        ),
        export("spi_setup_slave", "void *", &["uint", "uint", "uint", "uint"]),
        export("spi_free_slave", "void", &["void *"]),
        export("spi_claim_bus", "int", &["void *"]),
        export("spi_release_bus", "void", &["void *"]),
        export("spi_xfer", "int", &["void *"]),
        export(
            "ustrtoul",
            "unsigned long",
            &["const char *", "char **", "unsigned int"],
        ),
        export(
            "ustrtoull",
            "unsigned long long",
            &["const char *", "char **", "unsigned int"],
        ),
        export("strcpy", "char *", &["char *", "const char *"]),
        export("mdelay", "void", &["unsigned long"]),
        export("memset", "void *", &["void *", "int", "size_t"]),
    ]);

    ret
}

/// Location information recovered from a read of the global data structure.
#[derive(Clone, Debug)]
pub struct JtLocation {
    /// Candidate `gd->jt` value.
    pub jt_addr: u64,
    /// Offset of `gd->new_gd` within the read region.
    pub new_gd_offset: usize,
    /// Offset of `gd->env_buf[32]` within the read region.
    pub env_buf_offset: usize,
    /// Fields preceding `new_gd`, recovered while walking backward.
    pub extras: BTreeMap<String, u64>,
    /// Whether the candidate pointer failed the address-mask sanity check.
    pub mask_check_failed: bool,
}

/// Search `gd_mem` for `gd->new_gd`: a pointer whose value equals
/// `gd_address` itself (post-relocation, gd points at its own copy).
fn find_new_gd(gd_address: u64, gd_mem: &[u8], arch: &Architecture) -> Result<usize> {
    debug!("Searching for gd->new_gd == 0x{gd_address:08x}");

    let mut offset = arch.word_size;
    let mut data = &gd_mem[arch.word_size..];

    while data.len() >= arch.word_size {
        let (value, rest) = arch.ptr_value_adv(data)?;
        if value == gd_address {
            return Ok(offset);
        }
        data = rest;
        offset += arch.word_size;
    }

    Err(UBootError::FieldNotFound("gd->new_gd"))
}

/// Search for `gd->env_buf[32]`: at least 32 consecutive bytes that are
/// either NUL or printable ASCII, starting on a word boundary past `new_gd`.
fn find_env_buf(gd_mem: &[u8], new_gd_offset: usize, arch: &Architecture) -> Result<usize> {
    let search_offset = new_gd_offset + arch.word_size;

    let mut valid_count = 0;
    let mut env_buf_offset = 0;

    for (i, &value) in gd_mem[search_offset..].iter().enumerate() {
        if value != 0 && !(0x20..0x80).contains(&value) {
            valid_count = 0;
            continue;
        }

        if valid_count == 0 {
            if !arch.is_word_aligned(i as u64) {
                continue;
            }
            env_buf_offset = i;
        }

        valid_count += 1;
        if valid_count == 32 {
            return Ok(env_buf_offset + search_offset);
        }
    }

    Err(UBootError::FieldNotFound("gd->env_buf[32]"))
}

/// Recover the global data fields directly preceding `new_gd`, in reverse,
/// up to the next conditionally-compiled field.
fn find_extras(
    gd_mem: &[u8],
    new_gd_offset: usize,
    arch: &Architecture,
) -> BTreeMap<String, u64> {
    // Fields preceding struct global_data *new_gd. Builds with
    // CONFIG_SYS_MEM_RESERVE_SECURE insert secure_ram here and shift the
    // rest; this walk-back mirrors the common layout.
    let fields: [(&str, usize); 7] = [
        ("reloc_off", arch.word_size),
        ("start_addr_sp", arch.word_size),
        ("irq_sp", arch.word_size),
        ("mon_len", arch.word_size),
        ("ram_size", arch.phys_size),
        ("relocaddr", arch.word_size),
        ("ram_top", arch.word_size),
    ];

    let mut ret = BTreeMap::new();
    let mut off = new_gd_offset;

    for (name, size) in fields {
        let Some(new_off) = off.checked_sub(size) else {
            break;
        };
        off = new_off;

        if let Ok(value) = arch.to_uint(&gd_mem[off..]) {
            debug!("Located gd->{name}. Value: 0x{value:08x}");
            ret.insert(name.to_string(), value);
        }
    }

    ret
}

/// Locate the candidate `gd->jt` pointer within a read of the global data
/// structure starting at `gd_address`.
pub fn locate(
    gd_address: u64,
    gd_mem: &[u8],
    arch: &Architecture,
    jt_addr_mask: u64,
) -> Result<JtLocation> {
    if !arch.is_word_aligned(gd_address) {
        return Err(UBootError::InvalidArgument(
            "Global data structure address must be word-aligned".to_string(),
        ));
    }

    let new_gd_offset = find_new_gd(gd_address, gd_mem, arch)?;
    debug!(
        "Located gd->new_gd @ 0x{:x} = gd + 0x{new_gd_offset:x}",
        gd_address + new_gd_offset as u64
    );

    let extras = find_extras(gd_mem, new_gd_offset, arch);

    let env_buf_offset = find_env_buf(gd_mem, new_gd_offset, arch)?;
    debug!(
        "Located gd->env_buf[32] @ 0x{:x}",
        gd_address + env_buf_offset as u64
    );

    // gd->jt is the field before env_buf. The mask check against relocaddr
    // (or gd itself) gives early warning before a bogus pointer is
    // dereferenced and crashes the device.
    let jt_offset = env_buf_offset - arch.word_size;
    let jt_addr = arch.ptr_value(&gd_mem[jt_offset..])?;

    let check_addr = extras.get("relocaddr").copied().unwrap_or(gd_address);
    let mask_check_failed = jt_addr & jt_addr_mask != check_addr & jt_addr_mask;
    if mask_check_failed {
        warn!(
            "Address mask suggests the gd->jt guess (0x{jt_addr:08x}) may be incorrect; \
             dereferencing it may crash the device"
        );
    }

    Ok(JtLocation {
        jt_addr,
        new_gd_offset,
        env_buf_offset,
        extras,
        mask_check_failed,
    })
}

/// One resolved jump table entry.
#[derive(Clone, Debug)]
pub struct JumpTableEntry {
    pub address: u64,
    pub name: String,
    pub return_type: String,
    pub arg_types: Vec<String>,
}

/// Parse the function pointers read from the jump table itself.
///
/// `expected_masked_addr` is the pre-masked comparison value from
/// [`locate`]'s sanity check; entries failing it are kept but warned about.
pub fn parse_entries(
    table_mem: &[u8],
    arch: &Architecture,
    sys_malloc_simple: bool,
    jt_addr_mask: u64,
    expected_masked_addr: u64,
) -> Result<Vec<JumpTableEntry>> {
    let mut entries = Vec::new();
    let mut data = table_mem;

    for entry in exports(sys_malloc_simple) {
        let (fn_ptr, rest) = arch.ptr_value_adv(data)?;
        data = rest;

        if fn_ptr & jt_addr_mask != expected_masked_addr {
            warn!(
                "{}() function pointer (0x{fn_ptr:08x}) failed mask check - may be incorrect",
                entry.name
            );
        }

        entries.push(JumpTableEntry {
            address: fn_ptr,
            name: entry.name.to_string(),
            return_type: entry.return_type.to_string(),
            arg_types: entry.arg_types.iter().map(|s| s.to_string()).collect(),
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports() {
        let full = exports(false);
        assert_eq!(full[0].name, "get_version");
        assert!(full.iter().any(|e| e.name == "free"));
        assert_eq!(full.last().unwrap().name, "memset");

        let simple = exports(true);
        assert!(!simple.iter().any(|e| e.name == "free"));
        assert_eq!(simple.len(), full.len() - 1);
    }

    /// Build a synthetic gd region: leading fields, the extras run,
    /// new_gd, flags word, jt pointer, then a printable env_buf.
    fn synthetic_gd(gd_address: u64, jt_addr: u64, arch: &Architecture) -> Vec<u8> {
        let mut gd = Vec::new();

        gd.extend_from_slice(&arch.int_to_bytes(0xdead_0000)); // bd pointer
        gd.extend_from_slice(&arch.int_to_bytes(0x0012_3400)); // flags
        gd.extend_from_slice(&arch.int_to_bytes(115_200)); // baudrate

        // Extras, in forward order
        gd.extend_from_slice(&arch.int_to_bytes(0x9fff_0000)); // ram_top
        gd.extend_from_slice(&arch.int_to_bytes(0x9ff4_7000)); // relocaddr
        gd.extend_from_slice(&arch.int_to_bytes(0x2000_0000)); // ram_size
        gd.extend_from_slice(&arch.int_to_bytes(0x0008_0000)); // mon_len
        gd.extend_from_slice(&arch.int_to_bytes(0x9ef4_4ea0)); // irq_sp
        gd.extend_from_slice(&arch.int_to_bytes(0x9ef4_4e90)); // start_addr_sp
        gd.extend_from_slice(&arch.int_to_bytes(0x1874_7000)); // reloc_off

        gd.extend_from_slice(&arch.int_to_bytes(gd_address)); // new_gd
        gd.extend_from_slice(&arch.int_to_bytes(0x9fe0_0000)); // env_addr
        gd.extend_from_slice(&arch.int_to_bytes(jt_addr)); // jt

        gd.extend_from_slice(b"stdin=serial\0\0\0\0stdout=serial\0\0\0"); // env_buf[32]
        gd.extend_from_slice(&arch.int_to_bytes(0));
        gd
    }

    #[test]
    fn test_locate() {
        let arch = Architecture::get("arm").unwrap();
        let gd_address = 0x9ef4_4e00;
        let jt_addr = 0x9ff5_1000;

        let gd_mem = synthetic_gd(gd_address, jt_addr, arch);
        let loc = locate(gd_address, &gd_mem, arch, DEFAULT_JT_ADDR_MASK).unwrap();

        assert_eq!(loc.jt_addr, jt_addr);
        assert_eq!(loc.new_gd_offset, 40);
        assert_eq!(loc.env_buf_offset, 52);
        assert_eq!(loc.extras["relocaddr"], 0x9ff4_7000);
        assert_eq!(loc.extras["reloc_off"], 0x1874_7000);
        assert!(!loc.mask_check_failed);
    }

    #[test]
    fn test_locate_mask_failure() {
        let arch = Architecture::get("arm").unwrap();
        let gd_address = 0x9ef4_4e00;

        // A jt candidate nowhere near relocaddr trips the sanity check
        let gd_mem = synthetic_gd(gd_address, 0x0000_1000, arch);
        let loc = locate(gd_address, &gd_mem, arch, DEFAULT_JT_ADDR_MASK).unwrap();
        assert!(loc.mask_check_failed);
    }

    #[test]
    fn test_locate_unaligned() {
        let arch = Architecture::get("arm").unwrap();
        assert!(locate(0x9ef4_4e01, &[0u8; 64], arch, DEFAULT_JT_ADDR_MASK).is_err());
    }

    #[test]
    fn test_parse_entries() {
        let arch = Architecture::get("arm").unwrap();
        let count = exports(false).len();

        let mut table = Vec::new();
        for i in 0..count {
            table.extend_from_slice(&arch.int_to_bytes(0x9ff4_0000 + (i as u64) * 0x40));
        }

        let entries = parse_entries(
            &table,
            arch,
            false,
            DEFAULT_JT_ADDR_MASK,
            0x9ff4_0000 & DEFAULT_JT_ADDR_MASK,
        )
        .unwrap();

        assert_eq!(entries.len(), count);
        assert_eq!(entries[0].name, "get_version");
        assert_eq!(entries[0].address, 0x9ff4_0000);
        assert_eq!(entries[1].address, 0x9ff4_0040);
    }
}
