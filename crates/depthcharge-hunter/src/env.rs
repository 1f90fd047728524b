//! U-Boot environment searches with `env_t` header recovery.

use std::fmt;

use regex::bytes::Regex;

use depthcharge_arch::{Architecture, Endianness};
use depthcharge_uboot::env::{self, Environment};

use crate::hunter::{HunterCore, HunterOptions, SearchResult, find_iter};
use crate::{HunterError, Result};

/// How a located environment is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvType {
    /// Hard-coded defaults compiled into U-Boot.
    BuiltIn,
    /// Stored in non-volatile memory behind a CRC32 header.
    Stored,
    /// Stored with the CRC32 header plus the redundant-environment flags
    /// byte (`CONFIG_SYS_REDUNDAND_ENVIRONMENT`, sic).
    StoredRedundant,
}

impl fmt::Display for EnvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BuiltIn => "Built-in environment",
            Self::Stored => "Stored environment",
            Self::StoredRedundant => "Stored redundant environment",
        };
        f.write_str(s)
    }
}

/// A located environment instance.
#[derive(Clone, Debug)]
pub struct EnvironmentResult {
    pub src_off: usize,
    pub src_addr: u64,
    pub src_size: usize,
    pub env_type: EnvType,
    /// Header CRC32, for stored environments.
    pub crc: Option<u32>,
    /// Redundant-environment flags byte.
    pub flags: Option<u8>,
    /// The raw `NAME=VALUE\0` payload, including padding.
    pub raw: Vec<u8>,
    /// Parsed variable definitions.
    pub vars: Environment,
    /// Architecture the header was decoded for.
    pub arch: &'static str,
}

impl SearchResult for EnvironmentResult {
    fn src_off(&self) -> usize {
        self.src_off
    }

    fn src_size(&self) -> usize {
        self.src_size
    }
}

/// Search parameters for [`EnvironmentHunter`].
#[derive(Clone, Copy, Debug)]
pub struct EnvOptions {
    /// Minimum number of `NAME=VALUE` entries to consider a match.
    pub min_entries: usize,
    pub max_entries: Option<usize>,
    /// Upper bound on `CONFIG_ENV_SIZE` when extending the CRC search. The
    /// default matches the largest sizes seen in defconfigs.
    pub env_size_max: usize,
    /// Whether the target uses the redundant-environment layout. `None`
    /// tries both.
    pub redundant_env: Option<bool>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            min_entries: 5,
            max_entries: None,
            env_size_max: 0x0010_0000,
            redundant_env: None,
        }
    }
}

/// Searches for U-Boot environments: built-in defaults, stored instances
/// (validated against their CRC32 header), and redundant-layout instances.
pub struct EnvironmentHunter<'d> {
    core: HunterCore<'d>,
    arch: &'static Architecture,
    env_regex: Regex,
    opts: EnvOptions,
}

impl<'d> EnvironmentHunter<'d> {
    pub fn new(
        data: &'d [u8],
        address: u64,
        arch: &'static Architecture,
        opts: &HunterOptions,
        env_opts: EnvOptions,
    ) -> Result<Self> {
        Ok(Self {
            core: HunterCore::new(data, address, opts)?,
            arch,
            env_regex: env::raw_regex(env_opts.min_entries, env_opts.max_entries),
            opts: env_opts,
        })
    }

    fn header_crc(&self, offset: usize, redundant: bool) -> Option<u32> {
        let header_len = if redundant { 5 } else { 4 };
        let crc_off = offset.checked_sub(header_len)?;
        let bytes: [u8; 4] = self.core.data.get(crc_off..crc_off + 4)?.try_into().ok()?;

        match self.arch.endianness {
            Endianness::Little => Some(u32::from_le_bytes(bytes)),
            Endianness::Big => Some(u32::from_be_bytes(bytes)),
        }
    }

    /// Attempt to recover an `env_t` header preceding the match at `offset`.
    ///
    /// The regex can bite one or more bytes early when trailing CRC bytes
    /// happen to be printable, so the candidate start is advanced up to the
    /// first `=` while looking for a CRC match. The environment's true size
    /// (`CONFIG_ENV_SIZE`) is found by extending the CRC over the zero
    /// padding until it matches the header value.
    fn recover_header(
        &self,
        offset: usize,
        min_size: usize,
        redundant: bool,
    ) -> Option<(usize, usize, u32)> {
        let data = self.core.data;

        // Not off-by-one: a variable may have a completely empty name
        let eq_rel = data[offset..offset + min_size].iter().position(|&b| b == b'=')?;
        let actual_offset_max = offset + eq_rel;

        for ao in offset..=actual_offset_max {
            let Some(expected_crc) = self.header_crc(ao, redundant) else {
                continue;
            };

            let used_end = (ao + min_size).min(data.len());
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&data[ao..used_end]);

            if used_end == ao + min_size && hasher.clone().finalize() == expected_crc {
                return Some((ao, min_size, expected_crc));
            }

            // Extend through the (padded) unused portion
            let max_end = (ao + self.opts.env_size_max).min(data.len());
            for i in used_end..max_end {
                hasher.update(&data[i..i + 1]);
                let crc = hasher.clone().finalize();
                if crc == expected_crc {
                    return Some((ao, i - ao + 1, crc));
                }
            }
        }

        None
    }

    fn search_at(&self, target: Option<&str>, start: usize, end: usize) -> Result<Option<(usize, usize, EnvironmentResult)>> {
        let data = self.core.data;
        let haystack = &data[start..end.min(data.len())];

        let Some(m) = self.env_regex.find(haystack) else {
            // The regex covered the full remaining range
            return Err(HunterError::not_found());
        };

        let offset = start + m.start();
        let size = m.len();

        // Decode the preceding header (if there is one) to determine the
        // true offset, size, CRC, and flags of the environment.
        let mut recovered = None;
        let mut redundant = false;

        match self.opts.redundant_env {
            Some(r) => {
                recovered = self.recover_header(offset, size, r);
                redundant = r;
            }
            None => {
                for r in [true, false] {
                    recovered = self.recover_header(offset, size, r);
                    if recovered.is_some() {
                        redundant = r;
                        break;
                    }
                }
            }
        }

        let (actual_off, actual_size, crc) = match recovered {
            Some((off, size, crc)) => (off, size, Some(crc)),
            // Either a built-in environment, or header recovery failed;
            // report what the regex matched.
            None => (offset, size, None),
        };

        let (env_type, flags) = match crc {
            None => (EnvType::BuiltIn, None),
            Some(_) if redundant => (
                EnvType::StoredRedundant,
                actual_off.checked_sub(1).map(|i| data[i]),
            ),
            Some(_) => (EnvType::Stored, None),
        };

        let raw = data[actual_off..(actual_off + actual_size).min(data.len())].to_vec();
        let vars = env::parse_raw(&raw).map_err(|_| HunterError::not_found())?;

        // Caller is looking for an environment containing a specific item
        if let Some(target) = target {
            if !target.is_empty() && !contains(&raw, target.as_bytes()) {
                return Err(HunterError::not_found());
            }
        }

        let result = EnvironmentResult {
            src_off: actual_off,
            src_addr: self.core.address + actual_off as u64,
            src_size: actual_size,
            env_type,
            crc,
            flags,
            raw,
            vars,
            arch: self.arch.name,
        };

        Ok(Some((actual_off, actual_size, result)))
    }

    /// Locate the next environment instance. A non-empty `target` restricts
    /// results to environments whose raw contents contain it.
    pub fn find(
        &self,
        target: Option<&str>,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<EnvironmentResult> {
        let (_, _, result) =
            self.core
                .find_at_each(start, end, None, "Searching for environment", |i, upper| {
                    self.search_at(target, i, upper)
                })?;
        Ok(result)
    }

    /// Iterate over all environment instances.
    pub fn finditer<'h>(
        &'h self,
        target: Option<&'h str>,
        start: Option<usize>,
        end: Option<usize>,
    ) -> impl Iterator<Item = EnvironmentResult> + 'h {
        let begin = start.unwrap_or(self.core.start_offset);
        find_iter(begin, end, move |s, e| self.find(target, Some(s), e))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len().max(1))
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunter::HunterOptions;
    use depthcharge_uboot::env::create_raw;

    fn canonical_env() -> Environment {
        let mut env = Environment::new();
        env.insert("addip".into(), "setenv bootargs ${bootargs} ip=${ipaddr}".into());
        env.insert("boot_dtb".into(), "bootm ${loadaddr} - ${dtb_addr}".into());
        env.insert("dtb_addr".into(), "0x83000000".into());
        env.insert("bootcmd".into(), "run mmcboot".into());
        env.insert("bootdelay".into(), "2".into());
        env.insert("ipaddr".into(), "192.168.0.42".into());
        env.insert("loadaddr".into(), "0x82000000".into());
        env.insert("mmcboot".into(), "mmc rescan; load mmc 0 ${loadaddr} zImage".into());
        env.insert("netmask".into(), "255.255.255.0".into());
        env.insert("serverip".into(), "192.168.0.10".into());
        env
    }

    fn random_data(len: usize, seed: u32) -> Vec<u8> {
        // Deterministic xorshift filler; NUL-free so it cannot terminate or
        // extend a neighboring string match.
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state % 0xfe) as u8 + 1
            })
            .map(|b| if (0x20..0x7f).contains(&b) { 0x81 } else { b })
            .collect()
    }

    fn arm() -> &'static Architecture {
        Architecture::get("arm").unwrap()
    }

    /// Five environment instances: two headerless copies, one stored with a
    /// plain header, and two stored redundant instances.
    fn build_blob() -> (Vec<u8>, Vec<usize>, usize) {
        let env = canonical_env();
        let headerless = create_raw(&env, 0, arm(), None, true).unwrap_or_else(|_| {
            // size 0 is a degenerate request; build unpadded manually
            let mut bin = Vec::new();
            for (name, value) in &env {
                bin.extend_from_slice(name.as_bytes());
                bin.push(b'=');
                bin.extend_from_slice(value.as_bytes());
                bin.push(0);
            }
            bin
        });
        let env_bin_len = headerless.len();

        let mut blob = Vec::new();
        let mut expected = Vec::new();

        blob.extend_from_slice(&random_data(31, 1));
        blob.push(0);

        expected.push(blob.len());
        blob.extend_from_slice(&headerless);

        blob.extend_from_slice(&random_data(63, 2));
        blob.push(0);

        expected.push(blob.len());
        blob.extend_from_slice(&headerless);

        blob.extend_from_slice(&random_data(1023, 3));
        blob.push(0);

        // Redundant env: header is CRC + flags
        expected.push(blob.len() + 5);
        blob.extend_from_slice(&create_raw(&env, 4096, arm(), Some(0x0a), false).unwrap());

        blob.extend_from_slice(&random_data(3, 4));
        blob.push(0);

        expected.push(blob.len() + 4);
        blob.extend_from_slice(&create_raw(&env, 1024, arm(), None, false).unwrap());

        blob.extend_from_slice(&random_data(64, 5));
        blob.push(0);

        // Second redundant copy with an older flags counter
        expected.push(blob.len() + 5);
        blob.extend_from_slice(&create_raw(&env, 2048, arm(), Some(0x04), false).unwrap());

        blob.extend_from_slice(&random_data(55, 6));
        blob.push(0);

        (blob, expected, env_bin_len)
    }

    #[test]
    fn test_finditer_recovers_all_instances() {
        let (blob, expected, env_bin_len) = build_blob();
        let hunter = EnvironmentHunter::new(
            &blob,
            0x2000,
            arm(),
            &HunterOptions::default(),
            EnvOptions::default(),
        )
        .unwrap();

        let results: Vec<EnvironmentResult> = hunter.finditer(None, None, None).collect();
        assert_eq!(results.len(), 5);

        for (result, &off) in results.iter().zip(&expected) {
            assert_eq!(result.src_off, off);
            assert_eq!(result.src_addr, 0x2000 + off as u64);
        }

        assert_eq!(results[0].env_type, EnvType::BuiltIn);
        assert_eq!(results[0].src_size, env_bin_len);
        assert_eq!(results[1].env_type, EnvType::BuiltIn);

        assert_eq!(results[2].env_type, EnvType::StoredRedundant);
        assert_eq!(results[2].flags, Some(0x0a));
        assert_eq!(results[2].src_size, 4096 - 5);

        assert_eq!(results[3].env_type, EnvType::Stored);
        assert_eq!(results[3].flags, None);
        assert_eq!(results[3].src_size, 1024 - 4);

        assert_eq!(results[4].env_type, EnvType::StoredRedundant);
        assert_eq!(results[4].flags, Some(0x04));
        assert_eq!(results[4].src_size, 2048 - 5);

        // Every stored result's header CRC matches its raw payload
        for result in &results {
            if let Some(crc) = result.crc {
                assert_eq!(crc, crc32fast::hash(&result.raw));
            }
            assert_eq!(result.vars["ipaddr"], "192.168.0.42");
        }
    }

    #[test]
    fn test_find_with_target() {
        let (blob, expected, _) = build_blob();
        let hunter = EnvironmentHunter::new(
            &blob,
            0x2000,
            arm(),
            &HunterOptions::default(),
            EnvOptions::default(),
        )
        .unwrap();

        let result = hunter.find(Some("ipaddr"), None, None).unwrap();
        assert_eq!(result.src_off, expected[0]);

        assert!(hunter.find(Some("not_in_environment"), None, None).is_err());
    }
}
