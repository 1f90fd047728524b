//! U-Boot environment variable parsing, expansion, and binary image handling.
//!
//! U-Boot is remarkably permissive about variable naming (`setenv '' :)` is
//! legal), so the binary-image patterns here accept any printable name byte
//! other than `=`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use regex::bytes::Regex as BytesRegex;
use tracing::warn;

use depthcharge_arch::Architecture;

use crate::{Result, UBootError};

/// Parsed environment: variable name to (unexpanded) definition.
pub type Environment = BTreeMap<String, String>;

static VAR_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(.*?)\}|\$([^\$\s\{][^\$\s]*)").unwrap());

/// Pattern matching a single `NAME=VALUE\0` definition stored in NV memory.
pub fn raw_var_regex() -> BytesRegex {
    BytesRegex::new(
        r"(?s-u)(?P<name>[\x20-\x3c\x3e-\x7f]+)=(?P<value>[\x09\x0a\x0d\x20-\x7f]+)\x00",
    )
    .unwrap()
}

/// Pattern matching a run of consecutive stored variable definitions, bounded
/// by `min_entries` and (optionally) `max_entries`.
pub fn raw_regex(min_entries: usize, max_entries: Option<usize>) -> BytesRegex {
    let max = max_entries.map_or(String::new(), |m| m.to_string());
    let pattern = format!(
        r"(?s-u)([\x20-\x3c\x3d-\x7f]+=[\x20-\x7f]+\x00){{{min_entries},{max}}}"
    );
    BytesRegex::new(&pattern).unwrap()
}

/// Parse `printenv` output into an [`Environment`].
///
/// A value ending in `\` continues on the next line. Unparseable lines and
/// the trailing "Environment size:" report are skipped.
pub fn parse(text: &str) -> Result<Environment> {
    let mut results = Environment::new();
    let mut prev_name: Option<String> = None;

    for line in text.lines() {
        if let Some(name) = prev_name.take() {
            let value = results.get_mut(&name).unwrap();
            value.push('\n');
            value.push_str(line);
            if line.ends_with('\\') {
                prev_name = Some(name);
            }
            continue;
        }

        if line.is_empty() || line.starts_with("Environment size: ") {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };

        if value.ends_with('\\') {
            prev_name = Some(name.to_string());
        }
        results.insert(name.to_string(), value.to_string());
    }

    if results.is_empty() {
        return Err(UBootError::NoEnvironment);
    }

    Ok(results)
}

/// Parse an environment carved from flash or memory. `data` must begin at
/// the variable definitions, past any `env_t` CRC/flags header.
pub fn parse_raw(data: &[u8]) -> Result<Environment> {
    let mut results = Environment::new();

    for caps in raw_var_regex().captures_iter(data) {
        let name = String::from_utf8_lossy(&caps["name"]).into_owned();
        let value = String::from_utf8_lossy(&caps["value"]).into_owned();
        results.insert(name, value);
    }

    if results.is_empty() {
        return Err(UBootError::NoEnvironment);
    }

    Ok(results)
}

/// Controls for [`expand_variable`].
#[derive(Clone, Copy, Debug)]
pub struct ExpandOptions {
    /// Maximum expansion passes before giving up.
    pub limit: usize,
    /// Warn (rather than fail) when a referenced variable is undefined.
    pub warn_only: bool,
    /// Suppress the undefined-variable warning.
    pub quiet: bool,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            warn_only: true,
            quiet: false,
        }
    }
}

/// Return the definition of `to_expand` with all `${NAME}` and `$NAME`
/// references recursively substituted to a fixpoint.
pub fn expand_variable(env: &Environment, to_expand: &str, opts: &ExpandOptions) -> Result<String> {
    let mut value = env
        .get(to_expand)
        .ok_or_else(|| UBootError::UndefinedVariable(to_expand.to_string()))?
        .clone();

    let mut settled = false;
    for _ in 0..opts.limit {
        let prev = value.clone();

        for caps in VAR_NAME_RE.captures_iter(&prev) {
            let (var_name, braced) = match (caps.get(1), caps.get(2)) {
                (Some(m), _) => (m.as_str(), true),
                (_, Some(m)) => (m.as_str(), false),
                _ => continue,
            };

            if let Some(expansion) = env.get(var_name) {
                let reference = if braced {
                    format!("${{{var_name}}}")
                } else {
                    format!("${var_name}")
                };
                value = value.replace(&reference, expansion);
            }
        }

        if prev == value {
            settled = true;
            break;
        }
    }

    if !settled {
        return Err(UBootError::ExpansionLimit(to_expand.to_string()));
    }

    // Any references left at this point have no definition
    if let Some(caps) = VAR_NAME_RE.captures(&value) {
        let var_name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        if opts.warn_only {
            if !opts.quiet {
                warn!(
                    "No definition for environment variable \"{var_name}\" \
                     found when expanding \"{to_expand}\""
                );
            }
        } else {
            return Err(UBootError::UndefinedVariable(var_name.to_string()));
        }
    }

    Ok(value)
}

/// Return a copy of `env` with every definition fully expanded.
pub fn expand(env: &Environment, opts: &ExpandOptions) -> Result<Environment> {
    let mut ret = Environment::new();
    for name in env.keys() {
        ret.insert(name.clone(), expand_variable(env, name, opts)?);
    }
    Ok(ret)
}

/// Load an environment from a `printenv`-formatted text file.
pub fn load(path: &Path) -> Result<Environment> {
    parse(&fs::read_to_string(path)?)
}

/// Save an environment as `printenv`-formatted text.
pub fn save(path: &Path, env: &Environment) -> Result<()> {
    let mut text = String::new();
    for (name, value) in env {
        text.push_str(name);
        text.push('=');
        text.push_str(value);
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

/// Metadata recovered alongside a raw environment image.
#[derive(Clone, Debug, Default)]
pub struct RawMetadata {
    /// CRC32 value read from the `env_t` header, if one was present.
    pub crc: Option<u32>,
    /// Redundant-environment flags byte, if present.
    pub flags: Option<u8>,
    /// CRC32 computed over the post-header payload.
    pub actual_crc: Option<u32>,
    /// Payload size in bytes (excluding header).
    pub size: usize,
}

/// Load an environment previously carved from a binary or produced by
/// [`save_raw`]. The environment (or its header) must begin at offset 0.
pub fn load_raw(
    path: &Path,
    arch: &Architecture,
    has_crc: bool,
    has_flags: bool,
) -> Result<(Environment, RawMetadata)> {
    let data = fs::read(path)?;
    let mut metadata = RawMetadata::default();

    let mut start = 0;
    if has_crc {
        if data.len() < 5 {
            return Err(UBootError::NoEnvironment);
        }
        let header: [u8; 4] = data[0..4].try_into().unwrap();
        let crc = match arch.endianness {
            depthcharge_arch::Endianness::Little => u32::from_le_bytes(header),
            depthcharge_arch::Endianness::Big => u32::from_be_bytes(header),
        };
        metadata.crc = Some(crc);
        start += 4;

        if has_flags {
            metadata.flags = Some(data[start]);
            start += 1;
        }

        metadata.actual_crc = Some(crc32fast::hash(&data[start..]));
    }

    let payload = &data[start..];
    metadata.size = payload.len();
    let env = parse_raw(payload)?;
    Ok((env, metadata))
}

/// Convert `env` to the binary format used in non-volatile storage.
///
/// `size` must match the target's `CONFIG_ENV_SIZE`; the definitions are
/// zero-padded to this length before the CRC32 header is computed over them.
/// A `flags` byte is emitted only for redundant-environment layouts. With
/// `no_header`, only the padded payload is returned.
pub fn create_raw(
    env: &Environment,
    size: usize,
    arch: &Architecture,
    flags: Option<u8>,
    no_header: bool,
) -> Result<Vec<u8>> {
    let mut env_bin = Vec::with_capacity(size);
    for (name, value) in env {
        env_bin.extend_from_slice(name.as_bytes());
        env_bin.push(b'=');
        env_bin.extend_from_slice(value.as_bytes());
        env_bin.push(0);
    }

    let mut header_len = 0;
    if !no_header {
        header_len = 4 + usize::from(flags.is_some());
    }

    let payload_size = size.checked_sub(header_len).unwrap_or(0);
    if env_bin.len() > payload_size {
        return Err(UBootError::EnvironmentTooLarge {
            contents: env_bin.len() + header_len,
            size,
        });
    }
    env_bin.resize(payload_size, 0);

    if no_header {
        return Ok(env_bin);
    }

    let mut ret = Vec::with_capacity(size);
    ret.extend_from_slice(&arch.value_to_bytes(u64::from(crc32fast::hash(&env_bin)), 4));
    if let Some(flags) = flags {
        ret.push(flags);
    }
    ret.extend_from_slice(&env_bin);
    Ok(ret)
}

/// Write a binary environment image created by [`create_raw`] to a file.
pub fn save_raw(
    path: &Path,
    env: &Environment,
    size: usize,
    arch: &Architecture,
    flags: Option<u8>,
    no_header: bool,
) -> Result<()> {
    let data = create_raw(env, size, arch, flags, no_header)?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> Environment {
        let mut env = Environment::new();
        env.insert("loadaddr".into(), "0x82000000".into());
        env.insert("kernel_addr".into(), "${loadaddr}".into());
        env.insert("bootcmd".into(), "bootm $kernel_addr - ${fdt_addr}".into());
        env.insert("fdt_addr".into(), "0x83000000".into());
        env
    }

    #[test]
    fn test_parse() {
        let text = "loadaddr=0x82000000\nbootcmd=run xyz\n\nEnvironment size: 41/8188 bytes\n";
        let env = parse(text).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env["loadaddr"], "0x82000000");
        assert_eq!(env["bootcmd"], "run xyz");
    }

    #[test]
    fn test_parse_continuation() {
        let text = "multi=first \\\nsecond \\\nthird\nother=1\n";
        let env = parse(text).unwrap();
        assert_eq!(env["multi"], "first \\\nsecond \\\nthird");
        assert_eq!(env["other"], "1");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("\n\n").is_err());
    }

    #[test]
    fn test_expand_variable() {
        let env = sample_env();
        let opts = ExpandOptions::default();

        assert_eq!(
            expand_variable(&env, "kernel_addr", &opts).unwrap(),
            "0x82000000"
        );
        assert_eq!(
            expand_variable(&env, "bootcmd", &opts).unwrap(),
            "bootm 0x82000000 - 0x83000000"
        );
    }

    #[test]
    fn test_expand_undefined() {
        let mut env = Environment::new();
        env.insert("a".into(), "${nope}".into());

        let lax = ExpandOptions::default();
        assert_eq!(expand_variable(&env, "a", &lax).unwrap(), "${nope}");

        let strict = ExpandOptions {
            warn_only: false,
            ..ExpandOptions::default()
        };
        assert!(expand_variable(&env, "a", &strict).is_err());
    }

    #[test]
    fn test_expand_limit() {
        let mut env = Environment::new();
        env.insert("a".into(), "${b}".into());
        env.insert("b".into(), "${a}".into());

        let opts = ExpandOptions::default();
        assert!(matches!(
            expand_variable(&env, "a", &opts),
            Err(UBootError::ExpansionLimit(_))
        ));
    }

    #[test]
    fn test_raw_round_trip() {
        let arch = Architecture::get("arm").unwrap();
        let env = sample_env();

        let image = create_raw(&env, 0x1000, arch, None, false).unwrap();
        assert_eq!(image.len(), 0x1000);

        let crc = u32::from_le_bytes(image[0..4].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&image[4..]));

        let parsed = parse_raw(&image[4..]).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_raw_with_flags() {
        let arch = Architecture::get("arm").unwrap();
        let env = sample_env();

        let image = create_raw(&env, 0x1000, arch, Some(0x0a), false).unwrap();
        assert_eq!(image.len(), 0x1000);
        assert_eq!(image[4], 0x0a);

        let crc = u32::from_le_bytes(image[0..4].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&image[5..]));
    }

    #[test]
    fn test_create_raw_too_large() {
        let arch = Architecture::get("arm").unwrap();
        let env = sample_env();
        assert!(matches!(
            create_raw(&env, 16, arch, None, false),
            Err(UBootError::EnvironmentTooLarge { .. })
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.txt");
        let env = sample_env();

        save(&path, &env).unwrap();
        assert_eq!(load(&path).unwrap(), env);
    }

    #[test]
    fn test_load_raw_round_trip() {
        let arch = Architecture::get("arm").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.bin");
        let env = sample_env();

        save_raw(&path, &env, 0x800, arch, Some(3), false).unwrap();
        let (loaded, metadata) = load_raw(&path, arch, true, true).unwrap();

        assert_eq!(loaded, env);
        assert_eq!(metadata.flags, Some(3));
        assert_eq!(metadata.crc, metadata.actual_crc);
        assert_eq!(metadata.size, 0x800 - 5);
    }
}
