//! The top-level target interaction handle.
//!
//! A [`Context`] owns the console (and companion, if any), inspects the
//! target to determine which operations are available, and dispatches
//! memory/register/execution requests to the best-ranked implementation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use depthcharge_arch::Architecture;
use depthcharge_hunter::Stratagem;
use depthcharge_uboot::env::{self, Environment, ExpandOptions};
use depthcharge_uboot::{board, jump_table};

use crate::companion::Companion;
use crate::console::Console;
use crate::executor::{Executor, GoExecutor};
use crate::memory::data_abort::DataAbortReadOptions;
use crate::memory::patch::MemoryPatchList;
use crate::memory::reader::{MemoryReader, ReadOptions};
use crate::memory::writer::{MemoryWriter, WriteOptions};
use crate::memory::{
    CpCrashMemoryReader, CpMemoryWriter, Crc32MemoryReader, Crc32MemoryWriter, GoMemoryReader,
    I2cMemoryReader, I2cMemoryWriter, ItestMemoryReader, LoadbMemoryWriter, LoadxMemoryWriter,
    LoadyMemoryWriter, MdMemoryReader, MmMemoryReader, MmMemoryWriter, MwMemoryWriter,
    NmMemoryReader, NmMemoryWriter, SetexprMemoryReader,
};
use crate::operation::{
    DEFAULT_EXCLUDE_REQTS, Operation, OperationSet, RankHints, Requirements,
};
use crate::payload_map::{PayloadMap, PayloadMapOptions};
use crate::register::{CrashRegisterReader, GoRegisterReader, RegisterReader};
use crate::strutil::parse_int;
use crate::target::{CommandInfo, GlobalData, JumpTable, JumpTableEntryInfo, PostRebootHook, Target};
use crate::{Error, Result};

static HELP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<cmd>[a-zA-Z0-9_]+)\s*-?\s*(?P<summary>.*)").unwrap());

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^U-Boot\s+[0-9]{4}\.[0-9]{2}").unwrap());

/// Where payloads are staged in target memory.
#[derive(Clone, Debug)]
pub enum PayloadBase {
    /// Resolve an environment variable expression (recursively expanded).
    EnvVar(String),
    /// Use an absolute address.
    Address(u64),
}

/// Context construction parameters.
pub struct ContextOptions {
    /// Architecture name. Defaults to the 32-bit little-endian generic.
    pub arch: Option<String>,
    /// Permit operations that crash or reboot the platform.
    pub allow_reboot: bool,
    /// Permit payload deployment and execution.
    pub allow_deploy: bool,
    /// Assume payloads are already resident; implies execution is allowed.
    /// The target will crash if that assumption is wrong.
    pub skip_deploy: bool,
    /// Also retrieve per-command help text during inspection.
    pub detailed_help: bool,
    /// Payload staging base. Defaults to `$loadaddr` plus a 32 MiB offset.
    pub payload_base: Option<PayloadBase>,
    pub payload_offset: Option<u64>,
    pub payload_map: PayloadMapOptions,
    /// Invoked instead of a plain interrupt after each crash-induced reset.
    pub post_reboot: Option<PostRebootHook>,
    /// Commands to run before each crash-inducing word read.
    pub data_abort: DataAbortReadOptions,
    /// Skip `bdinfo` / jump-table inspection during construction.
    pub skip_bdinfo: bool,
    pub skip_gd_jt: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            arch: None,
            allow_reboot: false,
            allow_deploy: false,
            skip_deploy: false,
            detailed_help: false,
            payload_base: None,
            payload_offset: None,
            payload_map: PayloadMapOptions::default(),
            post_reboot: None,
            data_abort: DataAbortReadOptions::default(),
            skip_bdinfo: false,
            skip_gd_jt: false,
        }
    }
}

/// The JSON "device configuration file" produced by [`Context::save`],
/// letting later sessions skip target inspection.
#[derive(Serialize, Deserialize)]
pub struct DeviceConfig {
    pub arch: String,
    pub baudrate: u32,
    pub version: Vec<String>,
    pub prompt: Option<String>,
    pub commands: BTreeMap<String, CommandInfo>,
    pub env_vars: Environment,
    pub payload_base: u64,
    pub payload_offset: u64,
    pub gd: GlobalData,
    pub depthcharge_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depthcharge_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depthcharge_comment: Option<String>,
}

/// Kinds of operations a [`Context`] collects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    MemoryReader,
    MemoryWriter,
    RegisterReader,
    Executor,
}

/// The built-in operation catalog: every implementation this build knows,
/// with its declarative requirements. Useful for inspecting what a build
/// supports without a target attached.
pub const CATALOG: &[(&str, OpKind, &Requirements)] = &[
    ("MdMemoryReader", OpKind::MemoryReader, &MdMemoryReader::REQUIRED),
    ("MmMemoryReader", OpKind::MemoryReader, &MmMemoryReader::REQUIRED),
    ("NmMemoryReader", OpKind::MemoryReader, &NmMemoryReader::REQUIRED),
    ("CRC32MemoryReader", OpKind::MemoryReader, &Crc32MemoryReader::REQUIRED),
    ("ItestMemoryReader", OpKind::MemoryReader, &ItestMemoryReader::REQUIRED),
    ("SetexprMemoryReader", OpKind::MemoryReader, &SetexprMemoryReader::REQUIRED),
    ("GoMemoryReader", OpKind::MemoryReader, &GoMemoryReader::REQUIRED),
    ("I2CMemoryReader", OpKind::MemoryReader, &I2cMemoryReader::REQUIRED),
    ("CpCrashMemoryReader", OpKind::MemoryReader, &CpCrashMemoryReader::REQUIRED),
    ("MwMemoryWriter", OpKind::MemoryWriter, &MwMemoryWriter::REQUIRED),
    ("MmMemoryWriter", OpKind::MemoryWriter, &MmMemoryWriter::REQUIRED),
    ("NmMemoryWriter", OpKind::MemoryWriter, &NmMemoryWriter::REQUIRED),
    ("LoadbMemoryWriter", OpKind::MemoryWriter, &LoadbMemoryWriter::REQUIRED),
    ("LoadxMemoryWriter", OpKind::MemoryWriter, &LoadxMemoryWriter::REQUIRED),
    ("LoadyMemoryWriter", OpKind::MemoryWriter, &LoadyMemoryWriter::REQUIRED),
    ("CpMemoryWriter", OpKind::MemoryWriter, &CpMemoryWriter::REQUIRED),
    ("CRC32MemoryWriter", OpKind::MemoryWriter, &Crc32MemoryWriter::REQUIRED),
    ("I2CMemoryWriter", OpKind::MemoryWriter, &I2cMemoryWriter::REQUIRED),
    ("GoRegisterReader", OpKind::RegisterReader, &GoRegisterReader::REQUIRED),
    ("GoExecutor", OpKind::Executor, &GoExecutor::REQUIRED),
];

/// Top-level handle coordinating console I/O, target inspection, payload
/// deployment, and operation dispatch. One per session; all target
/// interaction is serialized through it.
pub struct Context {
    pub target: Target,
    memory_readers: OperationSet<dyn MemoryReader>,
    memory_writers: OperationSet<dyn MemoryWriter>,
    register_readers: OperationSet<dyn RegisterReader>,
    executors: OperationSet<dyn Executor>,
    payload_base: u64,
    payload_offset: u64,
    data_abort: DataAbortReadOptions,
}

impl Context {
    /// Attach to a target, inspect it, and enumerate available operations.
    pub fn new(
        console: Console,
        companion: Option<Companion>,
        mut opts: ContextOptions,
    ) -> Result<Self> {
        let arch_name = opts.arch.clone().unwrap_or_else(|| "generic".to_string());
        let arch = Architecture::get(&arch_name)?;
        debug!("Architecture: {}", arch.description);

        let payloads = PayloadMap::new(arch, 0, &opts.payload_map);
        let mut target = Target::new(console, companion, arch, payloads);

        target.allow_reboot = opts.allow_reboot;
        target.post_reboot = opts.post_reboot.take();

        // Reconcile deployment behavior: an explicit allow_deploy wins;
        // skip_deploy alone still implies execution.
        target.allow_deploy_exec = opts.allow_deploy || opts.skip_deploy;
        let skip_deploy = opts.skip_deploy && !opts.allow_deploy;
        opts.payload_map.skip_deploy = skip_deploy;

        let mut ctx = Self {
            target,
            memory_readers: OperationSet::new("MemoryReader"),
            memory_writers: OperationSet::new("MemoryWriter"),
            register_readers: OperationSet::new("RegisterReader"),
            executors: OperationSet::new("Executor"),
            payload_base: 0,
            payload_offset: 0,
            data_abort: opts.data_abort.clone(),
        };

        ctx.perform_active_init(&opts)?;

        if ctx.target.arch.is_generic() {
            warn!(
                "Using {} architecture. Functionality may be limited without a more \
                 specific architecture.",
                ctx.target.arch.name
            );
        }

        Ok(ctx)
    }

    /// Re-create a context from a device configuration file, skipping
    /// inspection of anything the file already records.
    pub fn load(
        path: &Path,
        console: Console,
        companion: Option<Companion>,
        mut opts: ContextOptions,
    ) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(&fs::read_to_string(path)?)?;

        if opts.arch.is_none() {
            opts.arch = Some(config.arch.clone());
        }
        if opts.payload_base.is_none() {
            opts.payload_base = Some(PayloadBase::Address(config.payload_base));
            opts.payload_offset = Some(config.payload_offset);
        }

        let mut console = console;
        if console.prompt.is_none() {
            console.prompt = config.prompt.clone();
        }

        // Pre-populate the caches the active init would otherwise query
        let arch = Architecture::get(opts.arch.as_deref().unwrap_or("generic"))?;
        let payloads = PayloadMap::new(arch, 0, &opts.payload_map);
        let mut target = Target::new(console, companion, arch, payloads);
        target.cmds = config.commands;
        target.env = config.env_vars;
        target.version = config.version;
        target.gd = config.gd;
        target.gd.inspected = true;
        target.allow_reboot = opts.allow_reboot;
        target.post_reboot = opts.post_reboot.take();
        target.allow_deploy_exec = opts.allow_deploy || opts.skip_deploy;

        let mut ctx = Self {
            target,
            memory_readers: OperationSet::new("MemoryReader"),
            memory_writers: OperationSet::new("MemoryWriter"),
            register_readers: OperationSet::new("RegisterReader"),
            executors: OperationSet::new("Executor"),
            payload_base: 0,
            payload_offset: 0,
            data_abort: opts.data_abort.clone(),
        };
        ctx.perform_active_init(&opts)?;
        Ok(ctx)
    }

    /// Serialize the target snapshot to a device configuration file.
    pub fn save(&self, path: &Path, timestamp: bool, comment: Option<&str>) -> Result<()> {
        info!("Saving device configuration state to {}", path.display());

        let config = DeviceConfig {
            arch: self.target.arch.name.to_string(),
            baudrate: self.target.console.baudrate(),
            version: self.target.version.clone(),
            prompt: self.target.console.prompt.clone(),
            commands: self.target.cmds.clone(),
            env_vars: self.target.env.clone(),
            payload_base: self.payload_base,
            payload_offset: self.payload_offset,
            gd: self.target.gd.clone(),
            depthcharge_version: env!("CARGO_PKG_VERSION").to_string(),
            depthcharge_timestamp: timestamp.then(|| chrono::Utc::now().to_rfc3339()),
            depthcharge_comment: comment.map(String::from),
        };

        fs::write(path, serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }

    fn perform_active_init(&mut self, opts: &ContextOptions) -> Result<()> {
        // Attach to the console, discovering the prompt if necessary
        self.target.interrupt()?;

        self.commands(true, opts.detailed_help)?;
        self.environment(true)?;

        // Establish the payload staging area
        match self.resolve_payload_base(opts) {
            Ok((base, offset)) => {
                self.payload_base = base;
                self.payload_offset = offset;
                self.target.payloads =
                    PayloadMap::new(self.target.arch, base + offset, &opts.payload_map);
            }
            Err(e) => {
                warn!("Disabling payload deployment and execution due to error(s): {e}");
                self.target.allow_deploy_exec = false;
            }
        }

        self.version(true)?;

        // Enumerate operations in dependency order: writers are required to
        // deploy the payloads that readers/executors may rely upon
        self.enumerate_memory_writers();
        self.enumerate_memory_readers();
        self.enumerate_executors();
        self.enumerate_register_readers();

        // Best-effort inspection of the global data structure
        if let Err(e) = self.uboot_global_data(true, opts.skip_bdinfo, opts.skip_gd_jt) {
            warn!("{e}");
        }

        Ok(())
    }

    fn resolve_payload_base(&mut self, opts: &ContextOptions) -> Result<(u64, u64)> {
        let default_base = opts.payload_base.is_none();
        let base = match opts.payload_base.clone() {
            Some(PayloadBase::Address(addr)) => addr,
            Some(PayloadBase::EnvVar(name)) => self.expand_base_var(&name)?,
            None => {
                info!("Using default payload base address: ${{loadaddr}} + 32MiB");
                self.expand_base_var("loadaddr")?
            }
        };

        let offset = opts
            .payload_offset
            .unwrap_or(if default_base { 32 * 1024 * 1024 } else { 0 });

        info!(
            "Payload base (0x{base:08x}) + payload offset (0x{offset:08x}) => 0x{:08x}",
            base + offset
        );
        Ok((base, offset))
    }

    fn expand_base_var(&self, name: &str) -> Result<u64> {
        let expanded = env::expand_variable(&self.target.env, name, &ExpandOptions::default())
            .map_err(|_| {
                Error::OperationFailed(format!(
                    "Environment variable used for payload_base does not exist: {name}"
                ))
            })?;

        parse_int(&expanded).map_err(|_| {
            Error::OperationFailed(format!(
                "Encountered invalid expansion of payload_base: {expanded}"
            ))
        })
    }

    fn log_not_supported(e: &Error) {
        // Situations the user could resolve by providing more warrant a
        // louder message
        let msg = format!("  Excluded:  {e}");
        if msg.contains("companion") || msg.contains("opt-in not specified") {
            warn!("{msg}");
        } else {
            info!("{msg}");
        }
    }

    fn enumerate_memory_writers(&mut self) {
        info!("Enumerating available MemoryWriter implementations...");

        macro_rules! probe {
            ($ctor:expr) => {
                match $ctor {
                    Ok(op) => {
                        info!("  Available: {}", Operation::name(&op));
                        self.memory_writers.add(Box::new(op));
                    }
                    Err(e) => Self::log_not_supported(&e),
                }
            };
        }

        probe!(MwMemoryWriter::new(&self.target));
        probe!(MmMemoryWriter::new(&self.target));
        probe!(NmMemoryWriter::new(&self.target));
        probe!(LoadbMemoryWriter::new(&self.target));
        probe!(LoadxMemoryWriter::new(&self.target));
        probe!(LoadyMemoryWriter::new(&self.target));
        probe!(CpMemoryWriter::new(&self.target));
        probe!(Crc32MemoryWriter::new(&self.target));
        probe!(I2cMemoryWriter::new(&self.target));
    }

    /// Exclusions shared by readers/executors/register readers that depend
    /// on deployed payloads.
    fn payload_requirements_ok(&self, op_name: &str, req: &Requirements) -> Result<()> {
        if req.payloads.is_empty() {
            return Ok(());
        }

        if self.memory_writers.is_empty() {
            return Err(Error::not_supported(
                op_name,
                "No MemoryWriter available to deploy required payload(s)",
            ));
        }

        if !self.target.allow_deploy_exec {
            return Err(Error::not_supported(
                op_name,
                "Payload deployment+execution opt-in not specified",
            ));
        }

        Ok(())
    }

    fn enumerate_memory_readers(&mut self) {
        info!("Enumerating available MemoryReader implementations...");

        macro_rules! probe {
            ($name:literal, $req:expr, $ctor:expr) => {
                match self
                    .payload_requirements_ok($name, $req)
                    .and_then(|()| $ctor)
                {
                    Ok(op) => {
                        info!("  Available: {}", Operation::name(&op));
                        for payload in Operation::required(&op).payloads {
                            let _ = self.target.payloads.mark_required_by(payload, $name);
                        }
                        self.memory_readers.add(Box::new(op));
                    }
                    Err(e) => Self::log_not_supported(&e),
                }
            };
        }

        probe!("MdMemoryReader", &MdMemoryReader::REQUIRED, MdMemoryReader::new(&self.target));
        probe!("MmMemoryReader", &MmMemoryReader::REQUIRED, MmMemoryReader::new(&self.target));
        probe!("NmMemoryReader", &NmMemoryReader::REQUIRED, NmMemoryReader::new(&self.target));
        probe!(
            "CRC32MemoryReader",
            &Crc32MemoryReader::REQUIRED,
            Crc32MemoryReader::new(&self.target)
        );
        probe!(
            "ItestMemoryReader",
            &ItestMemoryReader::REQUIRED,
            ItestMemoryReader::new(&self.target)
        );
        probe!(
            "SetexprMemoryReader",
            &SetexprMemoryReader::REQUIRED,
            SetexprMemoryReader::new(&self.target)
        );
        probe!("GoMemoryReader", &GoMemoryReader::REQUIRED, GoMemoryReader::new(&self.target));
        probe!("I2CMemoryReader", &I2cMemoryReader::REQUIRED, I2cMemoryReader::new(&self.target));

        let da_opts = self.data_abort.clone();
        probe!(
            "CpCrashMemoryReader",
            &CpCrashMemoryReader::REQUIRED,
            CpCrashMemoryReader::new(&self.target, &da_opts)
        );
    }

    fn enumerate_executors(&mut self) {
        info!("Enumerating available Executor implementations...");

        if !self.target.allow_deploy_exec {
            Self::log_not_supported(&Error::not_supported(
                "GoExecutor",
                "Payload deployment+execution opt-in not specified",
            ));
            return;
        }

        match GoExecutor::new(&self.target) {
            Ok(op) => {
                info!("  Available: {}", Operation::name(&op));
                self.executors.add(Box::new(op));
            }
            Err(e) => Self::log_not_supported(&e),
        }
    }

    fn enumerate_register_readers(&mut self) {
        info!("Enumerating available RegisterReader implementations...");

        macro_rules! probe {
            ($name:literal, $req:expr, $ctor:expr) => {
                match self
                    .payload_requirements_ok($name, $req)
                    .and_then(|()| $ctor)
                {
                    Ok(op) => {
                        info!("  Available: {}", Operation::name(&op));
                        for payload in Operation::required(&op).payloads {
                            let _ = self.target.payloads.mark_required_by(payload, $name);
                        }
                        self.register_readers.add(Box::new(op));
                    }
                    Err(e) => Self::log_not_supported(&e),
                }
            };
        }

        probe!(
            "GoRegisterReader",
            &GoRegisterReader::REQUIRED,
            GoRegisterReader::new(&self.target)
        );

        for ctor in [
            CrashRegisterReader::md,
            CrashRegisterReader::mm,
            CrashRegisterReader::mw,
            CrashRegisterReader::nm,
            CrashRegisterReader::crc32,
            CrashRegisterReader::cp,
            CrashRegisterReader::fdt,
            CrashRegisterReader::itest,
            CrashRegisterReader::setexpr,
        ] {
            match ctor(&self.target) {
                Ok(op) => {
                    info!("  Available: {}", Operation::name(&op));
                    self.register_readers.add(Box::new(op));
                }
                Err(e) => Self::log_not_supported(&e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Target inspection
    // ------------------------------------------------------------------

    /// Commands supported by the target console, from `help`. Cached unless
    /// `cached` is false; `detailed` additionally collects per-command help
    /// text.
    pub fn commands(
        &mut self,
        cached: bool,
        detailed: bool,
    ) -> Result<BTreeMap<String, CommandInfo>> {
        let have_details = self
            .target
            .cmds
            .values()
            .next()
            .is_some_and(|info| info.details.is_some());

        if cached && !self.target.cmds.is_empty() && (!detailed || have_details) {
            return Ok(self.target.cmds.clone());
        }

        if detailed {
            info!("Retrieving detailed command info via \"help\"");
        } else {
            info!("Retrieving command list via \"help\"");
        }

        let help_text = self.target.send_command("help")?;
        let mut cmds = BTreeMap::new();

        for line in help_text.lines() {
            if let Some(caps) = HELP_RE.captures(line) {
                cmds.insert(
                    caps["cmd"].to_string(),
                    CommandInfo {
                        summary: caps["summary"].to_string(),
                        details: None,
                    },
                );
            }
        }

        if cmds.is_empty() {
            return Err(Error::Protocol(
                "Failed to retrieve command list via help".to_string(),
            ));
        }

        if detailed {
            let names: Vec<String> = cmds.keys().cloned().collect();
            let progress = self.target.create_progress(
                names.len() as u64,
                "Reading console command help text",
                "cmd",
                true,
            );

            for name in names {
                debug!("Reading help text for: {name}");
                let details = self.target.send_command(&format!("help {name}"))?;
                if let Some(info) = cmds.get_mut(&name) {
                    info.details = Some(details);
                }
                progress.inc(1);
            }
            self.target.close_progress(&progress);
        }

        self.target.cmds = cmds.clone();
        Ok(cmds)
    }

    /// The target's environment variables, from `printenv`.
    pub fn environment(&mut self, cached: bool) -> Result<Environment> {
        if cached && !self.target.env.is_empty() {
            return Ok(self.target.env.clone());
        }

        info!("Reading environment via \"printenv\"");

        self.target.interrupt()?;
        let text = self.target.send_command("printenv")?;

        match env::parse(&text) {
            Ok(parsed) => self.target.env = parsed,
            Err(e) => {
                warn!("Failed to parse environment: {e}");
                self.target.env = Environment::new();
            }
        }

        Ok(self.target.env.clone())
    }

    /// Retrieve one environment variable, optionally fully expanded.
    pub fn env_var(&mut self, name: &str, expand: bool, cached: bool) -> Result<String> {
        if !cached {
            self.environment(false)?;
        }

        if expand {
            Ok(env::expand_variable(
                &self.target.env,
                name,
                &ExpandOptions::default(),
            )?)
        } else {
            self.target
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UBoot(depthcharge_uboot::UBootError::UndefinedVariable(
                    name.to_string(),
                )))
        }
    }

    /// [`Self::env_var`], converted to an integer.
    pub fn env_var_int(&mut self, name: &str, cached: bool) -> Result<u64> {
        let value = self.env_var(name, true, cached)?;
        parse_int(&value)
    }

    /// Set an environment variable. Integer values are written as
    /// hexadecimal. Re-reads the environment unless `invalidate_cache` is
    /// false (useful when setting several variables in succession).
    pub fn set_env_var(&mut self, name: &str, value: &str, invalidate_cache: bool) -> Result<()> {
        self.target
            .send_command_checked(&format!("setenv {name} {value}"))?;
        info!("Set environment variable: {name}={value}");

        if invalidate_cache {
            self.environment(false)?;
        }
        Ok(())
    }

    /// [`Self::set_env_var`] for integer values, written as hexadecimal.
    pub fn set_env_var_int(&mut self, name: &str, value: u64, invalidate_cache: bool) -> Result<()> {
        self.set_env_var(name, &format!("0x{value:08x}"), invalidate_cache)
    }

    /// The target's version information, from `version` (or, failing that,
    /// a `reset` and a scan of the boot banner).
    pub fn version(&mut self, cached: bool) -> Result<Vec<String>> {
        if cached && !self.target.version.is_empty() {
            return Ok(self.target.version.clone());
        }

        if self.target.has_command("version") {
            // Preferred: also reports compiler and linker versions
            let resp = self.target.send_command("version")?;
            self.target.version = resp.lines().map(String::from).collect();
            if let Some(first) = self.target.version.first() {
                info!("Version: {first}");
            }
            return Ok(self.target.version.clone());
        }

        if self.target.has_command("reset") && self.target.allow_reboot {
            info!("Resetting device to search for version string.");
            self.target.send_command_no_response("reset")?;
            self.target.interrupt()?;

            let banner = self.target.console.read()?;
            for line in banner.lines() {
                if VERSION_RE.is_match(line) {
                    self.target.version = vec![line.trim().to_string()];
                    info!("Version: {line}");
                    return Ok(self.target.version.clone());
                }
            }
            warn!("Did not see U-Boot version string. Old or non-standard version format?");
        } else {
            warn!("Unable to query U-Boot version string.");
        }

        self.target.version = vec!["unknown".to_string()];
        Ok(self.target.version.clone())
    }

    // ------------------------------------------------------------------
    // Operation dispatch
    // ------------------------------------------------------------------

    /// Names of the available memory readers.
    pub fn memory_reader_names(&self) -> Vec<&'static str> {
        self.memory_readers.names()
    }

    pub fn memory_writer_names(&self) -> Vec<&'static str> {
        self.memory_writers.names()
    }

    pub fn register_reader_names(&self) -> Vec<&'static str> {
        self.register_readers.names()
    }

    pub fn executor_names(&self) -> Vec<&'static str> {
        self.executors.names()
    }

    /// Name of the memory reader that would serve a read of `data_len`
    /// bytes absent an explicit `impl` request.
    pub fn default_memory_reader(&self, data_len: Option<usize>) -> Result<&'static str> {
        let hints = RankHints { data_len };
        let i = self
            .memory_readers
            .default_index(&hints, &[], DEFAULT_EXCLUDE_REQTS)?;
        Ok(self.memory_readers.get(i).name())
    }

    pub fn default_memory_writer(&self, data_len: Option<usize>) -> Result<&'static str> {
        let hints = RankHints { data_len };
        let i = self
            .memory_writers
            .default_index(&hints, &[], DEFAULT_EXCLUDE_REQTS)?;
        Ok(self.memory_writers.get(i).name())
    }

    pub fn default_register_reader(&self) -> Result<&'static str> {
        let i = self
            .register_readers
            .default_index(&RankHints::default(), &[], DEFAULT_EXCLUDE_REQTS)?;
        Ok(self.register_readers.get(i).name())
    }

    fn resolve_reader(&self, impl_spec: Option<&[&str]>, data_len: usize) -> Result<usize> {
        match impl_spec {
            Some(specs) if !specs.is_empty() => self.memory_readers.find_first(specs),
            _ => self.memory_readers.default_index(
                &RankHints {
                    data_len: Some(data_len),
                },
                &[],
                DEFAULT_EXCLUDE_REQTS,
            ),
        }
    }

    fn resolve_writer(&self, impl_spec: Option<&[&str]>, data_len: usize) -> Result<usize> {
        match impl_spec {
            Some(specs) if !specs.is_empty() => self.memory_writers.find_first(specs),
            _ => self.memory_writers.default_index(
                &RankHints {
                    data_len: Some(data_len),
                },
                &[],
                DEFAULT_EXCLUDE_REQTS,
            ),
        }
    }

    /// Deploy any payloads the selected operation depends upon.
    fn ensure_payloads_deployed(&mut self, payloads: &[String]) -> Result<()> {
        for name in payloads {
            self.deploy_payload(name, false)?;
        }
        Ok(())
    }

    /// Read `size` bytes of target memory at `address`.
    ///
    /// `impl_spec` optionally names the implementation(s) to use, in
    /// preference order; otherwise the best-ranked reader for the size is
    /// chosen.
    pub fn read_memory(
        &mut self,
        address: u64,
        size: usize,
        impl_spec: Option<&[&str]>,
        opts: &ReadOptions,
    ) -> Result<Vec<u8>> {
        let i = self.resolve_reader(impl_spec, size)?;
        let payloads = self.memory_readers.get(i).resolved().payloads.clone();
        self.ensure_payloads_deployed(&payloads)?;

        self.memory_readers
            .get_mut(i)
            .read(&mut self.target, address, size, opts)
    }

    /// Read `size` bytes at `address`, streaming them to a file.
    pub fn read_memory_to_file(
        &mut self,
        address: u64,
        size: usize,
        path: &Path,
        impl_spec: Option<&[&str]>,
        opts: &ReadOptions,
    ) -> Result<()> {
        let i = self.resolve_reader(impl_spec, size)?;
        let payloads = self.memory_readers.get(i).resolved().payloads.clone();
        self.ensure_payloads_deployed(&payloads)?;

        self.memory_readers
            .get_mut(i)
            .read_to_file(&mut self.target, address, size, path, opts)
    }

    /// Write `data` to target memory at `address`.
    pub fn write_memory(
        &mut self,
        address: u64,
        data: &[u8],
        impl_spec: Option<&[&str]>,
        opts: &WriteOptions,
    ) -> Result<()> {
        let i = self.resolve_writer(impl_spec, data.len())?;
        self.memory_writers
            .get_mut(i)
            .write(&mut self.target, address, data, opts)
    }

    /// Execute a Stratagem to produce its payload at `address`, dispatching
    /// to the writer the Stratagem was built for.
    pub fn write_memory_stratagem(
        &mut self,
        address: u64,
        stratagem: &Stratagem,
        opts: &WriteOptions,
    ) -> Result<()> {
        let i = self.memory_writers.find_index(stratagem.operation_name())?;
        self.memory_writers
            .get_mut(i)
            .write_stratagem(&mut self.target, address, stratagem, opts)
    }

    /// Write the contents of a file to `address`. With `is_stratagem`, the
    /// file is parsed as a Stratagem and executed instead.
    pub fn write_memory_from_file(
        &mut self,
        address: u64,
        path: &Path,
        is_stratagem: bool,
        impl_spec: Option<&[&str]>,
        opts: &WriteOptions,
    ) -> Result<()> {
        if is_stratagem {
            let stratagem = Stratagem::from_json_file(path)?;
            return self.write_memory_stratagem(address, &stratagem, opts);
        }

        let size = fs::metadata(path)?.len() as usize;
        let i = self.resolve_writer(impl_spec, size)?;
        self.memory_writers
            .get_mut(i)
            .write_from_file(&mut self.target, address, path, opts)
    }

    /// Read a register by (case-insensitive) name or alias.
    pub fn read_register(&mut self, register: &str, impl_spec: Option<&[&str]>) -> Result<u64> {
        let reg = self.target.arch.register(register)?;

        let i = match impl_spec {
            Some(specs) if !specs.is_empty() => self.register_readers.find_first(specs)?,
            _ => self
                .register_readers
                .default_index(&RankHints::default(), &[], DEFAULT_EXCLUDE_REQTS)?,
        };

        let payloads = self.register_readers.get(i).resolved().payloads.clone();
        self.ensure_payloads_deployed(&payloads)?;

        self.register_readers
            .get_mut(i)
            .read_register(&mut self.target, reg)
    }

    // ------------------------------------------------------------------
    // Payload deployment and execution
    // ------------------------------------------------------------------

    /// Register a user payload for later deployment and execution.
    pub fn register_payload(
        &mut self,
        name: &str,
        payload: Vec<u8>,
        required_by: Option<&str>,
    ) -> Result<()> {
        self.target.payloads.insert(name, payload);
        if let Some(op) = required_by {
            self.target.payloads.mark_required_by(name, op)?;
        }
        Ok(())
    }

    /// Write the named payload to its assigned address. A no-op if already
    /// deployed, unless `force` is set.
    pub fn deploy_payload(&mut self, name: &str, force: bool) -> Result<()> {
        if !self.target.allow_deploy_exec {
            return Err(Error::OperationFailed(
                "Not performing payload deployment. Requires opt-in.".to_string(),
            ));
        }

        let (addr, data, deployed, skip_deploy) = {
            let entry = self.target.payloads.get(name)?;
            (
                entry.address,
                entry.data.clone(),
                entry.deployed,
                entry.skip_deploy,
            )
        };

        if skip_deploy && !deployed && !force {
            info!("Payload deployment skipped: assuming \"{name}\" @ 0x{addr:08x}");
            self.target.payloads.mark_deployed(name, true)?;
            return Ok(());
        }

        if deployed && !force {
            return Ok(());
        }

        // Stale caches would hand the CPU old bytes at the jump target
        if self.target.has_command("dcache") {
            self.target.send_command("dcache flush")?;
        } else {
            warn!("Command to flush data cache (dcache) not available. Device may crash.");
        }
        if self.target.has_command("icache") {
            self.target.send_command("icache flush")?;
        } else {
            warn!("Command to flush instruction cache (icache) not available. Device may crash.");
        }

        info!("Deploying payload \"{name}\" @ 0x{addr:08x}");
        self.write_memory(addr, &data, None, &WriteOptions::default())?;
        self.target.payloads.mark_deployed(name, true)?;
        Ok(())
    }

    /// Deploy (as needed) and execute the named payload, returning the
    /// standalone application return code and response text.
    pub fn execute_payload(
        &mut self,
        name: &str,
        args: &[String],
        read_response: bool,
    ) -> Result<Option<(u64, String)>> {
        self.deploy_payload(name, false)?;
        self.target.execute_payload(name, args, read_response)
    }

    /// Execute code at an arbitrary address. No prerequisite validation is
    /// performed; prefer [`Self::execute_payload`].
    pub fn execute_at(
        &mut self,
        address: u64,
        args: &[String],
        read_response: bool,
        impl_spec: Option<&[&str]>,
    ) -> Result<Option<(u64, String)>> {
        let i = match impl_spec {
            Some(specs) if !specs.is_empty() => self.executors.find_first(specs)?,
            _ => self
                .executors
                .default_index(&RankHints::default(), &[], DEFAULT_EXCLUDE_REQTS)?,
        };

        self.executors
            .get_mut(i)
            .execute_at(&mut self.target, address, args, read_response)
    }

    // ------------------------------------------------------------------
    // Memory patching
    // ------------------------------------------------------------------

    /// Apply a series of memory patches.
    ///
    /// Unless `skip_checks`, regions with expected values are read first:
    /// mismatches fail, fully-patched targets short-circuit, and partially
    /// patched targets proceed. With `dry_run`, the write phase is skipped.
    pub fn patch_memory(
        &mut self,
        patches: &MemoryPatchList,
        dry_run: bool,
        skip_checks: bool,
        impl_spec: Option<&[&str]>,
    ) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }

        let avg_patch_size =
            patches.iter().map(|p| p.value().len()).sum::<usize>() / patches.len();

        let reader = self.resolve_reader(impl_spec, avg_patch_size)?;
        let writer = self.resolve_writer(impl_spec, avg_patch_size)?;

        let mut do_writes = true;
        if dry_run || !skip_checks {
            do_writes = self.check_patch_expectations(reader, patches)?;
        }

        if dry_run || !do_writes {
            return Ok(());
        }

        let progress =
            self.target
                .create_progress(patches.len() as u64, "Applying patches", "patch", true);

        let result = (|| -> Result<()> {
            let count = patches.len();
            for (i, patch) in patches.iter().enumerate() {
                // Collapse setup/teardown across the contiguous sequence
                let opts = WriteOptions {
                    suppress_setup: i != 0,
                    suppress_teardown: i < count - 1,
                    show_progress: false,
                    block_size: None,
                };

                self.memory_writers.get_mut(writer).write(
                    &mut self.target,
                    patch.address(),
                    patch.value(),
                    &opts,
                )?;
                progress.inc(1);
            }
            Ok(())
        })();

        self.target.close_progress(&progress);
        result
    }

    fn check_patch_expectations(
        &mut self,
        reader: usize,
        patches: &MemoryPatchList,
    ) -> Result<bool> {
        let mut matches_expected = 0usize;
        let mut already_applied = 0usize;

        // Pre-determine the first and last reads to collapse setup/teardown
        let checked: Vec<usize> = patches
            .iter()
            .enumerate()
            .filter(|(_, p)| p.expected().is_some())
            .map(|(i, _)| i)
            .collect();
        let (first_read, last_read) = match (checked.first(), checked.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Ok(true),
        };

        let progress = self.target.create_progress(
            patches.len() as u64,
            "Verifying expected pre-patch state",
            "patch",
            true,
        );

        let result = (|| -> Result<()> {
            for (i, patch) in patches.iter().enumerate() {
                let Some(expected) = patch.expected() else {
                    progress.inc(1);
                    continue;
                };

                let opts = ReadOptions {
                    suppress_setup: i != first_read,
                    suppress_teardown: i != last_read,
                    show_progress: false,
                };

                let read_data = self.memory_readers.get_mut(reader).read(
                    &mut self.target,
                    patch.address(),
                    expected.len(),
                    &opts,
                )?;

                if read_data == expected {
                    debug!("{} matches expected pre-patch value.", patch.description());
                    matches_expected += 1;
                } else if read_data == patch.value() {
                    debug!("{} is already patched.", patch.description());
                    already_applied += 1;
                } else {
                    debug!("Expected:  {expected:02x?}");
                    debug!("Read data: {read_data:02x?}");
                    return Err(Error::InvalidArgument(format!(
                        "{} does not match expected value.",
                        patch.description()
                    )));
                }

                progress.inc(1);
            }
            Ok(())
        })();

        self.target.close_progress(&progress);
        result?;

        if matches_expected == patches.len() {
            info!("Target memory matches expected pre-patch values.");
            return Ok(true);
        }

        if already_applied == patches.len() {
            info!("Target memory appears to be already patched. No writes needed.");
            return Ok(false);
        }

        info!("Target memory appears to have been only partially patched.");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Global data inspection
    // ------------------------------------------------------------------

    /// Inspect U-Boot's global data structure: `bdinfo` output where
    /// available, then the `gd` register and jump-table location.
    pub fn uboot_global_data(
        &mut self,
        cached: bool,
        skip_bdinfo: bool,
        skip_gd_jt: bool,
    ) -> Result<GlobalData> {
        if cached && self.target.gd.inspected {
            return Ok(self.target.gd.clone());
        }

        if self.target.has_command("bdinfo") && !skip_bdinfo {
            let resp = self.target.send_command("bdinfo")?;
            let bdinfo = board::bdinfo_dict(&resp);
            if !bdinfo.is_empty() {
                let mut bd = BTreeMap::new();
                for (key, entry) in bdinfo {
                    let value = match entry.value {
                        board::BdinfoValue::Int(v) => serde_json::json!(v),
                        board::BdinfoValue::Text(s) => serde_json::json!(s),
                    };
                    bd.insert(
                        key,
                        serde_json::json!({
                            "name": entry.name,
                            "value": value,
                            "suffix": entry.suffix,
                        }),
                    );
                }
                self.target.gd.bd = Some(bd);
            }
        } else if !skip_bdinfo {
            warn!("Device does not support bdinfo command.");
        }

        if !skip_gd_jt {
            if let Err(e) = self
                .locate_gd_address()
                .and_then(|gd_addr| self.locate_jump_table(gd_addr))
            {
                warn!("{e}");
            }
        }

        if self.target.gd.bd.is_none()
            && self.target.gd.address.is_none()
            && self.target.gd.jt.is_none()
        {
            return Err(Error::not_supported(
                "Context",
                "Cannot inspect global data structure with available functionality.",
            ));
        }

        self.target.gd.inspected = true;
        Ok(self.target.gd.clone())
    }

    /// Read the register holding the global data pointer.
    fn locate_gd_address(&mut self) -> Result<u64> {
        if let Some(address) = self.target.gd.address {
            return Ok(address);
        }

        let Some(gd_reg) = self.target.arch.gd_register() else {
            return Err(Error::not_supported(
                "Context",
                format!(
                    "Accessing the gd pointer on {} is not currently supported.",
                    self.target.arch.name
                ),
            ));
        };

        let address = self.read_register(gd_reg, None)?;
        info!("Located U-Boot global data structure (*gd) @ 0x{address:08x}");
        self.target.gd.address = Some(address);
        Ok(address)
    }

    /// Locate and read the exported jump table, given the gd address.
    fn locate_jump_table(&mut self, gd_addr: u64) -> Result<JumpTable> {
        let read_size = jump_table::DEFAULT_GD_READ_SIZE;
        info!("Reading {read_size} bytes of global data structure (gd) to search for gd->jt.");

        let gd_mem = self.read_memory(gd_addr, read_size, None, &ReadOptions::default())?;

        let mask = jump_table::DEFAULT_JT_ADDR_MASK;
        let location = jump_table::locate(gd_addr, &gd_mem, self.target.arch, mask)?;

        let check_addr = location.extras.get("relocaddr").copied().unwrap_or(gd_addr);

        let exports = jump_table::exports(false);
        let table_size = exports.len() * self.target.arch.word_size;
        let table_mem =
            self.read_memory(location.jt_addr, table_size, None, &ReadOptions::default())?;

        let entries = jump_table::parse_entries(
            &table_mem,
            self.target.arch,
            false,
            mask,
            check_addr & mask,
        )?;

        let jt = JumpTable {
            address: location.jt_addr,
            entries: entries
                .into_iter()
                .map(|e| JumpTableEntryInfo {
                    address: e.address,
                    name: e.name,
                    return_type: e.return_type,
                    arg_types: e.arg_types,
                })
                .collect(),
            extras: location.extras,
        };

        self.target.gd.jt = Some(jt.clone());
        Ok(jt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_contents() {
        // Every kind is represented, and stratagem consumers are flagged
        assert!(CATALOG.iter().any(|(_, k, _)| *k == OpKind::MemoryReader));
        assert!(CATALOG.iter().any(|(_, k, _)| *k == OpKind::MemoryWriter));
        assert!(CATALOG.iter().any(|(_, k, _)| *k == OpKind::RegisterReader));
        assert!(CATALOG.iter().any(|(_, k, _)| *k == OpKind::Executor));

        let crc32_writer = CATALOG
            .iter()
            .find(|(name, _, _)| *name == "CRC32MemoryWriter")
            .unwrap();
        assert!(crc32_writer.2.stratagem);

        let i2c_reader = CATALOG
            .iter()
            .find(|(name, _, _)| *name == "I2CMemoryReader")
            .unwrap();
        assert!(i2c_reader.2.companion);
    }

    #[test]
    fn test_help_regex() {
        let caps = HELP_RE.captures("md      - memory display").unwrap();
        assert_eq!(&caps["cmd"], "md");
        assert_eq!(&caps["summary"], "memory display");
    }

    #[test]
    fn test_version_regex() {
        assert!(VERSION_RE.is_match("U-Boot 2020.04 (Apr 20 2020 - 11:22:33)"));
        assert!(!VERSION_RE.is_match("Linux version 5.4.0"));
    }
}
