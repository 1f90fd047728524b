//! The Operation framework: declarative requirements, ranking, and ranked
//! operation collections.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::strutil::find_program;
use crate::target::Target;
use crate::{Error, Result};

/// Declarative requirements of an [`Operation`] implementation.
///
/// This is data, not code: the full catalog of what a build supports can be
/// inspected without instantiating anything. Each entry in `commands` is an
/// any-of group; a single-element group is simply a required command.
#[derive(Clone, Copy, Debug)]
pub struct Requirements {
    /// Restrict to these architectures (by name). Empty means any.
    pub arch: &'static [&'static str],
    pub commands: &'static [&'static [&'static str]],
    pub variables: &'static [&'static str],
    pub payloads: &'static [&'static str],
    pub host_programs: &'static [&'static str],
    pub companion: bool,
    /// The operation crashes or reboots the target; the user must opt in.
    pub crash_or_reboot: bool,
    /// The operation consumes a Stratagem rather than raw data.
    pub stratagem: bool,
}

impl Requirements {
    pub const NONE: Self = Self {
        arch: &[],
        commands: &[],
        variables: &[],
        payloads: &[],
        host_programs: &[],
        companion: false,
        crash_or_reboot: false,
        stratagem: false,
    };
}

/// Requirement categories, used to exclude operations from default
/// selection by what they depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReqKey {
    Arch,
    Commands,
    Variables,
    Payloads,
    HostPrograms,
    Companion,
    CrashOrReboot,
    Stratagem,
}

impl Requirements {
    /// Does this set carry a requirement of the given category?
    pub fn requires(&self, key: ReqKey) -> bool {
        match key {
            ReqKey::Arch => !self.arch.is_empty(),
            ReqKey::Commands => !self.commands.is_empty(),
            ReqKey::Variables => !self.variables.is_empty(),
            ReqKey::Payloads => !self.payloads.is_empty(),
            ReqKey::HostPrograms => !self.host_programs.is_empty(),
            ReqKey::Companion => self.companion,
            ReqKey::CrashOrReboot => self.crash_or_reboot,
            ReqKey::Stratagem => self.stratagem,
        }
    }
}

/// How an instance's requirements were satisfied: which of the any-of
/// commands were accepted, and where host programs were found.
#[derive(Clone, Debug, Default)]
pub struct Resolved {
    pub commands: Vec<String>,
    pub variables: Vec<String>,
    pub payloads: Vec<String>,
    pub host_programs: BTreeMap<String, PathBuf>,
    pub companion: bool,
    pub crash_or_reboot: bool,
}

/// Check an operation's requirements against the current target snapshot.
///
/// Fails with [`Error::OperationNotSupported`] naming the eliminating
/// requirement; on success, records how each requirement was satisfied.
pub fn check_requirements(op: &str, req: &Requirements, target: &Target) -> Result<Resolved> {
    let mut resolved = Resolved {
        companion: req.companion,
        crash_or_reboot: req.crash_or_reboot,
        ..Resolved::default()
    };

    if !req.arch.is_empty()
        && !req
            .arch
            .iter()
            .any(|a| a.eq_ignore_ascii_case(target.arch.name))
    {
        return Err(Error::not_supported(
            op,
            format!(
                "Not available for {} architecture.",
                target.arch.description
            ),
        ));
    }

    if req.crash_or_reboot && !target.allow_reboot {
        return Err(Error::not_supported(
            op,
            "Operation requires crash or reboot, but opt-in not specified.",
        ));
    }

    for group in req.commands {
        let acceptable: Vec<&str> = group
            .iter()
            .copied()
            .filter(|c| target.has_command(c))
            .collect();

        if acceptable.is_empty() {
            let reason = if group.len() == 1 {
                format!("Command \"{}\" required but not detected.", group[0])
            } else {
                format!("Requires at least one of: {}", group.join(" "))
            };
            return Err(Error::not_supported(op, reason));
        }

        resolved
            .commands
            .extend(acceptable.into_iter().map(String::from));
    }

    if req.companion && target.companion.is_none() {
        return Err(Error::not_supported(
            op,
            "Depthcharge companion device required, but none specified.",
        ));
    }

    for var in req.variables {
        if !target.env.contains_key(*var) {
            return Err(Error::not_supported(
                op,
                format!("Environment variable \"{var}\" required but not detected."),
            ));
        }
        resolved.variables.push((*var).to_string());
    }

    for payload in req.payloads {
        if !target.payloads.contains(payload) {
            return Err(Error::not_supported(
                op,
                format!("Invalid or unsupported payload \"{payload}\" required."),
            ));
        }
        resolved.payloads.push((*payload).to_string());
    }

    for program in req.host_programs {
        let Some(path) = find_program(program) else {
            return Err(Error::not_supported(
                op,
                format!("Host program \"{program}\" required but not found in PATH."),
            ));
        };
        resolved.host_programs.insert((*program).to_string(), path);
    }

    Ok(resolved)
}

/// Selection hints passed to [`Operation::rank`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RankHints {
    /// Number of bytes the caller intends to transfer. Some operations have
    /// setup overhead that only pays off for larger transfers.
    pub data_len: Option<usize>,
}

/// Common surface of every target interaction primitive.
///
/// Ranks lie in [0, 100]: >= 75 is a great choice, 50-74 gets the job done,
/// 25-49 is slow or dirties device state, below that is a last resort.
pub trait Operation {
    /// Stable class-like identity, e.g. `"MdMemoryReader"`.
    fn name(&self) -> &'static str;

    fn required(&self) -> &'static Requirements;

    /// How this instance's requirements were satisfied.
    fn resolved(&self) -> &Resolved;

    fn rank(&self, hints: &RankHints) -> u8;
}

/// Default exclusion for [`OperationSet::default_index`]: stratagem-based
/// operations cannot serve as general-purpose defaults.
pub const DEFAULT_EXCLUDE_REQTS: &[ReqKey] = &[ReqKey::Stratagem];

/// An ordered collection of operations of one kind, searchable by
/// case-insensitive, suffix-tolerant name.
pub struct OperationSet<T: ?Sized> {
    suffix: &'static str,
    ops: Vec<Box<T>>,
}

impl<T: Operation + ?Sized> OperationSet<T> {
    pub fn new(suffix: &'static str) -> Self {
        Self {
            suffix,
            ops: Vec::new(),
        }
    }

    pub fn add(&mut self, op: Box<T>) {
        if self.find_index(op.name()).is_err() {
            self.ops.push(op);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.ops.iter().map(AsRef::as_ref)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ops.iter().map(|op| op.name()).collect()
    }

    pub fn get(&self, index: usize) -> &T {
        self.ops[index].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        self.ops[index].as_mut()
    }

    /// Find an operation by name. The set's suffix may be omitted:
    /// `"crc32"`, `"CRC32"`, and `"CRC32MemoryWriter"` all match in a set
    /// of memory writers.
    pub fn find_index(&self, name: &str) -> Result<usize> {
        let position = |wanted: &str| {
            self.ops
                .iter()
                .position(|op| op.name().eq_ignore_ascii_case(wanted))
        };

        if let Some(i) = position(name) {
            return Ok(i);
        }

        let with_suffix = format!("{name}{}", self.suffix);
        if let Some(i) = position(&with_suffix) {
            return Ok(i);
        }

        Err(Error::InvalidArgument(format!(
            "No operation named \"{name}\" available"
        )))
    }

    /// Find the first available operation out of an ordered list of names.
    pub fn find_first(&self, names: &[&str]) -> Result<usize> {
        for name in names {
            if let Ok(i) = self.find_index(name) {
                return Ok(i);
            }
        }

        Err(Error::InvalidArgument(format!(
            "Operations not available: {names:?}"
        )))
    }

    /// Select the highest-ranking member, excluding specific indices and any
    /// member carrying a requirement category named in `exclude_reqts`.
    pub fn default_index(
        &self,
        hints: &RankHints,
        exclude: &[usize],
        exclude_reqts: &[ReqKey],
    ) -> Result<usize> {
        let best = self
            .ops
            .iter()
            .enumerate()
            .filter(|(i, _)| !exclude.contains(i))
            .filter(|(_, op)| !exclude_reqts.iter().any(|&k| op.required().requires(k)))
            .max_by_key(|(_, op)| op.rank(hints));

        match best {
            Some((i, _)) => Ok(i),
            None => Err(Error::not_supported(
                self.suffix,
                "No default operation available.",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeOp {
        name: &'static str,
        rank: u8,
        required: &'static Requirements,
        resolved: Resolved,
    }

    impl Operation for FakeOp {
        fn name(&self) -> &'static str {
            self.name
        }

        fn required(&self) -> &'static Requirements {
            self.required
        }

        fn resolved(&self) -> &Resolved {
            &self.resolved
        }

        fn rank(&self, _hints: &RankHints) -> u8 {
            self.rank
        }
    }

    static STRATAGEM_REQ: Requirements = Requirements {
        stratagem: true,
        ..Requirements::NONE
    };

    fn fake(name: &'static str, rank: u8, required: &'static Requirements) -> Box<FakeOp> {
        Box::new(FakeOp {
            name,
            rank,
            required,
            resolved: Resolved::default(),
        })
    }

    fn sample_set() -> OperationSet<FakeOp> {
        let mut set = OperationSet::new("MemoryWriter");
        set.add(fake("MwMemoryWriter", 40, &Requirements::NONE));
        set.add(fake("NmMemoryWriter", 35, &Requirements::NONE));
        set.add(fake("CRC32MemoryWriter", 90, &STRATAGEM_REQ));
        set
    }

    #[test]
    fn test_find_case_insensitive_suffix_tolerant() {
        let set = sample_set();

        let i = set.find_index("mw").unwrap();
        assert_eq!(set.get(i).name(), "MwMemoryWriter");

        let i = set.find_index("CRC32").unwrap();
        assert_eq!(set.get(i).name(), "CRC32MemoryWriter");

        let i = set.find_index("crc32memorywriter").unwrap();
        assert_eq!(set.get(i).name(), "CRC32MemoryWriter");

        assert!(set.find_index("loady").is_err());
    }

    #[test]
    fn test_find_first() {
        let set = sample_set();
        let i = set.find_first(&["loady", "nm", "mw"]).unwrap();
        assert_eq!(set.get(i).name(), "NmMemoryWriter");

        assert!(set.find_first(&["loady", "loadx"]).is_err());
    }

    #[test]
    fn test_default_excludes_stratagem_ops() {
        let set = sample_set();

        // CRC32 ranks highest but requires a stratagem
        let i = set
            .default_index(&RankHints::default(), &[], DEFAULT_EXCLUDE_REQTS)
            .unwrap();
        assert_eq!(set.get(i).name(), "MwMemoryWriter");

        // With no requirement filter, the raw ranking wins
        let i = set.default_index(&RankHints::default(), &[], &[]).unwrap();
        assert_eq!(set.get(i).name(), "CRC32MemoryWriter");
    }

    #[test]
    fn test_default_excludes_indices() {
        let set = sample_set();
        let mw = set.find_index("mw").unwrap();

        let i = set
            .default_index(&RankHints::default(), &[mw], DEFAULT_EXCLUDE_REQTS)
            .unwrap();
        assert_eq!(set.get(i).name(), "NmMemoryWriter");
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut set = sample_set();
        assert_eq!(set.len(), 3);
        set.add(fake("MwMemoryWriter", 40, &Requirements::NONE));
        assert_eq!(set.len(), 3);
    }
}
