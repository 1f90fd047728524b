//! Assignment of target memory slots to executable payloads.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use depthcharge_arch::Architecture;

use crate::payloads;
use crate::{Error, Result};

/// One payload's slot and deployment state.
#[derive(Clone, Debug)]
pub struct PayloadEntry {
    pub address: u64,
    pub data: Vec<u8>,
    pub size: usize,
    pub deployed: bool,
    /// Assume the payload is already resident; skip the write on deploy.
    pub skip_deploy: bool,
    /// Operations that depend on this payload.
    pub required_by: BTreeSet<String>,
}

/// Construction parameters for [`PayloadMap`].
#[derive(Clone, Debug)]
pub struct PayloadMapOptions {
    pub align: u64,
    pub skip_deploy: bool,
    pub exclude_builtins: bool,
    /// Builtin payload names to leave out.
    pub exclude: Vec<String>,
}

impl Default for PayloadMapOptions {
    fn default() -> Self {
        Self {
            align: 16,
            skip_deploy: false,
            exclude_builtins: false,
            exclude: Vec::new(),
        }
    }
}

/// Tracks the target memory locations assigned to executable payloads.
///
/// Slots are disjoint, aligned, and assigned monotonically from the base
/// address; space is allocated for every known payload whether or not it is
/// ultimately deployed.
pub struct PayloadMap {
    base: u64,
    offset: u64,
    align: u64,
    skip_deploy: bool,
    map: BTreeMap<String, PayloadEntry>,
}

impl PayloadMap {
    pub fn new(arch: &'static Architecture, base: u64, opts: &PayloadMapOptions) -> Self {
        let mut ret = Self {
            base,
            offset: 0,
            align: opts.align.max(1),
            skip_deploy: opts.skip_deploy,
            map: BTreeMap::new(),
        };

        if !opts.exclude_builtins {
            for payload in payloads::builtins(arch.name) {
                if opts.exclude.iter().any(|name| name == payload.name) {
                    continue;
                }
                ret.insert(payload.name, payload.data.to_vec());
            }
        }

        ret
    }

    /// Base address at which payload slots begin.
    pub fn base_address(&self) -> u64 {
        self.base
    }

    /// Register a payload, assigning it the next aligned slot. Re-inserting
    /// an existing name leaves its slot untouched.
    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        if self.map.contains_key(name) {
            debug!("{name} is already in the PayloadMap");
            return;
        }

        let address = self.base + self.offset;
        let size = data.len();
        self.offset += (size as u64).div_ceil(self.align) * self.align;

        self.map.insert(
            name.to_string(),
            PayloadEntry {
                address,
                data,
                size,
                deployed: false,
                skip_deploy: self.skip_deploy,
                required_by: BTreeSet::new(),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&PayloadEntry> {
        self.map.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "No such payload registered in PayloadMap: \"{name}\""
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadEntry)> {
        self.map.iter()
    }

    pub fn mark_deployed(&mut self, name: &str, state: bool) -> Result<()> {
        self.map
            .get_mut(name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "No such payload registered in PayloadMap: \"{name}\""
                ))
            })?
            .deployed = state;
        Ok(())
    }

    /// Record that `operation` depends on the named payload.
    pub fn mark_required_by(&mut self, name: &str, operation: &str) -> Result<()> {
        self.map
            .get_mut(name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "No such payload registered in PayloadMap: \"{name}\""
                ))
            })?
            .required_by
            .insert(operation.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm() -> &'static Architecture {
        Architecture::get("arm").unwrap()
    }

    #[test]
    fn test_slot_assignment() {
        let mut map = PayloadMap::new(arm(), 0x8400_0000, &PayloadMapOptions::default());

        map.insert("A", vec![0u8; 100]);
        map.insert("B", vec![0u8; 1]);

        let builtin_end: u64 = payloads::builtins("ARM")
            .iter()
            .map(|p| (p.data.len() as u64).div_ceil(16) * 16)
            .sum();

        let a = map.get("A").unwrap();
        assert_eq!(a.address, 0x8400_0000 + builtin_end);
        assert_eq!(a.size, 100);

        // Slots are aligned and disjoint
        let b = map.get("B").unwrap();
        assert_eq!(b.address, a.address + 112);
        assert_eq!(b.address % 16, 0);
    }

    #[test]
    fn test_builtins_loaded() {
        let map = PayloadMap::new(arm(), 0x8400_0000, &PayloadMapOptions::default());
        assert!(map.contains(payloads::RETURN_MEMORY_WORD));
        assert!(map.contains(payloads::READ_MEMORY));

        let excluded = PayloadMap::new(
            arm(),
            0x8400_0000,
            &PayloadMapOptions {
                exclude_builtins: true,
                ..PayloadMapOptions::default()
            },
        );
        assert!(!excluded.contains(payloads::READ_MEMORY));
    }

    #[test]
    fn test_insert_idempotent() {
        let mut map = PayloadMap::new(arm(), 0x1000, &PayloadMapOptions::default());
        map.insert("X", vec![1, 2, 3]);
        let addr = map.get("X").unwrap().address;

        map.insert("X", vec![9; 64]);
        assert_eq!(map.get("X").unwrap().address, addr);
        assert_eq!(map.get("X").unwrap().size, 3);
    }

    #[test]
    fn test_required_by() {
        let mut map = PayloadMap::new(arm(), 0x1000, &PayloadMapOptions::default());
        map.mark_required_by(payloads::READ_MEMORY, "GoMemoryReader")
            .unwrap();
        assert!(
            map.get(payloads::READ_MEMORY)
                .unwrap()
                .required_by
                .contains("GoMemoryReader")
        );

        assert!(map.mark_required_by("nope", "GoMemoryReader").is_err());
    }
}
