//! U-Boot version comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::{Result, UBootError};

// Refer to the definitions at the top of the U-Boot Makefile. NAME and SCM
// information are ignored; no meaningful comparison can be made with them.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"v?(?P<version>[0-9]+)\.(?P<patch>[0-9]+)(\.(?P<sub>[0-9]+))?(-rc(?P<extra>[0-9]+))?")
        .unwrap()
});

/// A parsed U-Boot version (e.g. `2020.04`, `v2016.09.01-rc2`) with a total
/// ordering. Release candidates order below the corresponding release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UBootVersion {
    version: u32,
    patch: u32,
    sub: u32,
    /// `None` for releases; orders above any `-rcN`.
    extra: Option<u32>,
}

impl UBootVersion {
    /// Search for a version string anywhere within `s`.
    pub fn find(s: &str) -> Option<Self> {
        VERSION_RE.captures(s).map(Self::from_captures)
    }

    fn from_captures(caps: regex::Captures<'_>) -> Self {
        let field = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str().parse::<u32>().unwrap_or(0))
        };

        Self {
            version: field("version").unwrap_or(0),
            patch: field("patch").unwrap_or(0),
            sub: field("sub").unwrap_or(0),
            extra: field("extra"),
        }
    }

    fn key(&self) -> (u32, u32, u32, u32) {
        (
            self.version,
            self.patch,
            self.sub,
            self.extra.map_or(u32::MAX, |rc| rc),
        )
    }

    /// Returns -1, 0, or 1 for less-than, equal, greater-than.
    pub fn compare(&self, other: &Self) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Returns `true` if this version lies within `[min, max]`, inclusive.
    pub fn in_range(&self, min: &Self, max: &Self) -> bool {
        min <= self && self <= max
    }
}

impl FromStr for UBootVersion {
    type Err = UBootError;

    fn from_str(s: &str) -> Result<Self> {
        // Anchored: the version must begin the string
        let caps = VERSION_RE
            .captures(s)
            .filter(|caps| caps.get(0).unwrap().start() == 0)
            .ok_or_else(|| UBootError::InvalidVersion(s.to_string()))?;
        Ok(Self::from_captures(caps))
    }
}

impl Ord for UBootVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for UBootVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UBootVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.version, self.patch)?;
        if self.sub != 0 {
            write!(f, ".{:02}", self.sub)?;
        }
        if let Some(rc) = self.extra {
            write!(f, "-rc{rc}")?;
        }
        Ok(())
    }
}

/// Convenience wrapper: does `version` fall within `[min_version, max_version]`?
pub fn version_in_range(version: &str, min_version: &str, max_version: &str) -> Result<bool> {
    let version: UBootVersion = version.parse()?;
    Ok(version.in_range(&min_version.parse()?, &max_version.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> UBootVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(v("2020.04"), v("v2020.04"));
        assert!("garbage".parse::<UBootVersion>().is_err());
    }

    #[test]
    fn test_total_ordering() {
        let cases = [
            ("2019.07", "2020.04", Ordering::Less),
            ("2020.04", "2020.04", Ordering::Equal),
            ("2020.04", "2020.01", Ordering::Greater),
            ("2016.03.01", "2016.03.02", Ordering::Less),
            ("2020.04-rc1", "2020.04-rc2", Ordering::Less),
            ("2020.04-rc4", "2020.04", Ordering::Less),
            ("2020.04", "2020.04-rc4", Ordering::Greater),
        ];

        for (a, b, expected) in cases {
            let (a, b) = (v(a), v(b));
            assert_eq!(a.cmp(&b), expected, "{a} vs {b}");

            // Exactly one of <, ==, > holds
            let holds = [a < b, a == b, a > b];
            assert_eq!(holds.iter().filter(|&&h| h).count(), 1);
        }
    }

    #[test]
    fn test_in_range() {
        let ver = v("2018.11");
        assert!(ver.in_range(&v("2017.01"), &v("2020.04")));
        assert!(ver.in_range(&v("2018.11"), &v("2018.11")));
        assert!(!ver.in_range(&v("2019.01"), &v("2020.04")));

        assert!(version_in_range("2020.04-rc2", "2020.04-rc1", "2020.04").unwrap());
    }

    #[test]
    fn test_find() {
        let line = "U-Boot 2017.03-00387-g7ef5974 (Jun 14 2017 - 11:27:03 -0500)";
        let found = UBootVersion::find(line).unwrap();
        assert_eq!(found, v("2017.03"));

        assert!(UBootVersion::find("no version here").is_none());
    }

    #[test]
    fn test_compare() {
        assert_eq!(v("2019.10").compare(&v("2020.01")), -1);
        assert_eq!(v("2020.01").compare(&v("2020.01")), 0);
        assert_eq!(v("2020.04").compare(&v("2020.01")), 1);
    }
}
