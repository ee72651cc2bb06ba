//! Semantic `major.minor` version, used to key defaults, restrictions and
//! the mold/config version bound.
//!
//! The wider Rust ecosystem reaches for the `semver` crate for versioning,
//! but `semver::Version` always carries a `patch` component and additional
//! pre-release/build metadata that this schema has no use for — molds and
//! configs are versioned strictly by `major.minor` (see spec.md §3, the
//! `Version` entry). A small dedicated type avoids smuggling in a field the
//! domain model doesn't have; the drop is recorded in DESIGN.md.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A `major.minor` version. Ordered lexicographically: major first, then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Version { major, minor }
    }

    /// The implicit version of a mold/config element that never declares one.
    pub const DEFAULT: Version = Version::new(1, 0);
}

impl Default for Version {
    fn default() -> Self {
        Version::DEFAULT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major_str, minor_str) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidArgument(format!("'{s}' is not a major.minor version")))?;
        let major = major_str
            .parse::<u32>()
            .map_err(|_| Error::InvalidArgument(format!("'{s}' has a non-numeric major")))?;
        let minor = minor_str
            .parse::<u32>()
            .map_err(|_| Error::InvalidArgument(format!("'{s}' has a non-numeric minor")))?;
        Ok(Version::new(major, minor))
    }
}

/// Ordering helper matching `dc_semantic_version_compare`'s tri-state return.
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_one_zero() {
        assert_eq!(Version::default(), Version::new(1, 0));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Version::new(1, 9) < Version::new(2, 0));
        assert!(Version::new(2, 0) < Version::new(2, 1));
        assert_eq!(Version::new(2, 1), Version::new(2, 1));
    }

    #[test]
    fn parses_and_displays() {
        let v: Version = "3.7".parse().unwrap();
        assert_eq!(v, Version::new(3, 7));
        assert_eq!(v.to_string(), "3.7");
    }

    #[test]
    fn rejects_malformed() {
        assert!("3".parse::<Version>().is_err());
        assert!("x.y".parse::<Version>().is_err());
        assert!("3.y".parse::<Version>().is_err());
    }
}
