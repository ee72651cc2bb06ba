//! Version-ordered default values for a mold KEYVAL.
//!
//! Ported from `src/context_default.c` / `src/private_include/default.h`.

use crate::error::Error;
use crate::value::Value;
use crate::version::Version;

#[derive(Debug, Clone)]
pub struct DefaultEntry {
    pub introduced: Version,
    pub value: Value,
}

/// A KEYVAL's sorted-by-introduced-version default list.
#[derive(Debug, Clone, Default)]
pub struct DefaultList {
    entries: Vec<DefaultEntry>,
}

impl DefaultList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DefaultEntry> {
        self.entries.iter()
    }

    /// Inserts a default, keeping the list sorted ascending by `introduced`.
    /// Rejects a duplicate `introduced` version with `CONFLICTING_SEMVER`,
    /// exactly as `dx_context_default` does at finalize.
    pub fn insert(&mut self, introduced: Version, value: Value) -> Result<(), Error> {
        if self.entries.iter().any(|e| e.introduced == introduced) {
            return Err(Error::ConflictingSemver(format!(
                "a default already exists at version {introduced}"
            )));
        }
        let position = self
            .entries
            .iter()
            .position(|e| e.introduced > introduced)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, DefaultEntry { introduced, value });
        Ok(())
    }

    /// The default with the greatest `introduced <= target`, or the
    /// earliest default if none qualify (spec.md §4.4).
    pub fn active(&self, target: &Version) -> Option<&DefaultEntry> {
        self.entries
            .iter()
            .filter(|e| e.introduced <= *target)
            .max_by_key(|e| e.introduced)
            .or_else(|| self.entries.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_picks_latest_not_exceeding_target() {
        let mut defaults = DefaultList::new();
        defaults.insert(Version::new(1, 0), Value::Integer(4)).unwrap();
        defaults.insert(Version::new(2, 0), Value::Integer(8)).unwrap();

        assert_eq!(defaults.active(&Version::new(1, 0)).unwrap().value, Value::Integer(4));
        assert_eq!(defaults.active(&Version::new(1, 5)).unwrap().value, Value::Integer(4));
        assert_eq!(defaults.active(&Version::new(2, 0)).unwrap().value, Value::Integer(8));
        assert_eq!(defaults.active(&Version::new(9, 0)).unwrap().value, Value::Integer(8));
    }

    #[test]
    fn active_falls_back_to_earliest_below_all() {
        let mut defaults = DefaultList::new();
        defaults.insert(Version::new(2, 0), Value::Integer(8)).unwrap();
        assert_eq!(defaults.active(&Version::new(1, 0)).unwrap().value, Value::Integer(8));
    }

    #[test]
    fn duplicate_version_rejected() {
        let mut defaults = DefaultList::new();
        defaults.insert(Version::new(1, 0), Value::Integer(1)).unwrap();
        let err = defaults.insert(Version::new(1, 0), Value::Integer(2)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConflictingSemver);
    }

    #[test]
    fn monotonic_lookup_property() {
        let mut defaults = DefaultList::new();
        defaults.insert(Version::new(1, 0), Value::Integer(1)).unwrap();
        defaults.insert(Version::new(2, 0), Value::Integer(2)).unwrap();
        defaults.insert(Version::new(3, 0), Value::Integer(3)).unwrap();
        let d1 = defaults.active(&Version::new(1, 5)).unwrap().introduced;
        let d2 = defaults.active(&Version::new(2, 5)).unwrap().introduced;
        assert!(d1 <= d2);
    }

    proptest::proptest! {
        // Active-default lookup is monotonic (spec.md §8, invariant 7): for
        // any set of distinct introduced versions and any V1 <= V2, looking
        // up the active default at V1 never yields a *later* introduced
        // version than looking it up at V2.
        #[test]
        fn monotonic_lookup_holds_for_arbitrary_version_sets(
            majors in proptest::collection::hash_set(0u32..6, 1..8),
            v1_minor in 0u32..6,
            v2_minor in 0u32..6,
        ) {
            let mut defaults = DefaultList::new();
            let mut majors: Vec<u32> = majors.into_iter().collect();
            majors.sort_unstable();
            for (i, major) in majors.iter().enumerate() {
                defaults.insert(Version::new(*major, 0), Value::Integer(i as i64)).unwrap();
            }

            let (lo, hi) = if v1_minor <= v2_minor { (v1_minor, v2_minor) } else { (v2_minor, v1_minor) };
            let last_major = *majors.last().unwrap();
            let v1 = Version::new(last_major, lo);
            let v2 = Version::new(last_major, hi);

            let d1 = defaults.active(&v1).unwrap().introduced;
            let d2 = defaults.active(&v2).unwrap().introduced;
            proptest::prop_assert!(d1 <= d2);
        }
    }
}
