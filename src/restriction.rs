//! Version-ordered restrictions attached to a KEYVAL or SECTION.
//!
//! Ported from the cardinality and value-range checks scattered across
//! `lib/disir_config_query.c` and `src/private_include/default.h` in the
//! original source, generalized to a single flat list per owner as spec.md
//! §4.4 describes.

use crate::value::{Value, ValueType};
use crate::version::Version;

/// The restriction kind, mirroring `enum disir_restriction_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionKind {
    MinimumEntries,
    MaximumEntries,
    ValueEnum,
    ValueRange,
    ValueNumeric,
}

/// Restriction-specific payload. Range/Numeric are stored as `f64` since
/// both INTEGER and FLOAT keyvals may carry them; the active-restriction
/// check below casts the keyval's `Value` to `f64` for comparison.
#[derive(Debug, Clone)]
pub enum RestrictionPayload {
    Entries(u32),
    Enum(String),
    Range { lo: f64, hi: f64 },
    Numeric(f64),
}

#[derive(Debug, Clone)]
pub struct Documentation {
    pub text: String,
    pub introduced: Version,
}

#[derive(Debug, Clone)]
pub struct RestrictionEntry {
    pub kind: RestrictionKind,
    pub introduced: Version,
    pub deprecated: Option<Version>,
    pub doc: Vec<Documentation>,
    pub payload: RestrictionPayload,
}

/// The restriction set resolved against a single target version: cardinality
/// bounds plus the union of active VALUE_* constraints.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub min_entries: u32,
    pub max_entries: u32,
    pub enum_members: Vec<String>,
    pub ranges: Vec<(f64, f64)>,
    pub numerics: Vec<f64>,
}

impl Resolved {
    /// Default cardinality when no MIN/MAX is active: min=0, max=1 — an
    /// element under a mold is optional-single unless a restriction widens it
    /// (spec.md §4.4).
    fn default_entries() -> (u32, u32) {
        (0, 1)
    }
}

/// Picks, for a single restriction kind, the entry with the greatest
/// `introduced <= target` whose `deprecated` (if any) is `> target`.
fn active_entry<'a>(
    entries: &'a [RestrictionEntry],
    kind: RestrictionKind,
    target: &Version,
) -> Option<&'a RestrictionEntry> {
    entries
        .iter()
        .filter(|e| e.kind == kind && e.introduced <= *target)
        .filter(|e| e.deprecated.is_none_or(|d| d > *target))
        .max_by_key(|e| e.introduced)
}

/// Resolves the full restriction set at `target`. MIN/MAX are each
/// single-valued (latest wins); VALUE_ENUM/RANGE/NUMERIC union every
/// currently active entry (spec.md §4.4: "duplicates across active entries
/// are a union").
pub fn resolve(entries: &[RestrictionEntry], target: &Version) -> Resolved {
    let (default_min, default_max) = Resolved::default_entries();

    let min_entries = active_entry(entries, RestrictionKind::MinimumEntries, target)
        .map(|e| match e.payload {
            RestrictionPayload::Entries(n) => n,
            _ => default_min,
        })
        .unwrap_or(default_min);

    let max_entries = active_entry(entries, RestrictionKind::MaximumEntries, target)
        .map(|e| match e.payload {
            RestrictionPayload::Entries(n) => n,
            _ => default_max,
        })
        .unwrap_or(u32::MAX)
        // if no MAX entry is active at all, default is 1 (optional-single);
        // an active entry with an explicit value always wins over that default.
        .min(if active_entry(entries, RestrictionKind::MaximumEntries, target).is_some() {
            u32::MAX
        } else {
            default_max
        });

    let enum_members: Vec<String> = entries
        .iter()
        .filter(|e| e.kind == RestrictionKind::ValueEnum)
        .filter(|e| e.introduced <= *target)
        .filter(|e| e.deprecated.is_none_or(|d| d > *target))
        .filter_map(|e| match &e.payload {
            RestrictionPayload::Enum(s) => Some(s.clone()),
            _ => None,
        })
        .collect();

    let ranges: Vec<(f64, f64)> = entries
        .iter()
        .filter(|e| e.kind == RestrictionKind::ValueRange)
        .filter(|e| e.introduced <= *target)
        .filter(|e| e.deprecated.is_none_or(|d| d > *target))
        .filter_map(|e| match e.payload {
            RestrictionPayload::Range { lo, hi } => Some((lo, hi)),
            _ => None,
        })
        .collect();

    let numerics: Vec<f64> = entries
        .iter()
        .filter(|e| e.kind == RestrictionKind::ValueNumeric)
        .filter(|e| e.introduced <= *target)
        .filter(|e| e.deprecated.is_none_or(|d| d > *target))
        .filter_map(|e| match e.payload {
            RestrictionPayload::Numeric(n) => Some(n),
            _ => None,
        })
        .collect();

    Resolved {
        min_entries,
        max_entries,
        enum_members,
        ranges,
        numerics,
    }
}

/// Returns `Ok(())` or a description of which restriction(s) were violated.
pub fn check_value(resolved: &Resolved, value: &Value) -> Result<(), String> {
    if !resolved.enum_members.is_empty() {
        if let Some(s) = value.as_string() {
            if !resolved.enum_members.iter().any(|m| m == s) {
                return Err(format!(
                    "'{s}' is not among the permitted enum values {:?}",
                    resolved.enum_members
                ));
            }
        }
    }

    let numeric = match value.value_type() {
        ValueType::Integer => value.as_integer().map(|i| i as f64),
        ValueType::Float => value.as_float(),
        _ => None,
    };

    if let Some(n) = numeric {
        for (lo, hi) in &resolved.ranges {
            if n < *lo || n > *hi {
                return Err(format!("{n} is outside permitted range [{lo}, {hi}]"));
            }
        }
        for expected in &resolved.numerics {
            if (n - expected).abs() > f64::EPSILON {
                return Err(format!("{n} does not equal the permitted value {expected}"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries_restriction(introduced: Version, value: u32) -> RestrictionEntry {
        RestrictionEntry {
            kind: RestrictionKind::MaximumEntries,
            introduced,
            deprecated: None,
            doc: Vec::new(),
            payload: RestrictionPayload::Entries(value),
        }
    }

    #[test]
    fn default_cardinality_is_zero_one() {
        let resolved = resolve(&[], &Version::new(1, 0));
        assert_eq!(resolved.min_entries, 0);
        assert_eq!(resolved.max_entries, 1);
    }

    #[test]
    fn max_entries_widens_when_active() {
        let restrictions = vec![entries_restriction(Version::new(1, 0), 2)];
        let resolved = resolve(&restrictions, &Version::new(1, 0));
        assert_eq!(resolved.max_entries, 2);
    }

    #[test]
    fn enum_restriction_unions_across_versions() {
        let restrictions = vec![
            RestrictionEntry {
                kind: RestrictionKind::ValueEnum,
                introduced: Version::new(1, 0),
                deprecated: None,
                doc: Vec::new(),
                payload: RestrictionPayload::Enum("red".into()),
            },
            RestrictionEntry {
                kind: RestrictionKind::ValueEnum,
                introduced: Version::new(2, 0),
                deprecated: None,
                doc: Vec::new(),
                payload: RestrictionPayload::Enum("blue".into()),
            },
        ];
        let resolved = resolve(&restrictions, &Version::new(2, 0));
        assert_eq!(resolved.enum_members.len(), 2);
    }

    #[test]
    fn range_violation_is_reported() {
        let restrictions = vec![RestrictionEntry {
            kind: RestrictionKind::ValueRange,
            introduced: Version::new(1, 0),
            deprecated: None,
            doc: Vec::new(),
            payload: RestrictionPayload::Range { lo: 0.0, hi: 10.0 },
        }];
        let resolved = resolve(&restrictions, &Version::new(1, 0));
        assert!(check_value(&resolved, &Value::Integer(5)).is_ok());
        assert!(check_value(&resolved, &Value::Integer(20)).is_err());
    }
}
