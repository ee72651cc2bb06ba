//! Whole-tree and per-node validity checking against the mold (spec.md §4.7).
//!
//! Ported from `lib/disir_validate.c`'s recursive descent: `context_valid`
//! checks only the invariants a single node owns, while `config_valid` /
//! `mold_valid` walk the whole tree and collect every offending node so
//! tooling can "present all problems at once" (spec.md §7).

use crate::context::{Context, Payload, Tag};
use crate::error::Error;
use crate::restriction;
use crate::version::Version;

/// Checks only this node's own invariants — no recursion into children.
pub fn context_valid(ctx: &Context) -> bool {
    ctx.is_valid()
}

/// Walks `root`'s subtree depth-first, returning every context that fails
/// [`context_valid`], including cardinality violations detectable only with
/// sibling context (min_entries, which §4.1 defers to whole-tree validation).
fn collect_invalid(root: &Context, out: &mut Vec<Context>) {
    if !context_valid(root) {
        out.push(root.clone());
    }
    for child in children_of(root) {
        collect_invalid(&child, out);
    }
    check_min_entries(root, out);
}

fn children_of(ctx: &Context) -> Vec<Context> {
    let node = ctx.borrow();
    let elements = match &node.payload {
        Payload::Mold(m) => &m.elements,
        Payload::Config(c) => &c.elements,
        Payload::Section(s) => &s.elements,
        _ => return Vec::new(),
    };
    elements.iter().map(|n| Context::from(n.clone())).collect()
}

/// Minimum-entries is "invisible during construction but reported by
/// `config_valid`" (spec.md §8, boundary behavior) — it can only be checked
/// once all siblings under a parent are known, so it runs once per parent
/// rather than per child.
fn check_min_entries(parent: &Context, out: &mut Vec<Context>) {
    let is_config = parent.tag() == Tag::Config || parent.tag() == Tag::Section;
    if !is_config {
        return;
    }
    let config_version = match config_version_of(parent) {
        Some(v) => v,
        None => return,
    };
    let mold_parent = match parent.tag() {
        Tag::Config => crate::mold::config_mold(parent).ok(),
        Tag::Section => mold_equiv_of(parent),
        _ => None,
    };
    let mold_parent = match mold_parent {
        Some(m) => m,
        None => return,
    };

    // Walk every distinct name the mold declares under this parent, even
    // ones with zero instances in the config — min_entries violations are
    // invisible during construction precisely because "no instance at all"
    // can't be caught by a per-add check (spec.md §4.1).
    let mold_children: Vec<(String, Vec<crate::restriction::RestrictionEntry>)> = {
        let node = mold_parent.borrow();
        let elements = match &node.payload {
            Payload::Mold(m) => &m.elements,
            Payload::Section(s) => &s.elements,
            _ => return,
        };
        let mut seen = std::collections::HashSet::new();
        elements
            .iter_named()
            .filter(|(name, _)| seen.insert(name.to_string()))
            .map(|(name, child)| {
                let restrictions = match &child.borrow().payload {
                    Payload::Section(s) => s.restrictions.clone(),
                    Payload::Keyval(k) => k.restrictions.clone(),
                    _ => Vec::new(),
                };
                (name.to_string(), restrictions)
            })
            .collect()
    };

    let node = parent.borrow();
    let elements = match &node.payload {
        Payload::Config(c) => &c.elements,
        Payload::Section(s) => &s.elements,
        _ => return,
    };

    for (name, restrictions) in &mold_children {
        let resolved = restriction::resolve(restrictions, &config_version);
        let count = elements.count_by_name(name) as u32;
        if count < resolved.min_entries {
            out.push(parent.clone());
        }
    }
}

fn mold_equiv_of(ctx: &Context) -> Option<Context> {
    let node = ctx.borrow();
    let weak = match &node.payload {
        Payload::Section(s) => s.mold_equiv.clone(),
        Payload::Keyval(k) => k.mold_equiv.clone(),
        _ => None,
    };
    weak.and_then(|w| w.upgrade()).map(Context::from)
}

fn config_version_of(ctx: &Context) -> Option<Version> {
    let root = ctx.root_tag_pub();
    if root != Some(Tag::Config) {
        return None;
    }
    let node = ctx.borrow();
    match &node.root {
        Some(r) => r.upgrade().and_then(|root| match &root.borrow().payload {
            Payload::Config(c) => Some(c.version),
            _ => None,
        }),
        None => match &node.payload {
            Payload::Config(c) => Some(c.version),
            _ => None,
        },
    }
}

/// `config_valid(config) -> (ok|INVALID_CONTEXT, collection)` from spec.md §4.7.
pub fn config_valid(config: &Context) -> Result<Vec<Context>, Error> {
    if config.tag() != Tag::Config {
        return Err(Error::WrongContext("config_valid requires a CONFIG context".into()));
    }
    let mut out = Vec::new();
    collect_invalid(config, &mut out);
    Ok(out)
}

/// `mold_valid(mold)` is analogous to [`config_valid`] but for a mold tree.
pub fn mold_valid(mold: &Context) -> Result<Vec<Context>, Error> {
    if mold.tag() != Tag::Mold {
        return Err(Error::WrongContext("mold_valid requires a MOLD context".into()));
    }
    let mut out = Vec::new();
    collect_invalid(mold, &mut out);
    Ok(out)
}

/// The maximum `introduced` version over every descendant of `mold` — used
/// by [`crate::mold::mold_finalize`] to cache the mold's overall version.
pub fn max_introduced_version(mold: &Context) -> Version {
    fn walk(ctx: &Context, max: &mut Version) {
        let node = ctx.borrow();
        match &node.payload {
            Payload::Mold(m) => {
                for child in m.elements.iter() {
                    walk(&Context::from(child.clone()), max);
                }
            }
            Payload::Section(s) => {
                if let Some(v) = s.introduced {
                    *max = (*max).max(v);
                }
                if let Some(v) = s.deprecated {
                    *max = (*max).max(v);
                }
                for child in s.elements.iter() {
                    walk(&Context::from(child.clone()), max);
                }
                for r in &s.restrictions {
                    *max = (*max).max(r.introduced);
                }
            }
            Payload::Keyval(k) => {
                if let Some(v) = k.introduced {
                    *max = (*max).max(v);
                }
                if let Some(defaults) = &k.defaults {
                    for d in defaults.iter() {
                        *max = (*max).max(d.introduced);
                    }
                }
                for r in &k.restrictions {
                    *max = (*max).max(r.introduced);
                }
            }
            _ => {}
        }
    }
    let mut max = Version::DEFAULT;
    walk(mold, &mut max);
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Tag;
    use crate::mold::{add_keyval_integer, config_begin, config_finalize, mold_begin, mold_finalize};

    #[test]
    fn empty_mold_and_config_are_valid() {
        let mold = mold_begin().unwrap();
        assert!(mold_finalize(&mold).unwrap());
        assert!(mold_valid(&mold).unwrap().is_empty());

        let config = config_begin(&mold).unwrap();
        assert!(config_finalize(&config).unwrap());
        assert!(config_valid(&config).unwrap().is_empty());
    }

    #[test]
    fn unnamed_keyval_surfaces_as_invalid() {
        let mold = mold_begin().unwrap();
        let section = crate::mold::add_section(&mold, "net", "", Version::DEFAULT);
        let section = match section {
            Ok(s) => s,
            Err(_) => panic!("section should build"),
        };
        let keyval = Context::begin(Some(&section), Tag::Keyval).unwrap();
        // no name, no type, no default: every mold-keyval invariant is unmet
        let valid = keyval.finalize().unwrap();
        assert!(!valid);
        section.finalize().ok();

        assert!(!mold_valid(&mold).unwrap().is_empty());
    }

    #[test]
    fn illegal_keyval_name_surfaces_as_invalid() {
        // Scenario F (spec.md): a keyval named with an illegal character
        // fails finalize/mold_finalize with INVALID_CONTEXT and shows up in
        // mold_valid's collection, even though type and default are otherwise
        // well-formed.
        let mold = mold_begin().unwrap();
        let keyval = Context::begin(Some(&mold), Tag::Keyval).unwrap();
        keyval.set_name("bad name!").unwrap();
        keyval.set_value_type(crate::value::ValueType::Integer).unwrap();
        let default = Context::begin(Some(&keyval), Tag::Default).unwrap();
        default.add_introduced(Version::DEFAULT).unwrap();
        default.set_value_integer(1).unwrap();
        default.finalize().unwrap();
        keyval.add_introduced(Version::DEFAULT).unwrap();

        let valid = keyval.finalize().unwrap();
        assert!(!valid);

        assert!(!mold_valid(&mold).unwrap().is_empty());
    }

    #[test]
    fn min_entries_violation_is_reported_at_whole_tree_validation() {
        let mold = mold_begin().unwrap();
        let section = crate::mold::add_section(&mold, "worker", "", Version::DEFAULT).unwrap();
        let restriction = Context::begin(Some(&section), Tag::Restriction).unwrap();
        restriction.set_restriction_type(crate::restriction::RestrictionKind::MinimumEntries).unwrap();
        restriction.set_restriction_entries(1).unwrap();
        restriction.finalize().unwrap();
        add_keyval_integer(&section, "id", 1, "", Version::DEFAULT).unwrap();
        mold_finalize(&mold).unwrap();

        let config = config_begin(&mold).unwrap();
        config_finalize(&config).unwrap();
        // zero `worker` instances exist though min=1: invisible during
        // construction, caught here.
        assert!(!config_valid(&config).unwrap().is_empty());
    }
}
