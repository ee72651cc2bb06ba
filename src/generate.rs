//! Generates a default-valued config from a mold at a given target version
//! (spec.md §4.9).
//!
//! Ported from `src/config.c: disir_generate_config_from_mold`: walks the
//! mold depth-first, instantiating `min_entries` copies of each element
//! (defaulting to 1 when `min_entries` is 0 — an element that is merely
//! optional still gets one instance in a freshly generated config) and
//! copying each keyval's active default at the target version.

use crate::context::{Context, Payload, Tag};
use crate::error::Error;
use crate::mold::{config_begin, config_finalize, config_set_version};
use crate::restriction;
use crate::version::Version;

/// `generate_config_from_mold(mold, target_version?)` from spec.md §4.9.
/// `target_version = None` uses the mold's own (cached) version.
pub fn generate_config_from_mold(mold: &Context, target_version: Option<Version>) -> Result<Context, Error> {
    if mold.tag() != Tag::Mold {
        return Err(Error::WrongContext("generate requires a MOLD context".into()));
    }

    let mold_version = {
        let node = mold.borrow();
        match &node.payload {
            Payload::Mold(m) => m.version,
            _ => Version::DEFAULT,
        }
    };
    let target = target_version.unwrap_or(mold_version);
    if target > mold_version {
        return Err(Error::InvalidArgument(format!(
            "target version {target} exceeds mold version {mold_version}"
        )));
    }

    let config = config_begin(mold)?;
    config_set_version(&config, target)?;
    populate_children(mold, &config, &target)?;
    config_finalize(&config)?;
    Ok(config)
}

/// Recursively instantiates `mold_parent`'s children under `config_parent`.
fn populate_children(mold_parent: &Context, config_parent: &Context, target: &Version) -> Result<(), Error> {
    let children: Vec<Context> = {
        let node = mold_parent.borrow();
        let elements = match &node.payload {
            Payload::Mold(m) => &m.elements,
            Payload::Section(s) => &s.elements,
            _ => return Ok(()),
        };
        elements.iter().cloned().map(Context::from).collect()
    };

    // Only instantiate the first occurrence of each same-named sibling group;
    // `min_entries` determines how many copies to make of *that* group.
    let mut handled = std::collections::HashSet::new();
    for mold_child in &children {
        let name = mold_child.name().unwrap_or_default();
        if !handled.insert(name.clone()) {
            continue;
        }

        let introduced = introduced_of(mold_child);
        if introduced > *target {
            continue; // not yet introduced at the target version
        }

        let restrictions = restrictions_of(mold_child);
        let resolved = restriction::resolve(&restrictions, target);
        let instances = resolved.min_entries.max(1);

        for _ in 0..instances {
            match mold_child.tag() {
                Tag::Section => {
                    let section = instantiate_section(mold_child, config_parent)?;
                    populate_children(mold_child, &section, target)?;
                    section.finalize()?;
                }
                Tag::Keyval => {
                    instantiate_keyval(mold_child, config_parent, target)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn introduced_of(mold_node: &Context) -> Version {
    let node = mold_node.borrow();
    match &node.payload {
        Payload::Section(s) => s.introduced.unwrap_or(Version::DEFAULT),
        Payload::Keyval(k) => k.introduced.unwrap_or(Version::DEFAULT),
        _ => Version::DEFAULT,
    }
}

fn restrictions_of(mold_node: &Context) -> Vec<crate::restriction::RestrictionEntry> {
    let node = mold_node.borrow();
    match &node.payload {
        Payload::Section(s) => s.restrictions.clone(),
        Payload::Keyval(k) => k.restrictions.clone(),
        _ => Vec::new(),
    }
}

fn instantiate_section(mold_section: &Context, config_parent: &Context) -> Result<Context, Error> {
    let name = mold_section.name().unwrap_or_default();
    let section = Context::begin(Some(config_parent), Tag::Section)?;
    section.set_name(&name)?;
    Ok(section)
}

fn instantiate_keyval(mold_keyval: &Context, config_parent: &Context, target: &Version) -> Result<(), Error> {
    let name = mold_keyval.name().unwrap_or_default();
    let default_value = crate::query::active_default_value(mold_keyval, target)?;

    let keyval = Context::begin(Some(config_parent), Tag::Keyval)?;
    keyval.set_name(&name)?;
    keyval.set_value_type(default_value.value_type())?;
    match default_value {
        crate::value::Value::String(s) => keyval.set_value_string(s)?,
        crate::value::Value::Integer(i) => keyval.set_value_integer(i)?,
        crate::value::Value::Float(f) => keyval.set_value_float(f)?,
        crate::value::Value::Boolean(b) => keyval.set_value_boolean(b)?,
        crate::value::Value::Enum(e) => keyval.set_value_enum(e)?,
    }
    keyval.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mold::{add_keyval_integer, add_section, config_version, mold_begin, mold_finalize};
    use crate::validation::config_valid;

    #[test]
    fn generated_config_is_always_valid() {
        let mold = mold_begin().unwrap();
        add_keyval_integer(&mold, "threads", 4, "", Version::new(1, 0)).unwrap();
        let worker = add_section(&mold, "worker", "", Version::new(1, 0)).unwrap();
        add_keyval_integer(&worker, "id", 1, "", Version::new(1, 0)).unwrap();
        mold_finalize(&mold).unwrap();

        let config = generate_config_from_mold(&mold, None).unwrap();
        assert!(config_valid(&config).unwrap().is_empty());
        assert_eq!(config_version(&config).unwrap(), Version::new(1, 0));
    }

    #[test]
    fn generate_copies_active_default_at_target() {
        let mold = mold_begin().unwrap();
        let keyval = Context::begin(Some(&mold), Tag::Keyval).unwrap();
        keyval.set_name("threads").unwrap();
        keyval.set_value_type(crate::value::ValueType::Integer).unwrap();
        let d1 = Context::begin(Some(&keyval), Tag::Default).unwrap();
        d1.add_introduced(Version::new(1, 0)).unwrap();
        d1.set_value_integer(4).unwrap();
        d1.finalize().unwrap();
        let d2 = Context::begin(Some(&keyval), Tag::Default).unwrap();
        d2.add_introduced(Version::new(2, 0)).unwrap();
        d2.set_value_integer(8).unwrap();
        d2.finalize().unwrap();
        keyval.add_introduced(Version::new(1, 0)).unwrap();
        keyval.finalize().unwrap();
        mold_finalize(&mold).unwrap();

        let config_v1 = generate_config_from_mold(&mold, Some(Version::new(1, 0))).unwrap();
        assert_eq!(crate::query::get_value_string(&config_v1, "threads").unwrap(), "4");

        let config_v2 = generate_config_from_mold(&mold, Some(Version::new(2, 0))).unwrap();
        assert_eq!(crate::query::get_value_string(&config_v2, "threads").unwrap(), "8");
    }
}
