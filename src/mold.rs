//! Typed begin/finalize builders for MOLD and CONFIG roots, plus the
//! convenience one-shot keyval constructors from spec.md §4.5.
//!
//! Ported from `src/mold.c` / `src/config.c`'s `dc_mold_finalize` and
//! `dc_config_finalize`: a MOLD is finalized directly through
//! [`Context::finalize`]; a CONFIG additionally needs its `mold` reference
//! wired in at `begin` time, which [`Context::begin`] alone cannot express
//! (it only knows `Tag`, not "bind to this mold").

use crate::context::{Context, ConfigPayload, Lifecycle, MoldPayload, Node, Payload, Tag};
use crate::error::Error;
use crate::validation;
use crate::value::ValueType;
use crate::version::Version;

use std::cell::RefCell;
use std::rc::Rc;

/// Starts a MOLD root construction. Equivalent to `Context::begin(None, Tag::Mold)`.
pub fn mold_begin() -> Result<Context, Error> {
    Context::begin(None, Tag::Mold)
}

/// Finalizes a MOLD root, additionally recomputing its cached maximum
/// version over every descendant's `introduced` (spec.md §3: "MOLD... a
/// cached maximum version over all descendants' introduced versions").
pub fn mold_finalize(mold: &Context) -> Result<bool, Error> {
    if mold.tag() != Tag::Mold {
        return Err(Error::WrongContext("mold_finalize requires a MOLD context".into()));
    }
    let valid = mold.finalize()?;
    recompute_mold_version(mold);
    Ok(valid)
}

fn recompute_mold_version(mold: &Context) {
    let max = validation::max_introduced_version(mold);
    let mut node = mold.borrow_mut();
    if let Payload::Mold(m) = &mut node.payload {
        m.version = max.max(Version::DEFAULT);
    }
}

/// Starts a CONFIG root construction bound to `mold`. The core takes a
/// reference on the mold for the lifetime of the config (spec.md §5: "The
/// core enforces this by taking a reference on the mold at `config_begin`");
/// an `Rc` clone is exactly that reference.
pub fn config_begin(mold: &Context) -> Result<Context, Error> {
    if mold.tag() != Tag::Mold {
        return Err(Error::WrongContext("config_begin requires a MOLD context".into()));
    }
    if mold.state() == Lifecycle::Destroyed {
        return Err(Error::DestroyedContext("mold has been destroyed".into()));
    }

    let node = Node {
        tag: Tag::Config,
        state: Lifecycle::Constructing,
        valid: true,
        name: None,
        parent: None,
        root: None,
        payload: Payload::Config(ConfigPayload {
            mold: mold.inner_ref().clone(),
            version: Version::DEFAULT,
            elements: Default::default(),
        }),
        error: None,
    };
    let inner = Rc::new(RefCell::new(node));
    // A toplevel CONFIG is its own root, same as a toplevel MOLD.
    inner.borrow_mut().root = Some(Rc::downgrade(&inner));
    Ok(Context::from_inner_pub(inner))
}

fn mold_version(mold: &Context) -> Version {
    let node = mold.borrow();
    match &node.payload {
        Payload::Mold(MoldPayload { version, .. }) => *version,
        _ => Version::DEFAULT,
    }
}

/// Sets the config's version explicitly. Must be `<= mold.version()`
/// (spec.md §3 invariant: "A config's version must be ≤ its mold's version").
pub fn config_set_version(config: &Context, version: Version) -> Result<(), Error> {
    if config.tag() != Tag::Config {
        return Err(Error::WrongContext("only a CONFIG has a version".into()));
    }
    let mold = config_mold(config)?;
    let mold_ver = mold_version(&mold);
    if version > mold_ver {
        return Err(Error::InvalidArgument(format!(
            "config version {version} exceeds mold version {mold_ver}"
        )));
    }
    let mut node = config.borrow_mut();
    if let Payload::Config(c) = &mut node.payload {
        c.version = version;
    }
    Ok(())
}

pub fn config_version(config: &Context) -> Result<Version, Error> {
    let node = config.borrow();
    match &node.payload {
        Payload::Config(c) => Ok(c.version),
        _ => Err(Error::WrongContext("only a CONFIG has a version".into())),
    }
}

/// Returns a fresh handle to this config's mold (increments the `Rc` refcount,
/// mirroring taking out another reference on a shared resource).
pub fn config_mold(config: &Context) -> Result<Context, Error> {
    let node = config.borrow();
    match &node.payload {
        Payload::Config(c) => Ok(Context::from_inner_pub(c.mold.clone())),
        _ => Err(Error::WrongContext("only a CONFIG has a mold".into())),
    }
}

/// Finalizes a CONFIG root. Returns `Ok(valid)`: `valid == false` when any
/// descendant is INVALID, while the handle is still returned either way
/// (spec.md §4.5: "if any descendant is INVALID, also returns INVALID while
/// still yielding the handle").
pub fn config_finalize(config: &Context) -> Result<bool, Error> {
    if config.tag() != Tag::Config {
        return Err(Error::WrongContext("config_finalize requires a CONFIG context".into()));
    }
    config.require_state_pub(Lifecycle::Constructing)?;
    config.set_state_pub(Lifecycle::Finalized);
    let report = validation::config_valid(config)?;
    let mut node = config.borrow_mut();
    node.valid = report.is_empty();
    drop(node);
    Ok(report.is_empty())
}

/// Atomically builds, populates and finalizes a STRING keyval under `parent`
/// — spec.md §4.5's "Convenience constructors".
pub fn add_keyval_string(
    parent: &Context,
    name: &str,
    default_value: &str,
    doc: &str,
    version: Version,
) -> Result<Context, Error> {
    add_keyval(parent, name, ValueType::String, doc, version, |kv| {
        kv.set_value_string(default_value)
    })
}

pub fn add_keyval_integer(
    parent: &Context,
    name: &str,
    default_value: i64,
    doc: &str,
    version: Version,
) -> Result<Context, Error> {
    add_keyval(parent, name, ValueType::Integer, doc, version, |kv| {
        kv.set_value_integer(default_value)
    })
}

pub fn add_keyval_float(
    parent: &Context,
    name: &str,
    default_value: f64,
    doc: &str,
    version: Version,
) -> Result<Context, Error> {
    add_keyval(parent, name, ValueType::Float, doc, version, |kv| {
        kv.set_value_float(default_value)
    })
}

pub fn add_keyval_boolean(
    parent: &Context,
    name: &str,
    default_value: bool,
    doc: &str,
    version: Version,
) -> Result<Context, Error> {
    add_keyval(parent, name, ValueType::Boolean, doc, version, |kv| {
        kv.set_value_boolean(default_value)
    })
}

fn add_keyval(
    parent: &Context,
    name: &str,
    value_type: ValueType,
    doc: &str,
    version: Version,
    set_default_value: impl FnOnce(&Context) -> Result<(), Error>,
) -> Result<Context, Error> {
    let keyval = Context::begin(Some(parent), Tag::Keyval)?;
    keyval.set_name(name)?;
    keyval.set_value_type(value_type)?;
    if !doc.is_empty() {
        keyval.add_documentation(doc, Version::DEFAULT)?;
    }

    let is_mold_rooted = matches!(parent.tag(), Tag::Mold | Tag::Section)
        && root_tag(parent) == Some(Tag::Mold);

    if is_mold_rooted {
        let default = Context::begin(Some(&keyval), Tag::Default)?;
        default.add_introduced(version)?;
        set_default_value(&default)?;
        default.finalize()?;
        keyval.add_introduced(version)?;
    } else {
        set_default_value(&keyval)?;
    }

    keyval.finalize()?;
    Ok(keyval)
}

fn root_tag(ctx: &Context) -> Option<Tag> {
    ctx.root_tag_pub()
}

/// Atomically builds, populates and finalizes a named SECTION under `parent`.
pub fn add_section(parent: &Context, name: &str, doc: &str, version: Version) -> Result<Context, Error> {
    let section = Context::begin(Some(parent), Tag::Section)?;
    section.set_name(name)?;
    if !doc.is_empty() {
        section.add_documentation(doc, Version::DEFAULT)?;
    }
    if root_tag(parent) == Some(Tag::Mold) {
        section.add_introduced(version)?;
    }
    section.finalize()?;
    Ok(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Tag;

    fn sample_mold() -> Context {
        let mold = mold_begin().unwrap();
        add_keyval_integer(&mold, "threads", 4, "worker thread count", Version::new(1, 0)).unwrap();
        mold_finalize(&mold).unwrap();
        mold
    }

    #[test]
    fn mold_version_reflects_max_introduced() {
        let mold = mold_begin().unwrap();
        add_keyval_integer(&mold, "threads", 4, "", Version::new(1, 0)).unwrap();
        let keyval = crate::context::Context::begin(Some(&mold), Tag::Keyval).unwrap();
        keyval.set_name("timeout").unwrap();
        keyval.set_value_type(ValueType::Integer).unwrap();
        let d1 = Context::begin(Some(&keyval), Tag::Default).unwrap();
        d1.add_introduced(Version::new(2, 3)).unwrap();
        d1.set_value_integer(30).unwrap();
        d1.finalize().unwrap();
        keyval.finalize().unwrap();
        mold_finalize(&mold).unwrap();
        assert_eq!(mold_version(&mold), Version::new(2, 3));
    }

    #[test]
    fn config_begin_binds_mold_and_inherits_version() {
        let mold = sample_mold();
        let config = config_begin(&mold).unwrap();
        assert_eq!(config_version(&config).unwrap(), Version::new(1, 0));
        assert!(config_finalize(&config).unwrap());
    }

    #[test]
    fn config_version_cannot_exceed_mold_version() {
        let mold = sample_mold();
        let config = config_begin(&mold).unwrap();
        assert!(config_set_version(&config, Version::new(9, 9)).is_err());
    }
}
