//! Resume-style three-way merge of a config against a newer mold version
//! (spec.md §4.8).
//!
//! Ported from `src/update.c`: `disir_update_config` seeds an `Update` with
//! every old-config keyval in insertion order; `disir_update_continue` walks
//! the cursor until it either finishes or hits a conflict, at which point the
//! cursor position, the offending keyval and both candidate values are
//! captured on the state object rather than unwound through a callback —
//! "Model as an explicit state object (not coroutines)" (spec.md §9).

use crate::context::{Context, Payload, Tag};
use crate::error::Error;
use crate::generate::generate_config_from_mold;
use crate::mold::{config_mold, config_version};
use crate::query;
use crate::value::Value;
use crate::version::Version;

/// A single three-way conflict awaiting manual resolution.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub name: String,
    pub config_value: String,
    pub mold_value: String,
}

/// The caller's resolution choice for a pending [`Conflict`].
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Keep the config's current (user-customized) value.
    KeepConfig,
    /// Discard the user value in favor of the target mold's default.
    TakeMold,
    /// An explicit string supplied by the caller.
    Explicit(String),
}

/// The update engine's resumable state, analogous to `struct disir_update`.
#[derive(Debug)]
pub struct Update {
    config: Context,
    target: Version,
    reference: Context,
    cursor: Vec<Context>,
    position: usize,
    pending: Option<(Context, Conflict)>,
    updated_count: usize,
}

/// `disir_update_config(config, target?) -> Update` — validates the version
/// relationship and seeds the cursor, then immediately runs one pass via
/// [`Update::continue_update`] (mirrors the source's "seed, then continue").
pub fn update_config(config: &Context, target: Option<Version>) -> Result<Update, Error> {
    if config.tag() != Tag::Config {
        return Err(Error::WrongContext("update_config requires a CONFIG context".into()));
    }
    let mold = config_mold(config)?;
    let mold_version = {
        let node = mold.borrow();
        match &node.payload {
            Payload::Mold(m) => m.version,
            _ => Version::DEFAULT,
        }
    };
    let target = target.unwrap_or(mold_version);
    let current = config_version(config)?;

    if current > target {
        return Err(Error::ConflictingSemver(format!(
            "config has higher version ({current}) than target ({target})"
        )));
    }
    if current == target {
        return Err(Error::NoCanDo("config and target are of equal version".into()));
    }

    // A reference config at the target version supplies the "new default"
    // side of the three-way comparison without re-deriving it ad hoc per
    // keyval (spec.md §4.8: "Generate a reference config from the mold at
    // version B").
    let reference = generate_config_from_mold(&mold, Some(target))?;

    let cursor = collect_keyvals_in_order(config);

    let mut update = Update {
        config: config.clone(),
        target,
        reference,
        cursor,
        position: 0,
        pending: None,
        updated_count: 0,
    };
    update.continue_update()?;
    Ok(update)
}

/// Insertion-order, depth-first collection of every KEYVAL under `config`
/// (spec.md §4.8: "in insertion order" / §5: "the update engine visits
/// keyvals in insertion order of the old config").
fn collect_keyvals_in_order(config: &Context) -> Vec<Context> {
    let mut out = Vec::new();
    fn walk(ctx: &Context, out: &mut Vec<Context>) {
        let node = ctx.borrow();
        let elements = match &node.payload {
            Payload::Config(c) => &c.elements,
            Payload::Section(s) => &s.elements,
            _ => return,
        };
        for child in elements.iter() {
            let child_ctx = Context::from(child.clone());
            match child_ctx.tag() {
                Tag::Keyval => out.push(child_ctx),
                Tag::Section => walk(&child_ctx, out),
                _ => {}
            }
        }
    }
    walk(config, &mut out);
    out
}

impl Update {
    /// `disir_update_continue(update)`. Advances from `position` until the
    /// cursor is exhausted (config version bumped to target, `Ok(())`) or a
    /// conflict is hit (`Err` is never returned for conflicts — callers poll
    /// [`Update::is_finished`]/[`Update::conflict`], matching the source's
    /// "caller checks status, not exception" style).
    pub fn continue_update(&mut self) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Error::Conflict("a conflict is pending resolution".into()));
        }

        let config_version = config_version(&self.config)?;

        while self.position < self.cursor.len() {
            let old_keyval = self.cursor[self.position].clone();
            self.position += 1;

            let name = old_keyval.name().unwrap_or_default();
            let path = keyval_path(&self.config, &old_keyval);

            // step 1: removed in target mold (unreachable in the reference
            // config generated at B): skip, it stays until the next update.
            if query::resolve(&self.reference, &path).is_err() {
                continue;
            }

            let mold_equiv = mold_equiv_of(&old_keyval);
            let target_default = mold_equiv
                .as_ref()
                .and_then(|m| query::active_default_value(m, &self.target).ok());
            let target_default_introduced = mold_equiv
                .as_ref()
                .and_then(|m| default_introduced(m, &self.target));

            if let Some(introduced) = target_default_introduced {
                if introduced <= config_version {
                    continue; // step 2: nothing changed at the target version
                }
            }

            let current_value = current_value_of(&old_keyval);
            let current_value = match current_value {
                Some(v) => v,
                None => continue,
            };

            if let Some(target_default) = &target_default {
                if current_value.compare(target_default) == 0 {
                    continue; // step 3: already matches the new default
                }
            }

            let config_default = mold_equiv
                .as_ref()
                .and_then(|m| query::active_default_value(m, &config_version).ok());

            if let Some(config_default) = &config_default {
                if current_value.compare(config_default) == 0 {
                    // step 4: user never customized; follow the mold forward
                    if let Some(target_default) = &target_default {
                        set_keyval_value(&old_keyval, target_default)?;
                        self.updated_count += 1;
                    }
                    continue;
                }
            }

            // step 5: conflict
            let target_default_str = target_default
                .as_ref()
                .map(|v| v.stringify())
                .unwrap_or_default();
            self.pending = Some((
                old_keyval.clone(),
                Conflict {
                    name,
                    config_value: current_value.stringify(),
                    mold_value: target_default_str,
                },
            ));
            return Ok(());
        }

        crate::mold::config_set_version(&self.config, self.target)?;
        Ok(())
    }

    /// `disir_update_conflict(update)` — `NotExist` when there's nothing
    /// pending, mirroring the source's `NO_CAN_DO`.
    pub fn conflict(&self) -> Result<&Conflict, Error> {
        self.pending
            .as_ref()
            .map(|(_, c)| c)
            .ok_or_else(|| Error::NoCanDo("no conflict is pending".into()))
    }

    /// `disir_update_resolve(update, resolution)`.
    pub fn resolve(&mut self, resolution: Resolution) -> Result<(), Error> {
        let (keyval, conflict) = self
            .pending
            .take()
            .ok_or_else(|| Error::NoCanDo("no conflict is pending".into()))?;

        let chosen = match resolution {
            Resolution::KeepConfig => conflict.config_value.clone(),
            Resolution::TakeMold => conflict.mold_value.clone(),
            Resolution::Explicit(s) => s,
        };

        if let Err(e) = apply_stringified(&keyval, &chosen) {
            self.pending = Some((keyval, conflict));
            return Err(e);
        }
        self.updated_count += 1;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_none() && self.position >= self.cursor.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated_count
    }
}

fn keyval_path(_config: &Context, keyval: &Context) -> String {
    let mut parts = Vec::new();
    let mut current = keyval.clone();
    loop {
        parts.push(current.name().unwrap_or_default());
        let parent = {
            let node = current.borrow();
            node.parent.clone().and_then(|p| p.upgrade())
        };
        match parent {
            Some(p) => {
                let p_ctx = Context::from(p);
                if matches!(p_ctx.tag(), Tag::Config) {
                    break;
                }
                current = p_ctx;
            }
            None => break,
        }
    }
    parts.reverse();
    parts.join(".")
}

fn mold_equiv_of(keyval: &Context) -> Option<Context> {
    let node = keyval.borrow();
    match &node.payload {
        Payload::Keyval(kv) => kv.mold_equiv.as_ref().and_then(|w| w.upgrade()).map(Context::from),
        _ => None,
    }
}

fn default_introduced(mold_keyval: &Context, target: &Version) -> Option<Version> {
    let node = mold_keyval.borrow();
    match &node.payload {
        Payload::Keyval(kv) => kv.defaults.as_ref().and_then(|d| d.active(target)).map(|d| d.introduced),
        _ => None,
    }
}

fn current_value_of(keyval: &Context) -> Option<Value> {
    let node = keyval.borrow();
    match &node.payload {
        Payload::Keyval(kv) => kv.value.clone(),
        _ => None,
    }
}

fn set_keyval_value(keyval: &Context, value: &Value) -> Result<(), Error> {
    match value {
        Value::String(s) => keyval.set_value_string(s.clone()),
        Value::Integer(i) => keyval.set_value_integer(*i),
        Value::Float(f) => keyval.set_value_float(*f),
        Value::Boolean(b) => keyval.set_value_boolean(*b),
        Value::Enum(e) => keyval.set_value_enum(e.clone()),
    }
}

fn apply_stringified(keyval: &Context, s: &str) -> Result<(), Error> {
    let value_type = {
        let node = keyval.borrow();
        match &node.payload {
            Payload::Keyval(kv) => kv.value_type,
            _ => None,
        }
    };
    match value_type {
        Some(crate::value::ValueType::String) | Some(crate::value::ValueType::Enum) => {
            keyval.set_value_string(s)
        }
        Some(crate::value::ValueType::Integer) => {
            let v: i64 = s
                .parse()
                .map_err(|_| Error::WrongValueType(format!("'{s}' is not an integer")))?;
            keyval.set_value_integer(v)
        }
        Some(crate::value::ValueType::Float) => {
            let v: f64 = s
                .parse()
                .map_err(|_| Error::WrongValueType(format!("'{s}' is not a float")))?;
            keyval.set_value_float(v)
        }
        Some(crate::value::ValueType::Boolean) => keyval.set_value_boolean(s.eq_ignore_ascii_case("true")),
        _ => Err(Error::WrongValueType("keyval has no declared value type".into())),
    }
}

/// Convenience variant: resolves every conflict by keeping the config's
/// current value (spec.md §4.8, "Convenience variants").
pub fn update_config_keep(config: &Context, target: Option<Version>) -> Result<usize, Error> {
    let mut update = update_config(config, target)?;
    while !update.is_finished() {
        update.resolve(Resolution::KeepConfig)?;
        update.continue_update()?;
    }
    Ok(update.updated_count())
}

/// Convenience variant: resolves every conflict by taking the target mold's
/// default.
pub fn update_config_discard(config: &Context, target: Option<Version>) -> Result<usize, Error> {
    let mut update = update_config(config, target)?;
    while !update.is_finished() {
        update.resolve(Resolution::TakeMold)?;
        update.continue_update()?;
    }
    Ok(update.updated_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mold::{add_keyval_integer, config_begin, config_finalize, config_set_version, mold_begin, mold_finalize};
    use crate::value::ValueType;

    fn threads_mold() -> Context {
        let mold = mold_begin().unwrap();
        let keyval = Context::begin(Some(&mold), Tag::Keyval).unwrap();
        keyval.set_name("threads").unwrap();
        keyval.set_value_type(ValueType::Integer).unwrap();
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
        mold
    }

    #[test]
    fn scenario_a_versioned_default_upgrade_without_user_change() {
        let mold = threads_mold();
        let config = config_begin(&mold).unwrap();
        add_keyval_integer(&config, "threads", 4, "", Version::DEFAULT).unwrap();
        config_finalize(&config).unwrap();

        let update = update_config(&config, Some(Version::new(2, 0))).unwrap();
        assert!(update.is_finished());
        assert_eq!(query::get_value_string(&config, "threads").unwrap(), "8");
        assert_eq!(config_version(&config).unwrap(), Version::new(2, 0));
    }

    #[test]
    fn scenario_b_conflict_keep_and_discard() {
        let mold = threads_mold();

        let config_keep = config_begin(&mold).unwrap();
        add_keyval_integer(&config_keep, "threads", 16, "", Version::DEFAULT).unwrap();
        config_finalize(&config_keep).unwrap();
        let mut update = update_config(&config_keep, Some(Version::new(2, 0))).unwrap();
        assert!(!update.is_finished());
        {
            let conflict = update.conflict().unwrap();
            assert_eq!(conflict.name, "threads");
            assert_eq!(conflict.config_value, "16");
            assert_eq!(conflict.mold_value, "8");
        }
        update.resolve(Resolution::KeepConfig).unwrap();
        update.continue_update().unwrap();
        assert!(update.is_finished());
        assert_eq!(query::get_value_string(&config_keep, "threads").unwrap(), "16");

        let config_discard = config_begin(&mold).unwrap();
        add_keyval_integer(&config_discard, "threads", 16, "", Version::DEFAULT).unwrap();
        config_finalize(&config_discard).unwrap();
        let mut update = update_config(&config_discard, Some(Version::new(2, 0))).unwrap();
        update.resolve(Resolution::TakeMold).unwrap();
        update.continue_update().unwrap();
        assert_eq!(query::get_value_string(&config_discard, "threads").unwrap(), "8");
    }

    #[test]
    fn same_version_update_is_no_can_do() {
        let mold = threads_mold();
        let config = config_begin(&mold).unwrap();
        add_keyval_integer(&config, "threads", 4, "", Version::DEFAULT).unwrap();
        config_finalize(&config).unwrap();
        config_set_version(&config, Version::new(2, 0)).unwrap();

        let err = update_config(&config, Some(Version::new(2, 0))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoCanDo);
    }

    #[test]
    fn higher_source_version_is_conflicting_semver() {
        let mold = threads_mold();
        let config = config_begin(&mold).unwrap();
        add_keyval_integer(&config, "threads", 4, "", Version::DEFAULT).unwrap();
        config_finalize(&config).unwrap();
        config_set_version(&config, Version::new(2, 0)).unwrap();

        let err = update_config(&config, Some(Version::new(1, 0))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConflictingSemver);
    }
}
