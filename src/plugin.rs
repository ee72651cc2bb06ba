//! Plugin dispatch: a registry of I/O backends keyed by group id
//! (spec.md §4.10, §6 "Plugin ABI").
//!
//! Plugins themselves (byte-level TOML/JSON/INI codecs, filesystem layout
//! scanning) are explicitly out of scope (spec.md §1); what lives here is the
//! dispatch surface the core uses to locate and call into one, analogous to
//! the teacher's [`ConfigStore`](crate) registry but keyed by group id
//! instead of `TypeId`, and holding function pointers instead of boxed
//! config instances since a plugin is an external, possibly dynamically
//! loaded, implementation (spec.md §6: "A plugin exposes a single entry
//! point `dio_register_plugin`").

use std::collections::HashMap;
use std::fmt;

use tracing::{info, warn};

use crate::context::Context;
use crate::error::Error;
use crate::version::Version;

/// One of the two entry kinds a plugin can serialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Config,
    Mold,
}

/// Function-pointer table for a single registered I/O backend. Fields mirror
/// `struct disir_register_plugin` (spec.md §6); any may be absent to signal
/// an unsupported operation, as the spec explicitly allows.
pub struct Plugin {
    pub name: String,
    pub description: String,
    /// Free-form backend classification (spec.md §6 `type`), e.g. `"file"` —
    /// descriptive metadata only, never matched on by core dispatch.
    pub plugin_type: String,
    /// Free-form storage medium descriptor (spec.md §6 `storage`), e.g.
    /// `"filesystem"` or `"memory"`.
    pub storage: String,
    pub group_id: String,
    /// Entry id of this plugin's own base config, paired with `mold_base_id`
    /// the way a `PluginRegistration` row pairs them (spec.md §6).
    pub config_base_id: String,
    pub mold_base_id: String,
    pub config_entry_type: EntryType,
    pub mold_entry_type: EntryType,
    pub config_read: Option<ConfigReadFn>,
    pub config_write: Option<ConfigWriteFn>,
    pub config_entries: Option<EntriesFn>,
    pub config_query: Option<ConfigQueryFn>,
    pub mold_read: Option<MoldReadFn>,
    pub mold_write: Option<MoldWriteFn>,
    pub mold_entries: Option<EntriesFn>,
    pub mold_query: Option<MoldQueryFn>,
    /// Per-entry file-descriptor variants used by archive import/export:
    /// they operate directly on bytes already in hand (a tar entry's
    /// content) rather than resolving an entry id to a path themselves.
    pub config_fd_read: Option<ConfigFdReadFn>,
    pub config_fd_write: Option<ConfigFdWriteFn>,
    pub mold_fd_read: Option<MoldFdReadFn>,
    pub mold_fd_write: Option<MoldFdWriteFn>,
    /// Called once, in reverse registration order, at `Instance` teardown.
    pub plugin_finished: Option<Box<dyn FnMut()>>,
}

pub type ConfigReadFn = Box<dyn Fn(&str, &Context) -> Result<Context, Error>>;
pub type ConfigWriteFn = Box<dyn Fn(&str, &Context) -> Result<(), Error>>;
pub type MoldReadFn = Box<dyn Fn(&str) -> Result<Context, Error>>;
pub type MoldWriteFn = Box<dyn Fn(&str, &Context) -> Result<(), Error>>;
pub type EntriesFn = Box<dyn Fn() -> Result<Vec<String>, Error>>;
/// Queries the backend's current version for an entry without reading the
/// full context — used by archive import to decide whether an entry is
/// newer, older, or equal to what's already installed (spec.md §4.11).
pub type ConfigQueryFn = Box<dyn Fn(&str) -> Result<Version, Error>>;
pub type MoldQueryFn = Box<dyn Fn(&str) -> Result<Version, Error>>;
pub type ConfigFdReadFn = Box<dyn Fn(&[u8], &Context) -> Result<Context, Error>>;
pub type ConfigFdWriteFn = Box<dyn Fn(&Context) -> Result<Vec<u8>, Error>>;
pub type MoldFdReadFn = Box<dyn Fn(&[u8]) -> Result<Context, Error>>;
pub type MoldFdWriteFn = Box<dyn Fn(&Context) -> Result<Vec<u8>, Error>>;

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .finish()
    }
}

/// One row of the instance's own libdisir-style config (spec.md §6): which
/// plugin to load, under which group, and which entry ids form its base
/// mold/config.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PluginRegistration {
    pub plugin_filepath: String,
    pub io_id: String,
    pub group_id: String,
    pub config_base_id: String,
    pub mold_base_id: String,
}

/// The plugin registry held by an [`Instance`](crate::plugin::Instance).
/// Registration order is preserved so teardown can run it in reverse
/// (spec.md §6: "tears down plugins in reverse registration order").
#[derive(Default)]
pub struct Registry {
    order: Vec<String>,
    plugins: HashMap<String, Plugin>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its group id. A duplicate group id is
    /// rejected with `EXISTS` — the source leaves "archive duplicate-handle"
    /// registration unsolved (spec.md §9, Open Questions); this
    /// implementation takes the conservative branch and rejects the second
    /// registration rather than silently tracking multiple open handles.
    pub fn register(&mut self, plugin: Plugin) -> Result<(), Error> {
        if self.plugins.contains_key(&plugin.group_id) {
            return Err(Error::Exists(format!(
                "a plugin is already registered under group '{}'",
                plugin.group_id
            )));
        }
        info!(group = %plugin.group_id, name = %plugin.name, "plugin registered");
        self.order.push(plugin.group_id.clone());
        self.plugins.insert(plugin.group_id.clone(), plugin);
        Ok(())
    }

    pub fn get(&self, group_id: &str) -> Result<&Plugin, Error> {
        self.plugins
            .get(group_id)
            .ok_or_else(|| Error::GroupMissing(format!("no plugin registered for group '{group_id}'")))
    }

    pub fn group_ids(&self) -> &[String] {
        &self.order
    }

    /// Delegates to the plugin's `config_read`, failing with `NOT_SUPPORTED`
    /// if the backend left the slot null. `mold` is the schema the returned
    /// config will be bound against (spec.md §6: `config_base_id`/`mold_base_id`
    /// tell the instance which mold an entry id pairs with; resolving that
    /// mapping and loading the mold itself is the caller's job, not the
    /// registry's).
    pub fn config_read(&self, group_id: &str, entry_id: &str, mold: &Context) -> Result<Context, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .config_read
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no config_read")))?;
        f(entry_id, mold)
    }

    pub fn config_write(&self, group_id: &str, entry_id: &str, config: &Context) -> Result<(), Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .config_write
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no config_write")))?;
        f(entry_id, config)
    }

    pub fn mold_read(&self, group_id: &str, entry_id: &str) -> Result<Context, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .mold_read
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no mold_read")))?;
        f(entry_id)
    }

    pub fn mold_write(&self, group_id: &str, entry_id: &str, mold: &Context) -> Result<(), Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .mold_write
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no mold_write")))?;
        f(entry_id, mold)
    }

    /// Queries the current on-backend version of a config entry without a
    /// full read (spec.md §4.10 `config_query`).
    pub fn config_query(&self, group_id: &str, entry_id: &str) -> Result<Version, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .config_query
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no config_query")))?;
        f(entry_id)
    }

    pub fn mold_query(&self, group_id: &str, entry_id: &str) -> Result<Version, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .mold_query
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no mold_query")))?;
        f(entry_id)
    }

    /// Serializes `config` to raw bytes via the plugin's fd-variant writer,
    /// used by archive export to embed a real payload per entry instead of
    /// resolving an on-disk path (spec.md §4.11).
    pub fn config_fd_write(&self, group_id: &str, config: &Context) -> Result<Vec<u8>, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .config_fd_write
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no config_fd_write")))?;
        f(config)
    }

    /// Deserializes raw bytes (already extracted from an archive entry) into
    /// a config bound against `mold`, used by archive import.
    pub fn config_fd_read(&self, group_id: &str, bytes: &[u8], mold: &Context) -> Result<Context, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .config_fd_read
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no config_fd_read")))?;
        f(bytes, mold)
    }

    pub fn mold_fd_write(&self, group_id: &str, mold: &Context) -> Result<Vec<u8>, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .mold_fd_write
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no mold_fd_write")))?;
        f(mold)
    }

    pub fn mold_fd_read(&self, group_id: &str, bytes: &[u8]) -> Result<Context, Error> {
        let plugin = self.get(group_id)?;
        let f = plugin
            .mold_fd_read
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group_id}' has no mold_fd_read")))?;
        f(bytes)
    }

    /// Tears down plugins in reverse registration order, invoking each's
    /// `plugin_finished` hook if present.
    pub fn teardown(&mut self) {
        for group_id in self.order.iter().rev() {
            if let Some(plugin) = self.plugins.get_mut(group_id) {
                if let Some(hook) = plugin.plugin_finished.as_mut() {
                    hook();
                }
            }
        }
        warn!(count = self.order.len(), "plugin registry torn down");
        self.plugins.clear();
        self.order.clear();
    }
}

/// The process-level (by convention, not enforcement — spec.md §9)
/// singleton holding the plugin registry, the instance's own configuration,
/// and an error message buffer (spec.md §6 "Instance lifecycle").
pub struct Instance {
    pub registry: Registry,
    pub registrations: Vec<PluginRegistration>,
    error_buffer: Option<String>,
}

impl Instance {
    /// `instance_create(config_path?, libdisir_config?)`. When `config_path`
    /// is given, the instance's own config (listing plugins to register) is
    /// loaded from TOML via `serde` — the same read-parse-deserialize path
    /// the teacher's `ConfigData::load_from_dir` uses (spec.md §10.2).
    pub fn create(config_path: Option<&std::path::Path>) -> Result<Instance, Error> {
        let registrations = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let parsed: PluginConfigFile = toml::from_str(&text)?;
                parsed.plugin
            }
            None => Vec::new(),
        };
        Ok(Instance {
            registry: Registry::new(),
            registrations,
            error_buffer: None,
        })
    }

    /// `instance_destroy(instance)`.
    pub fn destroy(mut self) {
        self.registry.teardown();
    }

    pub fn error_copy(&self) -> Option<&str> {
        self.error_buffer.as_deref()
    }

    pub fn error_clear(&mut self) {
        self.error_buffer = None;
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.error_buffer = Some(msg.into());
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct PluginConfigFile {
    #[serde(default)]
    plugin: Vec<PluginRegistration>,
}

/// The core version string embedded in archive metadata (spec.md §6).
pub const IMPLEMENTATION_VERSION: Version = Version::new(0, 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_group_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(Plugin {
                name: "toml".into(),
                description: "".into(),
                plugin_type: "file".into(),
                storage: "filesystem".into(),
                group_id: "local".into(),
                config_base_id: "".into(),
                mold_base_id: "".into(),
                config_entry_type: EntryType::Config,
                mold_entry_type: EntryType::Mold,
                config_read: None,
                config_write: None,
                config_entries: None,
                config_query: None,
                mold_read: None,
                mold_write: None,
                mold_entries: None,
                mold_query: None,
                config_fd_read: None,
                config_fd_write: None,
                mold_fd_read: None,
                mold_fd_write: None,
                plugin_finished: None,
            })
            .unwrap();
        let err = registry
            .register(Plugin {
                name: "toml-2".into(),
                description: "".into(),
                plugin_type: "file".into(),
                storage: "filesystem".into(),
                group_id: "local".into(),
                config_base_id: "".into(),
                mold_base_id: "".into(),
                config_entry_type: EntryType::Config,
                mold_entry_type: EntryType::Mold,
                config_read: None,
                config_write: None,
                config_entries: None,
                config_query: None,
                mold_read: None,
                mold_write: None,
                mold_entries: None,
                mold_query: None,
                config_fd_read: None,
                config_fd_write: None,
                mold_fd_read: None,
                mold_fd_write: None,
                plugin_finished: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exists);
    }

    #[test]
    fn missing_group_is_group_missing() {
        let registry = Registry::new();
        let err = registry.get("nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::GroupMissing);
    }
}
