//! Archive bundles: export/import collections of configs across
//! installations (spec.md §4.11, §6 wire format).
//!
//! Ported from `lib/disir_export.cc`: a tar+xz container holding
//! `/metadata.toml`, one `/<backend>/entries.toml` per backend, and one file
//! per serialized config entry under `/<backend>/<group>/<entry_id>`. The
//! core only shapes the container and metadata; byte-level config encoding is
//! delegated to the plugin registry (spec.md §1: I/O backends are out of
//! scope).

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::Error;
use crate::plugin::{Registry, IMPLEMENTATION_VERSION};
use crate::version::Version;

/// `disir_org_version` is a fixed protocol-level constant, not a
/// configurable setting — the archive format's own version.
pub const ORG_VERSION: &str = "0/1-draft";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub id: String,
    pub groups: Vec<String>,
}

/// `/metadata.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub implementation: String,
    pub disir_org_version: String,
    pub backend: Vec<BackendMetadata>,
}

impl Metadata {
    pub fn current() -> Self {
        Metadata {
            implementation: IMPLEMENTATION_VERSION.to_string(),
            disir_org_version: ORG_VERSION.to_string(),
            backend: Vec::new(),
        }
    }
}

/// `/<backend>/entries.toml`: `<group>.<entry_id> = <version_string>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryIndex {
    #[serde(flatten)]
    pub groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl EntryIndex {
    pub fn insert(&mut self, group: &str, entry_id: &str, version: Version) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(entry_id.to_string(), version.to_string());
    }
}

/// A single archived entry's serialized bytes plus where it lives in the
/// container.
pub struct ArchiveEntry {
    pub backend: String,
    pub group: String,
    pub entry_id: String,
    pub version: Version,
    pub bytes: Vec<u8>,
}

/// An in-memory archive under construction. `create_fresh` starts empty;
/// `resume` loads an existing container's metadata/entries so more can be
/// appended (spec.md §4.11: "create a fresh or resume-from-existing
/// archive").
pub struct Archive {
    metadata: Metadata,
    index: BTreeMap<String, EntryIndex>, // backend id -> index
    entries: Vec<ArchiveEntry>,
}

impl Archive {
    /// Entries currently held in memory — freshly appended ones, plus
    /// whatever [`Archive::resume`] extracted back from an existing
    /// container.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn create_fresh() -> Self {
        Archive {
            metadata: Metadata::current(),
            index: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    /// Opens an existing archive and loads its entries' bytes back in, so
    /// further `append_entry`/`append_group` calls add to it rather than
    /// starting over (spec.md §4.11: "create a fresh or resume-from-existing
    /// archive").
    pub fn resume(path: &Path) -> Result<Self, Error> {
        let (metadata, index, entries) = read_archive(path)?;
        info!(path = %path.display(), entries = entries.len(), "archive resumed");
        Ok(Archive { metadata, index, entries })
    }

    /// Appends a single serialized config entry (spec.md §4.11: "append
    /// individual configs... via plugin dispatch").
    pub fn append_entry(
        &mut self,
        backend: &str,
        group: &str,
        entry_id: &str,
        version: Version,
        bytes: Vec<u8>,
    ) {
        if !self
            .metadata
            .backend
            .iter()
            .any(|b| b.id == backend)
        {
            self.metadata.backend.push(BackendMetadata {
                id: backend.to_string(),
                groups: vec![group.to_string()],
            });
        } else if let Some(b) = self.metadata.backend.iter_mut().find(|b| b.id == backend) {
            if !b.groups.contains(&group.to_string()) {
                b.groups.push(group.to_string());
            }
        }

        self.index
            .entry(backend.to_string())
            .or_default()
            .insert(group, entry_id, version);

        debug!(backend, group, entry_id, %version, "archive entry appended");
        self.entries.push(ArchiveEntry {
            backend: backend.to_string(),
            group: group.to_string(),
            entry_id: entry_id.to_string(),
            version,
            bytes,
        });
    }

    /// Appends every config a plugin's group reports via `config_entries`,
    /// loading each through `config_read` and serializing it through
    /// `config_fd_write` into a scratch buffer (spec.md §4.11: "append
    /// individual configs or all configs under a group, via plugin dispatch
    /// to serialize each config to a temporary entry").
    pub fn append_group(&mut self, registry: &Registry, backend: &str, group: &str, mold: &Context) -> Result<(), Error> {
        let plugin = registry.get(group)?;
        let entries_fn = plugin
            .config_entries
            .as_ref()
            .ok_or_else(|| Error::NotSupported(format!("'{group}' has no config_entries")))?;
        for entry_id in entries_fn()? {
            let config = registry.config_read(group, &entry_id, mold)?;
            let version = crate::mold::config_version(&config)?;
            let bytes = registry.config_fd_write(group, &config)?;
            debug!(group, entry_id, %version, "append_group: entry serialized via plugin dispatch");
            self.append_entry(backend, group, &entry_id, version, bytes);
        }
        Ok(())
    }

    /// Writes the tar+xz container to `path` (spec.md §6 wire format).
    pub fn write_to(&self, path: &Path) -> Result<(), Error> {
        let file = std::fs::File::create(path)?;
        let xz = xz2::write::XzEncoder::new(file, 6);
        let mut builder = tar::Builder::new(xz);

        let metadata_toml = toml::to_string_pretty(&self.metadata)?;
        append_bytes(&mut builder, "metadata.toml", metadata_toml.as_bytes())?;

        for (backend, index) in &self.index {
            let entries_toml = toml::to_string_pretty(index)?;
            append_bytes(
                &mut builder,
                &format!("{backend}/entries.toml"),
                entries_toml.as_bytes(),
            )?;
        }

        for entry in &self.entries {
            let path = format!("{}/{}/{}", entry.backend, entry.group, entry.entry_id);
            append_bytes(&mut builder, &path, &entry.bytes)?;
        }

        builder.into_inner()?.finish()?;
        info!(path = %path.display(), entries = self.entries.len(), "archive written");
        Ok(())
    }
}

fn append_bytes(builder: &mut tar::Builder<impl Write>, path: &str, bytes: &[u8]) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, bytes)
        .map_err(Error::Io)
}

/// The outcome of classifying a single entry during import (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Ok,
    Conflict,
    ConflictingSemver,
    ConfigInvalid,
    NoCanDo,
}

/// The caller's resolution verb for one imported entry (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryResolution {
    Update,
    Force,
    Do,
    Discard,
    UpdateWithDiscard,
}

#[derive(Debug, Clone)]
pub struct ImportedEntry {
    pub backend: String,
    pub group: String,
    pub entry_id: String,
    pub archive_version: Version,
    pub status: EntryStatus,
    pub info: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub applied: Vec<String>,
    pub discarded: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

/// Opens a tar+xz archive and returns its parsed metadata plus, per backend,
/// its entry index — the first phase of import (spec.md §4.11: "extract to a
/// scratch area, validate metadata").
pub fn read_metadata(path: &Path) -> Result<(Metadata, BTreeMap<String, EntryIndex>), Error> {
    let (metadata, indices, _entries) = read_archive(path)?;
    Ok((metadata, indices))
}

type ExtractedArchive = (Metadata, BTreeMap<String, EntryIndex>, Vec<ArchiveEntry>);

/// Shared extraction pass behind [`read_metadata`] and [`Archive::resume`]:
/// walks every tar member once, classifying each path as metadata, a
/// per-backend index, or an entry payload under `<backend>/<group>/<entry_id>`.
fn read_archive(path: &Path) -> Result<ExtractedArchive, Error> {
    let file = std::fs::File::open(path)?;
    let xz = xz2::read::XzDecoder::new(file);
    let mut archive = tar::Archive::new(xz);

    let mut metadata: Option<Metadata> = None;
    let mut indices: BTreeMap<String, EntryIndex> = BTreeMap::new();
    let mut payloads: BTreeMap<(String, String, String), Vec<u8>> = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_string_lossy().to_string();

        if entry_path == "metadata.toml" {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            metadata = Some(toml::from_str(&contents)?);
        } else if let Some(backend) = entry_path.strip_suffix("/entries.toml") {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            let index: EntryIndex = toml::from_str(&contents)?;
            indices.insert(backend.to_string(), index);
        } else {
            let parts: Vec<&str> = entry_path.splitn(3, '/').collect();
            if let [backend, group, entry_id] = parts[..] {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                payloads.insert((backend.to_string(), group.to_string(), entry_id.to_string()), bytes);
            }
        }
    }

    let metadata = metadata.ok_or_else(|| Error::ConfigInvalid("archive missing metadata.toml".into()))?;
    if metadata.implementation != IMPLEMENTATION_VERSION.to_string() {
        return Err(Error::ConfigInvalid(format!(
            "archive implementation version {} does not match {}",
            metadata.implementation, IMPLEMENTATION_VERSION
        )));
    }
    if metadata.disir_org_version != ORG_VERSION {
        return Err(Error::ConfigInvalid(format!(
            "archive org version {} does not match {ORG_VERSION}",
            metadata.disir_org_version
        )));
    }

    let mut entries = Vec::new();
    for (backend, index) in &indices {
        for (group, group_entries) in &index.groups {
            for (entry_id, version_str) in group_entries {
                let version: Version = version_str.parse()?;
                let bytes = payloads
                    .remove(&(backend.clone(), group.clone(), entry_id.clone()))
                    .unwrap_or_default();
                entries.push(ArchiveEntry {
                    backend: backend.clone(),
                    group: group.clone(),
                    entry_id: entry_id.clone(),
                    version,
                    bytes,
                });
            }
        }
    }

    Ok((metadata, indices, entries))
}

/// Classifies a single archived entry against the system mold version
/// already resolved by the caller (spec.md §4.11, Scenario E: "archive entry
/// is newer than system version").
pub fn classify_entry(archive_version: Version, system_mold_version: Version) -> (EntryStatus, String) {
    if archive_version > system_mold_version {
        (
            EntryStatus::ConflictingSemver,
            "archive entry is newer than system version".into(),
        )
    } else {
        (EntryStatus::Ok, String::new())
    }
}

/// Applies the caller's chosen [`EntryResolution`] to one classified entry,
/// updating `report` (spec.md §4.11: "Resolutions per entry... Finalize
/// applies all accepted entries").
pub fn resolve_entry(
    entry_id: &str,
    status: EntryStatus,
    resolution: EntryResolution,
    report: &mut ImportReport,
) -> Result<(), Error> {
    match (status, resolution) {
        (EntryStatus::ConflictingSemver, EntryResolution::Do) => {
            Err(Error::NoCanDo(format!(
                "'{entry_id}' is newer than the system mold; cannot apply as-is"
            )))
        }
        (_, EntryResolution::Discard) => {
            report.discarded.push(entry_id.to_string());
            Ok(())
        }
        (EntryStatus::Ok, EntryResolution::Do)
        | (EntryStatus::Ok, EntryResolution::Force)
        | (EntryStatus::Ok, EntryResolution::Update)
        | (EntryStatus::Ok, EntryResolution::UpdateWithDiscard) => {
            report.applied.push(entry_id.to_string());
            Ok(())
        }
        (EntryStatus::ConflictingSemver, EntryResolution::Force)
        | (EntryStatus::ConflictingSemver, EntryResolution::Update)
        | (EntryStatus::ConflictingSemver, EntryResolution::UpdateWithDiscard) => {
            report.applied.push(entry_id.to_string());
            Ok(())
        }
        (status, _) => {
            report.rejected.push((entry_id.to_string(), format!("{status:?}")));
            Err(Error::NoCanDo(format!("'{entry_id}' cannot be resolved in state {status:?}")))
        }
    }
}

/// Extracts one archived entry's config by loading its group's mold and
/// deserializing the entry's bytes against it, then classifies the result
/// (spec.md §4.11: "extract to a scratch area, load its mold, deserialize the
/// config, then classify against the system version"). `mold_entry_id` is the
/// group's `mold_base_id` (spec.md §6) that `entry`'s configs are bound to.
pub fn load_and_classify_entry(
    entry: &ArchiveEntry,
    registry: &Registry,
    mold_entry_id: &str,
) -> Result<(ImportedEntry, Context), Error> {
    let mold = registry.mold_read(&entry.group, mold_entry_id)?;
    let system_version = crate::validation::max_introduced_version(&mold);
    let config = registry.config_fd_read(&entry.group, &entry.bytes, &mold)?;

    let (mut status, mut info) = classify_entry(entry.version, system_version);
    if status == EntryStatus::Ok {
        let invalid = crate::validation::config_valid(&config)?;
        if !invalid.is_empty() {
            status = EntryStatus::ConfigInvalid;
            info = format!("deserialized config fails config_valid on {} context(s)", invalid.len());
        }
    }

    debug!(group = %entry.group, entry_id = %entry.entry_id, ?status, "archive entry classified");
    Ok((
        ImportedEntry {
            backend: entry.backend.clone(),
            group: entry.group.clone(),
            entry_id: entry.entry_id.clone(),
            archive_version: entry.version,
            status,
            info,
        },
        config,
    ))
}

/// Finalizes an import: applies [`EntryResolution`]s chosen by the caller for
/// each classified entry, writing accepted configs back through the plugin
/// registry, and returns the accumulated report (spec.md §4.11: "Finalize
/// applies all accepted entries").
pub fn finalize_import(
    classified: &[(ImportedEntry, Context)],
    resolutions: &BTreeMap<String, EntryResolution>,
    registry: &Registry,
) -> ImportReport {
    let mut report = ImportReport::default();
    for (entry, config) in classified {
        let resolution = resolutions.get(&entry.entry_id).copied().unwrap_or(EntryResolution::Discard);
        if let Err(e) = resolve_entry(&entry.entry_id, entry.status, resolution, &mut report) {
            warn!(entry_id = %entry.entry_id, error = %e, "finalize_import: entry not applied");
            continue;
        }
        if report.applied.contains(&entry.entry_id) {
            if let Err(e) = registry.config_write(&entry.group, &entry.entry_id, config) {
                warn!(entry_id = %entry.entry_id, error = %e, "finalize_import: config_write failed");
                report.applied.retain(|id| id != &entry.entry_id);
                report.rejected.push((entry.entry_id.clone(), e.to_string()));
            } else {
                info!(entry_id = %entry.entry_id, "finalize_import: entry applied");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar.xz");

        let mut archive = Archive::create_fresh();
        archive.append_entry("local", "svc", "db", Version::new(1, 0), b"hello".to_vec());
        archive.write_to(&path).unwrap();

        let (metadata, indices) = read_metadata(&path).unwrap();
        assert_eq!(metadata.disir_org_version, ORG_VERSION);
        assert_eq!(metadata.backend.len(), 1);
        assert_eq!(metadata.backend[0].id, "local");
        assert_eq!(
            indices.get("local").unwrap().groups.get("svc").unwrap().get("db").unwrap(),
            "1.0"
        );
    }

    #[test]
    fn scenario_e_newer_archive_entry_is_conflicting_semver() {
        let (status, info) = classify_entry(Version::new(2, 0), Version::new(1, 5));
        assert_eq!(status, EntryStatus::ConflictingSemver);
        assert!(info.contains("newer"));

        let mut report = ImportReport::default();
        assert!(resolve_entry("db", status, EntryResolution::Do, &mut report).is_err());
        resolve_entry("db", status, EntryResolution::Discard, &mut report).unwrap();
        assert_eq!(report.discarded, vec!["db".to_string()]);
    }

    #[test]
    fn export_resume_and_import_round_trip_through_plugin_dispatch() {
        use crate::mold::{add_keyval_integer, config_begin, config_finalize, mold_begin, mold_finalize};
        use crate::plugin::{EntryType, Plugin, Registry};
        use crate::query::{get_value_string, set_keyval_integer};
        use std::cell::RefCell;
        use std::rc::Rc;

        let mold = mold_begin().unwrap();
        add_keyval_integer(&mold, "port", 5, "", Version::DEFAULT).unwrap();
        mold_finalize(&mold).unwrap();

        let config = config_begin(&mold).unwrap();
        set_keyval_integer(&config, 7, "port").unwrap();
        config_finalize(&config).unwrap();

        let written = Rc::new(RefCell::new(Vec::new()));
        let written_for_write = written.clone();
        let mold_for_read = mold.clone();
        let config_for_read = config.clone();

        let mut registry = Registry::new();
        registry
            .register(Plugin {
                name: "inline".into(),
                description: "".into(),
                plugin_type: "file".into(),
                storage: "memory".into(),
                group_id: "local".into(),
                config_base_id: "app".into(),
                mold_base_id: "mold-app".into(),
                config_entry_type: EntryType::Config,
                mold_entry_type: EntryType::Mold,
                config_read: Some(Box::new(move |_entry_id, _mold| Ok(config_for_read.clone()))),
                config_write: Some(Box::new(move |entry_id, config| {
                    let value = get_value_string(config, "port").unwrap();
                    written_for_write.borrow_mut().push((entry_id.to_string(), value));
                    Ok(())
                })),
                config_entries: Some(Box::new(|| Ok(vec!["app".to_string()]))),
                config_query: None,
                mold_read: Some(Box::new(move |_entry_id| Ok(mold_for_read.clone()))),
                mold_write: None,
                mold_entries: None,
                mold_query: None,
                config_fd_read: Some(Box::new(|bytes, mold| {
                    let config = config_begin(mold)?;
                    let value: i64 = String::from_utf8_lossy(bytes).parse().unwrap_or(0);
                    set_keyval_integer(&config, value, "port")?;
                    config_finalize(&config)?;
                    Ok(config)
                })),
                config_fd_write: Some(Box::new(|config| {
                    Ok(get_value_string(config, "port")?.into_bytes())
                })),
                mold_fd_read: None,
                mold_fd_write: None,
                plugin_finished: None,
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar.xz");

        let mut archive = Archive::create_fresh();
        archive.append_group(&registry, "disk", "local", &mold).unwrap();
        archive.write_to(&path).unwrap();

        let resumed = Archive::resume(&path).unwrap();
        assert_eq!(resumed.entries().len(), 1);
        let entry = &resumed.entries()[0];
        assert_eq!(entry.entry_id, "app");
        assert_eq!(String::from_utf8_lossy(&entry.bytes), "7");

        let (imported, deserialized) = load_and_classify_entry(entry, &registry, "mold-app").unwrap();
        assert_eq!(imported.status, EntryStatus::Ok);
        assert_eq!(get_value_string(&deserialized, "port").unwrap(), "7");

        let mut resolutions = BTreeMap::new();
        resolutions.insert(imported.entry_id.clone(), EntryResolution::Do);
        let report = finalize_import(&[(imported, deserialized)], &resolutions, &registry);
        assert_eq!(report.applied, vec!["app".to_string()]);
        assert_eq!(written.borrow().as_slice(), &[("app".to_string(), "7".to_string())]);
    }
}
