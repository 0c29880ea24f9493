//! Installed plugin registry.
//!
//! A single JSON document maps plugin names to their metadata and binary
//! location. Every change is committed by writing a temp file next to the
//! registry, syncing it, and renaming it into place, so readers only ever
//! see a complete document. In-memory state changes only after a commit
//! succeeds.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::plugins::PluginMetadata;

/// Current on-disk layout version
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Could not read plugin registry {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Plugin registry {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Plugin registry {path} has unsupported schema version {version}")]
    UnsupportedSchema { path: PathBuf, version: u32 },

    #[error("Could not write plugin registry {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Could not remove plugin binary {path}: {reason}")]
    RemoveBinary { path: PathBuf, reason: String },

    #[error("Another plugin operation is in progress (lock held on {path})")]
    Locked { path: PathBuf },
}

/// One installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistryEntry {
    pub metadata: PluginMetadata,
    pub location: PathBuf,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryFile {
    schema_version: u32,
    #[serde(default)]
    plugins: BTreeMap<String, RegistryEntry>,
}

/// In-memory view of the registry document
#[derive(Debug)]
pub struct PluginRegistry {
    path: PathBuf,
    plugins: BTreeMap<String, RegistryEntry>,
}

impl PluginRegistry {
    /// Load the registry at `path`. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "No plugin registry yet");
                return Ok(Self {
                    path,
                    plugins: BTreeMap::new(),
                });
            }
            Err(e) => {
                return Err(RegistryError::Read {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let file: RegistryFile =
            serde_json::from_str(&data).map_err(|e| RegistryError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if file.schema_version != SCHEMA_VERSION {
            return Err(RegistryError::UnsupportedSchema {
                path,
                version: file.schema_version,
            });
        }

        for (name, entry) in &file.plugins {
            if name != &entry.metadata.name {
                return Err(RegistryError::Corrupt {
                    path,
                    reason: format!(
                        "entry '{}' holds metadata for '{}'",
                        name, entry.metadata.name
                    ),
                });
            }
        }

        debug!(path = ?path, plugins = file.plugins.len(), "Loaded plugin registry");
        Ok(Self {
            path,
            plugins: file.plugins,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.plugins.get(name)
    }

    /// Registered plugin whose name equals `name` ignoring case. An exact
    /// match wins.
    pub fn lookup(&self, name: &str) -> Option<(&str, &RegistryEntry)> {
        if let Some((key, entry)) = self.plugins.get_key_value(name) {
            return Some((key.as_str(), entry));
        }
        let folded = name.to_lowercase();
        self.plugins
            .iter()
            .find(|(key, _)| key.to_lowercase() == folded)
            .map(|(key, entry)| (key.as_str(), entry))
    }

    /// Installed plugins ordered by name
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.plugins.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Name of the installed plugin providing `command` as a name or alias
    pub fn owner_of(&self, command: &str) -> Option<&str> {
        self.plugins
            .iter()
            .find(|(_, entry)| entry.metadata.provides(command))
            .map(|(name, _)| name.as_str())
    }

    /// Record `metadata` as installed at `location`.
    ///
    /// Replaces any existing entry for the same name. When the replaced
    /// entry pointed at a different binary, that binary is removed after
    /// the commit.
    pub fn add(
        &mut self,
        metadata: PluginMetadata,
        location: impl Into<PathBuf>,
    ) -> Result<(), RegistryError> {
        let name = metadata.name.clone();
        let entry = RegistryEntry {
            metadata,
            location: location.into(),
            installed_at: Utc::now(),
        };

        let mut next = self.plugins.clone();
        let previous = next.insert(name.clone(), entry);
        self.commit(&next)?;
        self.plugins = next;

        if let Some(previous) = previous {
            let current = &self.plugins[&name].location;
            if &previous.location != current {
                if let Err(e) = remove_file_if_exists(&previous.location) {
                    warn!(plugin = %name, path = ?previous.location, error = %e, "Could not remove replaced plugin binary");
                }
            }
        }

        info!(plugin = %name, "Registered plugin");
        Ok(())
    }

    /// Remove plugin `name` and its binary. Unknown names are a no-op.
    ///
    /// The binary is moved aside before the document is committed and put
    /// back if the commit fails, so a failed remove changes nothing.
    pub fn remove(&mut self, name: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        let Some(entry) = self.plugins.get(name) else {
            debug!(plugin = %name, "Nothing to remove");
            return Ok(None);
        };

        let location = entry.location.clone();
        let tombstone = tombstone_path(&location);
        let moved = match fs::rename(&location, &tombstone) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(plugin = %name, path = ?location, "Plugin binary already missing");
                false
            }
            Err(e) => {
                return Err(RegistryError::RemoveBinary {
                    path: location,
                    reason: e.to_string(),
                })
            }
        };

        let mut next = self.plugins.clone();
        let removed = next.remove(name);
        if let Err(e) = self.commit(&next) {
            if moved {
                if let Err(restore) = fs::rename(&tombstone, &location) {
                    warn!(path = ?location, error = %restore, "Could not restore plugin binary");
                }
            }
            return Err(e);
        }
        self.plugins = next;

        if moved {
            if let Err(e) = fs::remove_file(&tombstone) {
                warn!(path = ?tombstone, error = %e, "Could not delete removed plugin binary");
            }
        }

        info!(plugin = %name, "Unregistered plugin");
        Ok(removed)
    }

    fn commit(&self, plugins: &BTreeMap<String, RegistryEntry>) -> Result<(), RegistryError> {
        let write_err = |e: &dyn std::fmt::Display| RegistryError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| write_err(&e))?;

        let document = RegistryFile {
            schema_version: SCHEMA_VERSION,
            plugins: plugins.clone(),
        };

        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| write_err(&e))?;
        serde_json::to_writer_pretty(temp.as_file_mut(), &document).map_err(|e| write_err(&e))?;
        temp.as_file_mut()
            .write_all(b"\n")
            .map_err(|e| write_err(&e))?;
        temp.as_file().sync_all().map_err(|e| write_err(&e))?;
        temp.persist(&self.path).map_err(|e| write_err(&e.error))?;

        debug!(path = ?self.path, plugins = plugins.len(), "Committed plugin registry");
        Ok(())
    }
}

// Hidden, so it can never be another plugin's binary
fn tombstone_path(location: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(location.file_name().unwrap_or_default());
    name.push(".removing");
    location.with_file_name(name)
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Exclusive lock serialising plugin operations across processes.
/// Released when dropped.
#[derive(Debug)]
pub struct RegistryLock {
    file: fs::File,
    path: PathBuf,
}

impl RegistryLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::Write {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| RegistryError::Write {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(RegistryError::Locked { path });
        }
        debug!(path = ?path, "Acquired plugin lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{CommandSpec, PluginVersion};
    use tempfile::TempDir;

    fn metadata(name: &str, commands: &[(&str, Option<&str>)]) -> PluginMetadata {
        PluginMetadata {
            name: name.to_string(),
            version: PluginVersion::new(1, 0, 0),
            commands: commands
                .iter()
                .map(|(cmd, alias)| {
                    let spec = CommandSpec::new(*cmd, "help");
                    match alias {
                        Some(a) => spec.with_alias(*a),
                        None => spec,
                    }
                })
                .collect(),
        }
    }

    fn fake_binary(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join("bin").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"binary").unwrap();
        path
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = PluginRegistry::load(dir.path().join("installed_plugins.json")).unwrap();
        assert!(registry.is_empty());
        assert!(!registry.has("echo"));
    }

    #[test]
    fn test_add_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let bin = fake_binary(dir.path(), "echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry
            .add(metadata("echo", &[("say-hi", Some("hi"))]), &bin)
            .unwrap();

        let reloaded = PluginRegistry::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        let entry = reloaded.get("echo").unwrap();
        assert_eq!(entry.location, bin);
        assert_eq!(reloaded.owner_of("hi"), Some("echo"));
        assert_eq!(reloaded.owner_of("say-hi"), Some("echo"));
        assert_eq!(reloaded.owner_of("bye"), None);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"SchemaVersion\": 1"));
        assert!(raw.contains("\"InstalledAt\""));
    }

    #[test]
    fn test_commit_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let bin = fake_binary(dir.path(), "echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("echo", &[("say-hi", None)]), &bin).unwrap();
        registry.remove("echo").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "{:?}", names);
        assert!(names.contains(&"installed_plugins.json".to_string()));
        assert!(names.contains(&"bin".to_string()));
    }

    #[test]
    fn test_remove_deletes_binary_and_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let bin = fake_binary(dir.path(), "echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("echo", &[("say-hi", None)]), &bin).unwrap();

        let removed = registry.remove("echo").unwrap().unwrap();
        assert_eq!(removed.metadata.name, "echo");
        assert!(!bin.exists());
        assert!(!tombstone_path(&bin).exists());
        assert!(!PluginRegistry::load(&path).unwrap().has("echo"));
    }

    #[test]
    fn test_remove_leaves_neighbouring_binaries_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let echo = fake_binary(dir.path(), "echo");
        let neighbour = fake_binary(dir.path(), "echo.removing");
        fs::write(&neighbour, b"neighbour").unwrap();

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("echo", &[("say-hi", None)]), &echo).unwrap();
        registry
            .add(metadata("echo.removing", &[("say-bye", None)]), &neighbour)
            .unwrap();

        registry.remove("echo").unwrap();
        assert!(!echo.exists());
        assert_eq!(fs::read(&neighbour).unwrap(), b"neighbour");
        assert!(PluginRegistry::load(&path).unwrap().has("echo.removing"));
    }

    #[test]
    fn test_lookup_ignores_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let bin = fake_binary(dir.path(), "Echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("Echo", &[]), &bin).unwrap();

        assert_eq!(registry.lookup("Echo").map(|(name, _)| name), Some("Echo"));
        assert_eq!(registry.lookup("ECHO").map(|(name, _)| name), Some("Echo"));
        assert!(registry.lookup("echo2").is_none());
        assert!(!registry.has("echo"));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut registry = PluginRegistry::load(dir.path().join("r.json")).unwrap();
        assert!(registry.remove("ghost").unwrap().is_none());
        assert!(!dir.path().join("r.json").exists());
    }

    #[test]
    fn test_remove_with_missing_binary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let bin = fake_binary(dir.path(), "echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("echo", &[]), &bin).unwrap();
        fs::remove_file(&bin).unwrap();

        assert!(registry.remove("echo").unwrap().is_some());
        assert!(!registry.has("echo"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_commit_restores_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let path = home.join("installed_plugins.json");
        let bin = fake_binary(dir.path(), "echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("echo", &[]), &bin).unwrap();

        // Read-only registry directory: the temp file cannot be created
        fs::set_permissions(&home, fs::Permissions::from_mode(0o555)).unwrap();
        let probe = home.join("probe");
        let writable = fs::write(&probe, b"x").is_ok();
        let result = registry.remove("echo");
        fs::set_permissions(&home, fs::Permissions::from_mode(0o755)).unwrap();

        if writable {
            // Running as root; permissions are not enforced
            return;
        }
        assert!(matches!(result, Err(RegistryError::Write { .. })));
        assert!(bin.exists());
        assert!(registry.has("echo"));
    }

    #[test]
    fn test_add_replacing_entry_removes_old_binary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let old = fake_binary(dir.path(), "echo-old");
        let new = fake_binary(dir.path(), "echo");

        let mut registry = PluginRegistry::load(&path).unwrap();
        registry.add(metadata("echo", &[]), &old).unwrap();
        registry.add(metadata("echo", &[]), &new).unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_corrupt_registry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            PluginRegistry::load(&path),
            Err(RegistryError::Corrupt { .. })
        ));

        fs::write(&path, br#"{"SchemaVersion": 7, "Plugins": {}}"#).unwrap();
        assert!(matches!(
            PluginRegistry::load(&path),
            Err(RegistryError::UnsupportedSchema { version: 7, .. })
        ));
    }

    #[test]
    fn test_mismatched_entry_name_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed_plugins.json");
        let doc = serde_json::json!({
            "SchemaVersion": 1,
            "Plugins": {
                "echo": {
                    "Metadata": {"Name": "other", "Version": {"Major": 1, "Minor": 0, "Patch": 0}, "Commands": []},
                    "Location": "/tmp/echo",
                    "InstalledAt": "2024-01-01T00:00:00Z"
                }
            }
        });
        fs::write(&path, doc.to_string()).unwrap();
        assert!(matches!(
            PluginRegistry::load(&path),
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(".lock");

        let first = RegistryLock::acquire(&lock_path).unwrap();
        assert!(matches!(
            RegistryLock::acquire(&lock_path),
            Err(RegistryError::Locked { .. })
        ));
        drop(first);
        assert!(RegistryLock::acquire(&lock_path).is_ok());
    }
}
