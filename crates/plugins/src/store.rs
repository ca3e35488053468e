//! On-disk layout of installed plugins and introspection over it.
//!
//! Each plugin occupies `<hostUserDir>/plugins/<name>/` with its manifest at
//! the root of that directory. A `.disabled` sentinel next to the manifest
//! marks the plugin disabled; the host tool ignores such plugins. Mutating
//! operations serialize per plugin through `<name>.lock` files at the
//! plugins root, so concurrent CLI invocations do not interleave.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::{PluginManifest, MANIFEST_FILE_NAME};
use crate::version::PluginVersion;

/// Sentinel file whose presence disables a plugin.
pub const DISABLED_SENTINEL: &str = ".disabled";

/// One row of `rem plugin status`.
#[derive(Debug, Clone)]
pub struct InstalledPlugin {
    pub name: String,
    pub version: PluginVersion,
    pub enabled: bool,
    pub directory: PathBuf,
}

/// Paths and queries over the plugins directory.
pub struct PluginStore {
    root: PathBuf,
}

impl PluginStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn try_default() -> Result<Self> {
        let host_dir = rem_common::paths::host_user_dir()
            .map_err(|e| Error::Validation(e.to_string()))?;
        Ok(Self::new(host_dir.join("plugins")))
    }

    pub fn plugins_directory(&self) -> &Path {
        &self.root
    }

    /// Directory a plugin with this name occupies (or would occupy). When an
    /// installation exists under a different casing, that directory wins.
    pub fn plugin_directory(&self, name: &str) -> PathBuf {
        self.find_installed_dir(name)
            .unwrap_or_else(|| self.root.join(name))
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.find_installed_dir(name)
            .map(|dir| dir.join(MANIFEST_FILE_NAME).is_file())
            .unwrap_or(false)
    }

    /// The installed plugin's manifest; `NotInstalled` when absent.
    pub fn read_manifest(&self, name: &str) -> Result<PluginManifest> {
        let dir = self
            .find_installed_dir(name)
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        if !manifest_path.is_file() {
            return Err(Error::NotInstalled(name.to_string()));
        }
        tracing::debug!("reading installed manifest from {}", manifest_path.display());
        PluginManifest::from_json(&fs::read(manifest_path)?)
    }

    pub fn is_enabled(&self, name: &str) -> Result<bool> {
        let dir = self
            .find_installed_dir(name)
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;
        Ok(!dir.join(DISABLED_SENTINEL).exists())
    }

    /// Drop the `.disabled` sentinel. A no-op if already enabled.
    pub fn enable(&self, name: &str) -> Result<()> {
        let dir = self
            .find_installed_dir(name)
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;
        match fs::remove_file(dir.join(DISABLED_SENTINEL)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the `.disabled` sentinel. A no-op if already disabled.
    pub fn disable(&self, name: &str) -> Result<()> {
        let dir = self
            .find_installed_dir(name)
            .ok_or_else(|| Error::NotInstalled(name.to_string()))?;
        File::create(dir.join(DISABLED_SENTINEL))?;
        Ok(())
    }

    /// Every installed plugin, ordered by directory name. Directories
    /// without a readable manifest are skipped.
    pub fn installed_plugins(&self) -> Result<Vec<InstalledPlugin>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && !is_internal_dir_name(path))
            .collect();
        dirs.sort();

        for dir in dirs {
            let manifest_path = dir.join(MANIFEST_FILE_NAME);
            let manifest = match fs::read(&manifest_path)
                .map_err(Error::from)
                .and_then(|bytes| PluginManifest::from_json(&bytes))
            {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::debug!("skipping {}: {e}", dir.display());
                    continue;
                }
            };
            let version = match manifest.version() {
                Ok(version) => version,
                Err(e) => {
                    tracing::debug!("skipping {}: {e}", dir.display());
                    continue;
                }
            };
            found.push(InstalledPlugin {
                name: manifest.name().to_string(),
                version,
                enabled: !dir.join(DISABLED_SENTINEL).exists(),
                directory: dir,
            });
        }
        Ok(found)
    }

    /// Advisory lock serializing mutations of one plugin. Hold the write
    /// guard for the whole install/upgrade/uninstall.
    pub fn mutation_lock(&self, name: &str) -> Result<fd_lock::RwLock<File>> {
        fs::create_dir_all(&self.root)?;
        let lock_path = self.root.join(format!("{}.lock", name.to_ascii_lowercase()));
        let file = File::create(lock_path)?;
        Ok(fd_lock::RwLock::new(file))
    }

    fn find_installed_dir(&self, name: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.root).ok()?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() || is_internal_dir_name(&path) {
                continue;
            }
            if entry
                .file_name()
                .to_str()
                .map(|dir_name| dir_name.eq_ignore_ascii_case(name))
                .unwrap_or(false)
            {
                return Some(path);
            }
        }
        None
    }
}

/// Staging and backup directories live alongside plugin directories but are
/// never plugins themselves.
fn is_internal_dir_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::manifest_json;

    fn install_fake_plugin(root: &Path, dir_name: &str, name: &str, version: &str) {
        let dir = root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE_NAME),
            manifest_json(name, version, &format!("{name}.py")),
        )
        .unwrap();
        fs::write(dir.join(format!("{name}.py")), "").unwrap();
    }

    #[test]
    fn lists_installed_plugins_with_enablement() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        install_fake_plugin(tmp.path(), "plugin1", "plugin1", "1.0.0");
        install_fake_plugin(tmp.path(), "other", "other", "0.2.0");
        // staging leftovers and lock files are not plugins
        fs::create_dir_all(tmp.path().join(".tmp-junk")).unwrap();
        fs::write(tmp.path().join("plugin1.lock"), "").unwrap();

        store.disable("other").unwrap();

        let installed = store.installed_plugins().unwrap();
        let summary: Vec<(String, String, bool)> = installed
            .iter()
            .map(|p| (p.name.clone(), p.version.to_string(), p.enabled))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("other".to_string(), "0.2.0".to_string(), false),
                ("plugin1".to_string(), "1.0.0".to_string(), true),
            ]
        );
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        install_fake_plugin(tmp.path(), "plugin1", "plugin1", "1.0.0");

        assert!(store.is_enabled("plugin1").unwrap());
        store.disable("plugin1").unwrap();
        store.disable("plugin1").unwrap();
        assert!(!store.is_enabled("plugin1").unwrap());
        store.enable("plugin1").unwrap();
        store.enable("plugin1").unwrap();
        assert!(store.is_enabled("plugin1").unwrap());

        assert!(matches!(
            store.disable("missing"),
            Err(Error::NotInstalled(_))
        ));
    }

    #[test]
    fn name_lookup_ignores_case_but_keeps_canonical_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        install_fake_plugin(tmp.path(), "MyPlugin", "MyPlugin", "1.0.0");

        assert!(store.is_installed("myplugin"));
        let manifest = store.read_manifest("MYPLUGIN").unwrap();
        assert_eq!(manifest.name(), "MyPlugin");
        assert_eq!(store.plugin_directory("myplugin"), tmp.path().join("MyPlugin"));
    }
}
