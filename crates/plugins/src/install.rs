//! Installing, upgrading, and removing plugins.
//!
//! Every mutation is transactional: archives extract into a staging
//! directory that is renamed into place only once extraction has fully
//! succeeded, upgrades keep the previous installation as a backup until the
//! replacement is validated, and any failure rolls the plugins directory
//! back to its prior state. The per-member safety gate runs before any
//! archive byte reaches the disk.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::archive::{normalize_member_path, PluginArchive};
use crate::error::{Error, Result};
use crate::manifest::{
    find_manifest, validate_manifest, validate_relative_path, ArchivePluginFiles, DirPluginFiles,
    PluginManifest,
};
use crate::pydeps;
use crate::settings::{resolve_install_values, SettingPrompter, SettingsStore};
use crate::store::PluginStore;
use crate::version::PluginVersion;

/// Knobs for one install or upgrade.
pub struct InstallOptions<'a> {
    /// `--config key=value` pairs from the command line.
    pub supplied_settings: BTreeMap<String, String>,
    /// Whether prompting for settings is allowed.
    pub interactive: bool,
    pub prompter: &'a mut dyn SettingPrompter,
    /// Interpreter override; `None` resolves through the environment and
    /// configuration.
    pub interpreter: Option<PathBuf>,
}

impl<'a> InstallOptions<'a> {
    pub fn non_interactive(prompter: &'a mut dyn SettingPrompter) -> Self {
        Self {
            supplied_settings: BTreeMap::new(),
            interactive: false,
            prompter,
            interpreter: None,
        }
    }
}

#[derive(Debug)]
pub struct InstallOutcome {
    /// Canonical plugin name, as declared by the manifest.
    pub name: String,
    pub version: PluginVersion,
}

/// Drives the per-plugin state machine over a [`PluginStore`] and the
/// shared settings document.
pub struct PluginManager {
    store: PluginStore,
    settings: SettingsStore,
}

impl PluginManager {
    pub fn new(store: PluginStore, settings: SettingsStore) -> Self {
        Self { store, settings }
    }

    pub fn try_default() -> Result<Self> {
        Ok(Self::new(PluginStore::try_default()?, SettingsStore::try_default()?))
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Install the named plugin from an archive.
    pub async fn install(
        &self,
        archive: &PluginArchive,
        name: &str,
        mut opts: InstallOptions<'_>,
    ) -> Result<InstallOutcome> {
        let (root, manifest) = find_manifest(archive, name)?;
        let files = ArchivePluginFiles::new(archive, &root);
        validate_manifest(&files, &manifest)?;
        let version = manifest.version()?;
        let canonical = manifest.name().to_string();

        if self.store.is_installed(&canonical) {
            return Err(Error::AlreadyInstalled(canonical));
        }

        let mut lock = self.store.mutation_lock(&canonical)?;
        let _guard = lock.write()?;

        // settings are collected (and may fail or prompt) before any
        // extraction side effect can survive
        let configured = self.settings.configured_keys(&manifest)?;
        let resolved = resolve_install_values(
            &manifest,
            &opts.supplied_settings,
            &configured,
            opts.interactive,
            opts.prompter,
        )?;

        let dest = self.store.plugins_directory().join(&canonical);
        self.extract_into_place(archive, &root, &dest)?;

        if let Err(e) = self
            .finish_installation(&manifest, &dest, resolved, opts.interpreter.take())
            .await
        {
            let _ = fs::remove_dir_all(&dest);
            return Err(e);
        }

        Ok(InstallOutcome {
            name: canonical,
            version,
        })
    }

    /// Replace an installed plugin with a strictly newer version. Existing
    /// settings are preserved; settings new in this version are
    /// bootstrapped like a fresh install.
    pub async fn upgrade(
        &self,
        archive: &PluginArchive,
        name: &str,
        mut opts: InstallOptions<'_>,
    ) -> Result<InstallOutcome> {
        let (root, manifest) = find_manifest(archive, name)?;
        let files = ArchivePluginFiles::new(archive, &root);
        validate_manifest(&files, &manifest)?;
        let requested = manifest.version()?;
        let canonical = manifest.name().to_string();

        let installed = self.store.read_manifest(&canonical)?.version()?;
        if requested <= installed {
            return Err(Error::Downgrade {
                name: canonical,
                requested,
                installed,
            });
        }

        let mut lock = self.store.mutation_lock(&canonical)?;
        let _guard = lock.write()?;

        let configured = self.settings.configured_keys(&manifest)?;
        let resolved = resolve_install_values(
            &manifest,
            &opts.supplied_settings,
            &configured,
            opts.interactive,
            opts.prompter,
        )?;

        // stage the new version fully before the old one is touched
        let dest = self.store.plugin_directory(&canonical);
        let staged = self.extract_to_staging(archive, &root)?;
        let backup = self
            .store
            .plugins_directory()
            .join(format!(".bak-{}", canonical.to_ascii_lowercase()));
        let _ = fs::remove_dir_all(&backup);

        if let Err(e) = fs::rename(&dest, &backup) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staged, &dest) {
            let _ = fs::rename(&backup, &dest);
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }

        if let Err(e) = self
            .finish_installation(&manifest, &dest, resolved, opts.interpreter.take())
            .await
        {
            let _ = fs::remove_dir_all(&dest);
            let _ = fs::rename(&backup, &dest);
            return Err(e);
        }

        let _ = fs::remove_dir_all(&backup);
        Ok(InstallOutcome {
            name: canonical,
            version: requested,
        })
    }

    /// Remove an installed plugin. Settings stay in the config document so
    /// a reinstall restores them, unless `purge` is set.
    pub fn uninstall(&self, name: &str, purge: bool) -> Result<String> {
        let manifest = self.store.read_manifest(name)?;
        let canonical = manifest.name().to_string();

        let mut lock = self.store.mutation_lock(&canonical)?;
        let _guard = lock.write()?;

        fs::remove_dir_all(self.store.plugin_directory(&canonical))?;
        if purge {
            self.settings.remove_plugin(&canonical)?;
        }
        Ok(canonical)
    }

    async fn finish_installation(
        &self,
        manifest: &PluginManifest,
        dest: &Path,
        resolved: BTreeMap<String, crate::settings::SettingValue>,
        interpreter: Option<PathBuf>,
    ) -> Result<()> {
        self.settings.write_values(manifest.name(), &resolved)?;

        let files = DirPluginFiles::new(dest);
        let packages = pydeps::plugin_dependencies(&files, manifest)?;
        if packages.is_empty() {
            return Ok(());
        }
        let python = match interpreter {
            Some(python) => python,
            None => pydeps::find_interpreter(&self.settings)?,
        };
        pydeps::check_installable(&python, &packages).await?;
        pydeps::install_packages(&python, &packages).await?;
        Ok(())
    }

    fn extract_into_place(
        &self,
        archive: &PluginArchive,
        manifest_root: &str,
        dest: &Path,
    ) -> Result<()> {
        let staged = self.extract_to_staging(archive, manifest_root)?;
        if let Err(e) = fs::rename(&staged, dest) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }
        Ok(())
    }

    /// Extract the manifest's subtree into a fresh staging directory next
    /// to the plugin directories. The staging directory is cleaned up on
    /// any failure.
    fn extract_to_staging(
        &self,
        archive: &PluginArchive,
        manifest_root: &str,
    ) -> Result<PathBuf> {
        fs::create_dir_all(self.store.plugins_directory())?;
        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(self.store.plugins_directory())?;
        extract_members(archive, manifest_root, staging.path())?;
        Ok(staging.into_path())
    }
}

fn extract_members(archive: &PluginArchive, prefix: &str, dest: &Path) -> Result<()> {
    let mut zip = archive.open()?;

    // the safety gate runs over every member before a single byte is
    // written
    for index in 0..zip.len() {
        let member = zip
            .by_index_raw(index)
            .map_err(|e| Error::Validation(format!("unreadable archive member: {e}")))?;
        let raw = normalize_member_path(member.name());
        let Some(relative) = raw.strip_prefix(prefix) else {
            continue;
        };
        let relative = relative.trim_end_matches('/');
        if relative.is_empty() {
            continue;
        }
        ensure_regular_member(&member, relative)?;
        validate_relative_path(relative, "archive member")?;
        realized_path(dest, relative)?;
    }

    for index in 0..zip.len() {
        let mut member = zip
            .by_index(index)
            .map_err(|e| Error::Validation(format!("unreadable archive member: {e}")))?;
        let raw = normalize_member_path(member.name());
        let Some(relative) = raw.strip_prefix(prefix) else {
            continue;
        };
        let relative = relative.trim_end_matches('/').to_string();
        if relative.is_empty() {
            continue;
        }
        let target = realized_path(dest, &relative)?;

        if member.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut member, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = member.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

/// Only regular files and directories may be written; symlinks and device
/// nodes smuggled into an archive are refused outright.
fn ensure_regular_member(member: &zip::read::ZipFile<'_>, relative: &str) -> Result<()> {
    if let Some(mode) = member.unix_mode() {
        const S_IFMT: u32 = 0o170000;
        const S_IFREG: u32 = 0o100000;
        const S_IFDIR: u32 = 0o040000;
        const S_IFLNK: u32 = 0o120000;
        match mode & S_IFMT {
            0 | S_IFREG | S_IFDIR => {}
            S_IFLNK => {
                return Err(Error::Validation(format!(
                    "refusing to extract symlink archive member: '{relative}'"
                )))
            }
            _ => {
                return Err(Error::Validation(format!(
                    "refusing to extract special-file archive member: '{relative}'"
                )))
            }
        }
    }
    Ok(())
}

/// Join a validated member path onto the destination and confirm the result
/// stays inside it.
fn realized_path(dest: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = dest.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(Error::Validation(format!(
                "archive member escapes the plugin directory: '{relative}'"
            )));
        }
        path.push(part);
    }
    if !path.starts_with(dest) {
        return Err(Error::Validation(format!(
            "archive member escapes the plugin directory: '{relative}'"
        )));
    }
    Ok(path)
}
