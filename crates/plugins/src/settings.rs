//! Per-plugin settings over `<hostUserDir>/config.json`.
//!
//! The plugin's manifest declares the schema; values live at
//! `plugins.<name>.settings.<key>` in one shared JSON document. Writes
//! validate against the schema and go through a read-modify-write cycle
//! under `config.json.lock`, so concurrent CLI invocations do not clobber
//! each other. Reads trust the file but coerce JSON primitives to the
//! declared type.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use serde_json::Value;

use crate::detect::{current_plugin, CallFrame};
use crate::error::{Error, Result};
use crate::manifest::{PluginManifest, SettingDescriptor, SettingType};
use crate::store::PluginStore;

pub const CONFIG_FILE_NAME: &str = "config.json";
const CONFIG_LOCK_FILE_NAME: &str = "config.json.lock";

/// A typed setting value, as stored in `config.json`. Enum settings are
/// strings constrained by the descriptor's choices.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    String(String),
    Bool(bool),
    Int(i64),
}

impl SettingValue {
    pub fn to_json(&self) -> Value {
        match self {
            SettingValue::String(s) => Value::String(s.clone()),
            SettingValue::Bool(b) => Value::Bool(*b),
            SettingValue::Int(i) => Value::Number((*i).into()),
        }
    }

    /// Coerce a stored JSON primitive to the declared type. Returns `None`
    /// when the stored shape cannot represent the type at all.
    pub fn from_json(value: &Value, descriptor: &SettingDescriptor) -> Option<SettingValue> {
        match descriptor.kind {
            SettingType::String | SettingType::Enum => {
                value.as_str().map(|s| SettingValue::String(s.to_string()))
            }
            SettingType::Bool => match value {
                Value::Bool(b) => Some(SettingValue::Bool(*b)),
                Value::String(s) => parse_bool(s).map(SettingValue::Bool),
                _ => None,
            },
            SettingType::Int => match value {
                Value::Number(n) => n.as_i64().map(SettingValue::Int),
                Value::String(s) => s.trim().parse().ok().map(SettingValue::Int),
                _ => None,
            },
        }
    }

    /// Parse and validate a user-supplied string against the descriptor.
    pub fn parse(plugin: &str, descriptor: &SettingDescriptor, raw: &str) -> Result<SettingValue> {
        let invalid = || {
            Error::SettingInvalid(format!(
                "failed to validate setting value: {plugin}: {}: '{raw}'",
                descriptor.key
            ))
        };
        match descriptor.kind {
            SettingType::String => {
                if raw.is_empty() && descriptor.required {
                    return Err(invalid());
                }
                Ok(SettingValue::String(raw.to_string()))
            }
            SettingType::Bool => parse_bool(raw).map(SettingValue::Bool).ok_or_else(invalid),
            SettingType::Int => raw
                .trim()
                .parse()
                .map(SettingValue::Int)
                .map_err(|_| invalid()),
            SettingType::Enum => {
                if descriptor.choices.iter().any(|choice| choice == raw) {
                    Ok(SettingValue::String(raw.to_string()))
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::String(s) => f.write_str(s),
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
        }
    }
}

/// One row of `rem plugin config <name> list`.
pub struct SettingRow {
    pub descriptor: SettingDescriptor,
    pub value: Option<SettingValue>,
    /// True when `value` came from the manifest default rather than the
    /// config file.
    pub from_default: bool,
}

/// Supplies values for prompted settings during an interactive install.
/// The CLI backs this with real terminal prompts; tests script it.
pub trait SettingPrompter {
    fn prompt(&mut self, plugin: &str, descriptor: &SettingDescriptor) -> Result<SettingValue>;
}

/// Prompter for non-interactive sessions; resolution never calls it.
pub struct NoPrompter;

impl SettingPrompter for NoPrompter {
    fn prompt(&mut self, _plugin: &str, descriptor: &SettingDescriptor) -> Result<SettingValue> {
        Err(Error::SettingsRequired(vec![descriptor.key.clone()]))
    }
}

/// Reads and writes the merged `config.json`.
pub struct SettingsStore {
    host_dir: PathBuf,
}

impl SettingsStore {
    pub fn new(host_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_dir: host_dir.into(),
        }
    }

    pub fn try_default() -> Result<Self> {
        let host_dir = rem_common::paths::host_user_dir()
            .map_err(|e| Error::Validation(e.to_string()))?;
        Ok(Self::new(host_dir))
    }

    pub fn config_path(&self) -> PathBuf {
        self.host_dir.join(CONFIG_FILE_NAME)
    }

    /// The interpreter executable configured for dependency installs, if
    /// any (`python.executable`).
    pub fn interpreter_path(&self) -> Result<Option<PathBuf>> {
        let doc = self.read_document()?;
        Ok(doc
            .get("python")
            .and_then(|python| python.get("executable"))
            .and_then(Value::as_str)
            .map(PathBuf::from))
    }

    /// The host version recorded by the host tool (`host.version`), used
    /// when `$HOST_VERSION` is not set.
    pub fn recorded_host_version(&self) -> Result<Option<String>> {
        let doc = self.read_document()?;
        Ok(doc
            .get("host")
            .and_then(|host| host.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Raw stored value for a plugin setting, no schema applied.
    pub fn stored_value(&self, plugin: &str, key: &str) -> Result<Option<Value>> {
        let doc = self.read_document()?;
        Ok(stored_setting(&doc, plugin, key).cloned())
    }

    /// A setting's effective value under the plugin's schema: the stored
    /// value if present, else the manifest default. `Ok(None)` for an
    /// optional setting with neither; `SettingMissing` for a required one.
    pub fn setting_value(
        &self,
        manifest: &PluginManifest,
        key: &str,
    ) -> Result<Option<SettingValue>> {
        let plugin = manifest.name();
        let descriptor = manifest
            .setting(key)
            .ok_or_else(|| Error::SettingInvalid(format!("unknown setting: {key}")))?;

        if let Some(stored) = self.stored_value(plugin, key)? {
            return match SettingValue::from_json(&stored, descriptor) {
                Some(value) => Ok(Some(value)),
                None => Err(Error::SettingInvalid(format!(
                    "stored value for {plugin}.{key} does not have the declared {} type",
                    descriptor.kind
                ))),
            };
        }
        if let Some(default) = &descriptor.default {
            return match SettingValue::from_json(default, descriptor) {
                Some(value) => Ok(Some(value)),
                None => Err(Error::SettingInvalid(format!(
                    "manifest default for {plugin}.{key} does not have the declared {} type",
                    descriptor.kind
                ))),
            };
        }
        if descriptor.required {
            return Err(Error::SettingMissing {
                plugin: plugin.to_string(),
                key: key.to_string(),
            });
        }
        Ok(None)
    }

    /// Convenience over [`Self::setting_value`] for an installed plugin.
    pub fn plugin_setting(
        &self,
        store: &PluginStore,
        plugin: &str,
        key: &str,
    ) -> Result<Option<SettingValue>> {
        let manifest = store.read_manifest(plugin)?;
        self.setting_value(&manifest, key)
    }

    /// `plugin_setting` with the plugin name inferred from the caller's
    /// stack frames; the way plugin code reads its own settings.
    pub fn current_plugin_setting(
        &self,
        store: &PluginStore,
        frame: &dyn CallFrame,
        key: &str,
    ) -> Result<Option<SettingValue>> {
        let plugin = current_plugin(frame, store)?;
        self.plugin_setting(store, &plugin, key)
    }

    /// Every declared setting with its effective value.
    pub fn list_settings(&self, store: &PluginStore, plugin: &str) -> Result<Vec<SettingRow>> {
        let manifest = store.read_manifest(plugin)?;
        let doc = self.read_document()?;
        let mut rows = Vec::new();
        for descriptor in manifest.settings() {
            let stored = stored_setting(&doc, manifest.name(), &descriptor.key)
                .and_then(|value| SettingValue::from_json(value, descriptor));
            let from_default = stored.is_none();
            let value = match stored {
                Some(value) => Some(value),
                None => descriptor
                    .default
                    .as_ref()
                    .and_then(|default| SettingValue::from_json(default, descriptor)),
            };
            rows.push(SettingRow {
                descriptor: descriptor.clone(),
                value,
                from_default,
            });
        }
        Ok(rows)
    }

    /// Validate and persist one setting.
    pub fn set_setting(
        &self,
        store: &PluginStore,
        plugin: &str,
        key: &str,
        raw: &str,
    ) -> Result<()> {
        let manifest = store.read_manifest(plugin)?;
        let descriptor = manifest
            .setting(key)
            .ok_or_else(|| Error::SettingInvalid(format!("unknown setting: {key}")))?;
        let value = SettingValue::parse(manifest.name(), descriptor, raw)?;
        self.write_values(
            manifest.name(),
            &BTreeMap::from([(key.to_string(), value)]),
        )
    }

    /// Remove one stored setting. Refused when the setting is required and
    /// the manifest provides no default to fall back to.
    pub fn delete_setting(&self, store: &PluginStore, plugin: &str, key: &str) -> Result<()> {
        let manifest = store.read_manifest(plugin)?;
        let descriptor = manifest
            .setting(key)
            .ok_or_else(|| Error::SettingInvalid(format!("unknown setting: {key}")))?;
        if descriptor.required && descriptor.default.is_none() {
            return Err(Error::SettingUndeletable {
                plugin: manifest.name().to_string(),
                key: key.to_string(),
            });
        }
        let plugin_name = manifest.name().to_string();
        self.mutate(|doc| {
            if let Some(settings) = doc
                .get_mut("plugins")
                .and_then(|plugins| plugins.get_mut(&plugin_name))
                .and_then(|plugin| plugin.get_mut("settings"))
                .and_then(Value::as_object_mut)
            {
                settings.remove(key);
            }
            Ok(())
        })
    }

    /// Persist a batch of already-validated values.
    pub fn write_values(
        &self,
        plugin: &str,
        values: &BTreeMap<String, SettingValue>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let plugin = plugin.to_string();
        self.mutate(move |doc| {
            let settings = doc
                .as_object_mut()
                .ok_or_else(|| {
                    Error::SettingInvalid("config.json: top level is not an object".into())
                })?
                .entry("plugins")
                .or_insert_with(|| Value::Object(Default::default()));
            let settings = settings
                .as_object_mut()
                .ok_or_else(|| Error::SettingInvalid("config.json: 'plugins' is not an object".into()))?
                .entry(plugin.clone())
                .or_insert_with(|| Value::Object(Default::default()));
            let settings = settings
                .as_object_mut()
                .ok_or_else(|| {
                    Error::SettingInvalid(format!("config.json: plugins.{plugin} is not an object"))
                })?
                .entry("settings")
                .or_insert_with(|| Value::Object(Default::default()));
            let settings = settings.as_object_mut().ok_or_else(|| {
                Error::SettingInvalid(format!(
                    "config.json: plugins.{plugin}.settings is not an object"
                ))
            })?;
            for (key, value) in values {
                settings.insert(key.clone(), value.to_json());
            }
            Ok(())
        })
    }

    /// Drop every stored setting of a plugin (the `uninstall --purge` path).
    pub fn remove_plugin(&self, plugin: &str) -> Result<()> {
        let plugin = plugin.to_string();
        self.mutate(move |doc| {
            if let Some(plugins) = doc.get_mut("plugins").and_then(Value::as_object_mut) {
                plugins.remove(&plugin);
            }
            Ok(())
        })
    }

    /// Stored keys of a plugin that hold a value coercible to its schema;
    /// these satisfy "already configured" during install and upgrade.
    pub fn configured_keys(&self, manifest: &PluginManifest) -> Result<BTreeSet<String>> {
        let doc = self.read_document()?;
        let mut keys = BTreeSet::new();
        for descriptor in manifest.settings() {
            if stored_setting(&doc, manifest.name(), &descriptor.key)
                .and_then(|value| SettingValue::from_json(value, descriptor))
                .is_some()
            {
                keys.insert(descriptor.key.clone());
            }
        }
        Ok(keys)
    }

    fn read_document(&self) -> Result<Value> {
        match fs::read(self.config_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::SettingInvalid(format!(
                    "malformed {}: {e}",
                    self.config_path().display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Value::Object(Default::default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of the config document under the advisory lock.
    fn mutate(&self, mutator: impl FnOnce(&mut Value) -> Result<()>) -> Result<()> {
        fs::create_dir_all(&self.host_dir)?;
        let lock_file = File::create(self.host_dir.join(CONFIG_LOCK_FILE_NAME))?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock.write()?;

        let mut doc = self.read_document()?;
        if !doc.is_object() {
            return Err(Error::SettingInvalid(format!(
                "malformed {}: top level is not an object",
                self.config_path().display()
            )));
        }
        mutator(&mut doc)?;

        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::SettingInvalid(format!("unserializable config document: {e}")))?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.host_dir)?;
        temp.write_all(text.as_bytes())?;
        temp.write_all(b"\n")?;
        temp.persist(self.config_path()).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

fn stored_setting<'doc>(doc: &'doc Value, plugin: &str, key: &str) -> Option<&'doc Value> {
    doc.get("plugins")?
        .get(plugin)?
        .get("settings")?
        .get(key)
}

/// Work out the values to persist when installing or upgrading a plugin.
///
/// Command-line pairs are validated first; unknown keys fail the operation
/// before anything touches the disk. Settings already configured (from a
/// previous install whose values were retained) are left alone. Remaining
/// settings take their value from prompting (interactive only, in declared
/// order) or the manifest default. Required settings that end up with no
/// value fail as one error naming every missing key.
pub fn resolve_install_values(
    manifest: &PluginManifest,
    supplied: &BTreeMap<String, String>,
    configured: &BTreeSet<String>,
    interactive: bool,
    prompter: &mut dyn SettingPrompter,
) -> Result<BTreeMap<String, SettingValue>> {
    let plugin = manifest.name();
    for key in supplied.keys() {
        if manifest.setting(key).is_none() {
            return Err(Error::SettingInvalid(format!("unknown setting: {key}")));
        }
    }

    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();
    for descriptor in manifest.settings() {
        let key = &descriptor.key;
        if let Some(raw) = supplied.get(key) {
            resolved.insert(key.clone(), SettingValue::parse(plugin, descriptor, raw)?);
            continue;
        }
        if configured.contains(key) {
            continue;
        }
        if descriptor.prompt && interactive {
            resolved.insert(key.clone(), prompter.prompt(plugin, descriptor)?);
            continue;
        }
        if let Some(default) = &descriptor.default {
            let value = SettingValue::from_json(default, descriptor).ok_or_else(|| {
                Error::SettingInvalid(format!(
                    "manifest default for {plugin}.{key} does not have the declared {} type",
                    descriptor.kind
                ))
            })?;
            resolved.insert(key.clone(), value);
            continue;
        }
        if descriptor.required {
            missing.push(key.clone());
        }
    }

    if !missing.is_empty() {
        return Err(Error::SettingsRequired(missing));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::manifest_json;
    use crate::manifest::MANIFEST_FILE_NAME;

    fn manifest_with_settings(settings: &str) -> PluginManifest {
        let doc = manifest_json("plugin1", "5.0.0", "plugin1.py").replace(
            "\"description\": \"a test plugin\",",
            &format!("\"description\": \"a test plugin\",\n  \"settings\": {settings},"),
        );
        PluginManifest::from_json(doc.as_bytes()).unwrap()
    }

    fn two_key_manifest() -> PluginManifest {
        manifest_with_settings(
            r#"[
                {"key": "key1", "type": "string", "required": true,
                 "description": "the value for key 1"},
                {"key": "key2", "type": "enum", "required": false,
                 "choices": ["default 2", "default 3"], "default": "default 2",
                 "description": "the value for key 2"}
            ]"#,
        )
    }

    fn installed_store(tmp: &std::path::Path, manifest: &PluginManifest) -> PluginStore {
        let plugins = tmp.join("plugins");
        let dir = plugins.join(manifest.name());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE_NAME), manifest.to_json().unwrap()).unwrap();
        PluginStore::new(plugins)
    }

    #[test]
    fn resolve_rejects_unknown_supplied_keys() {
        let manifest = two_key_manifest();
        let supplied = BTreeMap::from([("foo".to_string(), "bar".to_string())]);
        let err = resolve_install_values(
            &manifest,
            &supplied,
            &BTreeSet::new(),
            false,
            &mut NoPrompter,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown setting: foo");
    }

    #[test]
    fn resolve_fails_non_interactive_without_required_values() {
        let manifest = two_key_manifest();
        let err = resolve_install_values(
            &manifest,
            &BTreeMap::new(),
            &BTreeSet::new(),
            false,
            &mut NoPrompter,
        )
        .unwrap_err();
        let Error::SettingsRequired(keys) = err else {
            panic!("expected SettingsRequired, got {err}");
        };
        assert_eq!(keys, vec!["key1".to_string()]);
    }

    #[test]
    fn resolve_uses_supplied_values_and_defaults() {
        let manifest = two_key_manifest();
        let supplied = BTreeMap::from([("key1".to_string(), "bar".to_string())]);
        let resolved = resolve_install_values(
            &manifest,
            &supplied,
            &BTreeSet::new(),
            false,
            &mut NoPrompter,
        )
        .unwrap();
        assert_eq!(
            resolved,
            BTreeMap::from([
                ("key1".to_string(), SettingValue::String("bar".into())),
                ("key2".to_string(), SettingValue::String("default 2".into())),
            ])
        );
    }

    #[test]
    fn resolve_skips_already_configured_keys() {
        let manifest = two_key_manifest();
        let configured = BTreeSet::from(["key1".to_string()]);
        let resolved = resolve_install_values(
            &manifest,
            &BTreeMap::new(),
            &configured,
            false,
            &mut NoPrompter,
        )
        .unwrap();
        assert!(!resolved.contains_key("key1"));
    }

    #[test]
    fn interactive_resolution_prompts_in_declared_order() {
        struct Scripted(Vec<&'static str>);
        impl SettingPrompter for Scripted {
            fn prompt(
                &mut self,
                plugin: &str,
                descriptor: &SettingDescriptor,
            ) -> Result<SettingValue> {
                let raw = self.0.remove(0);
                SettingValue::parse(plugin, descriptor, raw)
            }
        }

        let manifest = two_key_manifest();
        let mut prompter = Scripted(vec!["hello", "default 3"]);
        let resolved = resolve_install_values(
            &manifest,
            &BTreeMap::new(),
            &BTreeSet::new(),
            true,
            &mut prompter,
        )
        .unwrap();
        assert_eq!(
            resolved["key1"],
            SettingValue::String("hello".into())
        );
        assert_eq!(
            resolved["key2"],
            SettingValue::String("default 3".into())
        );
        assert!(prompter.0.is_empty());
    }

    #[test]
    fn set_get_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = two_key_manifest();
        let store = installed_store(tmp.path(), &manifest);
        let settings = SettingsStore::new(tmp.path());

        settings
            .set_setting(&store, "plugin1", "key1", "bar")
            .unwrap();
        assert_eq!(
            settings.plugin_setting(&store, "plugin1", "key1").unwrap(),
            Some(SettingValue::String("bar".into()))
        );

        // enum validation
        let err = settings
            .set_setting(&store, "plugin1", "key2", "baz")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to validate setting value: plugin1: key2: 'baz'"
        );
        settings
            .set_setting(&store, "plugin1", "key2", "default 3")
            .unwrap();

        // delete falls back to the default
        settings
            .delete_setting(&store, "plugin1", "key2")
            .unwrap();
        assert_eq!(
            settings.plugin_setting(&store, "plugin1", "key2").unwrap(),
            Some(SettingValue::String("default 2".into()))
        );

        // required without default cannot be deleted
        let err = settings
            .delete_setting(&store, "plugin1", "key1")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot delete required setting without default: plugin1: key1"
        );

        // unknown key
        let err = settings
            .set_setting(&store, "plugin1", "nope", "x")
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown setting: nope");
    }

    #[test]
    fn required_setting_without_value_is_missing_on_read() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = two_key_manifest();
        let store = installed_store(tmp.path(), &manifest);
        let settings = SettingsStore::new(tmp.path());

        let err = settings
            .plugin_setting(&store, "plugin1", "key1")
            .unwrap_err();
        assert!(matches!(err, Error::SettingMissing { .. }));
    }

    #[test]
    fn typed_values_coerce_on_read() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = manifest_with_settings(
            r#"[
                {"key": "flag", "type": "bool", "default": false},
                {"key": "count", "type": "int", "default": 3}
            ]"#,
        );
        let store = installed_store(tmp.path(), &manifest);
        let settings = SettingsStore::new(tmp.path());

        assert_eq!(
            settings.plugin_setting(&store, "plugin1", "flag").unwrap(),
            Some(SettingValue::Bool(false))
        );
        settings
            .set_setting(&store, "plugin1", "flag", "true")
            .unwrap();
        settings
            .set_setting(&store, "plugin1", "count", "42")
            .unwrap();
        assert_eq!(
            settings.plugin_setting(&store, "plugin1", "flag").unwrap(),
            Some(SettingValue::Bool(true))
        );
        assert_eq!(
            settings.plugin_setting(&store, "plugin1", "count").unwrap(),
            Some(SettingValue::Int(42))
        );

        let err = settings
            .set_setting(&store, "plugin1", "count", "many")
            .unwrap_err();
        assert!(matches!(err, Error::SettingInvalid(_)));
    }

    #[test]
    fn purge_removes_only_that_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = two_key_manifest();
        let store = installed_store(tmp.path(), &manifest);
        let settings = SettingsStore::new(tmp.path());

        settings
            .set_setting(&store, "plugin1", "key1", "bar")
            .unwrap();
        settings
            .write_values(
                "other",
                &BTreeMap::from([("k".to_string(), SettingValue::Int(1))]),
            )
            .unwrap();

        settings.remove_plugin("plugin1").unwrap();
        assert_eq!(settings.stored_value("plugin1", "key1").unwrap(), None);
        assert_eq!(
            settings.stored_value("other", "k").unwrap(),
            Some(serde_json::json!(1))
        );
    }
}
