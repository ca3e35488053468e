//! The `plugin-manifest.json` schema: parsing, validation, and platform
//! inference.
//!
//! A single archive may carry several plugins; each manifest's directory is
//! that plugin's root, and every path in the manifest resolves relative to
//! it. Unknown manifest keys are preserved round-trip but never acted on.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::archive::{normalize_member_path, PluginArchive};
use crate::error::{Error, Result};
use crate::version::{HostVersionSpec, PluginVersion};

/// File name that identifies a plugin inside an archive or directory.
pub const MANIFEST_FILE_NAME: &str = "plugin-manifest.json";

/// Manifest schema revision understood by this build.
pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Overrides platform auto-detection, mainly for tests.
pub const ENV_HOST_PLATFORM: &str = "HOST_PLATFORM";

/// One of the four targets a plugin build can run on. Variant order
/// follows the lexicographic order of the tags, so ordered sets serialize
/// as sorted arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "linux-x86_64")]
    LinuxX86_64,
    #[serde(rename = "macos-aarch64")]
    MacosAarch64,
    #[serde(rename = "macos-x86_64")]
    MacosX86_64,
    #[serde(rename = "windows-x86_64")]
    WindowsX86_64,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::LinuxX86_64,
        Platform::MacosAarch64,
        Platform::MacosX86_64,
        Platform::WindowsX86_64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WindowsX86_64 => "windows-x86_64",
            Platform::LinuxX86_64 => "linux-x86_64",
            Platform::MacosX86_64 => "macos-x86_64",
            Platform::MacosAarch64 => "macos-aarch64",
        }
    }

    /// The platform rem is running on, or the `$HOST_PLATFORM` override.
    pub fn current() -> Result<Platform> {
        if let Ok(tag) = std::env::var(ENV_HOST_PLATFORM) {
            return tag.parse();
        }
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("windows", _) => Ok(Platform::WindowsX86_64),
            ("linux", _) => Ok(Platform::LinuxX86_64),
            ("macos", "aarch64") => Ok(Platform::MacosAarch64),
            ("macos", _) => Ok(Platform::MacosX86_64),
            (os, arch) => Err(Error::Validation(format!(
                "unsupported platform: {os}-{arch}"
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown platform tag: '{s}'")))
    }
}

/// Where a plugin's interpreter dependencies are declared: listed directly
/// in the manifest, or inline in a fenced block at the top of the entry
/// point source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DependencyRepr", into = "DependencyRepr")]
pub enum DependencySource {
    List(Vec<String>),
    Inline,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum DependencyRepr {
    List(Vec<String>),
    Token(String),
}

impl TryFrom<DependencyRepr> for DependencySource {
    type Error = String;

    fn try_from(repr: DependencyRepr) -> std::result::Result<Self, String> {
        match repr {
            DependencyRepr::List(deps) => Ok(DependencySource::List(deps)),
            DependencyRepr::Token(token) if token == "inline" => Ok(DependencySource::Inline),
            DependencyRepr::Token(token) => Err(format!(
                "dependencies must be a list or the literal \"inline\", got \"{token}\""
            )),
        }
    }
}

impl From<DependencySource> for DependencyRepr {
    fn from(source: DependencySource) -> Self {
        match source {
            DependencySource::List(deps) => DependencyRepr::List(deps),
            DependencySource::Inline => DependencyRepr::Token("inline".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Bool,
    Int,
    Enum,
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingType::String => "string",
            SettingType::Bool => "bool",
            SettingType::Int => "int",
            SettingType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// One entry of a plugin's settings schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingDescriptor {
    pub key: String,
    #[serde(rename = "type", default = "default_setting_type")]
    pub kind: SettingType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed values; only meaningful for `enum` settings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// Whether an interactive install asks the user for this value.
    #[serde(default = "default_true")]
    pub prompt: bool,
}

fn default_setting_type() -> SettingType {
    SettingType::String
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Urls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// Parsed `plugin-manifest.json`. Version and specifier fields keep their
/// source text so that reserialization is lossless; the typed accessors
/// normalize on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub(crate) schema_version: u32,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) entry_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) host_versions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) platforms: Option<BTreeSet<Platform>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) authors: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) maintainers: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) urls: Option<Urls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) logo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) dependencies: Option<DependencySource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) settings: Vec<SettingDescriptor>,
    /// Unknown keys, preserved for forward compatibility.
    #[serde(flatten)]
    pub(crate) extras: BTreeMap<String, serde_json::Value>,
}

impl PluginManifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("malformed {MANIFEST_FILE_NAME}: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Validation(format!("unserializable manifest: {e}")))
    }

    /// Display name; lookups treat names case-insensitively.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Result<PluginVersion> {
        PluginVersion::parse(&self.version)
    }

    pub fn raw_version(&self) -> &str {
        &self.version
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn logo_path(&self) -> Option<&str> {
        self.logo_path.as_deref()
    }

    pub fn repository_url(&self) -> Option<&str> {
        self.urls.as_ref().and_then(|urls| urls.repository.as_deref())
    }

    pub fn raw_host_versions(&self) -> Option<&str> {
        self.host_versions.as_deref()
    }

    /// The host compatibility specifier; absent means "any".
    pub fn host_version_spec(&self) -> Result<HostVersionSpec> {
        match &self.host_versions {
            Some(spec) => HostVersionSpec::parse_manifest(spec),
            None => Ok(HostVersionSpec::default()),
        }
    }

    pub fn dependencies(&self) -> Option<&DependencySource> {
        self.dependencies.as_ref()
    }

    pub fn settings(&self) -> &[SettingDescriptor] {
        &self.settings
    }

    pub fn setting(&self, key: &str) -> Option<&SettingDescriptor> {
        self.settings.iter().find(|s| s.key == key)
    }

    /// Whether the entry point is interpreter source rather than a native
    /// library.
    pub fn is_source_plugin(&self) -> bool {
        self.entry_point.to_ascii_lowercase().ends_with(".py")
    }
}

/// Uniform access to a plugin's files, whether they live in an archive
/// subtree or an on-disk directory. Paths are relative to the plugin root
/// with `/` separators.
pub trait PluginFiles {
    fn contains(&self, relative: &str) -> bool;
    fn read(&self, relative: &str) -> Result<Vec<u8>>;
}

/// A plugin rooted at a directory prefix inside an archive.
pub struct ArchivePluginFiles<'a> {
    archive: &'a PluginArchive,
    root: String,
}

impl<'a> ArchivePluginFiles<'a> {
    /// `root` is the manifest's directory within the archive: `""` for the
    /// archive root, otherwise a `/`-terminated prefix like `"sub/dir/"`.
    pub fn new(archive: &'a PluginArchive, root: &str) -> Self {
        let mut root = normalize_member_path(root);
        if !root.is_empty() && !root.ends_with('/') {
            root.push('/');
        }
        Self { archive, root }
    }

    fn resolve(&self, relative: &str) -> String {
        format!("{}{}", self.root, normalize_member_path(relative))
    }
}

impl PluginFiles for ArchivePluginFiles<'_> {
    fn contains(&self, relative: &str) -> bool {
        self.archive.has_member(&self.resolve(relative))
    }

    fn read(&self, relative: &str) -> Result<Vec<u8>> {
        self.archive.read_member(&self.resolve(relative))
    }
}

/// A plugin rooted at an on-disk directory (an unpacked installation or a
/// source tree being linted).
pub struct DirPluginFiles {
    root: PathBuf,
}

impl DirPluginFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in normalize_member_path(relative).split('/') {
            path.push(part);
        }
        path
    }
}

impl PluginFiles for DirPluginFiles {
    fn contains(&self, relative: &str) -> bool {
        self.resolve(relative).is_file()
    }

    fn read(&self, relative: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.resolve(relative))?)
    }
}

/// Enumerate every `(plugin root, manifest)` declared in the archive.
/// Members that fail to parse as JSON are skipped; schema validation is a
/// separate, explicit step.
pub fn manifests_in_archive(archive: &PluginArchive) -> Result<Vec<(String, PluginManifest)>> {
    let mut found = Vec::new();
    for member in archive.member_names()? {
        let Some(root) = member.strip_suffix(MANIFEST_FILE_NAME) else {
            continue;
        };
        if !root.is_empty() && !root.ends_with('/') {
            continue;
        }
        match PluginManifest::from_json(&archive.read_member(&member)?) {
            Ok(manifest) => found.push((root.to_string(), manifest)),
            Err(e) => {
                tracing::debug!("skipping unparseable manifest at '{member}': {e}");
            }
        }
    }
    Ok(found)
}

/// Locate the named plugin's manifest and root within the archive,
/// case-insensitively.
pub fn find_manifest(archive: &PluginArchive, name: &str) -> Result<(String, PluginManifest)> {
    manifests_in_archive(archive)?
        .into_iter()
        .find(|(_, manifest)| manifest.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::NotFound(format!("no plugin '{name}' in archive")))
}

/// Validate a manifest against its plugin's files, applying the schema and
/// path-safety rules.
pub fn validate_manifest(files: &dyn PluginFiles, manifest: &PluginManifest) -> Result<()> {
    if manifest.schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(Error::Validation(format!(
            "unsupported manifest schema version: {} (expected {SUPPORTED_SCHEMA_VERSION})",
            manifest.schema_version
        )));
    }

    if manifest.name.is_empty()
        || !manifest
            .name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b' '))
    {
        return Err(Error::Validation(format!(
            "invalid plugin name '{}': only ASCII letters, digits, underscores, dashes, and spaces are allowed",
            manifest.name
        )));
    }

    manifest.version()?;
    manifest.host_version_spec()?;

    if manifest.entry_point.is_empty() {
        return Err(Error::Validation("entry point required".to_string()));
    }
    validate_relative_path(&manifest.entry_point, "entry point")?;
    if let Some(logo) = &manifest.logo_path {
        validate_relative_path(logo, "logo path")?;
    }

    if manifest.is_source_plugin() {
        if !files.contains(&manifest.entry_point) {
            return Err(Error::Validation(format!(
                "entry point file not found: '{}'",
                manifest.entry_point
            )));
        }
    } else {
        let entry = &manifest.entry_point;
        let has_library_suffix = [".so", ".dll", ".dylib"]
            .iter()
            .any(|suffix| entry.to_ascii_lowercase().ends_with(suffix));
        let found = if has_library_suffix {
            files.contains(entry)
        } else {
            binary_entry_candidates(entry)
                .iter()
                .any(|(candidate, _)| files.contains(candidate))
        };
        if !found {
            return Err(Error::Validation(format!(
                "binary plugin file not found: '{entry}'"
            )));
        }
    }

    if let Some(logo) = &manifest.logo_path {
        if !files.contains(logo) {
            return Err(Error::Validation(format!("logo file not found: '{logo}'")));
        }
    }

    if let Some(platforms) = &manifest.platforms {
        if platforms.is_empty() {
            return Err(Error::Validation(
                "platforms, when given, must not be empty".to_string(),
            ));
        }
    }

    validate_settings_schema(&manifest.settings)?;

    Ok(())
}

fn validate_settings_schema(settings: &[SettingDescriptor]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for descriptor in settings {
        let key = &descriptor.key;
        if key.is_empty()
            || !key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
        {
            return Err(Error::Validation(format!(
                "invalid setting key '{key}': only ASCII letters, digits, underscores, and dashes are allowed"
            )));
        }
        if !seen.insert(key.clone()) {
            return Err(Error::Validation(format!("duplicate setting key '{key}'")));
        }
        if descriptor.kind == SettingType::Enum && descriptor.choices.is_empty() {
            return Err(Error::Validation(format!(
                "enum setting '{key}' must declare choices"
            )));
        }
        if descriptor.kind != SettingType::Enum && !descriptor.choices.is_empty() {
            return Err(Error::Validation(format!(
                "setting '{key}' has choices but is not an enum"
            )));
        }
        if !descriptor.prompt && descriptor.default.is_none() {
            return Err(Error::Validation(format!(
                "setting '{key}' disables prompting but has no default"
            )));
        }
        if let Some(default) = &descriptor.default {
            if !default_matches_type(default, descriptor) {
                return Err(Error::Validation(format!(
                    "default for setting '{key}' does not match its {} type",
                    descriptor.kind
                )));
            }
        }
    }
    Ok(())
}

fn default_matches_type(value: &serde_json::Value, descriptor: &SettingDescriptor) -> bool {
    match descriptor.kind {
        SettingType::String => value.is_string(),
        SettingType::Bool => value.is_boolean(),
        SettingType::Int => value.is_i64(),
        SettingType::Enum => value
            .as_str()
            .map(|s| descriptor.choices.iter().any(|c| c == s))
            .unwrap_or(false),
    }
}

/// Reject non-ASCII, absolute, and parent-traversing manifest paths before
/// anything touches the filesystem. The installer applies the same rule to
/// every archive member it extracts.
pub(crate) fn validate_relative_path(path: &str, field: &str) -> Result<()> {
    let invalid = || Error::Validation(format!("invalid {field} path: '{path}'"));

    if !path.is_ascii() {
        return Err(invalid());
    }
    let normalized = normalize_member_path(path);
    if normalized.starts_with('/') || Path::new(&normalized).is_absolute() {
        return Err(invalid());
    }
    // a Windows drive prefix is absolute even when Path::is_absolute (on
    // Unix) says otherwise
    if normalized.len() >= 2 && normalized.as_bytes()[1] == b':' {
        return Err(invalid());
    }
    if normalized.split('/').any(|part| part == "..") {
        return Err(invalid());
    }
    Ok(())
}

/// Candidate files a bare binary entry point may resolve to, with the
/// platforms each one implies.
fn binary_entry_candidates(entry: &str) -> Vec<(String, Vec<Platform>)> {
    vec![
        (format!("{entry}.so"), vec![Platform::LinuxX86_64]),
        (format!("{entry}.dll"), vec![Platform::WindowsX86_64]),
        (format!("{entry}_x86_64.dylib"), vec![Platform::MacosX86_64]),
        (format!("{entry}_aarch64.dylib"), vec![Platform::MacosAarch64]),
    ]
}

/// Determine which platforms a plugin supports.
///
/// Explicit `platforms` win. Otherwise: source plugins run everywhere;
/// binary plugins are classified by the entry point's library suffix, or,
/// for a bare entry name, by probing the sibling files each platform's
/// build would ship (a bare `.dylib` is assumed universal).
pub fn infer_platforms(
    files: &dyn PluginFiles,
    manifest: &PluginManifest,
) -> Result<BTreeSet<Platform>> {
    if let Some(platforms) = &manifest.platforms {
        if platforms.is_empty() {
            return Err(Error::Validation(
                "platforms, when given, must not be empty".to_string(),
            ));
        }
        return Ok(platforms.clone());
    }

    if manifest.is_source_plugin() {
        return Ok(Platform::ALL.into_iter().collect());
    }

    let entry = manifest.entry_point.to_ascii_lowercase();
    if entry.ends_with(".so") {
        return Ok(BTreeSet::from([Platform::LinuxX86_64]));
    }
    if entry.ends_with(".dll") {
        return Ok(BTreeSet::from([Platform::WindowsX86_64]));
    }
    if entry.ends_with(".dylib") {
        // assume a universal binary
        return Ok(BTreeSet::from([
            Platform::MacosX86_64,
            Platform::MacosAarch64,
        ]));
    }

    let mut platforms = BTreeSet::new();
    for (candidate, tags) in binary_entry_candidates(&manifest.entry_point) {
        if files.contains(&candidate) {
            platforms.extend(tags);
        }
    }
    // universal mac binary fallback, only when no arch-specific dylib matched
    if !platforms.contains(&Platform::MacosX86_64) && !platforms.contains(&Platform::MacosAarch64) {
        let universal = format!("{}.dylib", manifest.entry_point);
        if files.contains(&universal) {
            platforms.insert(Platform::MacosX86_64);
            platforms.insert(Platform::MacosAarch64);
        }
    }

    if platforms.is_empty() {
        return Err(Error::Validation(format!(
            "failed to discover platforms: entry point '{}' not found",
            manifest.entry_point
        )));
    }
    Ok(platforms)
}
