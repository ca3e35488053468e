use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use dialoguer::{Confirm, Input, Select};
use rem_plugins::archive::PluginArchive;
use rem_plugins::fetch;
use rem_plugins::index::Plugin;
use rem_plugins::install::{InstallOptions, PluginManager};
use rem_plugins::manifest::{
    manifests_in_archive, validate_manifest, DirPluginFiles, PluginManifest, SettingDescriptor,
    SettingType, MANIFEST_FILE_NAME,
};
use rem_plugins::repo::catalog::{to_canonical_json, CatalogRepo};
use rem_plugins::repo::PluginRepository;
use rem_plugins::settings::{SettingPrompter, SettingValue, SettingsStore};
use rem_plugins::store::PluginStore;
use rem_plugins::version::split_plugin_spec;

use crate::session::Session;

/// Manage the host tool's plugins.
#[derive(Parser, Debug)]
pub struct PluginArgs {
    /// Plugin repository for this invocation: a directory of archives, a
    /// catalog snapshot (path or URL), or "default".
    #[clap(long = "repo", global = true, value_name = "PATH|URL|default")]
    pub repo: Option<String>,

    #[clap(subcommand)]
    pub command: PluginCommands,
}

impl PluginArgs {
    pub async fn run(self) -> Result<()> {
        let repo = self.repo;
        match self.command {
            PluginCommands::Search(cmd) => cmd.run(repo).await,
            PluginCommands::Install(cmd) => cmd.run(repo).await,
            PluginCommands::Upgrade(cmd) => cmd.run(repo).await,
            PluginCommands::Uninstall(cmd) => cmd.run().await,
            PluginCommands::Enable(cmd) => cmd.run().await,
            PluginCommands::Disable(cmd) => cmd.run().await,
            PluginCommands::Status(cmd) => cmd.run(repo).await,
            PluginCommands::Config(cmd) => cmd.run().await,
            PluginCommands::Lint(cmd) => cmd.run().await,
            PluginCommands::Repo(cmd) => cmd.run(repo).await,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// List or filter the catalog, with host compatibility annotations.
    Search(Search),

    /// Install a plugin.
    ///
    /// The plugin may be named (optionally with a version specifier, like
    /// `name>=1.2`), or given as a local archive path or a `file://` /
    /// `https://` archive URL.
    Install(Install),

    /// Upgrade an installed plugin to a strictly greater version.
    Upgrade(Upgrade),

    /// Remove an installed plugin. Its settings are retained unless
    /// `--purge` is given.
    Uninstall(Uninstall),

    /// Re-enable a disabled plugin.
    Enable(Enable),

    /// Disable a plugin without removing it; the host tool will ignore it.
    Disable(Disable),

    /// Show installed plugins and whether upgrades are available.
    Status(Status),

    /// Read and write a plugin's settings.
    Config(Config),

    /// Validate a plugin manifest in a directory or archive.
    Lint(Lint),

    /// Catalog maintenance.
    #[clap(subcommand)]
    Repo(RepoCommands),
}

#[derive(Parser, Debug)]
pub struct Install {
    /// Plugin spec, archive path, or archive URL.
    pub spec: String,

    /// Supply a setting value, as key=value. Repeatable.
    #[clap(long = "config", value_name = "KEY=VALUE")]
    pub config: Vec<String>,

    /// Never prompt; use defaults and supplied values only.
    #[clap(short = 'y', long = "yes", takes_value = false)]
    pub yes: bool,
}

impl Install {
    pub async fn run(self, repo: Option<String>) -> Result<()> {
        let supplied = parse_config_pairs(&self.config)?;
        let (archive, name) = acquire_archive(repo.as_deref(), &self.spec).await?;

        let manager = PluginManager::try_default()?;
        let mut prompter = TermPrompter;
        let outcome = manager
            .install(
                &archive,
                &name,
                InstallOptions {
                    supplied_settings: supplied,
                    interactive: interactive(self.yes),
                    prompter: &mut prompter,
                    interpreter: None,
                },
            )
            .await?;

        println!("Installed plugin: {}=={}", outcome.name, outcome.version);
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Upgrade {
    /// Plugin spec, archive path, or archive URL.
    pub spec: String,

    /// Supply a setting value, as key=value. Repeatable.
    #[clap(long = "config", value_name = "KEY=VALUE")]
    pub config: Vec<String>,

    /// Never prompt; use defaults and supplied values only.
    #[clap(short = 'y', long = "yes", takes_value = false)]
    pub yes: bool,
}

impl Upgrade {
    pub async fn run(self, repo: Option<String>) -> Result<()> {
        let supplied = parse_config_pairs(&self.config)?;
        let (archive, name) = acquire_archive(repo.as_deref(), &self.spec).await?;

        let manager = PluginManager::try_default()?;
        let mut prompter = TermPrompter;
        let outcome = manager
            .upgrade(
                &archive,
                &name,
                InstallOptions {
                    supplied_settings: supplied,
                    interactive: interactive(self.yes),
                    prompter: &mut prompter,
                    interpreter: None,
                },
            )
            .await?;

        println!("Installed plugin: {}=={}", outcome.name, outcome.version);
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Uninstall {
    /// Name of the plugin to remove.
    pub name: String,

    /// Also delete the plugin's stored settings.
    #[clap(long = "purge", takes_value = false)]
    pub purge: bool,
}

impl Uninstall {
    pub async fn run(self) -> Result<()> {
        let manager = PluginManager::try_default()?;
        let name = manager.uninstall(&self.name, self.purge)?;
        println!("Uninstalled plugin: {name}");
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Enable {
    /// Name of the plugin to enable.
    pub name: String,
}

impl Enable {
    pub async fn run(self) -> Result<()> {
        let store = PluginStore::try_default()?;
        store.enable(&self.name)?;
        println!("Enabled plugin: {}", self.name);
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Disable {
    /// Name of the plugin to disable.
    pub name: String,
}

impl Disable {
    pub async fn run(self) -> Result<()> {
        let store = PluginStore::try_default()?;
        store.disable(&self.name)?;
        println!("Disabled plugin: {}", self.name);
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Status {}

impl Status {
    pub async fn run(self, repo: Option<String>) -> Result<()> {
        let store = PluginStore::try_default()?;
        let installed = store.installed_plugins()?;
        if installed.is_empty() {
            println!("No plugins found");
            return Ok(());
        }

        // the repository is only needed for the upgradability column; show
        // what we have even when it cannot be loaded
        let session = match Session::open(repo.as_deref()).await {
            Ok(session) => Some(session),
            Err(e) => {
                terminal::warn!("couldn't load the plugin repository; upgrade information unavailable: {e:#}");
                None
            }
        };

        let mut table = Table::new();
        table.set_header(vec!["Name", "Version", "Status"]);
        table.load_preset(comfy_table::presets::ASCII_BORDERS_ONLY_CONDENSED);

        for plugin in installed {
            let mut notes = Vec::new();
            if !plugin.enabled {
                notes.push("disabled".to_string());
            }
            if let Some(session) = &session {
                if let Ok(location) =
                    session
                        .repo
                        .resolve(&plugin.name, session.platform, &session.host_version)
                {
                    if location.version > plugin.version {
                        notes.push(format!("upgradable to {}", location.version));
                    }
                }
            }
            table.add_row(vec![
                plugin.name,
                plugin.version.to_string(),
                notes.join(", "),
            ]);
        }

        println!("{table}");
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Search {
    /// Filter text, an exact plugin name, or a `name==version` spec.
    pub query: Option<String>,
}

impl Search {
    pub async fn run(self, repo: Option<String>) -> Result<()> {
        let session = Session::open(repo.as_deref()).await?;

        match self.query.as_deref() {
            Some(query) if query.contains(['=', '<', '>', '!']) => {
                print_location_view(&session, query)
            }
            Some(query) => {
                if let Ok(plugin) = session.repo.find_plugin(query) {
                    print_detail_view(plugin)
                } else {
                    print_catalog_table(&session, Some(query))
                }
            }
            None => print_catalog_table(&session, None),
        }
    }
}

fn print_catalog_table(session: &Session, filter: Option<&str>) -> Result<()> {
    let mut table = Table::new();
    table.set_header(vec!["Name", "Version", "Repository", ""]);
    table.load_preset(comfy_table::presets::ASCII_BORDERS_ONLY_CONDENSED);

    let mut shown = 0;
    for plugin in session.repo.plugins() {
        if let Some(filter) = filter {
            if !plugin
                .name
                .to_ascii_lowercase()
                .contains(&filter.to_ascii_lowercase())
            {
                continue;
            }
        }
        let Some((version, locations)) = plugin.versions.iter().next_back() else {
            continue;
        };
        let repository = locations
            .first()
            .and_then(|location| location.metadata.repository_url())
            .unwrap_or("");
        let compatible = session
            .repo
            .resolve(&plugin.name, session.platform, &session.host_version)
            .is_ok();
        table.add_row(vec![
            plugin.name.clone(),
            version.to_string(),
            repository.to_string(),
            if compatible {
                String::new()
            } else {
                "incompatible with this host".to_string()
            },
        ]);
        shown += 1;
    }

    if shown == 0 {
        println!("No plugins found");
    } else {
        println!("{table}");
    }
    Ok(())
}

fn print_detail_view(plugin: &Plugin) -> Result<()> {
    println!("name: {}", plugin.name);
    if let Some(location) = plugin
        .versions
        .values()
        .next_back()
        .and_then(|locations| locations.first())
    {
        if let Some(description) = location.metadata.description() {
            println!("description: {description}");
        }
        if let Some(repository) = location.metadata.repository_url() {
            println!("repository: {repository}");
        }
    }
    println!("available versions:");
    for version in plugin.versions.keys().rev() {
        println!(" {version}");
    }
    Ok(())
}

fn print_location_view(session: &Session, query: &str) -> Result<()> {
    let (name, version_spec) = split_plugin_spec(query)?;
    let plugin = session.repo.find_plugin(name)?;

    println!("name: {}", plugin.name);
    println!("download locations:");
    for (version, locations) in plugin.versions.iter().rev() {
        if !version_spec.matches(version) {
            continue;
        }
        for location in locations {
            println!(
                " version: {version}  host: {}  platforms: {}  URL: {}",
                location.host_versions.as_deref().unwrap_or("any"),
                format_platforms(location),
                location.url,
            );
        }
    }
    Ok(())
}

fn format_platforms(location: &rem_plugins::index::PluginLocation) -> String {
    if location.platforms.len() == rem_plugins::Platform::ALL.len() {
        return "all".to_string();
    }
    location
        .platforms
        .iter()
        .map(|platform| platform.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Parser, Debug)]
pub struct Config {
    /// Name of the installed plugin.
    pub name: String,

    #[clap(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show every declared setting and its effective value.
    List,
    /// Print one setting's effective value.
    Get { key: String },
    /// Validate and store one setting.
    Set { key: String, value: String },
    /// Remove one stored setting, falling back to the manifest default.
    Del { key: String },
}

impl Config {
    pub async fn run(self) -> Result<()> {
        let store = PluginStore::try_default()?;
        let settings = SettingsStore::try_default()?;

        match self.command {
            ConfigCommands::List => {
                let rows = settings.list_settings(&store, &self.name)?;
                if rows.is_empty() {
                    println!("No settings defined for {}", self.name);
                    return Ok(());
                }
                let mut table = Table::new();
                table.set_header(vec!["Key", "Value", "Description"]);
                table.load_preset(comfy_table::presets::ASCII_BORDERS_ONLY_CONDENSED);
                for row in rows {
                    let value = match &row.value {
                        Some(value) if row.from_default => format!("{value} (default)"),
                        Some(value) => value.to_string(),
                        None => String::new(),
                    };
                    table.add_row(vec![
                        row.descriptor.key.clone(),
                        value,
                        row.descriptor.description.clone().unwrap_or_default(),
                    ]);
                }
                println!("{table}");
            }
            ConfigCommands::Get { key } => {
                match settings.plugin_setting(&store, &self.name, &key)? {
                    Some(value) => println!("{value}"),
                    None => println!("(unset)"),
                }
            }
            ConfigCommands::Set { key, value } => {
                settings.set_setting(&store, &self.name, &key, &value)?;
                println!("Set {}.{key}", self.name);
            }
            ConfigCommands::Del { key } => {
                settings.delete_setting(&store, &self.name, &key)?;
                println!("Deleted {}.{key}", self.name);
            }
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct Lint {
    /// A plugin directory or a plugin archive.
    pub path: PathBuf,
}

impl Lint {
    pub async fn run(self) -> Result<()> {
        if self.path.is_dir() {
            let manifest_path = self.path.join(MANIFEST_FILE_NAME);
            if !manifest_path.is_file() {
                bail!("{MANIFEST_FILE_NAME} not found in {}", self.path.display());
            }
            let manifest = PluginManifest::from_json(&std::fs::read(manifest_path)?)?;
            let files = DirPluginFiles::new(&self.path);
            validate_manifest(&files, &manifest)?;
            lint_report(&manifest)?;
        } else if self.path.is_file() {
            let archive = PluginArchive::new(std::fs::read(&self.path)?)?;
            let manifests = manifests_in_archive(&archive)?;
            if manifests.is_empty() {
                bail!("no {MANIFEST_FILE_NAME} found in {}", self.path.display());
            }
            for (root, manifest) in manifests {
                let files = rem_plugins::manifest::ArchivePluginFiles::new(&archive, &root);
                validate_manifest(&files, &manifest)?;
                lint_report(&manifest)?;
            }
        } else {
            bail!("no such file or directory: {}", self.path.display());
        }
        Ok(())
    }
}

fn lint_report(manifest: &PluginManifest) -> Result<()> {
    println!("OK: {} {}", manifest.name(), manifest.version()?);
    if manifest.raw_host_versions().is_none() {
        println!("Recommendation: provide hostVersions");
    }
    if manifest.description().is_none() {
        println!("Recommendation: provide description");
    }
    if manifest.categories().is_empty() {
        println!("Recommendation: provide categories");
    }
    if manifest.logo_path().is_none() {
        println!("Recommendation: provide logoPath");
    }
    Ok(())
}

#[derive(Subcommand, Debug)]
pub enum RepoCommands {
    /// Print the repository catalog as a canonical JSON snapshot.
    Snapshot,

    /// Refresh the cached remote catalog, or build a snapshot from a list
    /// of archive URLs.
    Sync(Sync),
}

#[derive(Parser, Debug)]
pub struct Sync {
    /// File of plugin archive URLs, one per line; the resulting snapshot is
    /// printed to stdout.
    #[clap(long = "archives", value_name = "FILE")]
    pub archives: Option<PathBuf>,
}

impl RepoCommands {
    pub async fn run(self, repo: Option<String>) -> Result<()> {
        match self {
            RepoCommands::Snapshot => {
                let session = Session::open(repo.as_deref()).await?;
                println!("{}", to_canonical_json(session.repo.plugins())?);
            }
            RepoCommands::Sync(cmd) => {
                if let Some(archives) = cmd.archives {
                    let text = std::fs::read_to_string(&archives)?;
                    let urls: Vec<String> = text
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty() && !line.starts_with('#'))
                        .map(str::to_string)
                        .collect();
                    let catalog =
                        CatalogRepo::from_archive_urls(&archives.display().to_string(), &urls)
                            .await?;
                    println!("{}", to_canonical_json(catalog.plugins())?);
                } else {
                    let source = repo.as_deref().unwrap_or("default").to_string();
                    let repo = PluginRepository::open(&source, true).await?;
                    terminal::step!(
                        "Synced",
                        "{} plugins from {}",
                        repo.plugins().len(),
                        repo.describe()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Get the archive to operate on: a local file, a direct URL, or the best
/// compatible location resolved from the repository.
async fn acquire_archive(repo: Option<&str>, spec: &str) -> Result<(PluginArchive, String)> {
    let as_path = Path::new(spec);
    if spec.to_ascii_lowercase().ends_with(".zip") && as_path.is_file() {
        tracing::info!("installing from the local file system");
        let archive = PluginArchive::new(std::fs::read(as_path)?)?;
        let name = sole_plugin_name(&archive)?;
        return Ok((archive, name));
    }

    if spec.starts_with("file://") || spec.starts_with("http://") || spec.starts_with("https://") {
        tracing::info!("installing from URL");
        let archive = PluginArchive::new(fetch::fetch_url(spec).await?)?;
        let name = sole_plugin_name(&archive)?;
        return Ok((archive, name));
    }

    let session = Session::open(repo).await?;
    let location = session
        .repo
        .resolve(spec, session.platform, &session.host_version)?;
    terminal::step!(
        "Fetching",
        "{}=={} from {}",
        location.name,
        location.version,
        location.url
    );
    let cache_root =
        rem_common::paths::cache_root().map_err(|e| anyhow!("cannot locate cache: {e}"))?;
    let bytes = fetch::fetch_location(location, &cache_root).await?;
    let name = location.name.clone();
    Ok((PluginArchive::new(bytes)?, name))
}

/// Direct archive installs (path or URL) must be unambiguous about which
/// plugin they mean.
fn sole_plugin_name(archive: &PluginArchive) -> Result<String> {
    let manifests = manifests_in_archive(archive)?;
    match manifests.as_slice() {
        [(_, manifest)] => Ok(manifest.name().to_string()),
        [] => bail!("archive does not declare a plugin"),
        _ => bail!("archive declares several plugins; install it through a repository instead"),
    }
}

fn interactive(yes_flag: bool) -> bool {
    !yes_flag && atty::is(atty::Stream::Stdin)
}

fn parse_config_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --config '{pair}': expected key=value");
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Terminal prompts for settings bootstrap, re-asking on invalid input.
struct TermPrompter;

impl SettingPrompter for TermPrompter {
    fn prompt(
        &mut self,
        plugin: &str,
        descriptor: &SettingDescriptor,
    ) -> rem_plugins::error::Result<SettingValue> {
        if let Some(description) = &descriptor.description {
            println!("{description}");
        }
        loop {
            let raw = ask_setting(descriptor).map_err(|e| {
                rem_plugins::Error::Io(std::io::Error::other(e.to_string()))
            })?;
            match SettingValue::parse(plugin, descriptor, &raw) {
                Ok(value) => return Ok(value),
                Err(e) => println!("{e}"),
            }
        }
    }
}

fn ask_setting(descriptor: &SettingDescriptor) -> dialoguer::Result<String> {
    let label = descriptor.name.as_deref().unwrap_or(&descriptor.key);
    match descriptor.kind {
        SettingType::Bool => {
            let mut confirm = Confirm::new().with_prompt(label);
            if let Some(default) = descriptor.default.as_ref().and_then(|v| v.as_bool()) {
                confirm = confirm.default(default);
            }
            Ok(confirm.interact()?.to_string())
        }
        SettingType::Enum => {
            let default_index = descriptor
                .default
                .as_ref()
                .and_then(|v| v.as_str())
                .and_then(|d| descriptor.choices.iter().position(|c| c == d));
            let index = Select::new()
                .with_prompt(label)
                .items(&descriptor.choices)
                .default(default_index.unwrap_or(0))
                .interact()?;
            Ok(descriptor.choices[index].clone())
        }
        SettingType::String | SettingType::Int => {
            let mut input = Input::<String>::new().with_prompt(label);
            let default = descriptor.default.as_ref().and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            if let Some(default) = default {
                input = input.default(default);
            }
            input.interact_text()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_pairs_parse_and_reject_malformed_input() {
        let parsed =
            parse_config_pairs(&["k1=v1".to_string(), "k2=a=b".to_string()]).unwrap();
        assert_eq!(parsed["k1"], "v1");
        // only the first '=' splits
        assert_eq!(parsed["k2"], "a=b");

        assert!(parse_config_pairs(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn sole_plugin_name_requires_exactly_one_manifest() {
        let single = PluginArchive::new(zip_with(&[
            ("plugin-manifest.json", &sample_manifest("one")),
            ("one.py", ""),
        ]))
        .unwrap();
        assert_eq!(sole_plugin_name(&single).unwrap(), "one");

        let double = PluginArchive::new(zip_with(&[
            ("a/plugin-manifest.json", &sample_manifest("a")),
            ("a/a.py", ""),
            ("b/plugin-manifest.json", &sample_manifest("b")),
            ("b/b.py", ""),
        ]))
        .unwrap();
        assert!(sole_plugin_name(&double).is_err());
    }

    fn sample_manifest(name: &str) -> String {
        format!(
            r#"{{"schemaVersion": 1, "name": "{name}", "version": "1.0.0", "entryPoint": "{name}.py"}}"#
        )
    }

    fn zip_with(members: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (path, contents) in members {
            writer
                .start_file(*path, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}
