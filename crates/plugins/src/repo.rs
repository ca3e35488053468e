//! Plugin repositories: where catalogs of installable plugins come from.
//!
//! Two concrete sources exist: a directory tree of plugin archives, and a
//! remote (or on-disk) catalog snapshot. Both produce the same catalog
//! shape, and resolution over it is shared.

pub mod catalog;
pub mod fs;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::{Plugin, PluginLocation};
use crate::manifest::Platform;
use crate::version::{split_plugin_spec, HostVersion, HostVersionSpec};

/// Names the default catalog snapshot; `$CATALOG_URL` overrides it.
pub const ENV_CATALOG_URL: &str = "CATALOG_URL";

const DEFAULT_CATALOG_URL: &str = "https://plugins.revhost.io/catalog.json";

/// How long a cached remote catalog stays fresh before it is re-fetched.
pub const CATALOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A loaded plugin repository.
pub enum PluginRepository {
    Filesystem(fs::FilesystemRepo),
    Catalog(catalog::CatalogRepo),
}

impl PluginRepository {
    /// Open a repository from a `--repo` argument: a directory of archives,
    /// a snapshot file, a `file://`/`https://` snapshot URL, or the literal
    /// `default`. `refresh` bypasses the remote snapshot cache.
    pub async fn open(source: &str, refresh: bool) -> Result<Self> {
        let max_age = if refresh {
            Duration::ZERO
        } else {
            CATALOG_TTL
        };

        if source == "default" {
            let url = std::env::var(ENV_CATALOG_URL)
                .unwrap_or_else(|_| DEFAULT_CATALOG_URL.to_string());
            return Ok(Self::Catalog(
                catalog::CatalogRepo::from_url(&url, max_age).await?,
            ));
        }

        let path = match url::Url::parse(source) {
            Ok(parsed) if parsed.scheme() == "file" => parsed
                .to_file_path()
                .map_err(|_| Error::Validation(format!("invalid file URL: {source}")))?,
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                return Ok(Self::Catalog(
                    catalog::CatalogRepo::from_url(source, max_age).await?,
                ));
            }
            _ => std::path::PathBuf::from(source),
        };

        if path.is_dir() {
            Ok(Self::Filesystem(fs::FilesystemRepo::load(path)?))
        } else if path.is_file() {
            Ok(Self::Catalog(catalog::CatalogRepo::from_file(&path)?))
        } else {
            Err(Error::Validation(format!(
                "repository source is neither a directory, a snapshot file, nor a URL: {source}"
            )))
        }
    }

    /// The catalog, ordered by plugin name.
    pub fn plugins(&self) -> &[Plugin] {
        match self {
            Self::Filesystem(repo) => repo.plugins(),
            Self::Catalog(repo) => repo.plugins(),
        }
    }

    /// Case-insensitive catalog lookup by plugin name.
    pub fn find_plugin(&self, name: &str) -> Result<&Plugin> {
        find_plugin_in(self.plugins(), name)
    }

    /// Pick the best location for a plugin spec on the given platform and
    /// host version. See [`resolve_in`] for the algorithm.
    pub fn resolve(
        &self,
        spec: &str,
        platform: Platform,
        host_version: &HostVersion,
    ) -> Result<&PluginLocation> {
        resolve_in(self.plugins(), spec, platform, host_version)
    }

    /// Human-readable source, for messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Filesystem(repo) => repo.root().display().to_string(),
            Self::Catalog(repo) => repo.source().to_string(),
        }
    }
}

fn find_plugin_in<'a>(plugins: &'a [Plugin], name: &str) -> Result<&'a Plugin> {
    let matches: Vec<&Plugin> = plugins
        .iter()
        .filter(|plugin| plugin.name.eq_ignore_ascii_case(name))
        .collect();
    match matches.as_slice() {
        [] => Err(Error::NotFound(name.to_string())),
        [plugin] => Ok(plugin),
        several => Err(Error::Ambiguous {
            name: name.to_string(),
            candidates: several.iter().map(|p| p.name.clone()).collect(),
        }),
    }
}

/// Walk the plugin's versions from newest to oldest; within the first
/// version that satisfies the specifier, take the first location that
/// supports the platform and matches the current host version.
pub(crate) fn resolve_in<'a>(
    plugins: &'a [Plugin],
    spec: &str,
    platform: Platform,
    host_version: &HostVersion,
) -> Result<&'a PluginLocation> {
    let (name, version_spec) = split_plugin_spec(spec)?;
    let plugin = find_plugin_in(plugins, name)?;

    for (version, locations) in plugin.versions.iter().rev() {
        if !version_spec.matches(version) {
            tracing::debug!("skipping {} {version}: outside the requested versions", plugin.name);
            continue;
        }
        for (i, location) in locations.iter().enumerate() {
            if !location.platforms.contains(&platform) {
                tracing::debug!("skipping location {i}: platforms {:?}", location.platforms);
                continue;
            }
            let host_spec =
                HostVersionSpec::parse(location.host_versions.as_deref().unwrap_or(""))?;
            if !host_spec.matches(host_version) {
                tracing::debug!(
                    "skipping location {i}: host versions '{}'",
                    location.host_versions.as_deref().unwrap_or("any")
                );
                continue;
            }
            return Ok(location);
        }
    }

    Err(Error::NoCompatible {
        name: plugin.name.clone(),
        platform,
        host_version: *host_version,
        wanted: spec.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::index::PluginIndex;
    use crate::manifest::PluginManifest;
    use crate::version::PluginVersion;

    fn location(
        name: &str,
        version: &str,
        host_versions: Option<&str>,
        platforms: &[Platform],
    ) -> PluginLocation {
        let manifest = PluginManifest::from_json(
            crate::manifest::tests::manifest_json(name, version, &format!("{name}.py"))
                .as_bytes(),
        )
        .unwrap();
        PluginLocation {
            url: format!("https://example.com/{name}-{version}.zip"),
            sha256: "0".repeat(64),
            name: name.to_string(),
            version: PluginVersion::parse(version).unwrap(),
            host_versions: host_versions.map(str::to_string),
            platforms: platforms.iter().copied().collect(),
            metadata: manifest,
        }
    }

    fn plugin_with(locations: Vec<PluginLocation>) -> Plugin {
        let name = locations[0].name.clone();
        let mut versions: BTreeMap<PluginVersion, Vec<PluginLocation>> = BTreeMap::new();
        for loc in locations {
            versions.entry(loc.version).or_default().push(loc);
        }
        Plugin { name, versions }
    }

    fn host(v: &str) -> HostVersion {
        HostVersion::parse(v).unwrap()
    }

    #[test]
    fn resolves_newest_satisfying_version() {
        let plugins = vec![plugin_with(vec![
            location("plugin1", "1.0.0", None, &Platform::ALL),
            location("plugin1", "2.0.0", None, &Platform::ALL),
        ])];
        let found = resolve_in(&plugins, "plugin1", Platform::LinuxX86_64, &host("9.1")).unwrap();
        assert_eq!(found.version, PluginVersion::parse("2.0.0").unwrap());

        let pinned =
            resolve_in(&plugins, "plugin1==1.0.0", Platform::LinuxX86_64, &host("9.1")).unwrap();
        assert_eq!(pinned.version, PluginVersion::parse("1.0.0").unwrap());
    }

    #[test]
    fn platform_filter_falls_back_to_older_versions() {
        // newest version is linux-only; windows callers get the older one
        let plugins = vec![plugin_with(vec![
            location("plugin1", "5.0.0", None, &[Platform::LinuxX86_64]),
            location("plugin1", "2.0.0", None, &Platform::ALL),
        ])];
        let found =
            resolve_in(&plugins, "plugin1", Platform::WindowsX86_64, &host("9.1")).unwrap();
        assert_eq!(found.version, PluginVersion::parse("2.0.0").unwrap());
    }

    #[test]
    fn host_version_specifier_gates_locations() {
        let plugins = vec![plugin_with(vec![location(
            "plugin1",
            "1.0.0",
            Some("==9.1"),
            &Platform::ALL,
        )])];

        // service packs of 9.1 are fine
        resolve_in(&plugins, "plugin1", Platform::LinuxX86_64, &host("9.1sp2")).unwrap();

        let err = resolve_in(&plugins, "plugin1", Platform::LinuxX86_64, &host("9.2"))
            .unwrap_err();
        assert!(matches!(err, Error::NoCompatible { .. }));
    }

    #[test]
    fn lookup_is_case_insensitive_and_flags_ambiguity() {
        let plugins = vec![plugin_with(vec![location(
            "Plugin1",
            "1.0.0",
            None,
            &Platform::ALL,
        )])];
        resolve_in(&plugins, "PLUGIN1", Platform::LinuxX86_64, &host("9.1")).unwrap();

        assert!(matches!(
            resolve_in(&plugins, "other", Platform::LinuxX86_64, &host("9.1")),
            Err(Error::NotFound(_))
        ));

        let ambiguous = vec![
            plugin_with(vec![location("Plugin1", "1.0.0", None, &Platform::ALL)]),
            plugin_with(vec![location("plugin1", "1.0.0", None, &Platform::ALL)]),
        ];
        assert!(matches!(
            resolve_in(&ambiguous, "plugin1", Platform::LinuxX86_64, &host("9.1")),
            Err(Error::Ambiguous { .. })
        ));
    }

    #[test]
    fn location_order_breaks_ties_deterministically() {
        let mut index = PluginIndex::new();
        let bytes = {
            let manifest = crate::manifest::tests::manifest_json("p", "1.0.0", "p.py");
            crate::archive::tests::build_zip(&[
                ("plugin-manifest.json", manifest.as_str()),
                ("p.py", ""),
            ])
        };
        index.add_archive("https://b.example.com/p.zip", bytes.clone()).unwrap();
        index.add_archive("https://a.example.com/p.zip", bytes).unwrap();
        let plugins = index.into_plugins();

        let found = resolve_in(&plugins, "p", Platform::LinuxX86_64, &host("9.1")).unwrap();
        assert_eq!(found.url, "https://a.example.com/p.zip");
    }
}
