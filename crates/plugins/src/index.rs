//! Aggregates heterogeneous plugin archives into a canonical index.
//!
//! Archives are grouped by `(name, version, host specifier, platform set)`;
//! several archives landing on the same key are kept as redundant download
//! locations. Output ordering is fully deterministic so that serialized
//! snapshots are byte-stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::archive::PluginArchive;
use crate::error::{Error, Result};
use crate::manifest::{
    infer_platforms, manifests_in_archive, validate_manifest, ArchivePluginFiles, Platform,
    PluginManifest,
};
use crate::version::PluginVersion;

/// One concrete downloadable artifact backing a `(name, version)` pair.
/// Frozen once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginLocation {
    pub url: String,
    pub sha256: String,
    pub name: String,
    pub version: PluginVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_versions: Option<String>,
    pub platforms: BTreeSet<Platform>,
    /// The full manifest, embedded so clients can resolve without fetching
    /// the archive.
    pub metadata: PluginManifest,
}

/// A catalog entry: one plugin name and every known version of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    /// Versions in ascending semantic order; the resolver walks them in
    /// reverse. Locations within a version keep their declared order.
    pub versions: BTreeMap<PluginVersion, Vec<PluginLocation>>,
}

impl Plugin {
    pub fn latest_version(&self) -> Option<PluginVersion> {
        self.versions.keys().next_back().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    host_versions: Option<String>,
    platforms: BTreeSet<Platform>,
}

struct Group {
    manifest: PluginManifest,
    /// url -> archive sha256; BTreeMap keeps the URL ordering stable.
    backings: BTreeMap<String, String>,
}

/// Builds a catalog from `(url, bytes)` archive pairs.
#[derive(Default)]
pub struct PluginIndex {
    plugins: BTreeMap<String, BTreeMap<PluginVersion, BTreeMap<GroupKey, Group>>>,
}

impl PluginIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every plugin declared by the archive at `url`. A validation
    /// failure rejects the whole archive; callers treat that as "skip this
    /// archive" and keep building the catalog.
    pub fn add_archive(&mut self, url: &str, bytes: Vec<u8>) -> Result<()> {
        let archive = PluginArchive::new(bytes)?;
        let sha256 = rem_common::sha256::hex_digest(archive.bytes());

        let manifests = manifests_in_archive(&archive)?;
        if manifests.is_empty() {
            return Err(Error::Validation(
                "archive declares no plugin manifests".to_string(),
            ));
        }

        for (root, manifest) in manifests {
            let files = ArchivePluginFiles::new(&archive, &root);
            validate_manifest(&files, &manifest)?;
            let platforms = infer_platforms(&files, &manifest)?;
            let version = manifest.version()?;

            tracing::debug!(
                "indexed plugin: {} {} host:{} {:?} from {url}",
                manifest.name(),
                version,
                manifest.raw_host_versions().unwrap_or("any"),
                platforms,
            );

            let key = GroupKey {
                host_versions: manifest.raw_host_versions().map(str::to_string),
                platforms,
            };
            self.plugins
                .entry(manifest.name().to_string())
                .or_default()
                .entry(version)
                .or_default()
                .entry(key)
                .or_insert_with(|| Group {
                    manifest,
                    backings: BTreeMap::new(),
                })
                .backings
                .insert(url.to_string(), sha256.clone());
        }
        Ok(())
    }

    /// Emit the catalog: plugins by name, versions in semantic order, and
    /// locations stably ordered by grouping key then URL.
    pub fn into_plugins(self) -> Vec<Plugin> {
        self.plugins
            .into_iter()
            .map(|(name, versions)| Plugin {
                name: name.clone(),
                versions: versions
                    .into_iter()
                    .map(|(version, groups)| {
                        let locations = groups
                            .into_iter()
                            .flat_map(|(key, group)| {
                                let name = name.clone();
                                let Group { manifest, backings } = group;
                                backings.into_iter().map(move |(url, sha256)| PluginLocation {
                                    url,
                                    sha256,
                                    name: name.clone(),
                                    version,
                                    host_versions: key.host_versions.clone(),
                                    platforms: key.platforms.clone(),
                                    metadata: manifest.clone(),
                                })
                            })
                            .collect();
                        (version, locations)
                    })
                    .collect(),
            })
            .collect()
    }
}
