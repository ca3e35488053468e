//! Catalog snapshots: a repository serialized to deterministic JSON.
//!
//! A snapshot embeds each location's manifest and sha256, so a client can
//! resolve and verify installs without touching the upstream archives.
//! Remote snapshots are cached on disk with a TTL; `repo sync` bypasses it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;

use crate::error::{Error, Result};
use crate::fetch;
use crate::index::{Plugin, PluginIndex};

/// A catalog loaded from a snapshot (or built in memory for one).
pub struct CatalogRepo {
    source: String,
    plugins: Vec<Plugin>,
}

impl CatalogRepo {
    pub fn new(source: impl Into<String>, plugins: Vec<Plugin>) -> Self {
        Self {
            source: source.into(),
            plugins,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(path.display().to_string(), parse_snapshot(&text)?))
    }

    /// Load a snapshot from a URL. `https` responses are cached under the
    /// cache root and reused until `max_age` elapses; pass zero to force a
    /// refresh.
    pub async fn from_url(url: &str, max_age: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Validation(format!("invalid catalog URL '{url}': {e}")))?;

        if parsed.scheme() == "file" {
            let path = parsed
                .to_file_path()
                .map_err(|_| Error::Validation(format!("invalid file URL: {url}")))?;
            return Self::from_file(&path);
        }

        let cache_path = snapshot_cache_path(url)?;
        if let Some(text) = fresh_cache_read(&cache_path, max_age) {
            tracing::debug!("catalog cache hit for {url}");
            return Ok(Self::new(url, parse_snapshot(&text)?));
        }

        let bytes = fetch::fetch_url(url).await?;
        let text = String::from_utf8(bytes).map_err(|_| {
            Error::Validation(format!("catalog snapshot at {url} is not UTF-8"))
        })?;
        let plugins = parse_snapshot(&text)?;

        if let Err(e) = write_snapshot_cache(&cache_path, &text) {
            tracing::warn!("failed to cache catalog from {url}: {e}");
        }
        Ok(Self::new(url, plugins))
    }

    /// Build a catalog by fetching a batch of archive URLs. The fetches run
    /// concurrently (the one fan-out in the CLI); indexing is sequential
    /// and archives that fail to fetch or validate are skipped with a
    /// warning.
    pub async fn from_archive_urls(source: &str, urls: &[String]) -> Result<Self> {
        let fetches = urls.iter().map(|url| fetch::fetch_url(url));
        let results = join_all(fetches).await;

        let mut index = PluginIndex::new();
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(bytes) => {
                    if let Err(e) = index.add_archive(url, bytes) {
                        terminal::warn!("skipping archive {url}: {e}");
                    }
                }
                Err(e) => terminal::warn!("skipping archive {url}: {e}"),
            }
        }
        Ok(Self::new(source, index.into_plugins()))
    }
}

/// Serialize a catalog to its canonical form: keys sorted, two-space
/// indent, platform sets as sorted arrays. Byte-identical across runs for
/// the same input.
pub fn to_canonical_json(plugins: &[Plugin]) -> Result<String> {
    // round-trip through Value so that every object's keys are emitted in
    // sorted order regardless of struct field order
    let value = serde_json::to_value(plugins)
        .map_err(|e| Error::Validation(format!("unserializable catalog: {e}")))?;
    serde_json::to_string_pretty(&value)
        .map_err(|e| Error::Validation(format!("unserializable catalog: {e}")))
}

pub fn parse_snapshot(text: &str) -> Result<Vec<Plugin>> {
    serde_json::from_str(text)
        .map_err(|e| Error::Validation(format!("malformed catalog snapshot: {e}")))
}

fn snapshot_cache_path(url: &str) -> Result<PathBuf> {
    let source_id = rem_common::sha256::hex_digest(url);
    Ok(rem_common::paths::cache_root()
        .map_err(|e| Error::Validation(e.to_string()))?
        .join("catalog")
        .join(format!("{source_id}.json")))
}

fn fresh_cache_read(path: &Path, max_age: Duration) -> Option<String> {
    if max_age.is_zero() {
        return None;
    }
    let modified = path.metadata().ok()?.modified().ok()?;
    let age = modified.elapsed().ok()?;
    if age > max_age {
        return None;
    }
    std::fs::read_to_string(path).ok()
}

fn write_snapshot_cache(path: &Path, text: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("cache path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(text.as_bytes())?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
