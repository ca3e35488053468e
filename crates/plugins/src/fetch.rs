//! Downloads plugin archives and verifies them against the catalog.
//!
//! Remote archives land in a content-addressed cache keyed by sha256, so a
//! reinstall or a second machine-wide CLI invocation never refetches bytes
//! it already has. Cache writes are tempfile-then-rename; reads need no
//! lock.

use std::io::Write;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{Error, Result};
use crate::index::PluginLocation;

/// Fetch raw bytes from a `file://`, `http://`, or `https://` URL.
pub async fn fetch_url(url: &str) -> Result<Vec<u8>> {
    let parsed = Url::parse(url)
        .map_err(|e| Error::Validation(format!("invalid archive URL '{url}': {e}")))?;

    match parsed.scheme() {
        "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|_| Error::Validation(format!("invalid file URL: {url}")))?;
            Ok(std::fs::read(path)?)
        }
        "http" | "https" => {
            let response = reqwest::get(url).await.map_err(|e| Error::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            if !response.status().is_success() {
                return Err(Error::Network {
                    url: url.to_string(),
                    reason: format!("HTTP status {}", response.status()),
                });
            }
            let bytes = response.bytes().await.map_err(|e| Error::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok(bytes.to_vec())
        }
        scheme => Err(Error::Validation(format!(
            "unsupported URL scheme '{scheme}': {url}"
        ))),
    }
}

/// Fetch a catalog location's archive, verifying its sha256 and consulting
/// the content-addressed cache first.
pub async fn fetch_location(location: &PluginLocation, cache_root: &Path) -> Result<Vec<u8>> {
    let cached = cached_archive_path(cache_root, &location.sha256);
    if let Ok(bytes) = std::fs::read(&cached) {
        if rem_common::sha256::hex_digest(&bytes) == location.sha256 {
            tracing::debug!("archive cache hit for {}", location.url);
            return Ok(bytes);
        }
        // damaged cache entry, refetch below
        tracing::warn!("discarding corrupt cache entry {}", cached.display());
    }

    let bytes = fetch_url(&location.url).await?;
    let actual = rem_common::sha256::hex_digest(&bytes);
    if actual != location.sha256 {
        return Err(Error::HashMismatch {
            url: location.url.clone(),
            expected: location.sha256.clone(),
            actual,
        });
    }

    if let Err(e) = write_cache_entry(&cached, &bytes) {
        tracing::warn!("failed to cache archive for {}: {e}", location.url);
    }
    Ok(bytes)
}

fn cached_archive_path(cache_root: &Path, sha256: &str) -> PathBuf {
    cache_root.join("archives").join(sha256).join("archive.bin")
}

fn write_cache_entry(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("cache path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::manifest::{Platform, PluginManifest};
    use crate::version::PluginVersion;

    fn file_location(dir: &Path, file_name: &str, bytes: &[u8], sha256: &str) -> PluginLocation {
        let path = dir.join(file_name);
        std::fs::write(&path, bytes).unwrap();
        let manifest = PluginManifest::from_json(
            crate::manifest::tests::manifest_json("p", "1.0.0", "p.py").as_bytes(),
        )
        .unwrap();
        PluginLocation {
            url: Url::from_file_path(&path).unwrap().to_string(),
            sha256: sha256.to_string(),
            name: "p".to_string(),
            version: PluginVersion::parse("1.0.0").unwrap(),
            host_versions: None,
            platforms: BTreeSet::from([Platform::LinuxX86_64]),
            metadata: manifest,
        }
    }

    #[tokio::test]
    async fn verifies_and_caches_archives() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let payload = b"pretend this is a zip";
        let digest = rem_common::sha256::hex_digest(payload);

        let location = file_location(dir.path(), "good.zip", payload, &digest);
        let bytes = fetch_location(&location, &cache).await.unwrap();
        assert_eq!(bytes, payload);
        assert!(cached_archive_path(&cache, &digest).is_file());

        // remove the source; the cache now satisfies the fetch
        std::fs::remove_file(dir.path().join("good.zip")).unwrap();
        let bytes = fetch_location(&location, &cache).await.unwrap();
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn mismatched_digest_fails_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let location = file_location(dir.path(), "bad.zip", b"payload", &"0".repeat(64));

        let err = fetch_location(&location, &cache).await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        // nothing was cached
        assert!(!cached_archive_path(&cache, &location.sha256).exists());
    }
}
