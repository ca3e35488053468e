//! A repository backed by a directory tree of plugin archives.

use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;
use url::Url;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::index::{Plugin, PluginIndex};

/// A catalog built by walking a directory for `.zip` archives.
pub struct FilesystemRepo {
    root: PathBuf,
    plugins: Vec<Plugin>,
}

impl FilesystemRepo {
    /// Walk `root` recursively, indexing every archive found. Invalid
    /// archives are reported and skipped; the rest of the catalog still
    /// loads.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut index = PluginIndex::new();

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Validation(format!(
                "cannot walk repository directory {}: {e}",
                root.display()
            )))?;
            if !entry.file_type().is_file() || !has_zip_extension(entry.path()) {
                continue;
            }

            let url = file_url(entry.path())?;
            let bytes = std::fs::read(entry.path())?;
            if let Err(e) = index.add_archive(&url, bytes) {
                terminal::warn!("skipping archive {}: {e}", entry.path().display());
            }
        }

        Ok(Self {
            root,
            plugins: index.into_plugins(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }
}

fn has_zip_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn file_url(path: &Path) -> Result<String> {
    let absolute = path
        .absolutize()
        .map_err(Error::Io)?
        .into_owned();
    Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|_| Error::Validation(format!("unrepresentable archive path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use crate::manifest::tests::manifest_json;

    fn write_source_archive(dir: &Path, file: &str, name: &str, version: &str) {
        let manifest = manifest_json(name, version, &format!("{name}.py"));
        let entry = format!("{name}.py");
        let bytes = build_zip(&[
            ("plugin-manifest.json", manifest.as_str()),
            (entry.as_str(), "PLUGIN_ENTRY = None\n"),
        ]);
        std::fs::write(dir.join(file), bytes).unwrap();
    }

    #[test]
    fn walks_nested_directories_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("team").join("releases");
        std::fs::create_dir_all(&nested).unwrap();

        write_source_archive(dir.path(), "plugin1-v1.0.0.zip", "plugin1", "1.0.0");
        write_source_archive(&nested, "plugin2-v2.0.0.zip", "plugin2", "2.0.0");
        std::fs::write(dir.path().join("notes.txt"), "not an archive").unwrap();
        std::fs::write(dir.path().join("broken.zip"), "not a zip at all").unwrap();

        let repo = FilesystemRepo::load(dir.path()).unwrap();
        let names: Vec<_> = repo.plugins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["plugin1", "plugin2"]);
        for plugin in repo.plugins() {
            let locations = plugin.versions.values().next().unwrap();
            assert!(locations[0].url.starts_with("file://"));
        }
    }
}
