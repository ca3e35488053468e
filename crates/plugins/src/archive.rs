//! Read-only access to a plugin archive held in memory.
//!
//! Nothing here writes to disk; extraction belongs to the installer, which
//! applies the path-safety gate before any member touches the filesystem.

use std::io::{Cursor, Read};

use zip::ZipArchive;

use crate::error::{Error, Result};

/// An immutable zip blob with member-level access.
pub struct PluginArchive {
    data: Vec<u8>,
}

impl PluginArchive {
    /// Wrap raw archive bytes, verifying that they open as a zip file.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        ZipArchive::new(Cursor::new(&data))
            .map_err(|e| Error::Validation(format!("not a valid plugin archive: {e}")))?;
        Ok(Self { data })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Member paths in archive order, normalized to `/` separators.
    pub fn member_names(&self) -> Result<Vec<String>> {
        let mut zip = self.open()?;
        let mut names = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let member = zip
                .by_index_raw(index)
                .map_err(|e| Error::Validation(format!("unreadable archive member: {e}")))?;
            names.push(normalize_member_path(member.name()));
        }
        Ok(names)
    }

    pub fn has_member(&self, path: &str) -> bool {
        let wanted = normalize_member_path(path);
        self.member_names()
            .map(|names| names.iter().any(|name| *name == wanted))
            .unwrap_or(false)
    }

    /// Read one member fully into memory.
    pub fn read_member(&self, path: &str) -> Result<Vec<u8>> {
        let wanted = normalize_member_path(path);
        let mut zip = self.open()?;
        for index in 0..zip.len() {
            let name = normalize_member_path(zip.by_index_raw(index).map_err(zip_error)?.name());
            if name == wanted {
                let mut member = zip.by_index(index).map_err(zip_error)?;
                let mut buf = Vec::with_capacity(member.size() as usize);
                member
                    .read_to_end(&mut buf)
                    .map_err(|e| Error::Validation(format!("failed to read '{wanted}': {e}")))?;
                return Ok(buf);
            }
        }
        Err(Error::Validation(format!(
            "no such member in archive: '{wanted}'"
        )))
    }

    pub(crate) fn open(&self) -> Result<ZipArchive<Cursor<&[u8]>>> {
        ZipArchive::new(Cursor::new(self.data.as_slice()))
            .map_err(|e| Error::Validation(format!("not a valid plugin archive: {e}")))
    }
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Validation(format!("unreadable archive member: {e}"))
}

/// Archives written on Windows may carry `\` separators; member lookups in
/// rem always use `/`.
pub(crate) fn normalize_member_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::*;

    /// Build an in-memory zip from `(path, contents)` pairs. Shared by the
    /// manifest, index, and installer tests.
    pub(crate) fn build_zip(members: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (path, contents) in members {
            writer
                .start_file(*path, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn rejects_non_zip_data() {
        assert!(PluginArchive::new(b"not a zip".to_vec()).is_err());
    }

    #[test]
    fn lists_and_reads_members() {
        let data = build_zip(&[("a.txt", "alpha"), ("dir/b.txt", "beta")]);
        let archive = PluginArchive::new(data).unwrap();

        assert_eq!(archive.member_names().unwrap(), ["a.txt", "dir/b.txt"]);
        assert!(archive.has_member("dir/b.txt"));
        assert!(!archive.has_member("missing.txt"));
        assert_eq!(archive.read_member("a.txt").unwrap(), b"alpha");
    }

    #[test]
    fn member_lookup_tolerates_backslash_separators() {
        let data = build_zip(&[("dir/b.txt", "beta")]);
        let archive = PluginArchive::new(data).unwrap();
        assert!(archive.has_member("dir\\b.txt"));
    }
}
