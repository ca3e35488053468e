//! Resolves which installed plugin the current caller belongs to.
//!
//! Plugin code asks "read *my* setting" without naming itself. The host
//! runtime supplies its call stack through the [`CallFrame`] interface; the
//! detector walks frames outward from the caller and claims the first one
//! whose source file lives under the plugins directory. The canonical name
//! comes from that directory's manifest, never from the directory name —
//! the two can differ in case.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::store::PluginStore;

/// A stack frame as reported by the host-language runtime.
pub trait CallFrame {
    /// Source file the frame is executing, if the runtime knows it.
    fn source_path(&self) -> Option<PathBuf>;
    /// The frame that called this one; `None` at the outermost frame.
    fn caller(&self) -> Option<&dyn CallFrame>;
}

/// Canonical name of the installed plugin that owns the calling code.
pub fn current_plugin(frame: &dyn CallFrame, store: &PluginStore) -> Result<String> {
    let plugins_root = normalize(store.plugins_directory());

    let mut current: Option<&dyn CallFrame> = Some(frame);
    while let Some(frame) = current {
        if let Some(source) = frame.source_path() {
            if let Some(name) = owning_plugin(&normalize(&source), &plugins_root, store)? {
                return Ok(name);
            }
        }
        current = frame.caller();
    }
    Err(Error::NotInPluginContext)
}

/// If `source` lies under `<plugins_root>/<dir>/` (at any depth), the
/// canonical name of that plugin.
fn owning_plugin(
    source: &Path,
    plugins_root: &Path,
    store: &PluginStore,
) -> Result<Option<String>> {
    let Ok(below_root) = source.strip_prefix(plugins_root) else {
        return Ok(None);
    };
    let Some(Component::Normal(dir_name)) = below_root.components().next() else {
        return Ok(None);
    };
    let Some(dir_name) = dir_name.to_str() else {
        return Ok(None);
    };
    // a file directly under the plugins root belongs to no plugin
    if below_root.components().count() < 2 {
        return Ok(None);
    }
    match store.read_manifest(dir_name) {
        Ok(manifest) => Ok(Some(manifest.name().to_string())),
        Err(Error::NotInstalled(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Lexical normalization: resolve `.` and `..` components without touching
/// the filesystem, so unextant paths from the runtime still compare.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::manifest_json;
    use crate::manifest::MANIFEST_FILE_NAME;

    /// A scripted stack: the runtime's frame chain, innermost first.
    struct TestFrame {
        path: Option<PathBuf>,
        parent: Option<Box<TestFrame>>,
    }

    impl TestFrame {
        fn chain(paths: &[Option<&Path>]) -> TestFrame {
            let mut frame: Option<Box<TestFrame>> = None;
            for path in paths.iter().rev() {
                frame = Some(Box::new(TestFrame {
                    path: path.map(Path::to_path_buf),
                    parent: frame,
                }));
            }
            *frame.expect("at least one frame")
        }
    }

    impl CallFrame for TestFrame {
        fn source_path(&self) -> Option<PathBuf> {
            self.path.clone()
        }

        fn caller(&self) -> Option<&dyn CallFrame> {
            self.parent.as_deref().map(|f| f as &dyn CallFrame)
        }
    }

    fn install_plugin(plugins: &Path, dir_name: &str, canonical: &str) -> PathBuf {
        let dir = plugins.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE_NAME),
            manifest_json(canonical, "1.0.0", "main.py"),
        )
        .unwrap();
        std::fs::write(dir.join("main.py"), "").unwrap();
        dir
    }

    #[test]
    fn detects_plugin_from_entry_point_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        let dir = install_plugin(tmp.path(), "my-cool-plugin", "my-cool-plugin");

        let frame = TestFrame::chain(&[Some(dir.join("main.py").as_path())]);
        assert_eq!(current_plugin(&frame, &store).unwrap(), "my-cool-plugin");
    }

    #[test]
    fn detects_plugin_from_nested_helper_module() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        let dir = install_plugin(tmp.path(), "deep", "deep");
        let helper = dir.join("lib").join("helper.py");

        let frame = TestFrame::chain(&[Some(helper.as_path())]);
        assert_eq!(current_plugin(&frame, &store).unwrap(), "deep");
    }

    #[test]
    fn walks_past_non_plugin_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        let dir = install_plugin(tmp.path(), "walker", "walker");

        let entry = dir.join("main.py");
        let frame = TestFrame::chain(&[
            Some(Path::new("/usr/lib/runtime/site.py")),
            None,
            Some(entry.as_path()),
        ]);
        assert_eq!(current_plugin(&frame, &store).unwrap(), "walker");
    }

    #[test]
    fn canonical_name_comes_from_the_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        // directory casing differs from the declared name
        let dir = install_plugin(tmp.path(), "mixedcase", "MixedCase");

        let frame = TestFrame::chain(&[Some(dir.join("main.py").as_path())]);
        assert_eq!(current_plugin(&frame, &store).unwrap(), "MixedCase");
    }

    #[test]
    fn dot_segments_normalize_before_matching() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        let dir = install_plugin(tmp.path(), "dotty", "dotty");
        let crooked = dir.join("lib").join("..").join(".").join("main.py");

        let frame = TestFrame::chain(&[Some(crooked.as_path())]);
        assert_eq!(current_plugin(&frame, &store).unwrap(), "dotty");
    }

    #[test]
    fn no_plugin_frame_means_not_in_plugin_context() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        install_plugin(tmp.path(), "present", "present");

        let frame = TestFrame::chain(&[Some(Path::new("/some/random/path.py")), None]);
        assert!(matches!(
            current_plugin(&frame, &store),
            Err(Error::NotInPluginContext)
        ));
    }
}
