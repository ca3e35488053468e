//! Installs a plugin's interpreter dependencies through the host tool's
//! embedded Python, which rem only ever sees as an external `pip` process.
//!
//! Dependencies come from the manifest's list, or from an inline TOML block
//! fenced with `# ///` lines at the top of the entry-point source. Installs
//! are two-phase: a `pip install --dry-run` surfaces resolver conflicts
//! before the real install mutates the interpreter environment.

use std::path::{Path, PathBuf};
use std::process::Output;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::manifest::{DependencySource, PluginFiles, PluginManifest};
use crate::settings::SettingsStore;

/// Overrides interpreter discovery; mainly for tests and CI.
pub const ENV_HOST_PYTHON_EXE: &str = "HOST_PYTHON_EXE";

const INLINE_BLOCK_OPEN: &str = "# /// script";
const INLINE_BLOCK_CLOSE: &str = "# ///";

/// The interpreter to install packages into: `$HOST_PYTHON_EXE`, or the
/// `python.executable` configuration key. Never silently skipped — a plugin
/// that declares dependencies without a configured interpreter is an error.
pub fn find_interpreter(settings: &SettingsStore) -> Result<PathBuf> {
    if let Ok(exe) = std::env::var(ENV_HOST_PYTHON_EXE) {
        return Ok(PathBuf::from(exe));
    }
    if let Some(exe) = settings.interpreter_path()? {
        return Ok(exe);
    }
    Err(Error::NoInterpreter(
        "the host tool's Python interpreter is not configured".to_string(),
    ))
}

/// The dependency list a plugin declares, resolving `"inline"` declarations
/// by reading the fenced block from the entry-point source.
pub fn plugin_dependencies(
    files: &dyn PluginFiles,
    manifest: &PluginManifest,
) -> Result<Vec<String>> {
    match manifest.dependencies() {
        None => Ok(Vec::new()),
        Some(DependencySource::List(deps)) => Ok(deps.clone()),
        Some(DependencySource::Inline) => {
            let source = files.read(manifest.entry_point())?;
            let source = String::from_utf8(source).map_err(|_| {
                Error::Validation(format!(
                    "entry point '{}' is not UTF-8, cannot read inline dependencies",
                    manifest.entry_point()
                ))
            })?;
            parse_inline_dependencies(&source)
        }
    }
}

/// Extract the `dependencies` array from the inline metadata block: the
/// commented TOML between the first `# /// script` line and the next
/// `# ///` line, with the comment prefix stripped.
pub fn parse_inline_dependencies(source: &str) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct InlineMetadata {
        #[serde(default)]
        dependencies: Vec<String>,
    }

    let mut lines = source.lines();
    lines
        .by_ref()
        .find(|line| line.trim_end() == INLINE_BLOCK_OPEN)
        .ok_or_else(|| {
            Error::Validation(
                "entry point declares inline dependencies but has no metadata block".to_string(),
            )
        })?;

    let mut block = String::new();
    let mut closed = false;
    for line in lines {
        let line = line.trim_end();
        if line == INLINE_BLOCK_CLOSE {
            closed = true;
            break;
        }
        let content = line
            .strip_prefix("# ")
            .or_else(|| line.strip_prefix('#'))
            .ok_or_else(|| {
                Error::Validation(format!("malformed inline metadata line: '{line}'"))
            })?;
        block.push_str(content);
        block.push('\n');
    }
    if !closed {
        return Err(Error::Validation(
            "inline metadata block is not closed with '# ///'".to_string(),
        ));
    }

    let metadata: InlineMetadata = toml::from_str(&block)
        .map_err(|e| Error::Validation(format!("malformed inline metadata block: {e}")))?;
    Ok(metadata.dependencies)
}

/// Dry-run the package set to surface resolver conflicts without touching
/// the interpreter environment.
pub async fn check_installable(python: &Path, packages: &[String]) -> Result<()> {
    let output = run_pip(python, &["install", "--dry-run"], packages).await?;
    if !output.status.success() {
        return Err(Error::DependencyConflict(format_pip_output(&output)));
    }
    Ok(())
}

/// Install the package set for real. Callers dry-run first.
pub async fn install_packages(python: &Path, packages: &[String]) -> Result<()> {
    let output = run_pip(python, &["install"], packages).await?;
    if !output.status.success() {
        return Err(Error::DependencyConflict(format_pip_output(&output)));
    }
    Ok(())
}

/// The interpreter's installed package set, one `name==version` per line.
pub async fn pip_freeze(python: &Path) -> Result<String> {
    let output = run_pip(python, &["freeze"], &[]).await?;
    if !output.status.success() {
        return Err(Error::DependencyConflict(format_pip_output(&output)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_pip(python: &Path, pip_args: &[&str], packages: &[String]) -> Result<Output> {
    tracing::debug!("running {} -m pip {:?} {:?}", python.display(), pip_args, packages);
    let result = Command::new(python)
        .arg("-m")
        .arg("pip")
        .args(pip_args)
        .args(packages)
        .kill_on_drop(true)
        .output()
        .await;
    match result {
        Ok(output) => Ok(output),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NoInterpreter(format!(
            "interpreter executable not found: {}",
            python.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Pip's own words, stdout then stderr, surfaced verbatim.
fn format_pip_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    [stdout.trim(), stderr.trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}
