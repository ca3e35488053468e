//! Resolves the host tool's user directory and rem's cache root.
//!
//! The host user directory is where the host tool itself looks for plugins
//! and configuration, so its location is fixed by the host, not by rem.
//! Every path here can be overridden through the environment, which is also
//! how the test suites point rem at throwaway directories.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// Overrides the host tool's per-user directory.
pub const ENV_HOST_USER_DIR: &str = "HOST_USER_DIR";
/// Overrides the cache root used for downloaded archives and catalogs.
pub const ENV_CACHE_DIR: &str = "CACHE_DIR";

/// Directory name of the host tool's per-user state on Windows (under
/// `%APPDATA%`) and, dotted, on Unix (under `$HOME`).
const HOST_DIR_NAME: &str = "revhost";

/// Return the host tool's per-user directory.
///
/// `$HOST_USER_DIR` wins; otherwise the host's conventional location:
/// `%APPDATA%\revhost` on Windows, `~/.revhost` elsewhere.
pub fn host_user_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_HOST_USER_DIR) {
        return Ok(PathBuf::from(dir));
    }

    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .ok_or_else(|| anyhow!("unable to determine %APPDATA% location"))?;
        Ok(PathBuf::from(appdata).join(HOST_DIR_NAME))
    } else {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        Ok(home.join(format!(".{HOST_DIR_NAME}")))
    }
}

/// Return the root of rem's cache, creating nothing.
///
/// `$CACHE_DIR` wins; otherwise the OS cache directory (or `~/.cache` as a
/// last resort), suffixed with `rem`.
pub fn cache_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
        return Ok(PathBuf::from(dir));
    }

    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
        .ok_or_else(|| anyhow!("unable to determine cache directory or home directory"))?;
    Ok(base.join("rem"))
}

/// Renders a path with double quotes for user-facing messages. Preferred to
/// the `Debug` format, which doubles backslashes on Windows.
pub fn quoted_path(path: impl AsRef<Path>) -> impl std::fmt::Display {
    format!("\"{}\"", path.as_ref().display())
}
