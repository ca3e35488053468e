//! The per-invocation context threaded through plugin commands: which
//! repository to resolve against, and the platform and host version that
//! gate compatibility. Built explicitly at command start rather than held
//! in any global state.

use anyhow::{bail, Result};
use rem_plugins::repo::PluginRepository;
use rem_plugins::settings::SettingsStore;
use rem_plugins::version::HostVersion;
use rem_plugins::Platform;

/// Overrides host-version detection, mainly for tests.
pub const ENV_HOST_VERSION: &str = "HOST_VERSION";

pub struct Session {
    pub repo: PluginRepository,
    pub platform: Platform,
    pub host_version: HostVersion,
}

impl Session {
    /// Open the selected (or default) repository and detect the current
    /// platform and host version.
    pub async fn open(repo_source: Option<&str>) -> Result<Self> {
        let repo = PluginRepository::open(repo_source.unwrap_or("default"), false).await?;
        Ok(Self {
            repo,
            platform: Platform::current()?,
            host_version: current_host_version()?,
        })
    }
}

/// The host tool's version: `$HOST_VERSION`, or the version the host last
/// recorded in its configuration file.
pub fn current_host_version() -> Result<HostVersion> {
    if let Ok(text) = std::env::var(ENV_HOST_VERSION) {
        return Ok(HostVersion::parse(&text)?);
    }
    let settings = SettingsStore::try_default()?;
    if let Some(text) = settings.recorded_host_version()? {
        return Ok(HostVersion::parse(&text)?);
    }
    bail!(
        "could not determine the host tool version; set ${ENV_HOST_VERSION} or launch the host tool once so it records its version"
    );
}
