use crate::version::{HostVersion, PluginVersion};
use crate::Platform;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while managing plugins, as one typed
/// taxonomy. The CLI maps each variant to an exit code via [`Error::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A manifest or archive failed schema or path-safety rules.
    #[error("invalid plugin metadata: {0}")]
    Validation(String),

    /// No plugin with the requested name exists in the repository.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The requested name matches several case-variant catalog entries.
    #[error("ambiguous plugin name '{name}': matches {candidates:?}")]
    Ambiguous { name: String, candidates: Vec<String> },

    /// The plugin exists but no location fits the platform and host version.
    #[error(
        "no compatible version of '{name}' for {platform} and host {host_version} (wanted: {wanted})"
    )]
    NoCompatible {
        name: String,
        platform: Platform,
        host_version: HostVersion,
        wanted: String,
    },

    #[error("plugin already installed: {0}; uninstall it first or use `rem plugin upgrade`")]
    AlreadyInstalled(String),

    #[error("plugin not installed: {0}")]
    NotInstalled(String),

    #[error(
        "cannot upgrade plugin {name}: new version {requested} is not greater than existing version {installed}"
    )]
    Downgrade {
        name: String,
        requested: PluginVersion,
        installed: PluginVersion,
    },

    /// A read of a required setting that has no stored value and no default.
    #[error("missing setting: {plugin}: {key}")]
    SettingMissing { plugin: String, key: String },

    /// A setting key or value failed validation against the plugin's schema.
    #[error("{0}")]
    SettingInvalid(String),

    #[error("cannot delete required setting without default: {plugin}: {key}")]
    SettingUndeletable { plugin: String, key: String },

    /// Required settings could not be collected without a terminal.
    #[error(
        "plugin requires configuration but console is not interactive; provide settings via the command line: {}",
        format_config_hint(.0)
    )]
    SettingsRequired(Vec<String>),

    /// The interpreter's resolver rejected the requested package set.
    #[error("cannot install interpreter dependencies:\n{0}")]
    DependencyConflict(String),

    /// No usable interpreter executable is configured.
    #[error("no interpreter available: {0}; set $HOST_PYTHON_EXE or the python.executable configuration key")]
    NoInterpreter(String),

    /// A downloaded archive did not match the catalog's digest.
    #[error("checksum mismatch for {url}: expected sha256 {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("failed to fetch {url}: {reason}")]
    Network { url: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,

    /// The identity detector found no frame inside an installed plugin.
    #[error("must be called from within an installed plugin")]
    NotInPluginContext,
}

fn format_config_hint(keys: &[String]) -> String {
    keys.iter()
        .map(|key| format!("--config {key}=<value>"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Error {
    /// Process exit code for this error: 1 user/validation, 2 dependency or
    /// compatibility, 3 I/O or network, 130 interrupt.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::Ambiguous { .. }
            | Error::AlreadyInstalled(_)
            | Error::NotInstalled(_)
            | Error::Downgrade { .. }
            | Error::SettingMissing { .. }
            | Error::SettingInvalid(_)
            | Error::SettingUndeletable { .. }
            | Error::SettingsRequired(_)
            | Error::NotInPluginContext => 1,
            Error::NoCompatible { .. }
            | Error::DependencyConflict(_)
            | Error::NoInterpreter(_) => 2,
            Error::HashMismatch { .. } | Error::Network { .. } | Error::Io(_) => 3,
            Error::Interrupted => 130,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_required_names_every_key() {
        let err = Error::SettingsRequired(vec!["key1".into(), "key2".into()]);
        let msg = err.to_string();
        assert!(msg.contains("--config key1=<value>"));
        assert!(msg.contains("--config key2=<value>"));
    }

    #[test]
    fn exit_codes_follow_the_documented_contract() {
        assert_eq!(Error::NotFound("x".into()).exit_code(), 1);
        assert_eq!(Error::DependencyConflict("boom".into()).exit_code(), 2);
        assert_eq!(
            Error::Network {
                url: "https://example.invalid".into(),
                reason: "refused".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::Interrupted.exit_code(), 130);
    }
}
