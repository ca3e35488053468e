//! Commands for the rem CLI.

/// Commands for managing the host tool's plugins.
pub mod plugins;
