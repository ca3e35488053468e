//! Shared leaf modules for the rem workspace.
//!
//! Everything here is a small, focused utility with no dependency on the
//! other rem crates. Domain logic belongs in `rem-plugins`, not here.

pub mod paths;
pub mod sha256;
