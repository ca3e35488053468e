//! The version algebra: plugin versions, host-tool versions with
//! service-pack semantics, and the specifier grammar both share.
//!
//! This module is the single authority on version strings. Nothing else in
//! the workspace parses or compares them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A normalized plugin version: up to three dot-separated decimal
/// components, optionally prefixed `v`. Missing components are zero and
/// leading zeros are stripped, so `"1.0"`, `"v1"`, and `"01.00.00"` all
/// denote `1.0.0`. Pre-release and build metadata are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginVersion {
    parts: [u64; 3],
}

impl PluginVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            parts: [major, minor, patch],
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(Error::Validation(format!("empty plugin version: '{text}'")));
        }

        let mut parts = [0u64; 3];
        let components: Vec<&str> = digits.split('.').collect();
        if components.len() > 3 {
            return Err(Error::Validation(format!(
                "plugin version has too many components: '{text}'"
            )));
        }
        for (i, component) in components.iter().enumerate() {
            if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::Validation(format!(
                    "plugin version must be dotted decimal, like '1.2.3': '{text}'"
                )));
            }
            parts[i] = component.parse().map_err(|_| {
                Error::Validation(format!("plugin version component out of range: '{text}'"))
            })?;
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.parts[0], self.parts[1], self.parts[2])
    }
}

impl FromStr for PluginVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for PluginVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PluginVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// A host-tool version: one or two numeric components with an optional
/// service-pack suffix, e.g. `9`, `9.1`, `9.1sp2`. Internally the service
/// pack occupies the patch slot so that `9.1 < 9.1sp1 < 9.2` is a plain
/// numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostVersion {
    major: u64,
    minor: u64,
    sp: u64,
}

impl HostVersion {
    pub fn new(major: u64, minor: u64, sp: u64) -> Self {
        Self { major, minor, sp }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (version, precision) = parse_host_literal(text)?;
        if precision == Precision::DottedPatch {
            return Err(Error::Validation(format!(
                "host version must be 'X', 'X.Y', or 'X.YspN': '{text}'"
            )));
        }
        Ok(version)
    }

    pub fn service_pack(&self) -> u64 {
        self.sp
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sp > 0 {
            write!(f, "{}.{}sp{}", self.major, self.minor, self.sp)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

impl FromStr for HostVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// How much of a host version a comparator literal pins down. A bare major
/// (`==9`) matches every `9.*`; a two-component literal (`==9.1`) matches
/// the base release and its service packs; an `sp` or dotted-patch literal
/// matches exactly one release. Dotted-patch literals (`9.1.0`) are legal in
/// user-supplied specifiers but never in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    MajorOnly,
    MinorOnly,
    ServicePack,
    DottedPatch,
}

fn parse_host_literal(text: &str) -> Result<(HostVersion, Precision)> {
    let trimmed = text.trim();
    let invalid =
        || Error::Validation(format!("invalid host version: '{text}'"));

    let (numeric, sp) = match trimmed.split_once("sp") {
        Some((base, sp_digits)) => {
            if sp_digits.is_empty() || !sp_digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            (base, Some(sp_digits.parse::<u64>().map_err(|_| invalid())?))
        }
        None => (trimmed, None),
    };

    let components: Vec<&str> = numeric.split('.').collect();
    if components.is_empty()
        || components.len() > 3
        || components
            .iter()
            .any(|c| c.is_empty() || !c.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(invalid());
    }
    let parse = |c: &str| c.parse::<u64>().map_err(|_| invalid());

    let major = parse(components[0])?;
    let minor = components.get(1).map(|c| parse(c)).transpose()?;
    let patch = components.get(2).map(|c| parse(c)).transpose()?;

    let (version, precision) = match (minor, patch, sp) {
        (None, None, None) => (HostVersion::new(major, 0, 0), Precision::MajorOnly),
        (Some(minor), None, None) => (HostVersion::new(major, minor, 0), Precision::MinorOnly),
        (None, None, Some(sp)) => (HostVersion::new(major, 0, sp), Precision::ServicePack),
        (Some(minor), None, Some(sp)) => {
            (HostVersion::new(major, minor, sp), Precision::ServicePack)
        }
        (Some(minor), Some(patch), None) => {
            (HostVersion::new(major, minor, patch), Precision::DottedPatch)
        }
        // both a dotted patch and an sp suffix, e.g. "9.1.2sp1"
        _ => return Err(invalid()),
    };
    Ok((version, precision))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

fn split_op(text: &str) -> Result<(Op, &str)> {
    let ops = [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
    ];
    for (token, op) in ops {
        if let Some(rest) = text.strip_prefix(token) {
            return Ok((op, rest));
        }
    }
    Err(Error::Validation(format!(
        "version comparator must start with one of ==, !=, >=, <=, >, <: '{text}'"
    )))
}

#[derive(Debug, Clone, PartialEq)]
struct HostComparator {
    op: Op,
    version: HostVersion,
    precision: Precision,
}

impl HostComparator {
    fn matches(&self, candidate: &HostVersion) -> bool {
        match self.op {
            Op::Eq => self.eq_at_precision(candidate),
            Op::Ne => !self.eq_at_precision(candidate),
            Op::Ge => candidate >= &self.version,
            Op::Le => candidate <= &self.version,
            Op::Gt => candidate > &self.version,
            Op::Lt => candidate < &self.version,
        }
    }

    fn eq_at_precision(&self, candidate: &HostVersion) -> bool {
        match self.precision {
            Precision::MajorOnly => candidate.major == self.version.major,
            Precision::MinorOnly => {
                (candidate.major, candidate.minor) == (self.version.major, self.version.minor)
            }
            Precision::ServicePack | Precision::DottedPatch => candidate == &self.version,
        }
    }
}

/// A comma-joined conjunction of host-version comparators, e.g.
/// `">=9.0,<9.2"`. The empty specifier matches every version.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostVersionSpec {
    comparators: Vec<HostComparator>,
}

impl HostVersionSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let comparators = trimmed
            .split(',')
            .map(|clause| {
                let (op, literal) = split_op(clause.trim())?;
                let (version, precision) = parse_host_literal(literal)?;
                Ok(HostComparator {
                    op,
                    version,
                    precision,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { comparators })
    }

    /// Parse a specifier as it appears in a plugin manifest, where
    /// three-component literals like `9.1.0` are reserved for internal use
    /// and rejected.
    pub fn parse_manifest(text: &str) -> Result<Self> {
        let spec = Self::parse(text)?;
        if spec
            .comparators
            .iter()
            .any(|c| c.precision == Precision::DottedPatch)
        {
            return Err(Error::Validation(format!(
                "host version specifiers in manifests must not use three-component literals: '{text}'"
            )));
        }
        Ok(spec)
    }

    pub fn matches(&self, candidate: &HostVersion) -> bool {
        self.comparators.iter().all(|c| c.matches(candidate))
    }

    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PluginComparator {
    op: Op,
    version: PluginVersion,
}

impl PluginComparator {
    fn matches(&self, candidate: &PluginVersion) -> bool {
        match self.op {
            Op::Eq => candidate == &self.version,
            Op::Ne => candidate != &self.version,
            Op::Ge => candidate >= &self.version,
            Op::Le => candidate <= &self.version,
            Op::Gt => candidate > &self.version,
            Op::Lt => candidate < &self.version,
        }
    }
}

/// A comma-joined conjunction of plugin-version comparators. Comparator
/// literals normalize like plugin versions, so `==1.0` is `==1.0.0`. The
/// empty specifier matches every version.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PluginVersionSpec {
    comparators: Vec<PluginComparator>,
}

impl PluginVersionSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let comparators = trimmed
            .split(',')
            .map(|clause| {
                let (op, literal) = split_op(clause.trim())?;
                Ok(PluginComparator {
                    op,
                    version: PluginVersion::parse(literal)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { comparators })
    }

    pub fn matches(&self, candidate: &PluginVersion) -> bool {
        self.comparators.iter().all(|c| c.matches(candidate))
    }

    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }
}

/// Split a plugin spec like `"my-plugin>=1.2"` into the name and its
/// version specifier. A bare name yields the match-all specifier.
pub fn split_plugin_spec(spec: &str) -> Result<(&str, PluginVersionSpec)> {
    let split_at = spec
        .find(|c| matches!(c, '=' | '<' | '>' | '!'))
        .unwrap_or(spec.len());
    let name = spec[..split_at].trim();
    if name.is_empty() {
        return Err(Error::Validation(format!("missing plugin name: '{spec}'")));
    }
    Ok((name, PluginVersionSpec::parse(&spec[split_at..])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_versions_normalize() {
        for (text, expected) in [
            ("1.0", "1.0.0"),
            ("v2", "2.0.0"),
            ("2025.09.24", "2025.9.24"),
            ("0.1", "0.1.0"),
            ("  3.2.1 ", "3.2.1"),
        ] {
            assert_eq!(PluginVersion::parse(text).unwrap().to_string(), expected);
        }
    }

    #[test]
    fn plugin_version_parse_is_idempotent_over_normalization() {
        for text in ["1.0", "v2", "2025.09.24", "1.2.3"] {
            let parsed = PluginVersion::parse(text).unwrap();
            let reparsed = PluginVersion::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn plugin_versions_reject_prerelease_markers() {
        for text in ["1.0.0-rc1", "1.0.0+build5", "1.0.0.0", "abc", "", "1..2"] {
            assert!(PluginVersion::parse(text).is_err(), "accepted '{text}'");
        }
    }

    #[test]
    fn plugin_versions_order_numerically() {
        let parse = |s| PluginVersion::parse(s).unwrap();
        assert!(parse("0.9.0") < parse("1.0"));
        assert!(parse("1.2") < parse("1.10"));
        assert!(parse("2") > parse("1.99.99"));
    }

    #[test]
    fn host_versions_normalize_service_packs_into_patch() {
        let parse = |s| HostVersion::parse(s).unwrap();
        assert_eq!(parse("9.1sp2"), HostVersion::new(9, 1, 2));
        assert_eq!(parse("9.1"), HostVersion::new(9, 1, 0));
        assert_eq!(parse("9"), HostVersion::new(9, 0, 0));
        assert_eq!(parse("9.1sp0"), parse("9.1"));
    }

    #[test]
    fn host_versions_order_with_service_packs_between_minors() {
        let parse = |s| HostVersion::parse(s).unwrap();
        assert!(parse("9.1") < parse("9.1sp1"));
        assert!(parse("9.1sp1") < parse("9.1sp2"));
        assert!(parse("9.1sp2") < parse("9.2"));
        assert!(parse("8.4") < parse("9.0"));
    }

    #[test]
    fn host_version_display_round_trips() {
        for text in ["9.1", "9.1sp2", "10.0"] {
            let parsed = HostVersion::parse(text).unwrap();
            assert_eq!(HostVersion::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn host_version_rejects_dotted_patch_and_garbage() {
        for text in ["9.1.2", "9.1sp", "sp1", "9.1.2sp1", "9.x", ""] {
            assert!(HostVersion::parse(text).is_err(), "accepted '{text}'");
        }
    }

    #[test]
    fn two_component_eq_matches_service_packs() {
        let spec = HostVersionSpec::parse("==9.1").unwrap();
        assert!(spec.matches(&HostVersion::parse("9.1").unwrap()));
        assert!(spec.matches(&HostVersion::parse("9.1sp2").unwrap()));
        assert!(!spec.matches(&HostVersion::parse("9.2").unwrap()));
        assert!(!spec.matches(&HostVersion::parse("9.0").unwrap()));
    }

    #[test]
    fn three_component_eq_matches_only_the_base() {
        let spec = HostVersionSpec::parse("==9.1.0").unwrap();
        assert!(spec.matches(&HostVersion::parse("9.1").unwrap()));
        assert!(!spec.matches(&HostVersion::parse("9.1sp1").unwrap()));
    }

    #[test]
    fn manifest_specs_reject_three_component_literals() {
        assert!(HostVersionSpec::parse_manifest("==9.1.0").is_err());
        assert!(HostVersionSpec::parse_manifest("==9.1sp1").is_ok());
        assert!(HostVersionSpec::parse_manifest(">=9.0,<9.2").is_ok());
    }

    #[test]
    fn empty_spec_matches_everything() {
        let spec = HostVersionSpec::parse("").unwrap();
        assert!(spec.is_any());
        assert!(spec.matches(&HostVersion::parse("1.0").unwrap()));
        assert!(spec.matches(&HostVersion::parse("99.9sp9").unwrap()));
    }

    #[test]
    fn host_range_specs_combine_with_commas() {
        let spec = HostVersionSpec::parse(">=9.0,<9.2").unwrap();
        assert!(spec.matches(&HostVersion::parse("9.0").unwrap()));
        assert!(spec.matches(&HostVersion::parse("9.1sp3").unwrap()));
        assert!(!spec.matches(&HostVersion::parse("9.2").unwrap()));
        assert!(!spec.matches(&HostVersion::parse("8.5").unwrap()));
    }

    #[test]
    fn plugin_specs_match_normalized_literals() {
        let spec = PluginVersionSpec::parse("==1.0").unwrap();
        assert!(spec.matches(&PluginVersion::parse("1.0.0").unwrap()));
        assert!(!spec.matches(&PluginVersion::parse("1.0.1").unwrap()));

        let range = PluginVersionSpec::parse(">=1.0,<2").unwrap();
        assert!(range.matches(&PluginVersion::parse("1.5").unwrap()));
        assert!(!range.matches(&PluginVersion::parse("2.0").unwrap()));
    }

    #[test]
    fn split_plugin_spec_separates_name_and_specifier() {
        let (name, spec) = split_plugin_spec("plugin1==1.0.0").unwrap();
        assert_eq!(name, "plugin1");
        assert!(spec.matches(&PluginVersion::parse("1.0.0").unwrap()));

        let (name, spec) = split_plugin_spec("plugin1").unwrap();
        assert_eq!(name, "plugin1");
        assert!(spec.is_any());

        assert!(split_plugin_spec(">=1.0").is_err());
    }
}
