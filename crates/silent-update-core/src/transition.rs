use std::cmp::Ordering;
use std::fmt;

use semver::Version;

use crate::types::VersionDescriptor;

/// How a newly deployed build relates to the one currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionTransition {
    /// No version has been applied yet.
    Initial,
    Upgrade,
    /// Deployed version number is lower than the running one.
    Rollback,
    /// Same version number, different build.
    Rebuild,
    /// At least one side is not a parseable version number.
    Unordered,
}

impl fmt::Display for VersionTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initial => "initial",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
            Self::Rebuild => "rebuild",
            Self::Unordered => "unordered",
        };
        f.write_str(label)
    }
}

#[must_use]
pub fn classify(current: Option<&VersionDescriptor>, next: &VersionDescriptor) -> VersionTransition {
    let Some(current) = current else {
        return VersionTransition::Initial;
    };
    match (parse_version(&next.version), parse_version(&current.version)) {
        (Some(next), Some(current)) => match next.cmp(&current) {
            Ordering::Greater => VersionTransition::Upgrade,
            Ordering::Less => VersionTransition::Rollback,
            Ordering::Equal => VersionTransition::Rebuild,
        },
        _ if next.version == current.version => VersionTransition::Rebuild,
        _ => VersionTransition::Unordered,
    }
}

/// Lenient semver parse: accepts a leading `v` and missing minor/patch parts.
fn parse_version(version: &str) -> Option<Version> {
    let version = version.trim();
    let version = version.strip_prefix(['v', 'V']).unwrap_or(version);
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let suffix_idx = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(suffix_idx);
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = match parts.next() {
        Some(part) => part.parse::<u64>().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(part) => part.parse::<u64>().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    Version::parse(&format!("{major}.{minor}.{patch}{suffix}")).ok()
}
