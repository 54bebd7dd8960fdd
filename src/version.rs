//! Kubernetes version parsing and skew rules.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::AkupError;

/// Maximum number of minor versions a single upgrade may advance.
pub const MAX_MINOR_SKEW: u64 = 1;

/// A Kubernetes version (`1.29.0`; a bare `1.29` means `1.29.0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KubeVersion(Version);

impl KubeVersion {
    pub fn parse(input: &str) -> Result<Self, AkupError> {
        let trimmed = input.trim().trim_start_matches('v');
        let normalized = match trimmed.split('.').count() {
            2 => format!("{trimmed}.0"),
            _ => trimmed.to_string(),
        };

        Version::parse(&normalized)
            .map(Self)
            .map_err(|_| AkupError::InvalidVersion(input.to_string()))
    }

    pub const fn major(&self) -> u64 {
        self.0.major
    }

    pub const fn minor(&self) -> u64 {
        self.0.minor
    }

    /// `major.minor` form used in messages and path steps.
    pub fn minor_line(&self) -> String {
        format!("{}.{}", self.0.major, self.0.minor)
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KubeVersion {
    type Err = AkupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KubeVersion {
    type Error = AkupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KubeVersion> for String {
    fn from(value: KubeVersion) -> Self {
        value.to_string()
    }
}

/// Outcome of comparing a current and a target version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkewVerdict {
    /// Target equals current: nothing to upgrade.
    Unchanged,
    /// Patch upgrade within the same minor line.
    Patch,
    /// Single supported minor step.
    MinorStep,
    /// Target is lower than current.
    Downgrade,
    /// Target is more than one minor ahead.
    SkewExceeded { minors: u64 },
    /// Major versions differ.
    CrossMajor,
}

impl SkewVerdict {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Unchanged | Self::Patch | Self::MinorStep)
    }

    /// Stable reason code reported in check results.
    pub const fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Unchanged | Self::Patch | Self::MinorStep => None,
            Self::Downgrade => Some("downgrade-not-supported"),
            Self::SkewExceeded { .. } => Some("version-skew-exceeded"),
            Self::CrossMajor => Some("cross-major-upgrade"),
        }
    }
}

/// Classify a current → target transition against the skew rules.
pub fn check_skew(current: &KubeVersion, target: &KubeVersion) -> SkewVerdict {
    if current.major() != target.major() {
        return SkewVerdict::CrossMajor;
    }
    if target < current {
        return SkewVerdict::Downgrade;
    }
    if target == current {
        return SkewVerdict::Unchanged;
    }

    match target.minor() - current.minor() {
        0 => SkewVerdict::Patch,
        m if m <= MAX_MINOR_SKEW => SkewVerdict::MinorStep,
        m => SkewVerdict::SkewExceeded { minors: m },
    }
}

/// Calculate the sequential minor-version path from current to target.
///
/// Used to tell operators how many separate runs a larger jump needs.
pub fn calculate_upgrade_path(current: &KubeVersion, target: &KubeVersion) -> Result<Vec<String>> {
    if current.major() != target.major() {
        return Err(AkupError::UpgradeNotPossible(
            "Cross-major version upgrades are not supported".to_string(),
        )
        .into());
    }

    if target < current {
        return Err(AkupError::UpgradeNotPossible(format!(
            "Target version {target} is lower than current version {current} (downgrade not supported)"
        ))
        .into());
    }

    Ok(((current.minor() + 1)..=target.minor())
        .map(|minor| format!("{}.{minor}", current.major()))
        .collect())
}
