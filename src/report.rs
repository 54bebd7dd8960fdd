//! Check results and validation reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Warn => write!(f, "warn"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Outcome of a single named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
    /// Stable machine-readable code for failures, e.g. `version-skew-exceeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
            reason: None,
        }
    }

    pub fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, detail)
    }

    pub fn warn(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, detail)
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, detail)
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Check name followed by its reason code, e.g. `version-skew-compatibility (version-skew-exceeded)`.
    pub fn label(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{} ({reason})", self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_fail(&self) -> bool {
        self.status == CheckStatus::Fail
    }
}

/// Ordered check results plus the overall status (the worst individual status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
    pub overall: CheckStatus,
}

impl ValidationReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let overall = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Pass);
        Self {
            generated_at: Utc::now(),
            checks,
            overall,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.overall == CheckStatus::Fail
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.is_fail())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Warn)
    }

    /// `[label] detail` lines for every failed check.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.failures()
            .map(|c| format!("[{}] {}", c.label(), c.detail))
            .collect()
    }

    pub fn failed_labels(&self) -> Vec<String> {
        self.failures().map(CheckResult::label).collect()
    }

    /// Comma separated failed check names, with reason codes where present.
    pub fn failed_names(&self) -> String {
        self.failed_labels().join(", ")
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Preflight gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Go,
    NoGo,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Go => write!(f, "GO"),
            Self::NoGo => write!(f, "NO-GO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_is_worst_status() {
        let report = ValidationReport::new(vec![
            CheckResult::pass("a", "ok"),
            CheckResult::warn("b", "hmm"),
        ]);
        assert_eq!(report.overall, CheckStatus::Warn);
        assert!(!report.has_failures());

        let report = ValidationReport::new(vec![
            CheckResult::warn("b", "hmm"),
            CheckResult::fail("c", "bad").with_reason("version-skew-exceeded"),
        ]);
        assert_eq!(report.overall, CheckStatus::Fail);
        assert_eq!(report.failed_names(), "c (version-skew-exceeded)");
    }

    #[test]
    fn test_failure_lines_carry_reason_code() {
        let report = ValidationReport::new(vec![
            CheckResult::fail("version-skew-compatibility", "1.29 -> 1.31 skips a minor")
                .with_reason("version-skew-exceeded"),
            CheckResult::fail("quota-headroom", "short by 8 vCPUs"),
            CheckResult::pass("node-readiness", "6/6 Ready"),
        ]);
        assert_eq!(
            report.failure_reasons(),
            vec![
                "[version-skew-compatibility (version-skew-exceeded)] 1.29 -> 1.31 skips a minor",
                "[quota-headroom] short by 8 vCPUs",
            ]
        );
        assert_eq!(
            report.failed_labels(),
            vec!["version-skew-compatibility (version-skew-exceeded)", "quota-headroom"]
        );
    }

    #[test]
    fn test_empty_report_passes() {
        assert_eq!(ValidationReport::new(Vec::new()).overall, CheckStatus::Pass);
    }

    #[test]
    fn test_report_json_shape() {
        let report = ValidationReport::new(vec![CheckResult::pass("node-readiness", "6/6 Ready")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overall"], "pass");
        assert_eq!(json["checks"][0]["status"], "pass");
        assert!(json["checks"][0].get("reason").is_none());
    }
}
