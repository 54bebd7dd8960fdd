//! Upgrade run record and its phase state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::plan::{BackendKind, UpgradePlan};
use crate::cluster::{ClusterHealthSnapshot, ClusterTarget};
use crate::error::{AkupError, FailureCategory};
use crate::lease::Lease;
use crate::report::ValidationReport;

/// Phase of an upgrade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Pending,
    Preflight,
    Aborted,
    Executing,
    Monitoring,
    Validating,
    Succeeded,
    Failed,
    FailedPostValidation,
}

impl RunPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Succeeded | Self::Failed | Self::FailedPostValidation
        )
    }

    /// Legal forward transitions.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Pending, Preflight)
                | (Preflight, Aborted)
                | (Preflight, Executing)
                // Dry-run ends after preflight with the diff only.
                | (Preflight, Succeeded)
                | (Executing, Monitoring)
                | (Executing, Failed)
                | (Monitoring, Validating)
                | (Monitoring, Succeeded)
                | (Monitoring, Failed)
                | (Validating, Succeeded)
                | (Validating, FailedPostValidation)
        )
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Preflight => write!(f, "Preflight"),
            Self::Aborted => write!(f, "Aborted"),
            Self::Executing => write!(f, "Executing"),
            Self::Monitoring => write!(f, "Monitoring"),
            Self::Validating => write!(f, "Validating"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::FailedPostValidation => write!(f, "Failed-PostValidation"),
        }
    }
}

/// Reference to the accepted mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHandle {
    pub backend: BackendKind,
    /// Human-readable description of what was issued.
    pub operation: String,
    pub issued_at: DateTime<Utc>,
}

/// Failure details kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub category: FailureCategory,
    pub message: String,
    pub remediation: String,
}

impl RunFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            remediation: category.remediation().to_string(),
        }
    }
}

/// Terminal provisioning state seen by a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalState {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalObservation {
    pub state: TerminalState,
    pub observed_at: DateTime<Utc>,
    /// Consecutive stable samples that confirmed it.
    pub samples: u32,
}

/// Options chosen when the run was started, needed by later invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub skip_preflight: bool,
    pub force: bool,
    pub skip_validation: bool,
    pub extended_validation: bool,
    pub no_snapshot_backup: bool,
}

/// One upgrade attempt against one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRun {
    id: String,
    plan: UpgradePlan,
    phase: RunPhase,
    pub options: RunOptions,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<BackendHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_snapshot: Option<ClusterHealthSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_snapshot: Option<ClusterHealthSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_report: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_report: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_observation: Option<TerminalObservation>,
    /// Preflight failed but the operator overrode the gate.
    #[serde(default)]
    pub preflight_overridden: bool,
}

impl UpgradeRun {
    pub fn new(plan: UpgradePlan, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            id: run_id(plan.cluster(), now),
            plan,
            phase: RunPhase::Pending,
            options,
            started_at: now,
            updated_at: now,
            lease: None,
            backend_handle: None,
            pre_snapshot: None,
            post_snapshot: None,
            preflight_report: None,
            post_report: None,
            failure: None,
            terminal_observation: None,
            preflight_overridden: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn plan(&self) -> &UpgradePlan {
        &self.plan
    }

    pub const fn phase(&self) -> RunPhase {
        self.phase
    }

    pub const fn is_dry_run(&self) -> bool {
        self.plan.is_dry_run()
    }

    /// Move to `next`, rejecting transitions outside the state machine.
    pub fn transition(&mut self, next: RunPhase) -> Result<(), AkupError> {
        if !self.phase.can_transition_to(next) {
            return Err(AkupError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        info!("Run {}: {} -> {}", self.id, self.phase, next);
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the run failed with a categorized failure.
    pub fn fail(&mut self, failure: RunFailure) -> Result<(), AkupError> {
        self.transition(RunPhase::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Copy suitable for persistence: snapshots omitted when backups are disabled.
    pub fn record(&self) -> Self {
        let mut record = self.clone();
        if self.options.no_snapshot_backup {
            record.pre_snapshot = None;
            record.post_snapshot = None;
        }
        record
    }
}

/// `<cluster-key>-<yyyymmddThhmmssZ>`
pub fn run_id(cluster: &ClusterTarget, at: DateTime<Utc>) -> String {
    format!("{}-{}", cluster.key(), at.format("%Y%m%dT%H%M%SZ"))
}
