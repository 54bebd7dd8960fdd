//! Custom error types for akup.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process exit status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    PreflightNoGo,
    LeaseConflict,
    ExecutionFailure,
    PostValidationFailure,
    AmbiguousTimeout,
}

impl ExitStatus {
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::PreflightNoGo => 1,
            Self::LeaseConflict => 2,
            Self::ExecutionFailure => 3,
            Self::PostValidationFailure => 4,
            Self::AmbiguousTimeout => 5,
        }
    }
}

/// Category of a failed mutating call, used to pick remediation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    QuotaExceeded,
    StuckProvisioning,
    AuthFailure,
    Other,
}

impl FailureCategory {
    /// Classify backend output into a failure category.
    pub fn classify(output: &str) -> Self {
        let lower = output.to_lowercase();

        if lower.contains("authorizationfailed")
            || lower.contains("az login")
            || lower.contains("invalidauthenticationtoken")
            || lower.contains("expiredauthenticationtoken")
            || lower.contains("aadsts")
            || lower.contains("does not have authorization")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
        {
            return Self::AuthFailure;
        }

        if lower.contains("quotaexceeded")
            || lower.contains("exceeding approved")
            || lower.contains("quota")
        {
            return Self::QuotaExceeded;
        }

        if lower.contains("operationnotallowed")
            || lower.contains("another operation")
            || lower.contains("is in progress")
            || lower.contains("etagmismatch")
            || lower.contains("failed provisioning state")
            || lower.contains("provisioningstate")
        {
            return Self::StuckProvisioning;
        }

        Self::Other
    }

    /// Operator-facing remediation for this category.
    pub const fn remediation(self) -> &'static str {
        match self {
            Self::QuotaExceeded => {
                "Regional vCPU quota cannot absorb the surge nodes. Request a quota increase \
                 or lower --surge for the affected pools, then re-run preflight."
            }
            Self::StuckProvisioning => {
                "The cluster has another operation in flight or a failed provisioning state. \
                 Check `az aks show --query provisioningState`, wait for it to settle \
                 (or reconcile with `az aks update`), then re-check with `akup status`."
            }
            Self::AuthFailure => {
                "Credentials were rejected. Re-authenticate with `az login` and make sure the \
                 identity holds Azure Kubernetes Service Contributor on the cluster."
            }
            Self::Other => {
                "The mutating call failed and may have partially applied. Inspect the output \
                 above and the cluster activity log before any retry; akup does not retry \
                 mutating calls."
            }
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuotaExceeded => write!(f, "quota exceeded"),
            Self::StuckProvisioning => write!(f, "stuck provisioning"),
            Self::AuthFailure => write!(f, "auth failure"),
            Self::Other => write!(f, "backend failure"),
        }
    }
}

/// Errors that can occur during upgrade orchestration.
#[derive(Error, Debug)]
pub enum AkupError {
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Lease for {cluster} is held by run {holder} (acquired {acquired_at})")]
    LeaseConflict {
        cluster: String,
        holder: String,
        acquired_at: String,
    },

    #[error("[{backend}] {category}: {message}")]
    BackendInvocation {
        backend: String,
        category: FailureCategory,
        message: String,
    },

    #[error("Transient poll error (attempt {attempt}/{max_attempts}): {message}")]
    TransientPoll {
        attempt: u32,
        max_attempts: u32,
        message: String,
    },

    #[error(
        "Monitoring of run {run_id} ended after {elapsed_secs}s without a terminal signal; \
         re-check the real cluster state"
    )]
    TimeoutAmbiguous { run_id: String, elapsed_secs: u64 },

    #[error(
        "Run {0} has no observed terminal provisioning state; run `akup monitor --run-id {0}` first"
    )]
    NoTerminalObservation(String),

    #[error("Post-upgrade validation failed: {0}")]
    PostValidationFailure(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Invalid scope '{0}' (expected control-plane, node-pool:<name>, node-image or full)")]
    InvalidScope(String),

    #[error("Invalid surge value: {0}")]
    InvalidSurge(String),

    #[error("Invalid upgrade plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Upgrade not possible: {0}")]
    UpgradeNotPossible(String),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("[{0}] Azure CLI error: {1}")]
    AzureCli(String, String),

    #[error("Terraform error: {0}")]
    Terraform(String),

    #[error("Artifact store error: {0}")]
    ArtifactStore(String),

    #[error("Operation cancelled by user")]
    UserCancelled,
}

impl AkupError {
    /// Build a backend invocation error, classifying the raw output.
    pub fn backend(backend: &str, output: &str) -> Self {
        Self::BackendInvocation {
            backend: backend.to_string(),
            category: FailureCategory::classify(output),
            message: Self::first_error_line(output),
        }
    }

    /// Extract the most meaningful single line from CLI stderr.
    ///
    /// Azure CLI prints `ERROR: (Code) message` lines; Terraform prints `Error: message`.
    fn first_error_line(output: &str) -> String {
        output
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("ERROR:") || l.starts_with("Error:") || l.starts_with("│ Error:"))
            .or_else(|| output.lines().map(str::trim).find(|l| !l.is_empty()))
            .map(|l| l.trim_start_matches("│ ").to_string())
            .unwrap_or_else(|| "no output from backend".to_string())
    }

    /// Returns true if this error is transient and a read-only query may be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KubernetesApi(_) | Self::AzureCli(_, _) | Self::TransientPoll { .. }
        )
    }

    /// Exit status this error maps to.
    pub const fn exit_status(&self) -> ExitStatus {
        match self {
            Self::ValidationFailure(_)
            | Self::InvalidVersion(_)
            | Self::InvalidScope(_)
            | Self::InvalidSurge(_)
            | Self::InvalidPlan(_)
            | Self::InvalidArgument(_)
            | Self::UpgradeNotPossible(_)
            | Self::UserCancelled => ExitStatus::PreflightNoGo,
            Self::LeaseConflict { .. } => ExitStatus::LeaseConflict,
            Self::PostValidationFailure(_) => ExitStatus::PostValidationFailure,
            Self::TimeoutAmbiguous { .. } | Self::NoTerminalObservation(_) => {
                ExitStatus::AmbiguousTimeout
            }
            _ => ExitStatus::ExecutionFailure,
        }
    }
}

/// Map any error chain to the exit status of the first `AkupError` in it.
pub fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    err.chain()
        .find_map(|e| e.downcast_ref::<AkupError>())
        .map_or(ExitStatus::ExecutionFailure, AkupError::exit_status)
}
