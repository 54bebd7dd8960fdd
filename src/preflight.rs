//! Preflight gate.
//!
//! Captures a read-only snapshot and runs every check against it:
//! - Version skew: always runs, never overridable.
//! - Node readiness, workload health, PDB feasibility, quota headroom and
//!   critical platform services: fatal on failure.
//! - Deprecated API usage: warning only.

pub mod checks;

use anyhow::Result;
use tracing::{info, warn};

use crate::cluster::{ClusterHealthSnapshot, ClusterQuery};
use crate::report::{CheckResult, CheckStatus, Decision, ValidationReport};
use crate::upgrade::UpgradePlan;

#[derive(Debug, Clone, Copy)]
pub struct PreflightOptions {
    /// Failing pods tolerated before workload health fails.
    pub max_failing_pods: usize,
    /// Run only the version skew check.
    pub skip_health_checks: bool,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self {
            max_failing_pods: 5,
            skip_health_checks: false,
        }
    }
}

/// Result of one preflight pass.
#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    pub decision: Decision,
    pub report: ValidationReport,
    pub snapshot: ClusterHealthSnapshot,
    /// NO-GO was overridden with `--force`.
    pub overridden: bool,
}

impl PreflightOutcome {
    /// Whether execution may proceed.
    pub const fn may_proceed(&self) -> bool {
        matches!(self.decision, Decision::Go) || self.overridden
    }
}

pub struct PreflightValidator<'a> {
    cluster: &'a dyn ClusterQuery,
    options: PreflightOptions,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(cluster: &'a dyn ClusterQuery, options: PreflightOptions) -> Self {
        Self { cluster, options }
    }

    /// Run every check against an already captured snapshot. Pure.
    pub fn evaluate(
        &self,
        snapshot: &ClusterHealthSnapshot,
        plan: &UpgradePlan,
    ) -> (Decision, ValidationReport) {
        let mut results = vec![checks::version_skew(snapshot, plan)];

        if !self.options.skip_health_checks {
            let pools = plan.scope().pools_in_scope(snapshot);
            results.extend([
                checks::node_readiness(snapshot, &pools),
                checks::workload_health(snapshot, self.options.max_failing_pods),
                checks::pdb_feasibility(snapshot, plan),
                checks::deprecated_api_usage(snapshot),
                checks::quota_headroom(snapshot, plan),
                checks::critical_services(snapshot),
            ]);
        }

        let report = ValidationReport::new(results);
        let decision = if report.has_failures() {
            Decision::NoGo
        } else {
            Decision::Go
        };
        (decision, report)
    }

    /// Capture a fresh snapshot and evaluate it.
    ///
    /// With `allow_override`, a NO-GO caused only by health checks is recorded
    /// as overridden. A failed version skew check can never be overridden.
    pub async fn assess(&self, plan: &UpgradePlan, allow_override: bool) -> Result<PreflightOutcome> {
        info!("Running preflight checks for {}", plan.cluster());
        let snapshot = self.cluster.capture().await?;
        let (decision, report) = self.evaluate(&snapshot, plan);

        for check in &report.checks {
            match check.status {
                CheckStatus::Fail => warn!("[fail] {}: {}", check.name, check.detail),
                CheckStatus::Warn => warn!("[warn] {}: {}", check.name, check.detail),
                CheckStatus::Pass => info!("[pass] {}: {}", check.name, check.detail),
            }
        }

        let skew_failed = report
            .check(checks::VERSION_SKEW)
            .is_some_and(CheckResult::is_fail);
        let overridden = decision == Decision::NoGo && allow_override && !skew_failed;

        if overridden {
            warn!(
                "Preflight NO-GO overridden with --force (failed: {})",
                report.failed_names()
            );
        } else if decision == Decision::NoGo && allow_override {
            warn!("--force cannot override a version skew failure");
        }
        info!("Preflight decision: {}", decision);

        Ok(PreflightOutcome {
            decision,
            report,
            snapshot,
            overridden,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterTarget, PdbHeadroom};
    use crate::testing::{FakeCluster, snapshot};
    use crate::upgrade::{BackendKind, UpgradePlanBuilder};

    fn plan(target: &str) -> UpgradePlan {
        UpgradePlanBuilder::new(ClusterTarget::resolve("p", "dev", None, None), target)
            .backend(BackendKind::Imperative)
            .build()
            .unwrap()
    }

    fn deadlocked(cp: &str) -> ClusterHealthSnapshot {
        let mut snap = snapshot(cp, cp);
        snap.pdbs.push(PdbHeadroom {
            namespace: "apps".into(),
            name: "web".into(),
            min_available: Some("100%".into()),
            max_unavailable: None,
            current_healthy: 2,
            expected_pods: 2,
            disruptions_allowed: 0,
            pods_per_node: [("aks-user-0".to_string(), 2)].into_iter().collect(),
        });
        snap
    }

    #[test]
    fn test_healthy_cluster_is_go() {
        let cluster = FakeCluster::new([]);
        let validator = PreflightValidator::new(&cluster, PreflightOptions::default());
        let (decision, report) = validator.evaluate(&snapshot("1.28.5", "1.28.5"), &plan("1.29.0"));
        assert_eq!(decision, Decision::Go);
        assert_eq!(report.checks.len(), 7);
        assert_eq!(report.overall, CheckStatus::Pass);
    }

    #[test]
    fn test_skew_is_no_go_with_reason() {
        let cluster = FakeCluster::new([]);
        let validator = PreflightValidator::new(&cluster, PreflightOptions::default());
        let (decision, report) = validator.evaluate(&snapshot("1.29.2", "1.29.2"), &plan("1.31.0"));
        assert_eq!(decision, Decision::NoGo);
        let failed: Vec<_> = report.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason.as_deref(), Some("version-skew-exceeded"));
    }

    #[test]
    fn test_deprecated_apis_do_not_block() {
        let cluster = FakeCluster::new([]);
        let validator = PreflightValidator::new(&cluster, PreflightOptions::default());
        let mut snap = snapshot("1.28.5", "1.28.5");
        snap.deprecated_apis.push(crate::cluster::DeprecatedApiUsage {
            group: "policy".into(),
            version: "v1beta1".into(),
            resource: "podsecuritypolicies".into(),
            removed_release: None,
        });
        let (decision, report) = validator.evaluate(&snap, &plan("1.29.0"));
        assert_eq!(decision, Decision::Go);
        assert_eq!(report.overall, CheckStatus::Warn);
    }

    #[test]
    fn test_skip_health_checks_keeps_skew() {
        let cluster = FakeCluster::new([]);
        let options = PreflightOptions {
            skip_health_checks: true,
            ..Default::default()
        };
        let validator = PreflightValidator::new(&cluster, options);
        let (decision, report) = validator.evaluate(&deadlocked("1.29.2"), &plan("1.31.0"));
        assert_eq!(decision, Decision::NoGo);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, checks::VERSION_SKEW);
    }

    #[tokio::test]
    async fn test_force_overrides_health_but_not_skew() {
        let cluster = FakeCluster::new([deadlocked("1.28.5")]);
        let validator = PreflightValidator::new(&cluster, PreflightOptions::default());

        let outcome = validator.assess(&plan("1.29.0"), true).await.unwrap();
        assert_eq!(outcome.decision, Decision::NoGo);
        assert!(outcome.overridden);
        assert!(outcome.may_proceed());

        let outcome = validator.assess(&plan("1.29.0"), false).await.unwrap();
        assert!(!outcome.may_proceed());

        let cluster = FakeCluster::new([deadlocked("1.29.2")]);
        let validator = PreflightValidator::new(&cluster, PreflightOptions::default());
        let outcome = validator.assess(&plan("1.31.0"), true).await.unwrap();
        assert!(!outcome.overridden);
        assert!(!outcome.may_proceed());
    }
}
