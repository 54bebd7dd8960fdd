//! Post-upgrade validation.
//!
//! Runs only after a terminal provisioning state was observed for the run.
//! Re-runs the read-only preflight health checks and asserts the upgrade
//! actually landed: every component in scope at the target, nodes Ready.

pub mod extended;

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cluster::{ClusterHealthSnapshot, ClusterQuery, ExtendedHealth};
use crate::error::AkupError;
use crate::preflight::checks;
use crate::report::{CheckResult, ValidationReport};
use crate::upgrade::{TerminalState, UpgradePlan, UpgradeRun};

pub const TARGET_REACHED: &str = "target-version-reached";
pub const PROVISIONING: &str = "provisioning-state";

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    /// How long an in-scope node may stay NotReady before it fails.
    pub node_grace: Duration,
    pub max_failing_pods: usize,
    pub extended: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            node_grace: Duration::from_secs(10 * 60),
            max_failing_pods: 5,
            extended: false,
        }
    }
}

pub fn target_reached(snapshot: &ClusterHealthSnapshot, plan: &UpgradePlan) -> CheckResult {
    let unmet = plan.unmet_targets(snapshot);
    if unmet.is_empty() {
        CheckResult::pass(
            TARGET_REACHED,
            format!("{} at {}", plan.scope(), plan.target_version()),
        )
    } else {
        CheckResult::fail(TARGET_REACHED, unmet.join("; ")).with_reason("target-version-not-reached")
    }
}

pub fn provisioning(snapshot: &ClusterHealthSnapshot) -> CheckResult {
    let unsettled: Vec<String> = snapshot
        .node_pools
        .iter()
        .filter(|p| !p.provisioning_state.is_succeeded())
        .map(|p| format!("{}={}", p.name, p.provisioning_state))
        .collect();

    if !snapshot.provisioning_state.is_succeeded() {
        CheckResult::fail(
            PROVISIONING,
            format!("cluster provisioning state is {}", snapshot.provisioning_state),
        )
    } else if !unsettled.is_empty() {
        CheckResult::fail(PROVISIONING, format!("node pools not settled: {}", unsettled.join(", ")))
    } else {
        CheckResult::pass(PROVISIONING, "cluster and node pools Succeeded")
    }
}

/// NotReady nodes in scope fail once past `grace`; younger ones and
/// out-of-scope nodes warn.
pub fn node_readiness(
    snapshot: &ClusterHealthSnapshot,
    pools: &[String],
    grace: Duration,
    now: DateTime<Utc>,
) -> CheckResult {
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    let in_scope = |pool: &Option<String>| {
        pools.is_empty() || pool.as_ref().is_some_and(|p| pools.contains(p))
    };

    let mut expired = Vec::new();
    let mut recovering = Vec::new();
    for node in snapshot.not_ready_nodes() {
        let age = node.not_ready_for(now).unwrap_or(chrono::Duration::MAX);
        let label = format!("{} (NotReady {}m)", node.name, age.num_minutes().min(9999));
        if !in_scope(&node.pool) || age <= grace {
            recovering.push(label);
        } else {
            expired.push(label);
        }
    }

    if !expired.is_empty() {
        CheckResult::fail(
            checks::NODE_READINESS,
            format!(
                "{} node(s) NotReady past the {}m grace: {}",
                expired.len(),
                grace.num_minutes(),
                expired.join(", ")
            ),
        )
        .with_reason("node-not-ready")
    } else if !recovering.is_empty() {
        CheckResult::warn(
            checks::NODE_READINESS,
            format!("NotReady within grace or out of scope: {}", recovering.join(", ")),
        )
    } else {
        CheckResult::pass(
            checks::NODE_READINESS,
            format!("all {} node(s) Ready", snapshot.nodes.len()),
        )
    }
}

pub struct PostUpgradeValidator<'a> {
    cluster: &'a dyn ClusterQuery,
    options: ValidationOptions,
}

impl<'a> PostUpgradeValidator<'a> {
    pub fn new(cluster: &'a dyn ClusterQuery, options: ValidationOptions) -> Self {
        Self { cluster, options }
    }

    /// Build the report for a post-upgrade snapshot. Pure.
    pub fn evaluate(
        &self,
        plan: &UpgradePlan,
        snapshot: &ClusterHealthSnapshot,
        extended: Option<&ExtendedHealth>,
        now: DateTime<Utc>,
    ) -> ValidationReport {
        // Control-plane scope replaces no nodes, so every node counts as in scope.
        let pools = plan.scope().pools_in_scope(snapshot);

        let mut results = vec![
            target_reached(snapshot, plan),
            provisioning(snapshot),
            node_readiness(snapshot, &pools, self.options.node_grace, now),
            checks::workload_health(snapshot, self.options.max_failing_pods),
            checks::critical_services(snapshot),
            checks::deprecated_api_usage(snapshot),
        ];
        if let Some(health) = extended {
            results.extend(extended::all(health, now));
        }
        ValidationReport::new(results)
    }

    /// Validate a run whose terminal state has been observed.
    ///
    /// Returns the report and the post-upgrade snapshot it was built from.
    pub async fn validate(
        &self,
        run: &UpgradeRun,
    ) -> Result<(ValidationReport, ClusterHealthSnapshot)> {
        let Some(observation) = &run.terminal_observation else {
            return Err(AkupError::NoTerminalObservation(run.id().to_string()).into());
        };
        if observation.state != TerminalState::Succeeded {
            warn!(
                "Run {} ended in a failed provisioning state; validating anyway",
                run.id()
            );
        }

        info!("Running post-upgrade validation for run {}", run.id());
        let snapshot = self.cluster.capture().await?;
        let extended = if self.options.extended || run.options.extended_validation {
            Some(self.cluster.extended_health().await?)
        } else {
            None
        };

        let report = self.evaluate(run.plan(), &snapshot, extended.as_ref(), Utc::now());
        for check in &report.checks {
            info!("[{}] {}: {}", check.status, check.name, check.detail);
        }
        Ok((report, snapshot))
    }
}
