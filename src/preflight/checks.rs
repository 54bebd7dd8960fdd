//! Individual read-only checks. Each takes a captured snapshot and returns one result.

use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::{ClusterHealthSnapshot, PdbHeadroom};
use crate::report::CheckResult;
use crate::upgrade::{UpgradePlan, UpgradeScope};
use crate::version::{KubeVersion, SkewVerdict, calculate_upgrade_path, check_skew};

pub const VERSION_SKEW: &str = "version-skew-compatibility";
pub const NODE_READINESS: &str = "node-readiness";
pub const WORKLOAD_HEALTH: &str = "workload-health";
pub const PDB_FEASIBILITY: &str = "pdb-feasibility";
pub const DEPRECATED_APIS: &str = "deprecated-api-usage";
pub const QUOTA_HEADROOM: &str = "quota-headroom";
pub const CRITICAL_SERVICES: &str = "critical-platform-services";

// ============================================================================
// Version skew
// ============================================================================

fn skew_failure(current: &str, verdict: &SkewVerdict, detail: String) -> CheckResult {
    let reason = verdict.reason().unwrap_or("version-skew-exceeded");
    CheckResult::fail(VERSION_SKEW, format!("{current}: {detail}")).with_reason(reason)
}

fn skew_detail(from: &KubeVersion, to: &KubeVersion, verdict: &SkewVerdict) -> String {
    match verdict {
        SkewVerdict::SkewExceeded { minors } => {
            let path = calculate_upgrade_path(from, to).unwrap_or_default();
            format!(
                "{from} -> {to} advances {minors} minor versions; upgrade one minor at a time ({})",
                path.join(" -> ")
            )
        }
        SkewVerdict::Downgrade => format!("{to} is lower than {from}; downgrades are not supported"),
        SkewVerdict::CrossMajor => format!("{from} -> {to} crosses a major version"),
        _ => format!("{from} -> {to}"),
    }
}

/// Target must be within one minor of current and never lower.
pub fn version_skew(snapshot: &ClusterHealthSnapshot, plan: &UpgradePlan) -> CheckResult {
    let cp = &snapshot.control_plane_version;
    let target = plan.target_version();

    match plan.scope() {
        UpgradeScope::ControlPlane | UpgradeScope::Full => {
            let verdict = check_skew(cp, target);
            if !verdict.is_allowed() {
                return skew_failure("control plane", &verdict, skew_detail(cp, target, &verdict));
            }

            if *plan.scope() == UpgradeScope::Full
                && let Some(ahead) = snapshot.node_pools.iter().find(|p| p.current_version > *target)
            {
                return CheckResult::fail(
                    VERSION_SKEW,
                    format!(
                        "node pool {} is at {}, above target {target}; downgrades are not supported",
                        ahead.name, ahead.current_version
                    ),
                )
                .with_reason("downgrade-not-supported");
            }

            if verdict == SkewVerdict::Unchanged {
                CheckResult::pass(VERSION_SKEW, format!("control plane already at {target}"))
            } else {
                CheckResult::pass(VERSION_SKEW, format!("{cp} -> {target} is a supported step"))
            }
        }
        UpgradeScope::NodePool(name) => {
            let Some(pool) = snapshot.pool(name) else {
                return CheckResult::fail(VERSION_SKEW, format!("node pool {name} does not exist"))
                    .with_reason("node-pool-not-found");
            };
            if target > cp {
                return CheckResult::fail(
                    VERSION_SKEW,
                    format!("target {target} is ahead of control plane {cp}; upgrade the control plane first"),
                )
                .with_reason("node-pool-ahead-of-control-plane");
            }
            let verdict = check_skew(&pool.current_version, target);
            if !verdict.is_allowed() {
                return skew_failure(
                    &format!("node pool {name}"),
                    &verdict,
                    skew_detail(&pool.current_version, target, &verdict),
                );
            }
            CheckResult::pass(
                VERSION_SKEW,
                format!("node pool {name} {} -> {target} is a supported step", pool.current_version),
            )
        }
        UpgradeScope::NodeImage => {
            if target != cp {
                return CheckResult::fail(
                    VERSION_SKEW,
                    format!("node-image upgrades keep the Kubernetes version; target must equal control plane {cp}"),
                )
                .with_reason("node-image-version-mismatch");
            }
            CheckResult::pass(VERSION_SKEW, format!("node images roll at {cp}"))
        }
    }
}

// ============================================================================
// Nodes and workloads
// ============================================================================

/// Nodes in scope must all be Ready. NotReady nodes outside the scope only warn.
pub fn node_readiness(snapshot: &ClusterHealthSnapshot, pools: &[String]) -> CheckResult {
    let (in_scope, out_of_scope): (Vec<_>, Vec<_>) = snapshot
        .not_ready_nodes()
        .partition(|n| n.pool.as_ref().is_some_and(|p| pools.contains(p)));

    if !in_scope.is_empty() {
        let names: Vec<&str> = in_scope.iter().map(|n| n.name.as_str()).collect();
        return CheckResult::fail(
            NODE_READINESS,
            format!("{} node(s) NotReady in scope: {}", names.len(), names.join(", ")),
        );
    }

    let total = snapshot.nodes_in(pools).count();
    if !out_of_scope.is_empty() {
        let names: Vec<&str> = out_of_scope.iter().map(|n| n.name.as_str()).collect();
        return CheckResult::warn(
            NODE_READINESS,
            format!("{total} node(s) in scope Ready; NotReady outside scope: {}", names.join(", ")),
        );
    }

    if pools.is_empty() {
        CheckResult::pass(NODE_READINESS, format!("all {} node(s) Ready", snapshot.nodes.len()))
    } else {
        CheckResult::pass(NODE_READINESS, format!("{total}/{total} node(s) in scope Ready"))
    }
}

pub fn workload_health(snapshot: &ClusterHealthSnapshot, max_failing: usize) -> CheckResult {
    let failing = &snapshot.failing_pods;
    let sample: Vec<String> = failing
        .iter()
        .take(5)
        .map(|p| format!("{}/{} ({})", p.namespace, p.name, p.reason))
        .collect();

    if failing.len() > max_failing {
        CheckResult::fail(
            WORKLOAD_HEALTH,
            format!(
                "{} failing pod(s) exceeds threshold {max_failing}: {}",
                failing.len(),
                sample.join(", ")
            ),
        )
    } else if !failing.is_empty() {
        CheckResult::warn(
            WORKLOAD_HEALTH,
            format!("{} failing pod(s) within threshold {max_failing}: {}", failing.len(), sample.join(", ")),
        )
    } else {
        CheckResult::pass(WORKLOAD_HEALTH, "no failing pods")
    }
}

// ============================================================================
// PodDisruptionBudgets
// ============================================================================

/// Pods of `pdb` that one surge wave could evict at once.
fn wave_evictions(pdb: &PdbHeadroom, snapshot: &ClusterHealthSnapshot, plan: &UpgradePlan, pools: &[String]) -> u32 {
    pools
        .iter()
        .filter_map(|name| snapshot.pool(name))
        .map(|pool| {
            let wave = plan.surge_for(pool).surge_nodes(pool.node_count) as usize;
            let mut per_node: Vec<u32> = snapshot
                .nodes_in(std::slice::from_ref(&pool.name))
                .filter_map(|n| pdb.pods_per_node.get(&n.name).copied())
                .collect();
            per_node.sort_unstable_by(|a, b| b.cmp(a));
            per_node.iter().take(wave).sum::<u32>()
        })
        .max()
        .unwrap_or(0)
}

/// Drain must be able to evict protected pods on every node being rolled.
pub fn pdb_feasibility(snapshot: &ClusterHealthSnapshot, plan: &UpgradePlan) -> CheckResult {
    let pools = plan.scope().pools_in_scope(snapshot);
    if pools.is_empty() {
        return CheckResult::pass(PDB_FEASIBILITY, "control-plane scope drains no nodes");
    }

    let drained: BTreeSet<&str> = snapshot.nodes_in(&pools).map(|n| n.name.as_str()).collect();
    let mut blocking = Vec::new();
    let mut tight = Vec::new();
    let mut relevant = 0;

    for pdb in &snapshot.pdbs {
        let on_drained = pdb.expected_pods > 0
            && pdb.pods_per_node.keys().any(|n| drained.contains(n.as_str()));
        if !on_drained {
            continue;
        }
        relevant += 1;

        if pdb.disruptions_allowed <= 0 {
            blocking.push(format!(
                "{}/{} ({}, {}/{} healthy)",
                pdb.namespace,
                pdb.name,
                pdb.spec_summary(),
                pdb.current_healthy,
                pdb.expected_pods
            ));
            continue;
        }

        let evictions = wave_evictions(pdb, snapshot, plan, &pools);
        if (pdb.disruptions_allowed as u32) < evictions {
            tight.push(format!(
                "{}/{} allows {} but a surge wave evicts {}",
                pdb.namespace, pdb.name, pdb.disruptions_allowed, evictions
            ));
        }
    }

    if !blocking.is_empty() {
        CheckResult::fail(
            PDB_FEASIBILITY,
            format!(
                "{}/{} PDB(s) allow zero disruptions on nodes being drained: {}",
                blocking.len(),
                relevant,
                blocking.join("; ")
            ),
        )
    } else if !tight.is_empty() {
        CheckResult::warn(
            PDB_FEASIBILITY,
            format!("drain will be serialized: {}", tight.join("; ")),
        )
    } else {
        CheckResult::pass(
            PDB_FEASIBILITY,
            format!(
                "{relevant} PDB(s) protect pods on drained nodes, none blocking ({} total)",
                snapshot.pdbs.len()
            ),
        )
    }
}

// ============================================================================
// Deprecated APIs, quota, platform services
// ============================================================================

pub fn deprecated_api_usage(snapshot: &ClusterHealthSnapshot) -> CheckResult {
    if snapshot.deprecated_apis.is_empty() {
        return CheckResult::pass(DEPRECATED_APIS, "no deprecated API requests observed");
    }

    let apis: Vec<String> = snapshot
        .deprecated_apis
        .iter()
        .map(|a| match &a.removed_release {
            Some(release) => format!("{} (removed in {release})", a.api()),
            None => a.api(),
        })
        .collect();
    CheckResult::warn(
        DEPRECATED_APIS,
        format!("{} deprecated API(s) in use: {}", apis.len(), apis.join(", ")),
    )
}

/// Regional and VM-family vCPU headroom must absorb the surge nodes of every
/// pool in scope.
pub fn quota_headroom(snapshot: &ClusterHealthSnapshot, plan: &UpgradePlan) -> CheckResult {
    let pools = plan.scope().pools_in_scope(snapshot);
    if pools.is_empty() {
        return CheckResult::pass(QUOTA_HEADROOM, "control-plane scope adds no surge nodes");
    }

    let Some(quota) = &snapshot.quota else {
        return CheckResult::warn(QUOTA_HEADROOM, "regional vCPU quota could not be read");
    };

    let mut required: u64 = 0;
    let mut per_family: BTreeMap<&str, u64> = BTreeMap::new();
    let mut unknown = Vec::new();
    for pool in pools.iter().filter_map(|name| snapshot.pool(name)) {
        let surge = u64::from(plan.surge_for(pool).surge_nodes(pool.node_count));
        let Some(vcpus) = quota.vcpus_per_size.get(&pool.vm_size) else {
            unknown.push(format!("vCPU count of {}", pool.vm_size));
            continue;
        };
        let needed = surge * u64::from(*vcpus);
        required += needed;
        match quota.family_per_size.get(&pool.vm_size) {
            Some(family) => *per_family.entry(family.as_str()).or_default() += needed,
            None => unknown.push(format!("family of {}", pool.vm_size)),
        }
    }

    let available = quota.available();
    let mut short = Vec::new();
    if required > available {
        short.push(format!(
            "surge needs {required} vCPUs but only {available} of {} are free in {}",
            quota.cores_limit, quota.region
        ));
    }
    for (family, needed) in &per_family {
        match quota.families.get(*family) {
            Some(usage) if *needed > usage.available() => short.push(format!(
                "{family} needs {needed} vCPUs but only {} of {} are free",
                usage.available(),
                usage.limit
            )),
            Some(_) => {}
            None => unknown.push(format!("{family} quota")),
        }
    }

    if !short.is_empty() {
        CheckResult::fail(QUOTA_HEADROOM, short.join("; "))
    } else if !unknown.is_empty() {
        CheckResult::warn(
            QUOTA_HEADROOM,
            format!("unknown {}; {required} vCPUs accounted", unknown.join(", ")),
        )
    } else {
        CheckResult::pass(
            QUOTA_HEADROOM,
            format!("surge needs {required} vCPUs, {available} free in {}", quota.region),
        )
    }
}

pub fn critical_services(snapshot: &ClusterHealthSnapshot) -> CheckResult {
    if snapshot.critical_services.is_empty() {
        return CheckResult::pass(CRITICAL_SERVICES, "no critical services configured");
    }

    let unhealthy: Vec<String> = snapshot
        .critical_services
        .iter()
        .filter(|s| !s.is_healthy())
        .map(|s| {
            if s.found {
                format!("{}/{} ({}/{} ready)", s.namespace, s.name, s.ready, s.desired)
            } else {
                format!("{}/{} (not found)", s.namespace, s.name)
            }
        })
        .collect();

    if unhealthy.is_empty() {
        CheckResult::pass(
            CRITICAL_SERVICES,
            format!("{} critical service(s) healthy", snapshot.critical_services.len()),
        )
    } else {
        CheckResult::fail(CRITICAL_SERVICES, format!("unhealthy: {}", unhealthy.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterTarget, DeprecatedApiUsage, FailingPod};
    use crate::report::CheckStatus;
    use crate::testing::snapshot;
    use crate::upgrade::{BackendKind, UpgradePlanBuilder};
    use std::collections::BTreeMap;

    fn plan(target: &str, scope: &str) -> UpgradePlan {
        UpgradePlanBuilder::new(ClusterTarget::resolve("p", "dev", None, None), target)
            .scope(scope)
            .backend(BackendKind::Imperative)
            .build()
            .unwrap()
    }

    fn pdb(name: &str, allowed: i32, nodes: &[(&str, u32)]) -> PdbHeadroom {
        PdbHeadroom {
            namespace: "apps".into(),
            name: name.into(),
            min_available: Some("2".into()),
            max_unavailable: None,
            current_healthy: 3,
            expected_pods: 3,
            disruptions_allowed: allowed,
            pods_per_node: nodes.iter().map(|(n, c)| (n.to_string(), *c)).collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_version_skew_single_minor_passes() {
        let r = version_skew(&snapshot("1.28.5", "1.28.5"), &plan("1.29.0", "full"));
        assert_eq!(r.status, CheckStatus::Pass);
    }

    #[test]
    fn test_version_skew_two_minors_fails() {
        let r = version_skew(&snapshot("1.29.2", "1.29.2"), &plan("1.31.0", "full"));
        assert_eq!(r.status, CheckStatus::Fail);
        assert_eq!(r.reason.as_deref(), Some("version-skew-exceeded"));
        assert!(r.detail.contains("1.30 -> 1.31"));
    }

    #[test]
    fn test_version_skew_downgrade_fails() {
        let r = version_skew(&snapshot("1.29.2", "1.29.2"), &plan("1.29.0", "control-plane"));
        assert_eq!(r.reason.as_deref(), Some("downgrade-not-supported"));
    }

    #[test]
    fn test_version_skew_node_pool_rules() {
        let snap = snapshot("1.29.0", "1.28.5");
        assert_eq!(version_skew(&snap, &plan("1.29.0", "node-pool:user")).status, CheckStatus::Pass);
        assert_eq!(
            version_skew(&snap, &plan("1.30.0", "node-pool:user")).reason.as_deref(),
            Some("node-pool-ahead-of-control-plane")
        );
        assert_eq!(
            version_skew(&snap, &plan("1.29.0", "node-pool:gpu")).reason.as_deref(),
            Some("node-pool-not-found")
        );
    }

    #[test]
    fn test_version_skew_node_image_requires_current_version() {
        let snap = snapshot("1.29.0", "1.29.0");
        assert_eq!(version_skew(&snap, &plan("1.29.0", "node-image")).status, CheckStatus::Pass);
        assert_eq!(
            version_skew(&snap, &plan("1.30.0", "node-image")).reason.as_deref(),
            Some("node-image-version-mismatch")
        );
    }

    #[test]
    fn test_node_readiness_scope() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        snap.nodes[0].ready = false; // aks-system-0
        let user = vec!["user".to_string()];
        let system = vec!["system".to_string()];

        assert_eq!(node_readiness(&snap, &user).status, CheckStatus::Warn);
        let r = node_readiness(&snap, &system);
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.detail.contains("aks-system-0"));
    }

    #[test]
    fn test_workload_health_threshold() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        assert_eq!(workload_health(&snap, 5).status, CheckStatus::Pass);

        for i in 0..6 {
            snap.failing_pods.push(FailingPod {
                namespace: "apps".into(),
                name: format!("web-{i}"),
                node: None,
                reason: "CrashLoopBackOff".into(),
            });
        }
        assert_eq!(workload_health(&snap, 5).status, CheckStatus::Fail);
        assert_eq!(workload_health(&snap, 6).status, CheckStatus::Warn);
    }

    #[test]
    fn test_pdb_zero_disruptions_on_drained_node_fails() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        snap.pdbs.push(pdb("web", 0, &[("aks-user-0", 1)]));

        let r = pdb_feasibility(&snap, &plan("1.29.0", "full"));
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.detail.contains("apps/web"));

        // Same PDB, control-plane scope drains nothing.
        let r = pdb_feasibility(&snap, &plan("1.29.0", "control-plane"));
        assert_eq!(r.status, CheckStatus::Pass);

        // Scope on the other pool leaves it alone.
        let r = pdb_feasibility(&snap, &plan("1.28.5", "node-pool:system"));
        assert_eq!(r.status, CheckStatus::Pass);
    }

    #[test]
    fn test_pdb_tight_budget_warns() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        snap.node_pools[1].node_count = 10; // 33% -> 4 nodes per wave
        snap.pdbs.push(pdb(
            "api",
            1,
            &[("aks-user-0", 1), ("aks-user-1", 1), ("aks-user-2", 1)],
        ));
        let r = pdb_feasibility(&snap, &plan("1.29.0", "node-pool:user"));
        assert_eq!(r.status, CheckStatus::Warn);
    }

    #[test]
    fn test_quota_headroom() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        // system: 1 node x 4 vCPU, user: 1 node x 8 vCPU (33% of 3)
        let r = quota_headroom(&snap, &plan("1.29.0", "full"));
        assert_eq!(r.status, CheckStatus::Pass);
        assert!(r.detail.contains("12 vCPUs"));

        if let Some(q) = snap.quota.as_mut() {
            q.cores_used = 195;
        }
        assert_eq!(quota_headroom(&snap, &plan("1.29.0", "full")).status, CheckStatus::Fail);
        assert_eq!(
            quota_headroom(&snap, &plan("1.29.0", "control-plane")).status,
            CheckStatus::Pass
        );

        snap.quota = None;
        assert_eq!(quota_headroom(&snap, &plan("1.29.0", "full")).status, CheckStatus::Warn);
    }

    #[test]
    fn test_quota_headroom_checks_vm_family() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        if let Some(q) = snap.quota.as_mut() {
            q.families.get_mut("standardDSv5Family").unwrap().used = 95;
        }
        // 152 regional vCPUs free, only 5 in the family.
        let r = quota_headroom(&snap, &plan("1.29.0", "full"));
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.detail.contains("standardDSv5Family needs 12 vCPUs"));

        if let Some(q) = snap.quota.as_mut() {
            q.families.clear();
        }
        let r = quota_headroom(&snap, &plan("1.29.0", "full"));
        assert_eq!(r.status, CheckStatus::Warn);
        assert!(r.detail.contains("standardDSv5Family quota"));
    }

    #[test]
    fn test_deprecated_apis_only_warn() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        snap.deprecated_apis.push(DeprecatedApiUsage {
            group: "flowcontrol.apiserver.k8s.io".into(),
            version: "v1beta2".into(),
            resource: "flowschemas".into(),
            removed_release: Some("1.29".into()),
        });
        let r = deprecated_api_usage(&snap);
        assert_eq!(r.status, CheckStatus::Warn);
        assert!(r.detail.contains("removed in 1.29"));
    }

    #[test]
    fn test_critical_services() {
        let mut snap = snapshot("1.28.5", "1.28.5");
        assert_eq!(critical_services(&snap).status, CheckStatus::Pass);
        snap.critical_services[1].found = false;
        let r = critical_services(&snap);
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.detail.contains("argocd/argocd-server (not found)"));
    }
}
