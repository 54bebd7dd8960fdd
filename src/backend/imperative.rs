//! Azure CLI backend: scoped direct mutation calls.
//!
//! Upgrade calls use `--no-wait`; the control plane owns the operation after it
//! is accepted and progress is observed separately.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{Backend, BackendState, DesiredState, DiffEntry, PlanDiff, cluster_state};
use crate::azure::AzCli;
use crate::cluster::{ClusterHealthSnapshot, ClusterTarget};
use crate::upgrade::{BackendHandle, BackendKind, UpgradePlan, UpgradeScope};

pub struct ImperativeBackend {
    cluster: ClusterTarget,
    az: AzCli,
}

impl ImperativeBackend {
    pub fn new(cluster: ClusterTarget, az: AzCli) -> Self {
        Self { cluster, az }
    }

    fn pool_args(&self, verb: &str, pool: &str) -> Vec<String> {
        [
            "aks",
            "nodepool",
            verb,
            "--resource-group",
            self.cluster.resource_group.as_str(),
            "--cluster-name",
            self.cluster.name.as_str(),
            "--name",
            pool,
        ]
        .map(String::from)
        .to_vec()
    }

    fn cluster_upgrade_args(&self) -> Vec<String> {
        [
            "aks",
            "upgrade",
            "--resource-group",
            self.cluster.resource_group.as_str(),
            "--name",
            self.cluster.name.as_str(),
        ]
        .map(String::from)
        .to_vec()
    }

    /// The ordered `az` calls for a plan. Surge updates precede the upgrade call.
    pub fn commands(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Vec<Vec<String>> {
        let target = plan.target_version().to_string();
        let mut commands = Vec::new();

        // `nodepool upgrade` takes the surge inline; cluster-wide upgrades need it set first.
        if matches!(plan.scope(), UpgradeScope::Full | UpgradeScope::NodeImage) {
            for pool in &snapshot.node_pools {
                let surge = plan.surge_for(pool).to_string();
                if pool.max_surge.as_deref() != Some(surge.as_str()) {
                    let mut cmd = self.pool_args("update", &pool.name);
                    cmd.extend(["--max-surge".to_string(), surge]);
                    commands.push(cmd);
                }
            }
        }

        let upgrade = match plan.scope() {
            UpgradeScope::ControlPlane => {
                let mut cmd = self.cluster_upgrade_args();
                cmd.extend(["--kubernetes-version".to_string(), target, "--control-plane-only".to_string()]);
                cmd
            }
            UpgradeScope::NodePool(name) => {
                let surge = snapshot
                    .pool(name)
                    .map(|p| plan.surge_for(p))
                    .or_else(|| plan.surge_overrides().get(name).copied())
                    .map(|s| s.to_string());
                let mut cmd = self.pool_args("upgrade", name);
                cmd.extend(["--kubernetes-version".to_string(), target]);
                if let Some(surge) = surge {
                    cmd.extend(["--max-surge".to_string(), surge]);
                }
                cmd
            }
            UpgradeScope::NodeImage => {
                let mut cmd = self.cluster_upgrade_args();
                cmd.push("--node-image-only".to_string());
                cmd
            }
            UpgradeScope::Full => {
                let mut cmd = self.cluster_upgrade_args();
                cmd.extend(["--kubernetes-version".to_string(), target]);
                cmd
            }
        };
        commands.push(
            upgrade
                .into_iter()
                .chain(["--yes".to_string(), "--no-wait".to_string()])
                .collect(),
        );

        commands
    }
}

fn render(cmd: &[String]) -> String {
    format!("az {}", cmd.join(" "))
}

#[async_trait]
impl Backend for ImperativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Imperative
    }

    async fn plan(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Result<PlanDiff> {
        let entries = if *plan.scope() == UpgradeScope::NodeImage {
            snapshot
                .node_pools
                .iter()
                .filter(|p| !p.node_image_current())
                .map(|p| DiffEntry {
                    resource: format!("node_pool.{}", p.name),
                    attribute: "node_image_version".to_string(),
                    from: p.node_image_version.clone().unwrap_or_default(),
                    to: p.latest_node_image_version.clone().unwrap_or_default(),
                })
                .collect()
        } else {
            DesiredState::compose(plan, snapshot).diff(snapshot)
        };

        Ok(PlanDiff {
            backend: Some(BackendKind::Imperative),
            entries,
            commands: self
                .commands(plan, snapshot)
                .iter()
                .map(|c| render(c))
                .collect(),
        })
    }

    async fn apply(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Result<BackendHandle> {
        let commands = self.commands(plan, snapshot);
        let mut issued = Vec::with_capacity(commands.len());

        for cmd in &commands {
            info!("Issuing: {}", render(cmd));
            let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
            self.az.mutate(&args).await?;
            issued.push(render(cmd));
        }

        Ok(BackendHandle {
            backend: BackendKind::Imperative,
            operation: issued.last().cloned().unwrap_or_default(),
            issued_at: Utc::now(),
        })
    }

    async fn query_state(&self) -> Result<BackendState> {
        cluster_state(&self.az, &self.cluster, BackendKind::Imperative).await
    }
}
