//! Terraform backend: composes desired state and lets Terraform reconcile it.
//!
//! Re-applying a plan that already succeeded is a no-op: the composed state
//! equals the actual state and `terraform plan -detailed-exitcode` exits 0.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Backend, BackendState, DiffEntry, PlanDiff, cluster_state};
use crate::azure::{AzCli, CommandOutput, CommandRunner};
use crate::cluster::{ClusterHealthSnapshot, ClusterTarget};
use crate::error::AkupError;
use crate::upgrade::{BackendHandle, BackendKind, UpgradePlan, UpgradeScope};

const PLAN_FILE: &str = "akup.tfplan";
const OVERRIDE_FILE: &str = "akup-override.tfvars.json";

/// Variables handed to Terraform on top of the environment's tfvars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredState {
    pub kubernetes_version: String,
    pub node_pool_versions: BTreeMap<String, String>,
    pub node_pool_max_surge: BTreeMap<String, String>,
}

impl DesiredState {
    /// Desired state for a plan. Out-of-scope components keep their current values.
    pub fn compose(plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Self {
        let target = plan.target_version().to_string();
        let in_scope = plan.scope().pools_in_scope(snapshot);

        let kubernetes_version = if plan.scope().includes_control_plane() {
            target.clone()
        } else {
            snapshot.control_plane_version.to_string()
        };

        let mut node_pool_versions = BTreeMap::new();
        let mut node_pool_max_surge = BTreeMap::new();

        for pool in &snapshot.node_pools {
            let rolls = in_scope.contains(&pool.name) && *plan.scope() != UpgradeScope::NodeImage;
            let version = if rolls {
                target.clone()
            } else {
                pool.current_version.to_string()
            };
            node_pool_versions.insert(pool.name.clone(), version);

            if in_scope.contains(&pool.name) {
                node_pool_max_surge.insert(pool.name.clone(), plan.surge_for(pool).to_string());
            } else if let Some(surge) = &pool.max_surge {
                node_pool_max_surge.insert(pool.name.clone(), surge.clone());
            }
        }

        Self {
            kubernetes_version,
            node_pool_versions,
            node_pool_max_surge,
        }
    }

    /// Attributes where the actual state differs from this desired state.
    pub fn diff(&self, snapshot: &ClusterHealthSnapshot) -> Vec<DiffEntry> {
        let mut entries = Vec::new();

        let current = snapshot.control_plane_version.to_string();
        if current != self.kubernetes_version {
            entries.push(DiffEntry {
                resource: "cluster".to_string(),
                attribute: "kubernetes_version".to_string(),
                from: current,
                to: self.kubernetes_version.clone(),
            });
        }

        for pool in &snapshot.node_pools {
            let resource = format!("node_pool.{}", pool.name);
            if let Some(want) = self.node_pool_versions.get(&pool.name) {
                let have = pool.current_version.to_string();
                if &have != want {
                    entries.push(DiffEntry {
                        resource: resource.clone(),
                        attribute: "orchestrator_version".to_string(),
                        from: have,
                        to: want.clone(),
                    });
                }
            }
            if let Some(want) = self.node_pool_max_surge.get(&pool.name)
                && pool.max_surge.as_ref() != Some(want)
            {
                entries.push(DiffEntry {
                    resource,
                    attribute: "max_surge".to_string(),
                    from: pool.max_surge.clone().unwrap_or_else(|| "unset".to_string()),
                    to: want.clone(),
                });
            }
        }

        entries
    }
}

pub struct DeclarativeBackend {
    cluster: ClusterTarget,
    az: AzCli,
    runner: Arc<dyn CommandRunner>,
    dir: PathBuf,
}

impl DeclarativeBackend {
    pub fn new(cluster: ClusterTarget, az: AzCli, dir: PathBuf) -> Self {
        Self {
            runner: az.runner(),
            cluster,
            az,
            dir,
        }
    }

    fn env_dir(&self) -> String {
        format!("environments/{}", self.cluster.environment)
    }

    async fn terraform(&self, args: &[String]) -> Result<CommandOutput> {
        let mut full = vec![format!("-chdir={}", self.dir.display())];
        full.extend_from_slice(args);
        self.runner.run("terraform", &full, None).await
    }

    async fn checked(&self, args: &[String]) -> Result<CommandOutput> {
        let output = self.terraform(args).await?;
        if !output.success() {
            return Err(AkupError::backend("declarative", &output.stderr).into());
        }
        Ok(output)
    }

    async fn init(&self) -> Result<()> {
        self.checked(&[
            "init".to_string(),
            "-input=false".to_string(),
            format!("-backend-config={}/backend.conf", self.env_dir()),
        ])
        .await?;
        Ok(())
    }

    async fn write_overrides(&self, desired: &DesiredState) -> Result<String> {
        let rel = format!("{}/{OVERRIDE_FILE}", self.env_dir());
        let path = self.dir.join(&rel);
        let body = serde_json::to_vec_pretty(desired)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AkupError::Terraform(format!("write {}: {e}", path.display())))?;
        debug!("Wrote Terraform overrides to {}", path.display());
        Ok(rel)
    }

    /// Run `terraform plan` into the plan file. Returns whether there are changes.
    async fn plan_to_file(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Result<bool> {
        self.init().await?;
        let overrides = self.write_overrides(&DesiredState::compose(plan, snapshot)).await?;

        let output = self
            .terraform(&[
                "plan".to_string(),
                "-input=false".to_string(),
                "-detailed-exitcode".to_string(),
                format!("-var-file={}/terraform.tfvars", self.env_dir()),
                format!("-var-file={overrides}"),
                format!("-out={PLAN_FILE}"),
            ])
            .await?;

        match output.code {
            Some(0) => Ok(false),
            Some(2) => Ok(true),
            _ => Err(AkupError::backend("declarative", &output.stderr).into()),
        }
    }
}

#[async_trait]
impl Backend for DeclarativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Declarative
    }

    async fn plan(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Result<PlanDiff> {
        let entries = if self.plan_to_file(plan, snapshot).await? {
            let shown = self
                .checked(&["show".to_string(), "-json".to_string(), PLAN_FILE.to_string()])
                .await?;
            parse_plan_json(&shown.stdout)?
        } else {
            Vec::new()
        };

        Ok(PlanDiff {
            backend: Some(BackendKind::Declarative),
            entries,
            commands: Vec::new(),
        })
    }

    async fn apply(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot) -> Result<BackendHandle> {
        let changes = self.plan_to_file(plan, snapshot).await?;

        let operation = if changes {
            info!("Applying Terraform plan in {}", self.dir.display());
            self.checked(&[
                "apply".to_string(),
                "-input=false".to_string(),
                PLAN_FILE.to_string(),
            ])
            .await?;
            format!("terraform apply ({} -> {})", plan.scope(), plan.target_version())
        } else {
            info!("Terraform reports no changes; desired state already applied");
            "terraform apply skipped (no changes)".to_string()
        };

        Ok(BackendHandle {
            backend: BackendKind::Declarative,
            operation,
            issued_at: Utc::now(),
        })
    }

    async fn query_state(&self) -> Result<BackendState> {
        cluster_state(&self.az, &self.cluster, BackendKind::Declarative).await
    }
}

/// Extract changed attributes from `terraform show -json <planfile>` output.
pub fn parse_plan_json(json: &str) -> Result<Vec<DiffEntry>> {
    let plan: Value = serde_json::from_str(json).context("Failed to parse terraform plan JSON")?;
    let mut entries = Vec::new();

    let Some(changes) = plan.get("resource_changes").and_then(Value::as_array) else {
        return Ok(entries);
    };

    for rc in changes {
        let address = rc
            .get("address")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let change = &rc["change"];
        let actions: Vec<&str> = change["actions"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        match actions.as_slice() {
            [] | ["no-op"] | ["read"] => continue,
            ["create"] | ["delete"] => {
                entries.push(DiffEntry {
                    resource: address,
                    attribute: "*".to_string(),
                    from: if actions[0] == "create" { "absent" } else { "present" }.to_string(),
                    to: actions[0].to_string(),
                });
                continue;
            }
            _ => {}
        }

        let mut before = BTreeMap::new();
        let mut after = BTreeMap::new();
        let mut unknown = BTreeMap::new();
        flatten("", &change["before"], &mut before);
        flatten("", &change["after"], &mut after);
        flatten("", &change["after_unknown"], &mut unknown);

        let keys: std::collections::BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for key in keys {
            let from = before.get(key);
            let to = after.get(key);
            let is_unknown = unknown.get(key).is_some_and(|v| v == "true");
            if from == to && !is_unknown {
                continue;
            }
            entries.push(DiffEntry {
                resource: address.clone(),
                attribute: key.clone(),
                from: from.cloned().unwrap_or_else(|| "null".to_string()),
                to: if is_unknown {
                    "(known after apply)".to_string()
                } else {
                    to.cloned().unwrap_or_else(|| "null".to_string())
                },
            });
        }

        if actions.contains(&"delete") && actions.contains(&"create") {
            entries.push(DiffEntry {
                resource: address,
                attribute: "*".to_string(),
                from: "present".to_string(),
                to: "replace".to_string(),
            });
        }
    }

    Ok(entries)
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(&key, v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(&format!("{prefix}[{i}]"), v, out);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}
