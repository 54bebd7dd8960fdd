//! Execution backends.
//!
//! The executor only sees the [`Backend`] contract; which variant runs is
//! chosen per plan.

pub mod declarative;
pub mod imperative;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::azure::AzCli;
use crate::azure::models::ManagedCluster;
use crate::cluster::{ClusterHealthSnapshot, ClusterTarget, ProvisioningState};
use crate::upgrade::{BackendHandle, BackendKind, UpgradePlan};

pub use declarative::{DeclarativeBackend, DesiredState};
pub use imperative::ImperativeBackend;

/// One attribute the backend would change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub resource: String,
    pub attribute: String,
    pub from: String,
    pub to: String,
}

/// Effective change set of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDiff {
    pub backend: Option<BackendKind>,
    pub entries: Vec<DiffEntry>,
    /// Commands that would be issued, for the imperative backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

impl PlanDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Provisioning state as reported through a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendState {
    pub backend: BackendKind,
    pub provisioning_state: ProvisioningState,
    pub control_plane_version: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Compute the effective diff. Never mutates.
    async fn plan(&self, plan: &UpgradePlan, snapshot: &ClusterHealthSnapshot)
    -> Result<PlanDiff>;

    /// Issue the mutating call. Returns once the control plane accepted it
    /// (imperative) or the reconciliation finished (declarative).
    async fn apply(
        &self,
        plan: &UpgradePlan,
        snapshot: &ClusterHealthSnapshot,
    ) -> Result<BackendHandle>;

    async fn query_state(&self) -> Result<BackendState>;
}

/// Build the backend selected by the plan.
pub fn create(
    kind: BackendKind,
    cluster: &ClusterTarget,
    az: AzCli,
    terraform_dir: PathBuf,
) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Declarative => Arc::new(DeclarativeBackend::new(
            cluster.clone(),
            az,
            terraform_dir,
        )),
        BackendKind::Imperative => Arc::new(ImperativeBackend::new(cluster.clone(), az)),
    }
}

/// `az aks show` based state shared by both variants.
async fn cluster_state(
    az: &AzCli,
    cluster: &ClusterTarget,
    backend: BackendKind,
) -> Result<BackendState> {
    let mc: ManagedCluster = az
        .query(
            "aks show",
            &[
                "aks",
                "show",
                "--resource-group",
                &cluster.resource_group,
                "--name",
                &cluster.name,
            ],
        )
        .await?;

    Ok(BackendState {
        backend,
        provisioning_state: ProvisioningState::from(mc.provisioning_state.as_str()),
        control_plane_version: mc.running_version().to_string(),
    })
}
