//! Cluster state types shared by the validators, backends and monitor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::KubeVersion;

/// Identifies one managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTarget {
    pub environment: String,
    pub resource_group: String,
    pub name: String,
}

impl ClusterTarget {
    /// Resolve the cluster from the environment with the project naming convention.
    pub fn resolve(
        project: &str,
        environment: &str,
        name: Option<&str>,
        resource_group: Option<&str>,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            resource_group: resource_group
                .map(String::from)
                .unwrap_or_else(|| format!("{project}-{environment}-rg")),
            name: name
                .map(String::from)
                .unwrap_or_else(|| format!("{project}-{environment}-aks")),
        }
    }

    /// File- and object-name-safe key. One live run is allowed per key.
    pub fn key(&self) -> String {
        format!("{}--{}", self.resource_group, self.name).to_lowercase()
    }
}

impl fmt::Display for ClusterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.resource_group, self.name, self.environment)
    }
}

/// Provisioning state reported by the control plane for the cluster or a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvisioningState {
    Succeeded,
    Failed,
    Canceled,
    /// Upgrading, Updating, Scaling, Creating and similar in-flight states.
    InProgress(String),
}

impl ProvisioningState {
    pub const fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl From<&str> for ProvisioningState {
    fn from(value: &str) -> Self {
        match value {
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Canceled" | "Cancelled" => Self::Canceled,
            other => Self::InProgress(other.to_string()),
        }
    }
}

impl From<String> for ProvisioningState {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<ProvisioningState> for String {
    fn from(value: ProvisioningState) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
            Self::InProgress(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolMode {
    System,
    User,
}

/// A node pool as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePoolState {
    pub name: String,
    pub mode: PoolMode,
    pub vm_size: String,
    pub node_count: u32,
    pub current_version: KubeVersion,
    /// Version the pool is converging to, when an upgrade is in flight.
    pub target_version: Option<KubeVersion>,
    pub node_image_version: Option<String>,
    pub latest_node_image_version: Option<String>,
    /// `maxSurge` currently configured on the pool.
    pub max_surge: Option<String>,
    pub provisioning_state: ProvisioningState,
}

impl NodePoolState {
    /// GPU pools use the N-series VM sizes.
    pub fn is_accelerator(&self) -> bool {
        self.vm_size
            .trim_start_matches("Standard_")
            .to_ascii_uppercase()
            .starts_with('N')
    }

    pub fn node_image_current(&self) -> bool {
        match (&self.node_image_version, &self.latest_node_image_version) {
            (Some(current), Some(latest)) => current == latest,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub name: String,
    /// Owning pool, from the agent pool label.
    pub pool: Option<String>,
    pub ready: bool,
    pub kubelet_version: String,
    /// When the Ready condition last changed, if known.
    pub ready_since: Option<DateTime<Utc>>,
}

impl NodeState {
    /// How long the node has been NotReady at `now`, if it is NotReady.
    pub fn not_ready_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if self.ready {
            return None;
        }
        Some(self.ready_since.map_or(chrono::Duration::MAX, |t| now - t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingPod {
    pub namespace: String,
    pub name: String,
    pub node: Option<String>,
    pub reason: String,
}

/// Disruption headroom of one PodDisruptionBudget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdbHeadroom {
    pub namespace: String,
    pub name: String,
    pub min_available: Option<String>,
    pub max_unavailable: Option<String>,
    pub current_healthy: i32,
    pub expected_pods: i32,
    pub disruptions_allowed: i32,
    /// Node name to number of protected pods scheduled on it.
    pub pods_per_node: BTreeMap<String, u32>,
}

impl PdbHeadroom {
    pub fn spec_summary(&self) -> String {
        if let Some(ref min) = self.min_available {
            format!("minAvailable={min}")
        } else if let Some(ref max) = self.max_unavailable {
            format!("maxUnavailable={max}")
        } else {
            "unknown spec".to_string()
        }
    }
}

/// A deprecated API still being requested, from `apiserver_requested_deprecated_apis`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecatedApiUsage {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub removed_release: Option<String>,
}

impl DeprecatedApiUsage {
    pub fn api(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// vCPU quota for the cluster's subscription: the regional total plus one
/// counter per VM family. Azure enforces both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaHeadroom {
    pub region: String,
    pub cores_limit: u64,
    pub cores_used: u64,
    /// vCPUs per VM size used by the cluster's pools.
    pub vcpus_per_size: BTreeMap<String, u32>,
    /// VM family of each size, e.g. `standardDSv5Family`.
    #[serde(default)]
    pub family_per_size: BTreeMap<String, String>,
    /// Family vCPU counters keyed by family name.
    #[serde(default)]
    pub families: BTreeMap<String, CoreUsage>,
}

impl QuotaHeadroom {
    pub const fn available(&self) -> u64 {
        self.cores_limit.saturating_sub(self.cores_used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreUsage {
    pub limit: u64,
    pub used: u64,
}

impl CoreUsage {
    pub const fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Readiness of a critical platform deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub namespace: String,
    pub name: String,
    pub found: bool,
    pub desired: i32,
    pub ready: i32,
}

impl ServiceHealth {
    pub const fn is_healthy(&self) -> bool {
        self.found && self.desired > 0 && self.ready >= self.desired
    }
}

/// Point-in-time view of cluster health. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealthSnapshot {
    pub captured_at: DateTime<Utc>,
    pub control_plane_version: KubeVersion,
    pub provisioning_state: ProvisioningState,
    pub node_pools: Vec<NodePoolState>,
    pub nodes: Vec<NodeState>,
    pub failing_pods: Vec<FailingPod>,
    pub pdbs: Vec<PdbHeadroom>,
    pub deprecated_apis: Vec<DeprecatedApiUsage>,
    /// `None` when the quota could not be read.
    pub quota: Option<QuotaHeadroom>,
    pub critical_services: Vec<ServiceHealth>,
}

impl ClusterHealthSnapshot {
    pub fn pool(&self, name: &str) -> Option<&NodePoolState> {
        self.node_pools.iter().find(|p| p.name == name)
    }

    /// Nodes that belong to any of the given pools.
    pub fn nodes_in<'a>(&'a self, pools: &'a [String]) -> impl Iterator<Item = &'a NodeState> {
        self.nodes
            .iter()
            .filter(move |n| n.pool.as_ref().is_some_and(|p| pools.contains(p)))
    }

    pub fn not_ready_nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.iter().filter(|n| !n.ready)
    }
}

/// Extended post-upgrade signals, only queried when requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedHealth {
    /// Ready endpoints behind the cluster DNS service.
    pub dns_ready_endpoints: usize,
    pub claims: Vec<ClaimState>,
    /// `None` when the Gateway API is not installed.
    pub routes: Option<Vec<RouteState>>,
    /// `None` when cert-manager is not installed.
    pub certificates: Option<Vec<CertificateState>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimState {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteState {
    pub namespace: String,
    pub name: String,
    pub programmed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateState {
    pub namespace: String,
    pub name: String,
    pub ready: bool,
    pub not_after: Option<DateTime<Utc>>,
}
