//! Serde models for the subset of `az` JSON output akup reads.

use serde::{Deserialize, Deserializer};

use crate::cluster::{NodePoolState, PoolMode, ProvisioningState};
use crate::version::KubeVersion;

/// `az aks show`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedCluster {
    pub name: String,
    pub location: String,
    pub kubernetes_version: String,
    /// Patch-level version actually running; absent on older API versions.
    pub current_kubernetes_version: Option<String>,
    pub provisioning_state: String,
}

impl ManagedCluster {
    pub fn running_version(&self) -> &str {
        self.current_kubernetes_version
            .as_deref()
            .unwrap_or(&self.kubernetes_version)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSettings {
    pub max_surge: Option<String>,
}

/// One element of `az aks nodepool list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPool {
    pub name: String,
    pub mode: String,
    pub vm_size: String,
    #[serde(default)]
    pub count: Option<u32>,
    pub orchestrator_version: String,
    pub current_orchestrator_version: Option<String>,
    pub node_image_version: Option<String>,
    #[serde(default)]
    pub upgrade_settings: Option<UpgradeSettings>,
    pub provisioning_state: String,
}

impl AgentPool {
    /// Convert to pool state. `latest_image` comes from `nodepool get-upgrades`.
    pub fn into_state(self, latest_image: Option<String>) -> anyhow::Result<NodePoolState> {
        let running = self
            .current_orchestrator_version
            .as_deref()
            .unwrap_or(&self.orchestrator_version);
        let current_version = KubeVersion::parse(running)?;
        let desired = KubeVersion::parse(&self.orchestrator_version)?;

        Ok(NodePoolState {
            mode: if self.mode.eq_ignore_ascii_case("system") {
                PoolMode::System
            } else {
                PoolMode::User
            },
            vm_size: self.vm_size,
            node_count: self.count.unwrap_or(0),
            target_version: (desired != current_version).then_some(desired),
            current_version,
            node_image_version: self.node_image_version,
            latest_node_image_version: latest_image,
            max_surge: self.upgrade_settings.and_then(|u| u.max_surge),
            provisioning_state: ProvisioningState::from(self.provisioning_state),
            name: self.name,
        })
    }
}

/// `az aks nodepool get-upgrades`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUpgradeProfile {
    pub latest_node_image_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageName {
    pub value: String,
}

/// One element of `az vm list-usage`. Counters are strings in some CLI versions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub name: UsageName,
    #[serde(deserialize_with = "lenient_u64")]
    pub current_value: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkuCapability {
    pub name: String,
    pub value: String,
}

/// One element of `az vm list-skus --resource-type virtualMachines`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSku {
    pub name: String,
    pub family: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<SkuCapability>,
}

impl ResourceSku {
    pub fn vcpus(&self) -> Option<u32> {
        self.capabilities
            .iter()
            .find(|c| c.name == "vCPUs")
            .and_then(|c| c.value.parse().ok())
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
