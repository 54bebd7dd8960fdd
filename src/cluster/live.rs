//! Cluster view backed by the Azure CLI and the Kubernetes API.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::query::ClusterQuery;
use super::types::{
    ClusterHealthSnapshot, ClusterTarget, CoreUsage, ExtendedHealth, NodePoolState,
    ProvisioningState, QuotaHeadroom,
};
use crate::azure::AzCli;
use crate::azure::models::{AgentPool, ManagedCluster, PoolUpgradeProfile, ResourceSku, Usage};
use crate::k8s;
use crate::version::KubeVersion;

/// `az vm list-usage` counter for total regional vCPUs.
const REGIONAL_CORES: &str = "cores";

/// Latest node image per pool name.
pub type ImageCache = Mutex<BTreeMap<String, Option<String>>>;

pub struct LiveCluster {
    kube: kube::Client,
    az: AzCli,
    target: ClusterTarget,
    critical_services: Vec<String>,
    latest_images: ImageCache,
}

impl LiveCluster {
    pub fn new(
        kube: kube::Client,
        az: AzCli,
        target: ClusterTarget,
        critical_services: Vec<String>,
    ) -> Self {
        Self {
            kube,
            az,
            target,
            critical_services,
            latest_images: ImageCache::default(),
        }
    }
}

#[async_trait]
impl ClusterQuery for LiveCluster {
    async fn capture(&self) -> Result<ClusterHealthSnapshot> {
        let cluster = managed_cluster(&self.az, &self.target).await?;
        let node_pools = cached_node_pools(&self.az, &self.target, &self.latest_images, true).await?;

        let (nodes, pods, pdbs, services) = tokio::try_join!(
            k8s::workloads::list_nodes(&self.kube),
            k8s::workloads::list_pods(&self.kube),
            k8s::pdb::list_pdbs(&self.kube),
            k8s::workloads::service_health(&self.kube, &self.critical_services),
        )?;

        let deprecated_apis = match k8s::metrics::deprecated_apis(&self.kube).await {
            Ok(apis) => apis,
            Err(e) => {
                warn!("Could not read deprecated API metrics: {e:#}");
                Vec::new()
            }
        };

        let sizes: Vec<&str> = node_pools.iter().map(|p| p.vm_size.as_str()).collect();
        let quota = quota(&self.az, &cluster.location, &sizes).await;
        debug!(
            "Captured {} ({}, {} pools, {} nodes)",
            cluster.name,
            cluster.provisioning_state,
            node_pools.len(),
            nodes.len()
        );

        Ok(ClusterHealthSnapshot {
            captured_at: Utc::now(),
            control_plane_version: KubeVersion::parse(cluster.running_version())?,
            provisioning_state: ProvisioningState::from(cluster.provisioning_state),
            nodes: nodes.iter().map(k8s::workloads::node_state).collect(),
            failing_pods: k8s::workloads::failing_pods(&pods),
            pdbs: k8s::pdb::headroom(&pdbs, &pods),
            deprecated_apis,
            quota,
            critical_services: services,
            node_pools,
        })
    }

    async fn sample(&self) -> Result<ClusterHealthSnapshot> {
        let cluster = managed_cluster(&self.az, &self.target).await?;
        let (node_pools, nodes) = tokio::try_join!(
            cached_node_pools(&self.az, &self.target, &self.latest_images, false),
            k8s::workloads::list_nodes(&self.kube),
        )?;
        debug!("Sampled {} ({})", cluster.name, cluster.provisioning_state);

        Ok(ClusterHealthSnapshot {
            captured_at: Utc::now(),
            control_plane_version: KubeVersion::parse(cluster.running_version())?,
            provisioning_state: ProvisioningState::from(cluster.provisioning_state),
            nodes: nodes.iter().map(k8s::workloads::node_state).collect(),
            failing_pods: Vec::new(),
            pdbs: Vec::new(),
            deprecated_apis: Vec::new(),
            quota: None,
            critical_services: Vec::new(),
            node_pools,
        })
    }

    async fn extended_health(&self) -> Result<ExtendedHealth> {
        k8s::extended::extended_health(&self.kube).await
    }
}

pub async fn managed_cluster(az: &AzCli, target: &ClusterTarget) -> Result<ManagedCluster> {
    az.query(
        "aks show",
        &[
            "aks",
            "show",
            "--resource-group",
            &target.resource_group,
            "--name",
            &target.name,
        ],
    )
    .await
}

/// All pools with their latest available node image.
pub async fn node_pools(az: &AzCli, target: &ClusterTarget) -> Result<Vec<NodePoolState>> {
    cached_node_pools(az, target, &ImageCache::default(), true).await
}

/// Pool states, looking up the latest node image only for pools missing from
/// `cache` unless `refresh` is set.
pub async fn cached_node_pools(
    az: &AzCli,
    target: &ClusterTarget,
    cache: &ImageCache,
    refresh: bool,
) -> Result<Vec<NodePoolState>> {
    let pools: Vec<AgentPool> = az
        .query(
            "aks nodepool list",
            &[
                "aks",
                "nodepool",
                "list",
                "--resource-group",
                &target.resource_group,
                "--cluster-name",
                &target.name,
            ],
        )
        .await?;
    debug!("Found {} node pools", pools.len());

    let mut cache = cache.lock().await;
    let mut states = Vec::with_capacity(pools.len());
    for pool in pools {
        let cached = if refresh { None } else { cache.get(&pool.name).cloned() };
        let latest = match cached {
            Some(latest) => latest,
            None => {
                let latest = latest_node_image(az, target, &pool.name).await;
                cache.insert(pool.name.clone(), latest.clone());
                latest
            }
        };
        states.push(pool.into_state(latest)?);
    }

    Ok(states)
}

async fn latest_node_image(az: &AzCli, target: &ClusterTarget, pool: &str) -> Option<String> {
    let profile: Result<PoolUpgradeProfile> = az
        .query(
            "aks nodepool get-upgrades",
            &[
                "aks",
                "nodepool",
                "get-upgrades",
                "--resource-group",
                &target.resource_group,
                "--cluster-name",
                &target.name,
                "--nodepool-name",
                pool,
            ],
        )
        .await;
    match profile {
        Ok(p) => p.latest_node_image_version,
        Err(e) => {
            warn!("Could not read node image upgrades for pool {pool}: {e:#}");
            None
        }
    }
}

/// Regional and per-family vCPU headroom. `None` when either call fails.
pub async fn quota(az: &AzCli, location: &str, sizes: &[&str]) -> Option<QuotaHeadroom> {
    let usage: Vec<Usage> = match az
        .query("vm list-usage", &["vm", "list-usage", "--location", location])
        .await
    {
        Ok(u) => u,
        Err(e) => {
            warn!("Could not read vCPU quota for {location}: {e:#}");
            return None;
        }
    };
    let Some(cores) = usage.iter().find(|u| u.name.value == REGIONAL_CORES) else {
        warn!("No regional cores counter in quota for {location}");
        return None;
    };

    let skus: Vec<ResourceSku> = match az
        .query(
            "vm list-skus",
            &[
                "vm",
                "list-skus",
                "--location",
                location,
                "--resource-type",
                "virtualMachines",
            ],
        )
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not read VM SKUs for {location}: {e:#}");
            return None;
        }
    };

    let mut vcpus_per_size = BTreeMap::new();
    let mut family_per_size = BTreeMap::new();
    for sku in skus.into_iter().filter(|s| sizes.contains(&s.name.as_str())) {
        if let Some(vcpus) = sku.vcpus() {
            vcpus_per_size.insert(sku.name.clone(), vcpus);
        }
        if let Some(family) = sku.family {
            family_per_size.insert(sku.name, family);
        }
    }

    let families = family_per_size
        .values()
        .filter_map(|family| {
            usage
                .iter()
                .find(|u| u.name.value.eq_ignore_ascii_case(family))
                .map(|u| {
                    (
                        family.clone(),
                        CoreUsage {
                            limit: u.limit,
                            used: u.current_value,
                        },
                    )
                })
        })
        .collect();

    Some(QuotaHeadroom {
        region: location.to_string(),
        cores_limit: cores.limit,
        cores_used: cores.current_value,
        vcpus_per_size,
        family_per_size,
        families,
    })
}
