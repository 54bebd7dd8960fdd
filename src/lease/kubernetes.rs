//! Lease store backed by a `coordination.k8s.io/v1` Lease in the target cluster.
//!
//! Create is the compare-and-set: the API server rejects a second create with 409.
//! Release deletes with a resourceVersion precondition so a lease re-taken in
//! between is never removed.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease as KubeLease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Api;
use kube::api::{DeleteParams, PostParams, Preconditions};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{Lease, LeaseStore};
use crate::error::AkupError;

const LEASE_NAMESPACE: &str = "kube-system";
const OWNER_ANNOTATION: &str = "akup.io/owner";
const CLUSTER_ANNOTATION: &str = "akup.io/cluster-key";

pub struct KubeLeaseStore {
    api: Api<KubeLease>,
}

impl KubeLeaseStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::namespaced(client, LEASE_NAMESPACE),
        }
    }

    async fn get(&self, cluster_key: &str) -> Result<Option<KubeLease>> {
        self.api
            .get_opt(&lease_name(cluster_key))
            .await
            .map_err(|e| AkupError::KubernetesApi(format!("get lease: {e}")).into())
    }
}

/// Object name for a cluster key, restricted to a valid DNS subdomain.
fn lease_name(cluster_key: &str) -> String {
    let sanitized: String = cluster_key
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let mut name = format!("akup-{sanitized}");
    name.truncate(253);
    name.trim_end_matches(['-', '.']).to_string()
}

fn to_kube_lease(lease: &Lease) -> KubeLease {
    KubeLease {
        metadata: ObjectMeta {
            name: Some(lease_name(&lease.cluster_key)),
            namespace: Some(LEASE_NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([
                (OWNER_ANNOTATION.to_string(), lease.owner.clone()),
                (CLUSTER_ANNOTATION.to_string(), lease.cluster_key.clone()),
            ])),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(lease.holder.clone()),
            acquire_time: Some(MicroTime(lease.acquired_at)),
            renew_time: Some(MicroTime(lease.acquired_at)),
            ..Default::default()
        }),
    }
}

fn from_kube_lease(cluster_key: &str, obj: &KubeLease) -> Lease {
    let spec = obj.spec.as_ref();
    let annotation = |key: &str| {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .cloned()
    };

    Lease {
        cluster_key: annotation(CLUSTER_ANNOTATION).unwrap_or_else(|| cluster_key.to_string()),
        holder: spec
            .and_then(|s| s.holder_identity.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        owner: annotation(OWNER_ANNOTATION).unwrap_or_else(|| "unknown".to_string()),
        acquired_at: spec
            .and_then(|s| s.acquire_time.as_ref())
            .map_or_else(chrono::Utc::now, |t| t.0),
        resource_version: obj.metadata.resource_version.clone(),
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn acquire(&self, cluster_key: &str, run_id: &str) -> Result<Lease> {
        let lease = Lease::new(cluster_key, run_id);

        match self
            .api
            .create(&PostParams::default(), &to_kube_lease(&lease))
            .await
        {
            Ok(created) => {
                info!("Acquired lease {} for run {}", lease_name(cluster_key), run_id);
                Ok(Lease {
                    resource_version: created.metadata.resource_version,
                    ..lease
                })
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let held = self
                    .get(cluster_key)
                    .await?
                    .map(|obj| from_kube_lease(cluster_key, &obj));
                debug!("Lease {} already exists", lease_name(cluster_key));
                let (holder, acquired_at) = held
                    .map(|l| (l.holder, l.acquired_at.to_rfc3339()))
                    .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
                Err(AkupError::LeaseConflict {
                    cluster: cluster_key.to_string(),
                    holder,
                    acquired_at,
                }
                .into())
            }
            Err(e) => Err(AkupError::KubernetesApi(format!("create lease: {e}")).into()),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let Some(current) = self.get(&lease.cluster_key).await? else {
            debug!("Lease {} already released", lease.cluster_key);
            return Ok(());
        };
        let current = from_kube_lease(&lease.cluster_key, &current);

        if current.holder != lease.holder {
            return Err(AkupError::LeaseConflict {
                cluster: lease.cluster_key.clone(),
                holder: current.holder,
                acquired_at: current.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: current.resource_version.clone(),
                uid: None,
            }),
            ..Default::default()
        };

        match self.api.delete(&lease_name(&lease.cluster_key), &params).await {
            Ok(_) => {
                info!("Released lease {} held by {}", lease.cluster_key, lease.holder);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(AkupError::LeaseConflict {
                cluster: lease.cluster_key.clone(),
                holder: "changed during release".to_string(),
                acquired_at: current.acquired_at.to_rfc3339(),
            }
            .into()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(AkupError::KubernetesApi(format!("delete lease: {e}")).into()),
        }
    }

    async fn current(&self, cluster_key: &str) -> Result<Option<Lease>> {
        Ok(self
            .get(cluster_key)
            .await?
            .map(|obj| from_kube_lease(cluster_key, &obj)))
    }

    async fn force_release(&self, cluster_key: &str) -> Result<Option<Lease>> {
        let existing = self.current(cluster_key).await?;
        if existing.is_some() {
            match self
                .api
                .delete(&lease_name(cluster_key), &DeleteParams::default())
                .await
            {
                Ok(_) => warn!("Force released lease {}", lease_name(cluster_key)),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(AkupError::KubernetesApi(format!("delete lease: {e}")).into());
                }
            }
        }
        Ok(existing)
    }

    fn name(&self) -> &str {
        "kubernetes"
    }
}
