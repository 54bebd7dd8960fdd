use anyhow::Result;
use async_trait::async_trait;

use super::types::{ClusterHealthSnapshot, ExtendedHealth};

/// Read-only access to node, pool and workload state of one cluster.
///
/// Every call is side-effect-free and may be retried.
#[async_trait]
pub trait ClusterQuery: Send + Sync {
    /// Capture a full health snapshot.
    async fn capture(&self) -> Result<ClusterHealthSnapshot>;

    /// Snapshot for progress polling: versions, provisioning and nodes.
    /// Quota, workload, PDB and deprecated-API fields may be left empty.
    async fn sample(&self) -> Result<ClusterHealthSnapshot> {
        self.capture().await
    }

    /// Query the optional post-upgrade signals (DNS, storage, routes, certificates).
    async fn extended_health(&self) -> Result<ExtendedHealth>;
}
