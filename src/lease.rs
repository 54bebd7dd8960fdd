//! Cluster-wide run lease.
//!
//! The lease is the only shared mutable resource: at most one live run per
//! cluster key. Stores must implement `acquire` as an atomic compare-and-set.

pub mod file;
pub mod kubernetes;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutual-exclusion record keyed by cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub cluster_key: String,
    /// Run id holding the lease.
    pub holder: String,
    /// `user@host` of the orchestrator that acquired it.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// Store-specific version used for conditional release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl Lease {
    pub fn new(cluster_key: &str, holder: &str) -> Self {
        Self {
            cluster_key: cluster_key.to_string(),
            holder: holder.to_string(),
            owner: local_owner(),
            acquired_at: Utc::now(),
            resource_version: None,
        }
    }
}

/// Identity recorded on leases this process takes.
fn local_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease for `cluster_key` on behalf of `run_id`.
    ///
    /// Fails with `AkupError::LeaseConflict` when any holder exists.
    async fn acquire(&self, cluster_key: &str, run_id: &str) -> Result<Lease>;

    /// Release a lease only if it is still held by `lease.holder`.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Current holder, if any.
    async fn current(&self, cluster_key: &str) -> Result<Option<Lease>>;

    /// Remove the lease regardless of holder, returning what was removed.
    async fn force_release(&self, cluster_key: &str) -> Result<Option<Lease>>;

    fn name(&self) -> &str;
}
