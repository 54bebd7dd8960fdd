//! Lease store backed by the local state directory.
//!
//! Acquisition relies on `create_new`, which the filesystem performs atomically.
//! Release first renames the lease file aside, so only one caller can take a
//! given record; a record taken by the wrong caller is linked back in place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{Lease, LeaseStore};
use crate::error::AkupError;

pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("leases"),
        }
    }

    fn path(&self, cluster_key: &str) -> PathBuf {
        self.dir.join(format!("{cluster_key}.json"))
    }

    /// Unique name to move a lease aside before inspecting it.
    fn tombstone(&self, cluster_key: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{cluster_key}.{}.{seq}.released", std::process::id()))
    }

    /// Move the current lease file aside. `None` when no lease exists.
    async fn take(&self, cluster_key: &str) -> Result<Option<(PathBuf, Lease)>> {
        let tombstone = self.tombstone(cluster_key);
        match fs::rename(self.path(cluster_key), &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AkupError::ArtifactStore(format!("move lease: {e}")).into()),
        }
        let lease = Self::parse(cluster_key, fs::read_to_string(&tombstone).await.ok());
        Ok(Some((tombstone, lease)))
    }

    async fn discard(tombstone: &Path) -> Result<()> {
        fs::remove_file(tombstone)
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("remove lease: {e}")).into())
    }

    fn parse(cluster_key: &str, content: Option<String>) -> Lease {
        content
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_else(|| Lease {
                cluster_key: cluster_key.to_string(),
                holder: "unknown".to_string(),
                owner: "unknown".to_string(),
                acquired_at: chrono::Utc::now(),
                resource_version: None,
            })
    }

    async fn read(&self, cluster_key: &str) -> Result<Option<Lease>> {
        match fs::read_to_string(self.path(cluster_key)).await {
            Ok(content) => {
                if serde_json::from_str::<Lease>(&content).is_err() {
                    // A writer may still be filling in the record.
                    warn!("Unreadable lease file for {}", cluster_key);
                }
                Ok(Some(Self::parse(cluster_key, Some(content))))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AkupError::ArtifactStore(format!("read lease: {e}")).into()),
        }
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn acquire(&self, cluster_key: &str, run_id: &str) -> Result<Lease> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("create {}: {e}", self.dir.display())))?;

        let path = self.path(cluster_key);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        let mut file = match file {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let held = self.read(cluster_key).await?;
                let (holder, acquired_at) = held
                    .map(|l| (l.holder, l.acquired_at.to_rfc3339()))
                    .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
                return Err(AkupError::LeaseConflict {
                    cluster: cluster_key.to_string(),
                    holder,
                    acquired_at,
                }
                .into());
            }
            Err(e) => {
                return Err(AkupError::ArtifactStore(format!("create lease: {e}")).into());
            }
        };

        let lease = Lease::new(cluster_key, run_id);
        let body = serde_json::to_vec_pretty(&lease)?;
        file.write_all(&body)
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("write lease: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("sync lease: {e}")))?;

        info!("Acquired lease {} for run {}", cluster_key, run_id);
        Ok(lease)
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let Some((tombstone, current)) = self.take(&lease.cluster_key).await? else {
            debug!("Lease {} already released", lease.cluster_key);
            return Ok(());
        };

        if current.holder == lease.holder {
            Self::discard(&tombstone).await?;
            info!("Released lease {} held by {}", lease.cluster_key, lease.holder);
            return Ok(());
        }

        // Not ours. Put it back unless a new holder already took the slot.
        match fs::hard_link(&tombstone, self.path(&lease.cluster_key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => warn!(
                "Lease {} of run {} was replaced while releasing for {}",
                lease.cluster_key, current.holder, lease.holder
            ),
            Err(e) => warn!("Could not restore lease {}: {}", lease.cluster_key, e),
        }
        Self::discard(&tombstone).await?;

        Err(AkupError::LeaseConflict {
            cluster: lease.cluster_key.clone(),
            holder: current.holder,
            acquired_at: current.acquired_at.to_rfc3339(),
        }
        .into())
    }

    async fn current(&self, cluster_key: &str) -> Result<Option<Lease>> {
        self.read(cluster_key).await
    }

    async fn force_release(&self, cluster_key: &str) -> Result<Option<Lease>> {
        let Some((tombstone, existing)) = self.take(cluster_key).await? else {
            return Ok(None);
        };
        Self::discard(&tombstone).await?;
        warn!("Force released lease {} held by {}", cluster_key, existing.holder);
        Ok(Some(existing))
    }

    fn name(&self) -> &str {
        "file"
    }
}
