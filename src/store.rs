//! Artifact persistence for run records, snapshots and reports.

pub mod blob;
pub mod file;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::cluster::ClusterHealthSnapshot;
use crate::error::AkupError;
use crate::report::ValidationReport;
use crate::upgrade::UpgradeRun;

pub use blob::BlobArtifactStore;
pub use file::FileArtifactStore;

/// Named artifact within a run directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Run,
    PreSnapshot,
    PostSnapshot,
    PreflightReport,
    PostValidationReport,
}

impl Artifact {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Run => "run.json",
            Self::PreSnapshot => "pre-snapshot.json",
            Self::PostSnapshot => "post-snapshot.json",
            Self::PreflightReport => "preflight-report.json",
            Self::PostValidationReport => "post-validation-report.json",
        }
    }
}

/// Pluggable artifact sink. Each `put` replaces the artifact atomically.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, run_id: &str, artifact: Artifact, body: Vec<u8>) -> Result<()>;

    async fn get(&self, run_id: &str, artifact: Artifact) -> Result<Option<Vec<u8>>>;

    /// All known run ids.
    async fn run_ids(&self) -> Result<Vec<String>>;

    fn name(&self) -> &str;

    /// Persist the run record. Plan, lease and snapshot land in one atomic write.
    async fn save_run(&self, run: &UpgradeRun) -> Result<()> {
        let body = serde_json::to_vec_pretty(&run.record())?;
        self.put(run.id(), Artifact::Run, body).await
    }

    async fn load_run(&self, run_id: &str) -> Result<UpgradeRun> {
        let body = self
            .get(run_id, Artifact::Run)
            .await?
            .ok_or_else(|| AkupError::RunNotFound(run_id.to_string()))?;
        serde_json::from_slice(&body).with_context(|| format!("Corrupt run record for {run_id}"))
    }

    async fn save_snapshot(
        &self,
        run_id: &str,
        artifact: Artifact,
        snapshot: &ClusterHealthSnapshot,
    ) -> Result<()> {
        self.put(run_id, artifact, serde_json::to_vec_pretty(snapshot)?)
            .await
    }

    async fn save_report(
        &self,
        run_id: &str,
        artifact: Artifact,
        report: &ValidationReport,
    ) -> Result<()> {
        self.put(run_id, artifact, serde_json::to_vec_pretty(report)?)
            .await
    }

    /// Most recent run for a cluster key. Run ids sort by their timestamp suffix.
    async fn latest_run(&self, cluster_key: &str) -> Result<Option<UpgradeRun>> {
        let prefix = format!("{cluster_key}-");
        let latest = self
            .run_ids()
            .await?
            .into_iter()
            .filter(|id| id.starts_with(&prefix))
            .max();

        match latest {
            Some(id) => Ok(Some(self.load_run(&id).await?)),
            None => Ok(None),
        }
    }
}
