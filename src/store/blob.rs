//! Object-store sink: stages artifacts locally and mirrors them to Azure Blob Storage.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Artifact, ArtifactStore, FileArtifactStore};
use crate::azure::AzCli;

pub struct BlobArtifactStore {
    local: FileArtifactStore,
    az: AzCli,
    account: String,
    container: String,
}

impl BlobArtifactStore {
    pub fn new(state_dir: &Path, az: AzCli, account: String, container: String) -> Self {
        Self {
            local: FileArtifactStore::new(state_dir),
            az,
            account,
            container,
        }
    }

    fn blob_name(run_id: &str, artifact: Artifact) -> String {
        format!("{run_id}/{}", artifact.file_name())
    }
}

#[async_trait]
impl ArtifactStore for BlobArtifactStore {
    async fn put(&self, run_id: &str, artifact: Artifact, body: Vec<u8>) -> Result<()> {
        self.local.put(run_id, artifact, body).await?;

        let file = self.local.path(run_id, artifact);
        let file = file.to_string_lossy();
        let name = Self::blob_name(run_id, artifact);
        self.az
            .query::<serde_json::Value>(
                "storage blob upload",
                &[
                    "storage",
                    "blob",
                    "upload",
                    "--account-name",
                    &self.account,
                    "--container-name",
                    &self.container,
                    "--name",
                    &name,
                    "--file",
                    &file,
                    "--overwrite",
                    "--auth-mode",
                    "login",
                ],
            )
            .await?;

        info!("Uploaded {} to {}/{}", name, self.account, self.container);
        Ok(())
    }

    async fn get(&self, run_id: &str, artifact: Artifact) -> Result<Option<Vec<u8>>> {
        if let Some(body) = self.local.get(run_id, artifact).await? {
            return Ok(Some(body));
        }

        let name = Self::blob_name(run_id, artifact);
        let exists: serde_json::Value = self
            .az
            .query(
                "storage blob exists",
                &[
                    "storage",
                    "blob",
                    "exists",
                    "--account-name",
                    &self.account,
                    "--container-name",
                    &self.container,
                    "--name",
                    &name,
                    "--auth-mode",
                    "login",
                ],
            )
            .await?;
        if exists.get("exists").and_then(serde_json::Value::as_bool) != Some(true) {
            return Ok(None);
        }

        // Download through a staged empty artifact so the directory exists.
        self.local.put(run_id, artifact, Vec::new()).await?;
        let file = self.local.path(run_id, artifact);
        let file = file.to_string_lossy();
        debug!("Downloading {} from {}", name, self.account);
        self.az
            .query::<serde_json::Value>(
                "storage blob download",
                &[
                    "storage",
                    "blob",
                    "download",
                    "--account-name",
                    &self.account,
                    "--container-name",
                    &self.container,
                    "--name",
                    &name,
                    "--file",
                    &file,
                    "--overwrite",
                    "--auth-mode",
                    "login",
                ],
            )
            .await?;

        self.local.get(run_id, artifact).await
    }

    async fn run_ids(&self) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .az
            .query(
                "storage blob list",
                &[
                    "storage",
                    "blob",
                    "list",
                    "--account-name",
                    &self.account,
                    "--container-name",
                    &self.container,
                    "--auth-mode",
                    "login",
                    "--query",
                    "[].name",
                ],
            )
            .await?;

        let mut ids: BTreeSet<String> = names
            .iter()
            .filter_map(|n| n.split_once('/').map(|(id, _)| id.to_string()))
            .collect();
        ids.extend(self.local.run_ids().await?);
        Ok(ids.into_iter().collect())
    }

    fn name(&self) -> &str {
        "blob"
    }
}
