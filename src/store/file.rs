use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{Artifact, ArtifactStore};
use crate::error::AkupError;

/// Stores artifacts under `<state-dir>/runs/<run-id>/`.
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("runs"),
        }
    }

    pub fn path(&self, run_id: &str, artifact: Artifact) -> PathBuf {
        self.root.join(run_id).join(artifact.file_name())
    }
}

/// Temp file beside `target`, unique per writer.
fn temp_path(target: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn put(&self, run_id: &str, artifact: Artifact, body: Vec<u8>) -> Result<()> {
        let dir = self.root.join(run_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("create {}: {e}", dir.display())))?;

        let target = self.path(run_id, artifact);
        let tmp = temp_path(&target);

        fs::write(&tmp, &body)
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("write {}: {e}", tmp.display())))?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(AkupError::ArtifactStore(format!("rename {}: {e}", target.display())).into());
        }

        debug!("Saved {}", target.display());
        Ok(())
    }

    async fn get(&self, run_id: &str, artifact: Artifact) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(run_id, artifact)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AkupError::ArtifactStore(format!("read {run_id}: {e}")).into()),
        }
    }

    async fn run_ids(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AkupError::ArtifactStore(format!("list runs: {e}")).into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AkupError::ArtifactStore(format!("list runs: {e}")))?
        {
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn name(&self) -> &str {
        "file"
    }
}
