//! File-based checkpoint store: one JSON document per checkpoint.
//!
//! Storage location: `~/.tether/checkpoints/<checkpoint-id>.json` unless the
//! config points elsewhere. Checkpoints are loaded into memory on creation
//! and written through on every save, so reads never touch the disk. Writes
//! go to a temporary file that is then renamed over the target, which keeps
//! a crash from leaving a half-written checkpoint behind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tether_core::checkpoint::{Checkpoint, CheckpointStore};
use tether_core::episode::EpisodeId;
use tether_core::error::CheckpointError;

const EXTENSION: &str = "json";

pub struct FileCheckpointStore {
    dir: PathBuf,
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl FileCheckpointStore {
    /// Open a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let checkpoints = Self::load_from_disk(&dir);
        debug!(dir = %dir.display(), count = checkpoints.len(), "File checkpoint store loaded");
        Self {
            dir,
            checkpoints: Arc::new(RwLock::new(checkpoints)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_from_disk(dir: &Path) -> HashMap<String, Checkpoint> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return HashMap::new();
        };

        entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|path| {
                let content = std::fs::read_to_string(&path).ok()?;
                match serde_json::from_str::<Checkpoint>(&content) {
                    Ok(cp) => Some((cp.id.clone(), cp)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupted checkpoint");
                        None
                    }
                }
            })
            .collect()
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CheckpointError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(CheckpointError::Storage(format!(
                "invalid checkpoint id: {id:?}"
            )));
        }
        Ok(self.dir.join(format!("{id}.{EXTENSION}")))
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.id)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            CheckpointError::Storage(format!("Failed to create checkpoint directory: {e}"))
        })?;

        let body = serde_json::to_vec_pretty(checkpoint).map_err(|e| {
            CheckpointError::Storage(format!("Failed to serialize checkpoint: {e}"))
        })?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Failed to write checkpoint: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::Storage(format!("Failed to commit checkpoint: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCheckpointStore")
            .field("dir", &self.dir)
            .finish()
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<String, CheckpointError> {
        self.write(&checkpoint).await?;
        let id = checkpoint.id.clone();
        debug!(checkpoint_id = %id, episode_id = %checkpoint.episode_id, "Checkpoint written");
        self.checkpoints.write().await.insert(id.clone(), checkpoint);
        Ok(id)
    }

    async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        self.checkpoints
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    async fn list(
        &self,
        episode_id: Option<&EpisodeId>,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(crate::select(checkpoints.values(), episode_id))
    }

    async fn delete(&self, id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(id)?;
        let removed = self.checkpoints.write().await.remove(id).is_some();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(removed),
            Err(e) => Err(CheckpointError::Storage(format!(
                "Failed to delete checkpoint: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tether_core::budget::Budget;
    use tether_core::episode::{Episode, EpisodeStatus, Phase};

    fn checkpoint() -> Checkpoint {
        let mut ep = Episode::new("client-1", "agent-1", "publish", Budget::new(1_000, 60_000, 10, 2));
        ep.status = EpisodeStatus::Running;
        ep.phase = Phase::Verify;
        Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap()
    }

    #[tokio::test]
    async fn save_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let cp = checkpoint();
        let id = store.save(cp.clone()).await.unwrap();

        assert!(dir.path().join("checkpoints").join(format!("{id}.json")).exists());

        let reopened = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let loaded = reopened.load(&id).await.unwrap();
        assert_eq!(loaded, cp);
        assert!(loaded.verify().is_ok());
        assert_eq!(reopened.list(Some(&cp.episode_id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let id = store.save(checkpoint()).await.unwrap();

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(FileCheckpointStore::new(dir.path()).list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_dir_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("absent"));
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(matches!(
            store.load("nope").await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupted_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(checkpoint()).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();

        let reopened = FileCheckpointStore::new(dir.path());
        assert_eq!(reopened.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut cp = checkpoint();
        cp.id = "../escape".into();
        assert!(matches!(
            store.save(cp).await,
            Err(CheckpointError::Storage(_))
        ));
    }
}
