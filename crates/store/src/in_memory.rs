//! In-memory checkpoint store, for tests and ephemeral runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use tether_core::checkpoint::{Checkpoint, CheckpointStore};
use tether_core::episode::EpisodeId;
use tether_core::error::CheckpointError;

#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<String, CheckpointError> {
        let id = checkpoint.id.clone();
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
        Ok(self.checkpoints.write().await.remove(id).is_some())
    }
}
