//! Checkpoint store selection and resume.

use std::sync::Arc;
use tracing::info;

use tether_config::{AppConfig, CheckpointBackend};
use tether_core::checkpoint::CheckpointStore;
use tether_core::episode::EpisodeId;
use tether_core::error::CheckpointError;
use tether_security::KillSwitch;
use tether_store::{FileCheckpointStore, InMemoryCheckpointStore};
use tether_tools::ToolWrapper;

use crate::machine::EpisodeMachine;

/// Open the checkpoint store the configuration asks for.
pub fn open_checkpoint_store(config: &AppConfig) -> Arc<dyn CheckpointStore> {
    match config.checkpoint.backend {
        CheckpointBackend::Memory => {
            info!(backend = "memory", "Checkpoint store opened");
            Arc::new(InMemoryCheckpointStore::new())
        }
        CheckpointBackend::File => {
            let dir = config.checkpoint_dir();
            info!(backend = "file", dir = %dir.display(), "Checkpoint store opened");
            Arc::new(FileCheckpointStore::new(dir))
        }
    }
}

/// Load a checkpoint by id and rebuild its episode.
///
/// Loading the same checkpoint twice yields two machines with identical
/// starting state. Side effects recorded in the checkpoint are carried as
/// a ledger, never replayed.
pub async fn load_and_resume(
    store: &dyn CheckpointStore,
    checkpoint_id: &str,
    wrapper: Arc<ToolWrapper>,
    kill_switch: Arc<KillSwitch>,
) -> Result<EpisodeMachine, CheckpointError> {
    let checkpoint = store.load(checkpoint_id).await?;
    EpisodeMachine::resume(&checkpoint, wrapper, kill_switch)
}

/// Most recent checkpoint of an episode, if any.
pub async fn latest_checkpoint_id(
    store: &dyn CheckpointStore,
    episode_id: &EpisodeId,
) -> Result<Option<String>, CheckpointError> {
    let checkpoints = store.list(Some(episode_id)).await?;
    Ok(checkpoints.last().map(|cp| cp.id.clone()))
}
