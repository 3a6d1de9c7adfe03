//! Checkpoint store backends.

pub mod file_backend;
pub mod in_memory;

pub use file_backend::FileCheckpointStore;
pub use in_memory::InMemoryCheckpointStore;

use tether_core::checkpoint::Checkpoint;
use tether_core::episode::EpisodeId;

/// Filter by episode and order oldest first.
pub(crate) fn select<'a>(
    checkpoints: impl Iterator<Item = &'a Checkpoint>,
    episode_id: Option<&EpisodeId>,
) -> Vec<Checkpoint> {
    let mut selected: Vec<Checkpoint> = checkpoints
        .filter(|c| episode_id.is_none_or(|id| &c.episode_id == id))
        .cloned()
        .collect();
    selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    selected
}
