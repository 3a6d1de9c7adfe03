//! Checkpoints: resumable snapshots of an episode at a phase boundary.
//!
//! A checkpoint carries the phase position, the budget *snapshot*, the
//! partial outputs, and the side-effect ledger. Restoring one never grants
//! fresh budget and never replays side effects: the ledger travels with the
//! snapshot so the resumed episode still knows which targets were touched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::budget::{Budget, BudgetSnapshot};
use crate::episode::{
    Episode, EpisodeId, EpisodeStatus, Phase, PhaseOutputs, RecursionPolicy, SideEffectRecord,
};
use crate::error::CheckpointError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub episode_id: EpisodeId,
    pub client_id: String,
    pub agent_id: String,
    pub goal: String,

    #[serde(default)]
    pub inputs: serde_json::Value,

    pub status: EpisodeStatus,
    pub current_phase: Phase,
    pub depth: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_episode_id: Option<EpisodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_type: Option<String>,

    pub recursion_policy: RecursionPolicy,
    pub budget: BudgetSnapshot,

    #[serde(default)]
    pub outputs: PhaseOutputs,

    #[serde(default)]
    pub side_effects: Vec<SideEffectRecord>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherited_targets: Vec<String>,

    pub created_at: DateTime<Utc>,

    /// Hex SHA-256 over every other field.
    #[serde(default)]
    pub digest: String,
}

impl Checkpoint {
    /// Capture an episode together with a budget snapshot taken by its guard.
    pub fn capture(episode: &Episode, budget: BudgetSnapshot) -> Result<Self, CheckpointError> {
        let mut checkpoint = Self {
            id: Uuid::new_v4().to_string(),
            episode_id: episode.id.clone(),
            client_id: episode.client_id.clone(),
            agent_id: episode.agent_id.clone(),
            goal: episode.goal.clone(),
            inputs: episode.inputs.clone(),
            status: episode.status,
            current_phase: episode.phase,
            depth: episode.depth,
            parent_episode_id: episode.parent_episode_id.clone(),
            child_type: episode.child_type.clone(),
            recursion_policy: episode.recursion_policy.clone(),
            budget,
            outputs: episode.outputs.clone(),
            side_effects: episode.side_effects.clone(),
            inherited_targets: episode.inherited_targets.clone(),
            created_at: Utc::now(),
            digest: String::new(),
        };
        checkpoint.digest = checkpoint.compute_digest()?;
        Ok(checkpoint)
    }

    pub fn compute_digest(&self) -> Result<String, CheckpointError> {
        let mut unsigned = self.clone();
        unsigned.digest.clear();
        let bytes = serde_json::to_vec(&unsigned)
            .map_err(|e| CheckpointError::Storage(format!("serialize checkpoint: {e}")))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Reject a checkpoint whose contents no longer match its digest.
    pub fn verify(&self) -> Result<(), CheckpointError> {
        if self.compute_digest()? != self.digest {
            return Err(CheckpointError::DigestMismatch(self.id.clone()));
        }
        Ok(())
    }

    /// Rebuild the episode in `running` at the saved phase.
    ///
    /// The budget clock is re-based to `now` so time spent while the
    /// checkpoint sat in storage is not charged.
    pub fn restore(&self, now: DateTime<Utc>) -> Result<Episode, CheckpointError> {
        if self.status.is_terminal() {
            return Err(CheckpointError::NotResumable {
                episode_id: self.episode_id.to_string(),
                status: self.status,
            });
        }
        self.verify()?;

        Ok(Episode {
            id: self.episode_id.clone(),
            client_id: self.client_id.clone(),
            agent_id: self.agent_id.clone(),
            goal: self.goal.clone(),
            inputs: self.inputs.clone(),
            status: EpisodeStatus::Running,
            phase: self.current_phase,
            depth: self.depth,
            parent_episode_id: self.parent_episode_id.clone(),
            child_type: self.child_type.clone(),
            budget: Budget::from_snapshot(&self.budget, now),
            recursion_policy: self.recursion_policy.clone(),
            outputs: self.outputs.clone(),
            side_effects: self.side_effects.clone(),
            inherited_targets: self.inherited_targets.clone(),
            summary: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Persistence collaborator for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Returns its id.
    async fn save(&self, checkpoint: Checkpoint) -> Result<String, CheckpointError>;

    async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError>;

    /// All checkpoints, oldest first, optionally for one episode only.
    async fn list(&self, episode_id: Option<&EpisodeId>)
    -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Returns `false` if nothing was stored under `id`.
    async fn delete(&self, id: &str) -> Result<bool, CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running_episode() -> Episode {
        let mut ep = Episode::new("client-1", "agent-1", "draft a post", Budget::new(1_000, 60_000, 10, 2))
            .with_inputs(serde_json::json!({"topic": "launch"}));
        ep.status = EpisodeStatus::Running;
        ep.phase = Phase::Act;
        ep.outputs.insert(Phase::Plan, "plan", serde_json::json!("one step"));
        ep
    }

    #[test]
    fn capture_produces_verifiable_digest() {
        let ep = running_episode();
        let cp = Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap();
        assert_eq!(cp.digest.len(), 64);
        assert!(cp.verify().is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let ep = running_episode();
        let mut cp = Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap();
        cp.budget.tokens.used = 0;
        cp.budget.tokens.max = 1_000_000;
        assert_eq!(cp.verify(), Err(CheckpointError::DigestMismatch(cp.id.clone())));
    }

    #[test]
    fn restore_keeps_identity_phase_and_budget() {
        let mut ep = running_episode();
        ep.budget.tokens.used = 600;
        ep.budget.time_ms.started_at = Utc::now() - Duration::milliseconds(2_000);
        let cp = Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap();

        let now = Utc::now() + Duration::minutes(10);
        let restored = cp.restore(now).unwrap();
        assert_eq!(restored.id, ep.id);
        assert_eq!(restored.status, EpisodeStatus::Running);
        assert_eq!(restored.phase, Phase::Act);
        assert_eq!(restored.budget.tokens.used, 600);
        assert!(restored.budget.time_ms.elapsed_ms(now) >= 2_000);
        assert!(restored.budget.time_ms.elapsed_ms(now) < 3_000);
        assert_eq!(
            restored.outputs.value(Phase::Plan, "plan"),
            Some(&serde_json::json!("one step"))
        );
    }

    #[test]
    fn restore_twice_is_identical() {
        let ep = running_episode();
        let cp = Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap();
        let now = Utc::now();
        assert_eq!(cp.restore(now).unwrap(), cp.restore(now).unwrap());
    }

    #[test]
    fn terminal_checkpoint_is_not_resumable() {
        let mut ep = running_episode();
        ep.status = EpisodeStatus::Completed;
        let cp = Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap();
        assert!(matches!(
            cp.restore(Utc::now()),
            Err(CheckpointError::NotResumable { .. })
        ));
    }

    #[test]
    fn digest_survives_json_roundtrip() {
        let ep = running_episode();
        let cp = Checkpoint::capture(&ep, ep.budget.snapshot(Utc::now())).unwrap();
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert!(back.verify().is_ok());
    }
}
