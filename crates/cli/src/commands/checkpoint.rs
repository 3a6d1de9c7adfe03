//! `tether checkpoint`: inspect stored episode checkpoints.

use tether_agent::open_checkpoint_store;
use tether_config::{AppConfig, CheckpointBackend};
use tether_core::episode::EpisodeId;

fn warn_if_memory(config: &AppConfig) {
    if config.checkpoint.backend == CheckpointBackend::Memory {
        println!("ℹ️  Checkpoint backend is 'memory'; nothing persists between runs.");
        println!("   Set [checkpoint] backend = \"file\" to inspect saved checkpoints.");
        println!();
    }
}

pub async fn list(
    config: &AppConfig,
    episode_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    warn_if_memory(config);
    let store = open_checkpoint_store(config);
    let episode_id = episode_id.map(EpisodeId);
    let checkpoints = store.list(episode_id.as_ref()).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints found.");
        return Ok(());
    }

    println!("📦 {} checkpoint(s):", checkpoints.len());
    for cp in &checkpoints {
        println!(
            "   {}  episode={}  phase={}  depth={}  tool_calls={}/{}  {}",
            cp.id,
            cp.episode_id,
            cp.current_phase,
            cp.depth,
            cp.budget.tool_calls.used,
            cp.budget.tool_calls.max,
            cp.created_at.to_rfc3339()
        );
    }
    Ok(())
}

pub async fn show(config: &AppConfig, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    warn_if_memory(config);
    let store = open_checkpoint_store(config);
    let checkpoint = store.load(id).await?;

    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    println!();
    match checkpoint.verify() {
        Ok(()) => println!("✅ Digest verified"),
        Err(e) => println!("❌ {e}"),
    }
    Ok(())
}
