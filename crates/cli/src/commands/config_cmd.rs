//! `tether config`: configuration management commands.

use std::path::{Path, PathBuf};

use tether_config::{AppConfig, CheckpointBackend};

pub fn default_path() -> PathBuf {
    AppConfig::config_dir().join("config.toml")
}

/// Non-fatal findings about an otherwise valid config.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.checkpoint.backend == CheckpointBackend::Memory {
        warnings.push("Checkpoint backend is 'memory'; checkpoints are lost on exit".to_string());
    }

    let child_calls = (config.budget.max_tool_calls as f64
        * config.recursion.default_child_fraction.min(0.5)) as u64;
    if config.budget_floor.tool_calls > child_calls {
        warnings.push(format!(
            "budget_floor.tool_calls ({}) exceeds a default child's share ({child_calls}); children will be refused",
            config.budget_floor.tool_calls
        ));
    }

    if config.budget.max_subcalls == 0 {
        warnings.push("budget.max_subcalls is 0; episodes can never spawn children".to_string());
    }

    if config.recursion.max_depth == 0 {
        warnings.push("recursion.max_depth is 0; recursion is disabled".to_string());
    }

    warnings
}

pub async fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration at {}...", path.display());

    if !path.exists() {
        println!("   ℹ️  No config file; defaults are in effect");
    }

    match AppConfig::load_from(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let warnings = warnings(&config);
            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Timeout:      {} ms", config.runtime.default_tool_timeout_ms);
            println!(
                "   Concurrency:  {} per client",
                config.runtime.max_concurrent_tools_per_client
            );
            println!(
                "   Budget:       {} tokens, {} ms, {} tool calls, {} subcalls",
                config.budget.max_tokens,
                config.budget.max_time_ms,
                config.budget.max_tool_calls,
                config.budget.max_subcalls
            );
            println!(
                "   Recursion:    depth {}, {} children, {} episodes",
                config.recursion.max_depth,
                config.recursion.max_children,
                config.recursion.max_total_episodes
            );
            println!("   Checkpoints:  {:?}", config.checkpoint.backend);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(explicit: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(default_path);
    println!("{}", path.display());
    Ok(())
}
