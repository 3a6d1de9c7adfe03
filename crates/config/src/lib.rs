//! Configuration loading, validation, and management for tether.
//!
//! Loads configuration from `~/.tether/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tether_core::episode::{Phase, RecursionPolicy, StopCondition};
use tether_core::Budget;

/// The root configuration structure.
///
/// Maps directly to `~/.tether/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tool pipeline settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Default budget for new root episodes
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Minimum viable child budget
    #[serde(default)]
    pub budget_floor: BudgetFloorConfig,

    /// Default recursion policy for root episodes
    #[serde(default)]
    pub recursion: RecursionConfig,

    /// Required outputs per phase
    #[serde(default)]
    pub phases: PhasesConfig,

    /// Checkpoint persistence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Emergency stop
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Used when neither the invocation nor the tool sets a timeout
    #[serde(default = "default_tool_timeout_ms")]
    pub default_tool_timeout_ms: u64,

    /// Concurrent in-flight invocations allowed per client id
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools_per_client: usize,

    /// Consumption ratio at which a wrap-up advisory is raised
    #[serde(default = "default_advisory_threshold")]
    pub advisory_threshold: f64,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_max_concurrent_tools() -> usize {
    8
}
fn default_advisory_threshold() -> f64 {
    0.7
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_tool_timeout_ms: default_tool_timeout_ms(),
            max_concurrent_tools_per_client: default_max_concurrent_tools(),
            advisory_threshold: default_advisory_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// 0 disables token metering
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    #[serde(default = "default_max_time_ms")]
    pub max_time_ms: u64,

    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u64,

    #[serde(default = "default_max_subcalls")]
    pub max_subcalls: u64,
}

fn default_max_tokens() -> u64 {
    100_000
}
fn default_max_time_ms() -> u64 {
    300_000
}
fn default_max_tool_calls() -> u64 {
    50
}
fn default_max_subcalls() -> u64 {
    5
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_time_ms: default_max_time_ms(),
            max_tool_calls: default_max_tool_calls(),
            max_subcalls: default_max_subcalls(),
        }
    }
}

impl BudgetConfig {
    /// A fresh budget whose clock starts now.
    pub fn to_budget(&self) -> Budget {
        Budget::new(
            self.max_tokens,
            self.max_time_ms,
            self.max_tool_calls,
            self.max_subcalls,
        )
    }
}

/// Smallest budget a child may be given. Spawning is refused below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetFloorConfig {
    #[serde(default = "default_floor_tokens")]
    pub tokens: u64,

    #[serde(default = "default_floor_time_ms")]
    pub time_ms: u64,

    #[serde(default = "default_floor_tool_calls")]
    pub tool_calls: u64,
}

fn default_floor_tokens() -> u64 {
    1_000
}
fn default_floor_time_ms() -> u64 {
    5_000
}
fn default_floor_tool_calls() -> u64 {
    2
}

impl Default for BudgetFloorConfig {
    fn default() -> Self {
        Self {
            tokens: default_floor_tokens(),
            time_ms: default_floor_time_ms(),
            tool_calls: default_floor_tool_calls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursionConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_max_children")]
    pub max_children: u32,

    #[serde(default = "default_max_total_episodes")]
    pub max_total_episodes: u32,

    /// Empty allows any type not forbidden
    #[serde(default)]
    pub allowed_child_types: Vec<String>,

    #[serde(default)]
    pub forbidden_child_types: Vec<String>,

    /// Consecutive children without new information before stopping
    #[serde(default = "default_no_new_information_limit")]
    pub no_new_information_limit: u32,

    /// Same failure class this many times in a row stops recursion
    #[serde(default = "default_repeated_failure_limit")]
    pub repeated_failure_limit: u32,

    /// Share of the parent's remaining budget given to a child by default
    #[serde(default = "default_child_fraction")]
    pub default_child_fraction: f64,
}

fn default_max_depth() -> u32 {
    3
}
fn default_max_children() -> u32 {
    5
}
fn default_max_total_episodes() -> u32 {
    20
}
fn default_no_new_information_limit() -> u32 {
    2
}
fn default_repeated_failure_limit() -> u32 {
    3
}
fn default_child_fraction() -> f64 {
    0.25
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_children: default_max_children(),
            max_total_episodes: default_max_total_episodes(),
            allowed_child_types: vec![],
            forbidden_child_types: vec![],
            no_new_information_limit: default_no_new_information_limit(),
            repeated_failure_limit: default_repeated_failure_limit(),
            default_child_fraction: default_child_fraction(),
        }
    }
}

impl RecursionConfig {
    pub fn to_policy(&self) -> RecursionPolicy {
        RecursionPolicy {
            max_depth: self.max_depth,
            max_children: self.max_children,
            max_total_episodes: self.max_total_episodes,
            allowed_child_types: self.allowed_child_types.clone(),
            forbidden_child_types: self.forbidden_child_types.clone(),
            stop_conditions: vec![
                StopCondition::BudgetExhausted,
                StopCondition::DepthExceeded,
                StopCondition::NoNewInformation {
                    consecutive: self.no_new_information_limit,
                },
                StopCondition::RepeatedFailure {
                    threshold: self.repeated_failure_limit,
                },
                StopCondition::PolicyBlocked,
                StopCondition::ObjectiveSatisfied,
            ],
        }
    }
}

/// Output keys each phase must produce before `advance_phase` succeeds.
/// A phase with no keys advances unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasesConfig {
    #[serde(default)]
    pub intake: Vec<String>,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub act: Vec<String>,
    #[serde(default)]
    pub verify: Vec<String>,
    #[serde(default)]
    pub commit: Vec<String>,
}

impl PhasesConfig {
    pub fn required_for(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Intake => &self.intake,
            Phase::Plan => &self.plan,
            Phase::Act => &self.act,
            Phase::Verify => &self.verify,
            Phase::Commit => &self.commit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Defaults to `~/.tether/checkpoints`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// Defaults to `~/.tether/.estop`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// How long a flag-file check is reused before the file is looked at
    /// again. 0 checks on every call.
    #[serde(default = "default_flag_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_flag_poll_interval_ms() -> u64 {
    250
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            file: None,
            poll_interval_ms: default_flag_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.tether/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `TETHER_DEFAULT_TIMEOUT_MS`
    /// - `TETHER_MAX_CONCURRENT_TOOLS`
    /// - `TETHER_LOG_LEVEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup, then re-validate.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TETHER_DEFAULT_TIMEOUT_MS") {
            self.runtime.default_tool_timeout_ms = parse_env("TETHER_DEFAULT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TETHER_MAX_CONCURRENT_TOOLS") {
            self.runtime.max_concurrent_tools_per_client =
                parse_env("TETHER_MAX_CONCURRENT_TOOLS", &v)?;
        }
        if let Some(v) = lookup("TETHER_LOG_LEVEL") {
            self.logging.level = v;
        }
        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tether")
    }

    /// Resolved checkpoint directory for the file backend.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint
            .dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("checkpoints"))
    }

    /// Resolved kill switch flag file.
    pub fn estop_path(&self) -> PathBuf {
        self.kill_switch
            .file
            .clone()
            .unwrap_or_else(|| Self::config_dir().join(".estop"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.default_tool_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.default_tool_timeout_ms must be > 0".into(),
            ));
        }

        if self.runtime.max_concurrent_tools_per_client == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.max_concurrent_tools_per_client must be > 0".into(),
            ));
        }

        let t = self.runtime.advisory_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::ValidationError(
                "runtime.advisory_threshold must be in (0, 1]".into(),
            ));
        }

        let f = self.recursion.default_child_fraction;
        if !(f > 0.0 && f <= 1.0) {
            return Err(ConfigError::ValidationError(
                "recursion.default_child_fraction must be in (0, 1]".into(),
            ));
        }

        self.recursion
            .to_policy()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has invalid value '{value}'")))
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.default_tool_timeout_ms, 30_000);
        assert_eq!(config.recursion.max_depth, 3);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.budget.max_tool_calls, config.budget.max_tool_calls);
        assert_eq!(parsed.recursion.max_children, config.recursion.max_children);
    }

    #[test]
    fn invalid_advisory_threshold_rejected() {
        let mut config = AppConfig::default();
        config.runtime.advisory_threshold = 1.5;
        assert!(config.validate().is_err());
        config.runtime.advisory_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.runtime.max_concurrent_tools_per_client = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_total_episodes_rejected() {
        let mut config = AppConfig::default();
        config.recursion.max_total_episodes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.runtime.max_concurrent_tools_per_client, 8);
        assert_eq!(config.kill_switch.poll_interval_ms, 250);
    }

    #[test]
    fn kill_switch_poll_interval_parses() {
        let config: AppConfig = toml::from_str("[kill_switch]\npoll_interval_ms = 0\n").unwrap();
        assert_eq!(config.kill_switch.poll_interval_ms, 0);

        let config: AppConfig = toml::from_str("[kill_switch]\n").unwrap();
        assert_eq!(config.kill_switch.poll_interval_ms, 250);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[budget]
max_tokens = 5000

[recursion]
forbidden_child_types = ["publish"]

[phases]
plan = ["plan"]

[checkpoint]
backend = "file"
dir = "/var/lib/tether"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.budget.max_tokens, 5000);
        assert_eq!(config.budget.max_tool_calls, 50);
        assert_eq!(config.recursion.forbidden_child_types, vec!["publish"]);
        assert_eq!(config.phases.required_for(Phase::Plan), ["plan".to_string()]);
        assert!(config.phases.required_for(Phase::Act).is_empty());
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/var/lib/tether"));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runtime\nbroken").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TETHER_DEFAULT_TIMEOUT_MS", "1500"),
            ("TETHER_MAX_CONCURRENT_TOOLS", "2"),
            ("TETHER_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runtime.default_tool_timeout_ms, 1500);
        assert_eq!(config.runtime.max_concurrent_tools_per_client, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn bad_env_override_rejected() {
        let mut config = AppConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "TETHER_MAX_CONCURRENT_TOOLS").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn recursion_config_builds_policy() {
        let config = RecursionConfig {
            no_new_information_limit: 4,
            ..RecursionConfig::default()
        };
        let policy = config.to_policy();
        assert_eq!(policy.no_new_information_limit(), Some(4));
        assert_eq!(policy.repeated_failure_threshold(), Some(3));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("default_tool_timeout_ms"));
        assert!(toml_str.contains("30000"));
    }
}
