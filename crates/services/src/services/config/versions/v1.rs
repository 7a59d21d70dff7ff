use executors::executors::claude::ClaudeCode;
use serde::{Deserialize, Serialize};

use crate::services::config::ConfigError;

pub const CONFIG_VERSION: &str = "v1";

fn default_config_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_git_branch_prefix() -> String {
    "taskloom".to_string()
}

fn default_audit_frequency() -> u32 {
    3
}

fn default_loop_threshold() -> usize {
    4
}

fn default_action_history_size() -> usize {
    20
}

fn default_stuck_timeout_secs() -> u64 {
    300
}

fn default_stuck_poll_interval_secs() -> u64 {
    15
}

fn default_compaction_display_secs() -> u64 {
    10
}

fn default_permission_timeout_secs() -> i64 {
    utils::approvals::PERMISSION_TIMEOUT_SECONDS
}

fn default_digest_token_budget() -> usize {
    2000
}

/// Initial allow/deny rule set, seeded idempotently at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSeed {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    /// Namespace every task branch is created under.
    #[serde(default = "default_git_branch_prefix")]
    pub git_branch_prefix: String,
    /// Root for per-repo worktree directories. Defaults to `<asset dir>/worktrees`.
    #[serde(default)]
    pub worktrees_dir: Option<String>,
    /// Raise an audit recommendation after every Nth completed cycle.
    #[serde(default = "default_audit_frequency")]
    pub audit_frequency: u32,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
    #[serde(default = "default_action_history_size")]
    pub action_history_size: usize,
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
    #[serde(default = "default_stuck_poll_interval_secs")]
    pub stuck_poll_interval_secs: u64,
    #[serde(default = "default_compaction_display_secs")]
    pub compaction_display_secs: u64,
    #[serde(default = "default_permission_timeout_secs")]
    pub permission_timeout_secs: i64,
    #[serde(default = "default_digest_token_budget")]
    pub digest_token_budget: usize,
    #[serde(default)]
    pub permissions: PermissionSeed,
    #[serde(default)]
    pub agent: ClaudeCode,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let probe = format!("{}/probe", self.git_branch_prefix);
        if self.git_branch_prefix.trim().is_empty()
            || !git2::Branch::name_is_valid(&probe).unwrap_or(false)
        {
            return Err(ConfigError::ValidationError(format!(
                "git_branch_prefix '{}' is not a valid branch component",
                self.git_branch_prefix
            )));
        }
        if self.loop_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "loop_threshold must be at least 2".to_string(),
            ));
        }
        if self.action_history_size < self.loop_threshold * 2 {
            return Err(ConfigError::ValidationError(
                "action_history_size must hold two full oscillation windows".to_string(),
            ));
        }
        if self.audit_frequency == 0 {
            return Err(ConfigError::ValidationError(
                "audit_frequency must be at least 1".to_string(),
            ));
        }
        if self.permission_timeout_secs <= 0
            || self.stuck_timeout_secs == 0
            || self.stuck_poll_interval_secs == 0
        {
            return Err(ConfigError::ValidationError(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        match serde_json::from_str::<Config>(&raw_config) {
            Ok(config) if config.config_version == CONFIG_VERSION => match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    tracing::warn!("Config invalid: {}, using default", e);
                    Self::default()
                }
            },
            Ok(config) => {
                tracing::warn!(
                    "Unknown config version '{}', using default",
                    config.config_version
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Config parse failed: {}, using default", e);
                Self::default()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            git_branch_prefix: default_git_branch_prefix(),
            worktrees_dir: None,
            audit_frequency: default_audit_frequency(),
            loop_threshold: default_loop_threshold(),
            action_history_size: default_action_history_size(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            stuck_poll_interval_secs: default_stuck_poll_interval_secs(),
            compaction_display_secs: default_compaction_display_secs(),
            permission_timeout_secs: default_permission_timeout_secs(),
            digest_token_budget: default_digest_token_budget(),
            permissions: PermissionSeed::default(),
            agent: ClaudeCode::default(),
        }
    }
}
