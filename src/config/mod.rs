//! Mutable runtime configuration, persisted as `config.json` under the data
//! root. Every field has a default, so a missing or partial file is never an
//! error; unknown keys in the file survive a rewrite.

use crate::{
    constants,
    persistence::{self, DataPaths},
    CosError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Scheduler tick period.
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,

    /// Health-check tick period.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Cap on live agents. Zero is legal and means the scheduler admits
    /// nothing.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,

    /// Per-agent RSS kill threshold.
    #[serde(default = "default_max_process_memory_mb")]
    pub max_process_memory_mb: u64,

    /// Start the scheduler on process boot.
    #[serde(default)]
    pub auto_start: bool,

    #[serde(default = "default_user_tasks_path")]
    pub user_tasks_path: PathBuf,

    #[serde(default = "default_internal_tasks_path")]
    pub internal_tasks_path: PathBuf,

    /// argv template used to spawn agents. `{promptPath}`, `{workspace}`
    /// and `{model}` are substituted literally, never through a shell.
    #[serde(default = "default_agent_command")]
    pub default_agent_command: Vec<String>,

    #[serde(default = "default_graceful_terminate_ms")]
    pub graceful_terminate_ms: u64,

    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,

    /// Per-agent in-memory output tail budget.
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,

    /// Base per-app cooldown after a failed run; scaled by the learning
    /// multiplier.
    #[serde(default = "default_app_cooldown_ms")]
    pub app_cooldown_ms: u64,

    /// Spawn agents inside isolated git worktrees when the task's workspace
    /// is a git repository.
    #[serde(default)]
    pub use_worktrees: bool,

    /// Options this version does not model; preserved on rewrite.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_evaluation_interval_ms() -> u64 {
    constants::DEFAULT_EVALUATION_INTERVAL_MS
}
fn default_health_check_interval_ms() -> u64 {
    constants::DEFAULT_HEALTH_CHECK_INTERVAL_MS
}
fn default_max_concurrent_agents() -> usize {
    constants::DEFAULT_MAX_CONCURRENT_AGENTS
}
fn default_max_process_memory_mb() -> u64 {
    constants::DEFAULT_MAX_PROCESS_MEMORY_MB
}
fn default_user_tasks_path() -> PathBuf {
    PathBuf::from("tasks/user.json")
}
fn default_internal_tasks_path() -> PathBuf {
    PathBuf::from("tasks/internal.json")
}
fn default_agent_command() -> Vec<String> {
    vec![
        "claude".to_string(),
        "--print".to_string(),
        "--model".to_string(),
        "{model}".to_string(),
        "--add-dir".to_string(),
        "{workspace}".to_string(),
        "{promptPath}".to_string(),
    ]
}
fn default_graceful_terminate_ms() -> u64 {
    constants::DEFAULT_GRACEFUL_TERMINATE_MS
}
fn default_shutdown_drain_ms() -> u64 {
    constants::DEFAULT_SHUTDOWN_DRAIN_MS
}
fn default_output_buffer_bytes() -> usize {
    constants::DEFAULT_OUTPUT_BUFFER_BYTES
}
fn default_app_cooldown_ms() -> u64 {
    constants::DEFAULT_APP_COOLDOWN_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: default_evaluation_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_concurrent_agents: default_max_concurrent_agents(),
            max_process_memory_mb: default_max_process_memory_mb(),
            auto_start: false,
            user_tasks_path: default_user_tasks_path(),
            internal_tasks_path: default_internal_tasks_path(),
            default_agent_command: default_agent_command(),
            graceful_terminate_ms: default_graceful_terminate_ms(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
            output_buffer_bytes: default_output_buffer_bytes(),
            app_cooldown_ms: default_app_cooldown_ms(),
            use_worktrees: false,
            extra: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from `config.json`, falling back to defaults for anything
    /// missing. Never fails: an unreadable file degrades to defaults.
    pub async fn load(paths: &DataPaths) -> Self {
        let config: Config = persistence::read_json(&paths.config(), Config::default()).await;
        config
    }

    pub async fn save(&self, paths: &DataPaths) -> Result<()> {
        persistence::write_json(&paths.config(), self).await
    }

    /// Merge a JSON patch into this config, validate, persist, and return
    /// the updated value. Unknown keys are kept, not rejected.
    pub async fn apply_patch(
        &self,
        paths: &DataPaths,
        patch: serde_json::Value,
    ) -> Result<Config> {
        let serde_json::Value::Object(patch) = patch else {
            return Err(CosError::Validation(
                "config patch must be a JSON object".to_string(),
            ));
        };

        let mut merged = serde_json::to_value(self)?;
        let obj = merged
            .as_object_mut()
            .ok_or_else(|| CosError::Validation("config must serialize to an object".into()))?;
        for (key, value) in patch {
            obj.insert(key, value);
        }

        let updated: Config = serde_json::from_value(merged)?;
        updated.validate()?;
        updated.save(paths).await?;
        info!("configuration updated");
        Ok(updated)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_agent_command.is_empty() {
            return Err(CosError::Configuration(
                "defaultAgentCommand must not be empty".to_string(),
            ));
        }
        if self.evaluation_interval_ms == 0 {
            return Err(CosError::Configuration(
                "evaluationIntervalMs must be positive".to_string(),
            ));
        }
        if self.output_buffer_bytes == 0 {
            return Err(CosError::Configuration(
                "outputBufferBytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tasks_path(&self, queue: crate::models::Queue) -> &PathBuf {
        match queue {
            crate::models::Queue::User => &self.user_tasks_path,
            crate::models::Queue::Internal => &self.internal_tasks_path,
        }
    }
}
