//! Configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model client settings for worker processes
    pub llm: LlmConfig,

    /// Execution engine knobs
    pub runner: RunnerConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// An explicitly given path must load or the call fails. Otherwise
    /// the first readable candidate from [`Config::search_paths`] wins,
    /// and a workspace without any config file runs on defaults.
    pub fn load(explicit: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::read_file(path);
        }

        for candidate in Self::search_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::read_file(&candidate) {
                Ok(config) => {
                    debug!(path = %candidate.display(), "Config loaded");
                    return Ok(config);
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Skipping unreadable config");
                }
            }
        }

        debug!("No config file found; using built-in defaults");
        Ok(Self::default())
    }

    /// Candidate config locations, nearest first: the working directory,
    /// then the user config directory.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".jobrunner.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("jobrunner").join("jobrunner.yml"));
        }
        paths
    }

    fn read_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .wrap_err_with(|| format!("cannot parse config file {}", path.display()))
    }
}

/// Settings a worker process uses to construct model clients when none
/// were registered at submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LlmConfig {
    /// Inference service the default model routes through
    pub service: String,

    /// Default model identifier
    pub model: String,

    /// Environment variable holding the service API key
    pub api_key_env: String,

    /// Endpoint override; the service's public endpoint when absent
    pub base_url: Option<String>,

    /// Response token ceiling
    pub max_tokens: u32,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            service: "anthropic".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: 4096,
            request_timeout_ms: 300_000,
        }
    }
}

/// Execution engine knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// Worker pool size
    pub max_workers: usize,

    /// Tasks rendered per batch
    pub render_batch_size: usize,

    /// Seconds an idle worker waits in one long-poll
    pub idle_timeout_secs: u64,

    /// Seconds between worker heartbeats (distributed mode)
    pub heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before a worker is considered dead
    pub dead_worker_timeout_secs: u64,

    /// Seconds before an in-flight task is considered stale
    pub stale_task_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: 32,
            render_batch_size: 1000,
            idle_timeout_secs: 30,
            heartbeat_interval_secs: 10,
            dead_worker_timeout_secs: 60,
            stale_task_timeout_secs: 300,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite store; in-memory storage when absent
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.llm.service, "anthropic");
        assert!(config.llm.base_url.is_none());
        assert_eq!(config.runner.max_workers, 32);
        assert_eq!(config.runner.render_batch_size, 1000);
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn test_search_paths_start_local() {
        let paths = Config::search_paths();
        assert_eq!(paths[0], PathBuf::from(".jobrunner.yml"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
llm:
  model: claude-3-5-sonnet-20241022
  max-tokens: 2048
runner:
  max-workers: 8
  dead-worker-timeout-secs: 30
storage:
  path: /tmp/jobs.db
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "claude-3-5-sonnet-20241022");
        assert_eq!(config.llm.max_tokens, 2048);
        assert_eq!(config.runner.max_workers, 8);
        assert_eq!(config.runner.dead_worker_timeout_secs, 30);
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/jobs.db")));
        // Unspecified fields keep defaults
        assert_eq!(config.runner.render_batch_size, 1000);
        assert_eq!(config.llm.service, "anthropic");
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let missing = PathBuf::from("/definitely/not/here.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
