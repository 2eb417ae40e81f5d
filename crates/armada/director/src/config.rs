//! Configuration for the director

use armada_lock::LockSettings;
use armada_update::{UpdateSettings, DEFAULT_MAX_TASKS, MAX_ATTACH_DISK_TRIES};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main director configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorConfig {
    /// Deployment lock timing
    #[serde(default)]
    pub lock: LockSettings,

    /// Agent RPC behaviour
    #[serde(default)]
    pub agent: AgentConfig,

    /// Instance update behaviour
    #[serde(default)]
    pub update: UpdateSection,

    /// Deletion of unneeded VMs and instances
    #[serde(default)]
    pub deleter: DeleterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Retries of `get_state` and `get_task` after a timeout
    #[serde(default = "default_agent_retries")]
    pub retries: u32,

    /// Interval between polls of a running agent task, in milliseconds
    #[serde(default = "default_task_poll_interval")]
    pub task_poll_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retries: default_agent_retries(),
            task_poll_interval_ms: default_task_poll_interval(),
        }
    }
}

/// Instance update configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSection {
    /// Ignore runtime errors from agents that predate the `start` call
    #[serde(default = "default_true")]
    pub tolerate_missing_start: bool,

    /// Retries of a VM recreate when its disk does not fit
    #[serde(default = "default_attach_disk_tries")]
    pub max_attach_disk_tries: u32,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            tolerate_missing_start: true,
            max_attach_disk_tries: default_attach_disk_tries(),
        }
    }
}

/// Deleter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleterConfig {
    /// Concurrent deletions, also used for VM creation outside job rollouts
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for DeleterConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_agent_retries() -> u32 {
    3
}

fn default_task_poll_interval() -> u64 {
    1000
}

fn default_attach_disk_tries() -> u32 {
    MAX_ATTACH_DISK_TRIES
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_TASKS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DirectorConfig {
    /// Load configuration: defaults, then the optional file, then `ARMADA_`
    /// environment variables (`ARMADA_LOCK__LEASE_MS=30000`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DirectorConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ARMADA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Settings handed to every update stage
    pub fn update_settings(&self) -> UpdateSettings {
        UpdateSettings {
            tolerate_missing_start: self.update.tolerate_missing_start,
            max_attach_disk_tries: self.update.max_attach_disk_tries,
            task_poll_interval: Duration::from_millis(self.agent.task_poll_interval_ms),
            max_in_flight: self.deleter.max_in_flight.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DirectorConfig::default();
        assert_eq!(config.lock, LockSettings::default());
        assert_eq!(config.agent.retries, 3);
        assert!(config.update.tolerate_missing_start);
        assert_eq!(config.deleter.max_in_flight, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_update_settings_follow_sections() {
        let mut config = DirectorConfig::default();
        config.agent.task_poll_interval_ms = 250;
        config.update.tolerate_missing_start = false;
        config.deleter.max_in_flight = 0;

        let settings = config.update_settings();
        assert_eq!(settings.task_poll_interval, Duration::from_millis(250));
        assert!(!settings.tolerate_missing_start);
        assert_eq!(settings.max_attach_disk_tries, 3);
        assert_eq!(settings.max_in_flight, 1);
    }

    #[test]
    fn test_load_without_file_gives_defaults() {
        let config = DirectorConfig::load(None).unwrap();
        assert_eq!(config.lock, LockSettings::default());
        assert_eq!(config.update, UpdateSection::default());
    }

    #[test]
    fn test_load_reads_sections_from_file() {
        let path = std::env::temp_dir().join(format!("armada-director-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"lock": {"timeout_ms": 2000}, "update": {"tolerate_missing_start": false},
                "logging": {"json": true}}"#,
        )
        .unwrap();

        let config = DirectorConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.lock.timeout_ms, 2000);
        assert_eq!(config.lock.lease_ms, LockSettings::default().lease_ms);
        assert!(!config.update.tolerate_missing_start);
        assert!(config.logging.json);
        assert_eq!(config.agent, AgentConfig::default());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let config = DirectorConfig::load(Some("/nonexistent/armada")).unwrap();
        assert_eq!(config, DirectorConfig::default());
    }
}
