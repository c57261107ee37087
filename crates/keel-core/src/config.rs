//! keel.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-node configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttributeMap, JobSpec, Resources};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub scheduler: SchedulerConfig,
    pub tasks: TasksConfig,
    pub leadership: LeadershipConfig,
    pub maintenance: MaintenanceConfig,
    pub cron: CronConfig,
    pub gc_executor: GcExecutorConfig,
    pub events: EventsConfig,
    /// Hosts served by the loopback resource manager in standalone mode.
    pub hosts: Vec<HostConfig>,
    /// Jobs submitted at startup if nothing is known about them yet.
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cluster_name: String,
    pub data_dir: PathBuf,
    /// Framework name presented to the resource manager.
    pub framework_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "local".to_string(),
            data_dir: PathBuf::from("/var/lib/keel"),
            framework_name: "keel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// How long terminal tasks stay queryable before they are pruned.
    pub retention_secs: u64,
    /// How often the pruner runs.
    pub prune_interval_secs: u64,
    /// Conflicting storage commits retried before giving up.
    pub storage_retry_budget: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            retention_secs: 900,
            prune_interval_secs: 60,
            storage_retry_budget: 3,
        }
    }
}

impl TasksConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadershipConfig {
    /// Upper bound on the resource manager registration handshake.
    pub registration_timeout_ms: u64,
    /// First delay before re-entering candidacy after a failed term.
    pub reelection_backoff_ms: u64,
    /// Cap for the re-election backoff.
    pub max_reelection_backoff_ms: u64,
    /// How long a revoked leader may hold on before its session is expired.
    pub session_timeout_ms: u64,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: 30_000,
            reelection_backoff_ms: 1_000,
            max_reelection_backoff_ms: 60_000,
            session_timeout_ms: 10_000,
        }
    }
}

impl LeadershipConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn reelection_backoff(&self) -> Duration {
        Duration::from_millis(self.reelection_backoff_ms)
    }

    pub fn max_reelection_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reelection_backoff_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub poll_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub tick_interval_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcExecutorConfig {
    /// Path to the GC executor launch script. Unset disables the launcher.
    pub path: Option<String>,
    /// How often each host gets a GC executor run.
    pub interval_secs: u64,
    pub resources: Resources,
}

impl Default for GcExecutorConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_secs: 3_600,
            resources: Resources::new(0.2, 128, 16, 0),
        }
    }
}

impl GcExecutorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Deliveries slower than this are logged as slow subscribers.
    pub slow_subscriber_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            slow_subscriber_ms: 250,
        }
    }
}

/// A host advertised by the loopback resource manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: String,
    pub resources: Resources,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl HostConfig {
    pub fn attribute_map(&self) -> AttributeMap {
        self.attributes
            .iter()
            .map(|(k, v)| (k.clone(), [v.clone()].into_iter().collect()))
            .collect()
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: KeelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.cluster_name.trim().is_empty() {
            return Err(ConfigError::Invalid("scheduler.cluster_name is empty".into()));
        }
        if self.tasks.prune_interval_secs == 0 {
            return Err(ConfigError::Invalid("tasks.prune_interval_secs must be > 0".into()));
        }
        if self.leadership.registration_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "leadership.registration_timeout_ms must be > 0".into(),
            ));
        }
        if self.leadership.reelection_backoff_ms > self.leadership.max_reelection_backoff_ms {
            return Err(ConfigError::Invalid(
                "leadership.reelection_backoff_ms exceeds max_reelection_backoff_ms".into(),
            ));
        }
        if self.cron.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid("cron.tick_interval_secs must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.host.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate host {}", host.host)));
            }
        }
        Ok(())
    }
}
