//! Loadable configuration for the core's own tunables.
//!
//! This intentionally does not cover application-level settings
//! (hypervisor endpoints, cloud credentials, tenant policy) — those
//! are out of scope and belong to the embedding binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub job_manager: JobManagerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub capability: CapabilityConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            job_manager: JobManagerConfig::default(),
            pool: PoolConfig::default(),
            webhook: WebhookConfig::default(),
            capability: CapabilityConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config file: {e}")))?;

        let config: CoreConfig = toml::from_str(&contents)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `HYPERSDK_CORE_CONFIG` if set, falling back to a few
    /// conventional locations, falling back again to built-in defaults.
    pub fn from_env() -> Result<Self, crate::Error> {
        if let Ok(path) = std::env::var("HYPERSDK_CORE_CONFIG") {
            return Self::load(&path);
        }

        for path in ["./config/core.toml", "/etc/hypersdk/core.toml"] {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.job_manager.worker_count == 0 {
            return Err(crate::Error::Config("worker_count must be >= 1".into()));
        }
        if self.job_manager.queue_capacity == 0 {
            return Err(crate::Error::Config("queue_capacity must be >= 1".into()));
        }
        if self.pool.max_connections == 0 {
            return Err(crate::Error::Config("pool.max_connections must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Size of the bounded worker pool.
    pub worker_count: usize,
    /// Upper bound on jobs awaiting a worker before `Submit` fails with `QueueFull`.
    pub queue_capacity: usize,
    /// Progress events are coalesced to at most one per this interval per job.
    #[serde(with = "duration_millis")]
    pub debounce_interval: Duration,
    /// Bounded deadline `Cancel` waits for worker acknowledgement.
    #[serde(with = "duration_millis")]
    pub cancel_deadline: Duration,
    /// How many recently finished jobs to retain for quick lookup after removal from the live map.
    pub recent_jobs_capacity: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            debounce_interval: Duration::from_millis(250),
            cancel_deadline: Duration::from_secs(30),
            recent_jobs_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    pub retry_factor: f64,
    #[serde(with = "duration_millis")]
    pub retry_max_delay: Duration,
    pub default_retry_count: u32,
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_secs(1),
            retry_factor: 2.0,
            retry_max_delay: Duration::from_secs(60),
            default_retry_count: 3,
            default_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    #[serde(with = "duration_millis")]
    pub probe_deadline: Duration,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            probe_deadline: Duration::from_millis(500),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
