use serde::Deserialize;
use std::time::Duration;

/// All tuning values of the engine. Every duration and threshold is
/// operational configuration, populated from `ET_*` environment variables
/// with the defaults below.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_esi_base_url")]
    pub esi_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_min_backoff_ms")]
    pub retry_min_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,

    #[serde(default = "default_fresh_max_age_secs")]
    pub fresh_max_age_secs: u64,
    #[serde(default = "default_stale_max_age_secs")]
    pub stale_max_age_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_route_compute_timeout_ms")]
    pub route_compute_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_esi_base_url() -> String {
    "https://esi.evetech.net/latest".to_string()
}

fn default_user_agent() -> String {
    "eve-trade-router/0.1".to_string()
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_min_backoff_ms() -> u64 {
    100
}

fn default_retry_max_backoff_ms() -> u64 {
    10_000
}

fn default_error_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_fresh_max_age_secs() -> u64 {
    300
}

fn default_stale_max_age_secs() -> u64 {
    1_800
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_worker_count() -> usize {
    8
}

fn default_queue_depth() -> usize {
    64
}

fn default_overall_timeout_ms() -> u64 {
    30_000
}

fn default_fetch_timeout_ms() -> u64 {
    20_000
}

fn default_task_timeout_ms() -> u64 {
    10_000
}

fn default_route_compute_timeout_ms() -> u64 {
    250
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        // serde fills every field from the default functions
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ET_").from_env()
    }

    pub fn fresh_max_age(&self) -> Duration {
        Duration::from_secs(self.fresh_max_age_secs)
    }

    pub fn stale_max_age(&self) -> Duration {
        Duration::from_secs(self.stale_max_age_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.retry_min_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn route_compute_timeout(&self) -> Duration {
        Duration::from_millis(self.route_compute_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
