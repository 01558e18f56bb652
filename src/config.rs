use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the re-indexing service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the search index (Solr) that provides raw records.
    pub solr_url: String,
    /// Response writer requested from the search index (`wt` parameter).
    pub solr_format: String,
    /// Rows requested per page; zero fetches every remaining record in one page.
    pub page_size: usize,
    /// Record attribute that selects the category of a record.
    pub category_field: String,
    /// Record attribute holding the stable record identifier.
    pub id_field: String,
    /// Record attribute holding nested child records.
    pub children_field: String,
    /// Base URL of the discovery backend.
    pub discovery_url: String,
    /// Discovery environment that owns the target collection.
    pub discovery_environment_id: String,
    /// Discovery collection receiving ingested documents.
    pub discovery_collection_id: String,
    /// Optional basic-auth username for the discovery backend.
    pub discovery_username: Option<String>,
    /// Optional basic-auth password for the discovery backend.
    pub discovery_password: Option<String>,
    /// API version date passed to the discovery backend.
    pub discovery_api_version: String,
    /// Redis connection string for the durable queue store. In-memory store when absent.
    pub redis_url: Option<String>,
    /// Key prefix applied to every queue-store key.
    pub queue_prefix: String,
    /// Number of concurrent workers attached to each queue.
    pub worker_concurrency: usize,
    /// Idle poll interval for workers, in milliseconds.
    pub queue_poll_interval_ms: u64,
    /// Interval between watchdog sweeps, in milliseconds.
    pub watchdog_interval_ms: u64,
    /// Maximum age of an active job's `updated_at` before it is reaped, in milliseconds.
    pub watchdog_stale_threshold_ms: u64,
    /// Consecutive failed record fetches tolerated before a job is dead-lettered.
    pub watchdog_max_fetch_failures: u32,
    /// Longest a job handler may run before it is abandoned, in milliseconds.
    pub job_timeout_ms: u64,
    /// Request timeout for the search-index and discovery clients, in milliseconds.
    pub http_timeout_ms: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            solr_url: load_env("SOLR_URL")?,
            solr_format: load_env_optional("SOLR_FORMAT").unwrap_or_else(|| "json".into()),
            page_size: load_env_parsed("REINDEX_PAGE_SIZE", 100)?,
            category_field: load_env_optional("CATEGORY_FIELD")
                .unwrap_or_else(|| "categoria".into()),
            id_field: load_env_optional("ID_FIELD").unwrap_or_else(|| "id".into()),
            children_field: load_env_optional("CHILDREN_FIELD")
                .unwrap_or_else(|| "_childDocuments_".into()),
            discovery_url: load_env("DISCOVERY_URL")?,
            discovery_environment_id: load_env("DISCOVERY_ENVIRONMENT_ID")?,
            discovery_collection_id: load_env("DISCOVERY_COLLECTION_ID")?,
            discovery_username: load_env_optional("DISCOVERY_USERNAME"),
            discovery_password: load_env_optional("DISCOVERY_PASSWORD"),
            discovery_api_version: load_env_optional("DISCOVERY_API_VERSION")
                .unwrap_or_else(|| "2017-11-07".into()),
            redis_url: load_env_optional("REDIS_URL"),
            queue_prefix: load_env_optional("QUEUE_PREFIX").unwrap_or_else(|| "reindex".into()),
            worker_concurrency: load_env_parsed("WORKER_CONCURRENCY", 2)?,
            queue_poll_interval_ms: load_env_parsed("QUEUE_POLL_INTERVAL_MS", 250)?,
            watchdog_interval_ms: load_env_parsed("WATCHDOG_INTERVAL_MS", 5_000)?,
            watchdog_stale_threshold_ms: load_env_parsed("WATCHDOG_STALE_THRESHOLD_MS", 2_000)?,
            watchdog_max_fetch_failures: load_env_parsed("WATCHDOG_MAX_FETCH_FAILURES", 3)?,
            job_timeout_ms: load_env_parsed("JOB_TIMEOUT_MS", 60_000)?,
            http_timeout_ms: load_env_parsed("HTTP_TIMEOUT_MS", 30_000)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Interval between watchdog sweeps.
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Liveness threshold applied by the watchdog.
    pub fn watchdog_stale_threshold(&self) -> Duration {
        Duration::from_millis(self.watchdog_stale_threshold_ms)
    }

    /// Idle poll interval for queue workers.
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    /// Upper bound on one job handler invocation.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Request timeout for outbound HTTP clients.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_env_parsed<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        solr_url = %config.solr_url,
        discovery_url = %config.discovery_url,
        page_size = config.page_size,
        durable_queue = config.redis_url.is_some(),
        watchdog_interval_ms = config.watchdog_interval_ms,
        watchdog_stale_threshold_ms = config.watchdog_stale_threshold_ms,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Once;

    /// Configuration with every optional value at its default.
    pub(crate) fn sample_config() -> Config {
        Config {
            solr_url: "http://127.0.0.1:8983/solr".into(),
            solr_format: "json".into(),
            page_size: 100,
            category_field: "categoria".into(),
            id_field: "id".into(),
            children_field: "_childDocuments_".into(),
            discovery_url: "http://127.0.0.1:9090".into(),
            discovery_environment_id: "env".into(),
            discovery_collection_id: "docs".into(),
            discovery_username: None,
            discovery_password: None,
            discovery_api_version: "2017-11-07".into(),
            redis_url: None,
            queue_prefix: "reindex".into(),
            worker_concurrency: 2,
            queue_poll_interval_ms: 250,
            watchdog_interval_ms: 5_000,
            watchdog_stale_threshold_ms: 2_000,
            watchdog_max_fetch_failures: 3,
            job_timeout_ms: 60_000,
            http_timeout_ms: 30_000,
            server_port: None,
        }
    }

    /// Install [`sample_config`] in the global cache once per test binary.
    pub(crate) fn ensure_test_config() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = CONFIG.set(sample_config());
        });
    }

    #[test]
    fn durations_reflect_millisecond_fields() {
        let config = sample_config();
        assert_eq!(config.watchdog_interval(), Duration::from_secs(5));
        assert_eq!(config.watchdog_stale_threshold(), Duration::from_secs(2));
        assert_eq!(config.queue_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.job_timeout(), Duration::from_secs(60));
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parsed_values_fall_back_to_default_when_unset() {
        let value: u64 = load_env_parsed("REINDEX_TEST_UNSET_VARIABLE", 42).expect("default");
        assert_eq!(value, 42);
    }
}
