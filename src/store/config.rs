//! Configuration options for the lock store connection

use std::time::Duration;

use crate::config::LockClientConfig;

/// Configuration for the Redis connection backing the lock store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis endpoint, either a `redis://` url or a bare `host:port`.
    pub url: String,
    /// Timeout to establish the initial connection.
    pub connection_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://0.0.0.0:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&LockClientConfig> for StoreConfig {
    fn from(value: &LockClientConfig) -> Self {
        Self {
            url: value.redis_url.clone(),
            connection_timeout: value.connection_timeout,
        }
    }
}
