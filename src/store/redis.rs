//! [`LockStore`] backed by a single Redis server
//!
//! Acquisition is a plain `SET NX PX`. Release and extension must compare the stored token before touching the key,
//! which Redis can only do atomically inside a script.

use std::time::{Duration, Instant};

use redis::{aio::ConnectionManager, Script};
use thiserror::Error;

use super::{config::StoreConfig, endpoint::StoreEndpoint, LockStore, Ownership, StoreError};

const DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXPIRE_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
elseif current == false then
    return 0
else
    return -1
end
"#;

/// Errors associated with connecting to the Redis server.
#[derive(Debug, Error)]
pub enum StoreConnectError {
    #[error(transparent)]
    ParseError(#[from] url::ParseError),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("timed out connecting to {0:?}")]
    TimedOut(StoreEndpoint),
}

/// Redis lease TTLs are whole milliseconds, and zero is rejected by the server.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn deleted_from_reply(reply: i64) -> Result<bool, StoreError> {
    match reply {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StoreError::UnexpectedReply(other)),
    }
}

fn ownership_from_reply(reply: i64) -> Result<Ownership, StoreError> {
    match reply {
        1 => Ok(Ownership::Owned),
        0 => Ok(Ownership::Missing),
        -1 => Ok(Ownership::OtherOwner),
        other => Err(StoreError::UnexpectedReply(other)),
    }
}

/// A multiplexed, auto-reconnecting connection to a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    endpoint: StoreEndpoint,
    delete_script: Script,
    expire_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect and verify the server responds to `PING`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreConnectError> {
        let endpoint = StoreEndpoint::try_from(config.url.as_str())?;

        // keep credentials and db index from a full url
        let url = if config.url.contains("://") {
            config.url.clone()
        } else {
            endpoint.url()
        };

        let client = redis::Client::open(url)?;

        tracing::debug!(endpoint = ?endpoint, "connecting to redis");

        let start = Instant::now();

        let mut conn = tokio::time::timeout(config.connection_timeout, async {
            let mut conn = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        })
        .await
        .map_err(|_| StoreConnectError::TimedOut(endpoint.clone()))??;

        tracing::info!(
            endpoint = ?endpoint,
            msecs = start.elapsed().as_millis() as u64,
            "redis client started"
        );

        match redis::cmd("CLIENT")
            .arg("ID")
            .query_async::<i64>(&mut conn)
            .await
        {
            Ok(id) => tracing::debug!(endpoint = ?endpoint, client_id = id, "redis client info"),
            Err(e) => tracing::debug!(endpoint = ?endpoint, "could not read redis client id: {e}"),
        }

        Ok(Self {
            conn,
            endpoint,
            delete_script: Script::new(DELETE_SCRIPT),
            expire_script: Script::new(EXPIRE_SCRIPT),
        })
    }

    pub fn endpoint(&self) -> &StoreEndpoint {
        &self.endpoint
    }
}

impl LockStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();

        let reply: i64 = self
            .delete_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        deleted_from_reply(reply)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Ownership, StoreError> {
        let mut conn = self.conn.clone();

        let reply: i64 = self
            .expire_script
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        ownership_from_reply(reply)
    }
}
