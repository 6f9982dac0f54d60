use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tracing::warn;

use crate::session::{DurableSessionCache, SessionInfo, StoreError};

#[derive(Clone, Debug)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "mcpgw".to_string(),
        }
    }
}

/// Durable session tier in Redis. Records are JSON strings written with a
/// millisecond expiry (`SET .. PX`), so Redis enforces the absolute lifetime.
///
/// One multiplexed connection is shared between calls. A command that fails
/// on the connection itself drops it, and the next call dials again.
#[derive(Clone)]
pub struct RedisSessionCache {
    client: redis::Client,
    config: RedisStoreConfig,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl RedisSessionCache {
    pub fn new(client: redis::Client, config: RedisStoreConfig) -> Self {
        Self {
            client,
            config,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    pub fn open(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self::new(client, config))
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.config.key_prefix, session_id)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    fn command_failed(&self, err: RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(error = %err, "redis connection lost, reconnecting on next call");
            self.connection.lock().take();
        }
        StoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl DurableSessionCache for RedisSessionCache {
    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>, StoreError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .get(self.session_key(session_id))
            .await
            .map_err(|err| self.command_failed(err))?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, session_id: &str, info: &SessionInfo, ttl: Duration) -> Result<(), StoreError> {
        let payload = serde_json::to_string(info)?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.session_key(session_id))
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_failed(err))?;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_failed(err))?;
        Ok(())
    }
}

fn _assert_send_sync<T: Send + Sync>() {}

#[allow(dead_code)]
fn _assert_redis_types() {
    _assert_send_sync::<RedisSessionCache>();
}
