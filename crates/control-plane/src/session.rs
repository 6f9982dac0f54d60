use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Durable record of a session's backend. Serialized as
/// `{"target": "...", "lastUsed": "<rfc3339>"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub target: String,
    pub last_used: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(target: impl Into<String>, last_used: DateTime<Utc>) -> Self {
        Self {
            target: target.into(),
            last_used,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session cache unavailable: {0}")]
    Unavailable(String),
    #[error("malformed session record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid session store config: {0}")]
    InvalidConfig(String),
}

/// Session id -> backend address affinity.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn try_get(&self, session_id: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, session_id: &str, target: &str) -> Result<(), StoreError>;
    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// The authoritative backing tier. Records expire `ttl` after they are written.
#[async_trait]
pub trait DurableSessionCache: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>, StoreError>;
    async fn set(&self, session_id: &str, info: &SessionInfo, ttl: Duration) -> Result<(), StoreError>;
    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

struct StoredRecord {
    payload: String,
    expires_at: DateTime<Utc>,
}

/// Durable tier kept in process memory, for development and tests. Records are
/// stored in their serialized form and honour the absolute expiration.
#[derive(Default)]
pub struct InMemoryDurableCache {
    records: DashMap<String, StoredRecord>,
    reads: AtomicUsize,
}

impl InMemoryDurableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of `get` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.records
            .get(session_id)
            .map(|record| record.expires_at > Utc::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DurableSessionCache for InMemoryDurableCache {
    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let live = match self.records.get(session_id) {
            Some(record) if record.expires_at > now => Some(record.payload.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        let Some(payload) = live else {
            self.records
                .remove_if(session_id, |_, record| record.expires_at <= now);
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&payload)?))
    }

    async fn set(&self, session_id: &str, info: &SessionInfo, ttl: Duration) -> Result<(), StoreError> {
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        let record = StoredRecord {
            payload: serde_json::to_string(info)?,
            expires_at: Utc::now() + ttl,
        };
        self.records.insert(session_id.to_string(), record);
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.records.remove(session_id);
        Ok(())
    }
}
