use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::{DurableSessionCache, SessionInfo, SessionStore, StoreError};

#[derive(Clone, Debug)]
pub struct SessionStoreConfig {
    /// Lifetime of a session, fixed when it is written to the durable tier.
    pub absolute_expiration: Duration,
    /// Idle time after which the local copy is dropped.
    pub sliding_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            absolute_expiration: Duration::from_secs(12 * 60 * 60),
            sliding_window: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

struct LocalEntry {
    info: SessionInfo,
    expires_at: DateTime<Utc>,
}

/// Two-tier session store: a process-local map in front of a durable cache.
///
/// The local tier only ever mirrors durable records. It is filled on `set` and
/// on durable hits, and each entry remembers the absolute expiry of the record
/// it mirrors, so a local hit can never outlive the session itself. Idle local
/// entries are dropped by [`NearSessionStore::sweep`]; the next read goes back
/// to the durable tier.
///
/// Every `remove` bumps a removal epoch once the durable delete is done. A
/// local insert that raced a removal sees the epoch move and retracts itself,
/// so a removed session never reappears in the local tier.
pub struct NearSessionStore {
    durable: Arc<dyn DurableSessionCache>,
    local: DashMap<String, LocalEntry>,
    removals: AtomicU64,
    config: SessionStoreConfig,
    absolute: TimeDelta,
    sliding: TimeDelta,
}

impl NearSessionStore {
    pub fn new(
        durable: Arc<dyn DurableSessionCache>,
        config: SessionStoreConfig,
    ) -> Result<Self, StoreError> {
        let absolute = positive_delta("absolute expiration", config.absolute_expiration)?;
        let sliding = positive_delta("sliding window", config.sliding_window)?;
        if config.sweep_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            durable,
            local: DashMap::new(),
            removals: AtomicU64::new(0),
            config,
            absolute,
            sliding,
        })
    }

    pub fn shared(
        durable: Arc<dyn DurableSessionCache>,
        config: SessionStoreConfig,
    ) -> Result<Arc<Self>, StoreError> {
        Self::new(durable, config).map(Arc::new)
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn is_cached_locally(&self, session_id: &str) -> bool {
        self.local.contains_key(session_id)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drops local entries idle for longer than the sliding window, or whose
    /// durable record has expired, as of `now`. Returns how many were dropped.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.local.len();
        self.local.retain(|_, entry| {
            now - entry.info.last_used <= self.sliding && entry.expires_at > now
        });
        before.saturating_sub(self.local.len())
    }

    fn cache_locally(&self, session_id: &str, entry: LocalEntry, epoch: u64) {
        let expires_at = entry.expires_at;
        self.local.insert(session_id.to_string(), entry);
        if self.removals.load(Ordering::SeqCst) != epoch {
            self.local
                .remove_if(session_id, |_, entry| entry.expires_at == expires_at);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move { store.run_sweeper(cancel).await })
    }

    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!("start cleaning up local session cache");
                    let evicted = self.sweep();
                    info!(evicted, remaining = self.local.len(), "finished cleaning up local session cache");
                }
                _ = cancel.cancelled() => break,
            }
        }
        debug!("session sweeper stopped");
    }
}

#[async_trait]
impl SessionStore for NearSessionStore {
    async fn try_get(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let stale = match self.local.get_mut(session_id) {
            Some(mut entry) if entry.expires_at > now => {
                entry.info.last_used = now;
                return Ok(Some(entry.info.target.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.local
                .remove_if(session_id, |_, entry| entry.expires_at <= now);
            return Ok(None);
        }

        let epoch = self.removals.load(Ordering::SeqCst);
        let Some(record) = self.durable.get(session_id).await? else {
            return Ok(None);
        };
        let expires_at = record.last_used + self.absolute;
        if expires_at <= now {
            return Ok(None);
        }
        let target = record.target.clone();
        self.cache_locally(
            session_id,
            LocalEntry {
                info: SessionInfo::new(record.target, now),
                expires_at,
            },
            epoch,
        );
        Ok(Some(target))
    }

    async fn set(&self, session_id: &str, target: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let info = SessionInfo::new(target, now);
        let epoch = self.removals.load(Ordering::SeqCst);
        self.durable
            .set(session_id, &info, self.config.absolute_expiration)
            .await?;
        self.cache_locally(
            session_id,
            LocalEntry {
                info,
                expires_at: now + self.absolute,
            },
            epoch,
        );
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.local.remove(session_id);
        let removed = self.durable.remove(session_id).await;
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.local.remove(session_id);
        removed
    }
}

fn positive_delta(name: &str, value: Duration) -> Result<TimeDelta, StoreError> {
    if value.is_zero() {
        return Err(StoreError::InvalidConfig(format!("{name} must be positive")));
    }
    TimeDelta::from_std(value).map_err(|err| StoreError::InvalidConfig(format!("{name}: {err}")))
}
