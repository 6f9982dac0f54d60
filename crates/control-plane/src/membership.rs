use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{InstanceEvent, InstanceEventKind, InstanceRecord, InstanceRegistry, RegistryError};

#[derive(Clone, Debug)]
pub struct TrackerSettings {
    pub namespace: String,
    pub cluster_domain: String,
    pub adapter_port: u16,
    pub retry_backoff: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            namespace: "adapter".to_string(),
            cluster_domain: "svc.cluster.local".to_string(),
            adapter_port: 8000,
            retry_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("cancelled while waiting for the initial instance listing")]
    Cancelled,
    #[error("membership tracker stopped before the initial instance listing")]
    Stopped,
}

/// Eventually consistent view of the healthy instances of every adapter.
///
/// The table is fed by a list+watch loop against an [`InstanceRegistry`]. Each
/// adapter maps to an immutable id set that is swapped whole on change, so
/// readers never observe a half-applied event.
pub struct MembershipTracker {
    settings: TrackerSettings,
    healthy: DashMap<String, Arc<BTreeSet<String>>>,
    initial_fetch: watch::Sender<bool>,
}

impl MembershipTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        let (initial_fetch, _) = watch::channel(false);
        Self {
            settings,
            healthy: DashMap::new(),
            initial_fetch,
        }
    }

    pub fn shared(settings: TrackerSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    /// Resolves the healthy instances of `adapter` to `instance id -> URL`.
    ///
    /// Suspends until the first full listing has been applied. Later relists
    /// never close the gate again.
    pub async fn get_addresses(
        &self,
        adapter: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>, TrackerError> {
        self.wait_initial_fetch(cancel).await?;
        let ids = self.healthy_instances(adapter);
        Ok(ids
            .iter()
            .map(|id| (id.clone(), self.address_for(adapter, id)))
            .collect())
    }

    pub fn healthy_instances(&self, adapter: &str) -> Arc<BTreeSet<String>> {
        self.healthy
            .get(adapter)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn address_for(&self, adapter: &str, instance_id: &str) -> String {
        format!(
            "http://{instance_id}.{adapter}-service.{}.{}:{}",
            self.settings.namespace, self.settings.cluster_domain, self.settings.adapter_port
        )
    }

    pub fn initial_fetch_completed(&self) -> bool {
        *self.initial_fetch.borrow()
    }

    async fn wait_initial_fetch(&self, cancel: &CancellationToken) -> Result<(), TrackerError> {
        let mut ready = self.initial_fetch.subscribe();
        tokio::select! {
            result = ready.wait_for(|done| *done) => result.map(|_| ()).map_err(|_| TrackerError::Stopped),
            _ = cancel.cancelled() => Err(TrackerError::Cancelled),
        }
    }

    /// Replaces the whole table with the ready instances of a full listing.
    pub fn apply_snapshot(&self, instances: &[InstanceRecord]) -> usize {
        let mut grouped: HashMap<String, BTreeSet<String>> = HashMap::new();
        for instance in instances.iter().filter(|instance| instance.ready) {
            grouped
                .entry(instance.adapter.clone())
                .or_default()
                .insert(instance.id.clone());
        }
        let total = grouped.values().map(BTreeSet::len).sum();

        self.healthy.retain(|adapter, _| grouped.contains_key(adapter));
        for (adapter, ids) in grouped {
            self.healthy.insert(adapter, Arc::new(ids));
        }
        total
    }

    pub fn apply_event(&self, event: &InstanceEvent) {
        let instance = &event.instance;
        match event.kind {
            InstanceEventKind::Added | InstanceEventKind::Modified if instance.ready => {
                self.add_member(&instance.adapter, &instance.id);
            }
            InstanceEventKind::Added
            | InstanceEventKind::Modified
            | InstanceEventKind::Deleted => {
                self.remove_member(&instance.adapter, &instance.id);
            }
        }
    }

    /// Adapters with an entry in the table, including ones whose last
    /// instance went away.
    pub fn tracked_adapters(&self) -> usize {
        self.healthy.len()
    }

    fn add_member(&self, adapter: &str, id: &str) {
        let mut entry = self.healthy.entry(adapter.to_string()).or_default();
        if !entry.contains(id) {
            let mut next = BTreeSet::clone(&entry);
            next.insert(id.to_string());
            *entry = Arc::new(next);
        }
    }

    fn remove_member(&self, adapter: &str, id: &str) {
        let Some(mut entry) = self.healthy.get_mut(adapter) else {
            return;
        };
        if entry.contains(id) {
            let mut next = BTreeSet::clone(&entry);
            next.remove(id);
            *entry = Arc::new(next);
        }
    }

    pub fn spawn(
        self: &Arc<Self>,
        registry: Arc<dyn InstanceRegistry>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.run(registry, cancel).await })
    }

    /// Runs list+watch cycles until cancelled. Any failure or watch end waits
    /// the retry backoff and starts over with a full listing.
    pub async fn run(&self, registry: Arc<dyn InstanceRegistry>, cancel: CancellationToken) {
        info!("membership tracker starting");
        while !cancel.is_cancelled() {
            match self.reconcile(registry.as_ref(), &cancel).await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => warn!("instance watch closed, relisting"),
                Err(err) => warn!(error = %err, "failed to refresh healthy instances"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!("membership tracker stopped");
    }

    async fn reconcile(
        &self,
        registry: &dyn InstanceRegistry,
        cancel: &CancellationToken,
    ) -> Result<(), RegistryError> {
        let listing = tokio::select! {
            listing = registry.list() => listing?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let total = self.apply_snapshot(&listing.instances);
        info!(
            healthy = total,
            resource_version = %listing.resource_version,
            "instance listing applied"
        );
        self.initial_fetch.send_replace(true);

        let mut events = tokio::select! {
            events = registry.watch(&listing.resource_version) => events?,
            _ = cancel.cancelled() => return Ok(()),
        };
        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        debug!(
                            kind = ?event.kind,
                            instance = %event.instance.id,
                            adapter = %event.instance.adapter,
                            ready = event.instance.ready,
                            "applying instance event"
                        );
                        self.apply_event(&event);
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
