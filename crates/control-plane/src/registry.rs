use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A backend replica as seen by the cluster registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub adapter: String,
    pub ready: bool,
}

impl InstanceRecord {
    pub fn new(id: impl Into<String>, adapter: impl Into<String>, ready: bool) -> Self {
        Self {
            id: id.into(),
            adapter: adapter.into(),
            ready,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceEvent {
    pub kind: InstanceEventKind,
    pub instance: InstanceRecord,
}

impl InstanceEvent {
    pub fn added(instance: InstanceRecord) -> Self {
        Self {
            kind: InstanceEventKind::Added,
            instance,
        }
    }

    pub fn modified(instance: InstanceRecord) -> Self {
        Self {
            kind: InstanceEventKind::Modified,
            instance,
        }
    }

    pub fn deleted(instance: InstanceRecord) -> Self {
        Self {
            kind: InstanceEventKind::Deleted,
            instance,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InstanceList {
    pub instances: Vec<InstanceRecord>,
    pub resource_version: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance list failed: {0}")]
    List(String),
    #[error("instance watch failed: {0}")]
    Watch(String),
    #[error("registry client unavailable: {0}")]
    Client(String),
}

pub type InstanceEventStream =
    Pin<Box<dyn Stream<Item = Result<InstanceEvent, RegistryError>> + Send>>;

/// List+watch access to the instances backing adapters.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn list(&self) -> Result<InstanceList, RegistryError>;
    async fn watch(&self, resource_version: &str) -> Result<InstanceEventStream, RegistryError>;
}

/// Registry held in process memory. Events published through it are applied
/// to its own listing and fanned out to every open watch.
pub struct InMemoryInstanceRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    instances: Vec<InstanceRecord>,
    version: u64,
    list_calls: usize,
    fail_lists: bool,
    watchers: Vec<mpsc::UnboundedSender<Result<InstanceEvent, RegistryError>>>,
}

impl InMemoryInstanceRegistry {
    pub fn new(instances: Vec<InstanceRecord>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                instances,
                ..RegistryState::default()
            }),
        }
    }

    pub fn shared(instances: Vec<InstanceRecord>) -> Arc<Self> {
        Arc::new(Self::new(instances))
    }

    pub fn publish(&self, event: InstanceEvent) {
        let mut state = self.state.lock();
        state.version += 1;
        let id = event.instance.id.clone();
        state.instances.retain(|instance| instance.id != id);
        if event.kind != InstanceEventKind::Deleted {
            state.instances.push(event.instance.clone());
        }
        state
            .watchers
            .retain(|watcher| watcher.send(Ok(event.clone())).is_ok());
    }

    /// Pushes an error into every open watch, which ends it.
    pub fn fail_watches(&self, message: &str) {
        let mut state = self.state.lock();
        for watcher in state.watchers.drain(..) {
            let _ = watcher.send(Err(RegistryError::Watch(message.to_string())));
        }
    }

    /// Ends every open watch gracefully.
    pub fn close_watches(&self) {
        self.state.lock().watchers.clear();
    }

    pub fn set_list_failure(&self, fail: bool) {
        self.state.lock().fail_lists = fail;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn open_watches(&self) -> usize {
        self.state
            .lock()
            .watchers
            .iter()
            .filter(|watcher| !watcher.is_closed())
            .count()
    }
}

#[async_trait]
impl InstanceRegistry for InMemoryInstanceRegistry {
    async fn list(&self) -> Result<InstanceList, RegistryError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.fail_lists {
            return Err(RegistryError::List("registry unavailable".to_string()));
        }
        Ok(InstanceList {
            instances: state.instances.clone(),
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(&self, _resource_version: &str) -> Result<InstanceEventStream, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
