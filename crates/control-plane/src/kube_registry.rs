use async_trait::async_trait;
use futures_util::{future, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client as KubeClient};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::registry::{
    InstanceEvent, InstanceEventKind, InstanceEventStream, InstanceList, InstanceRecord,
    InstanceRegistry, RegistryError,
};

const OWNER_KIND: &str = "StatefulSet";

#[derive(Clone, Debug)]
pub struct KubeRegistryConfig {
    pub namespace: String,
    pub label_selector: String,
    pub field_selector: String,
}

impl Default for KubeRegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "adapter".to_string(),
            label_selector: "adapter/type=mcp".to_string(),
            field_selector: "status.phase=Running".to_string(),
        }
    }
}

/// Lists and watches adapter pods in one namespace.
///
/// The client is built on first use from the in-cluster environment or the
/// local kubeconfig. A failed build is returned from that `list`/`watch` call
/// and retried on the next one.
pub struct KubeInstanceRegistry {
    pods: OnceCell<Api<Pod>>,
    config: KubeRegistryConfig,
}

impl KubeInstanceRegistry {
    pub fn new(config: KubeRegistryConfig) -> Self {
        Self {
            pods: OnceCell::new(),
            config,
        }
    }

    async fn pods(&self) -> Result<&Api<Pod>, RegistryError> {
        self.pods
            .get_or_try_init(|| async {
                let client = KubeClient::try_default()
                    .await
                    .map_err(|err| RegistryError::Client(err.to_string()))?;
                Ok::<_, RegistryError>(Api::namespaced(client, &self.config.namespace))
            })
            .await
    }

    fn list_params(&self) -> ListParams {
        ListParams::default()
            .labels(&self.config.label_selector)
            .fields(&self.config.field_selector)
    }

    fn watch_params(&self) -> WatchParams {
        WatchParams::default()
            .labels(&self.config.label_selector)
            .fields(&self.config.field_selector)
    }
}

#[async_trait]
impl InstanceRegistry for KubeInstanceRegistry {
    async fn list(&self) -> Result<InstanceList, RegistryError> {
        let pods = self
            .pods()
            .await?
            .list(&self.list_params())
            .await
            .map_err(|err| RegistryError::List(err.to_string()))?;
        let resource_version = pods.metadata.resource_version.clone().unwrap_or_default();
        let instances = pods.items.iter().filter_map(instance_from_pod).collect();
        Ok(InstanceList {
            instances,
            resource_version,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<InstanceEventStream, RegistryError> {
        let events = self
            .pods()
            .await?
            .watch(&self.watch_params(), resource_version)
            .await
            .map_err(|err| RegistryError::Watch(err.to_string()))?;

        let mapped = events.filter_map(|event| {
            let mapped = match event {
                Ok(WatchEvent::Added(pod)) => to_event(InstanceEventKind::Added, &pod),
                Ok(WatchEvent::Modified(pod)) => to_event(InstanceEventKind::Modified, &pod),
                Ok(WatchEvent::Deleted(pod)) => to_event(InstanceEventKind::Deleted, &pod),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(status)) => {
                    Some(Err(RegistryError::Watch(status.message)))
                }
                Err(err) => Some(Err(RegistryError::Watch(err.to_string()))),
            };
            future::ready(mapped)
        });
        Ok(Box::pin(mapped))
    }
}

fn to_event(
    kind: InstanceEventKind,
    pod: &Pod,
) -> Option<Result<InstanceEvent, RegistryError>> {
    let Some(instance) = instance_from_pod(pod) else {
        debug!(
            pod = pod.metadata.name.as_deref().unwrap_or("unknown"),
            "skipping pod without adapter owner"
        );
        return None;
    };
    Some(Ok(InstanceEvent { kind, instance }))
}

/// Maps a pod onto an instance record. Pods without a name or without an
/// owning StatefulSet do not belong to any adapter.
pub fn instance_from_pod(pod: &Pod) -> Option<InstanceRecord> {
    let id = pod.metadata.name.clone()?;
    let adapter = pod
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.kind == OWNER_KIND)?
        .name
        .clone();
    Some(InstanceRecord {
        id,
        adapter,
        ready: is_pod_ready(pod),
    })
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}
