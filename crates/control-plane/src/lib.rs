pub mod config;
pub mod kube_registry;
pub mod membership;
pub mod near_cache;
pub mod redis_store;
pub mod registry;
pub mod session;
pub mod static_config;

pub use config::{ConfigError, SystemConfig, SystemConfigLoader};
pub use kube_registry::{instance_from_pod, KubeInstanceRegistry, KubeRegistryConfig};
pub use membership::{MembershipTracker, TrackerError, TrackerSettings};
pub use near_cache::{NearSessionStore, SessionStoreConfig};
pub use redis_store::{RedisSessionCache, RedisStoreConfig};
pub use registry::{
    InMemoryInstanceRegistry, InstanceEvent, InstanceEventKind, InstanceEventStream, InstanceList,
    InstanceRecord, InstanceRegistry, RegistryError,
};
pub use session::{
    DurableSessionCache, InMemoryDurableCache, SessionInfo, SessionStore, StoreError,
};
