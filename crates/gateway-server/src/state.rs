use std::path::Path;
use std::sync::Arc;

use control_plane::{
    ConfigError, DurableSessionCache, InMemoryDurableCache, KubeInstanceRegistry,
    KubeRegistryConfig, MembershipTracker, NearSessionStore, RedisSessionCache, RedisStoreConfig,
    SessionStoreConfig, SystemConfig, SystemConfigLoader, TrackerSettings,
};
use kernel::{
    AdapterProxy, AddressResolver, HttpForwarder, HttpForwarderConfig, SessionRouter,
    StaticAddressResolver,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::AppError;

pub struct AppState {
    pub proxy: AdapterProxy,
}

impl AppState {
    pub fn new(proxy: AdapterProxy) -> Self {
        Self { proxy }
    }
}

/// Shared request state plus the background loops that feed it.
pub struct Gateway {
    pub state: Arc<AppState>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub async fn from_config(
        config: &SystemConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, AppError> {
        let mut tasks = Vec::new();

        let durable = build_durable_cache(config)?;
        let sessions = NearSessionStore::shared(durable, session_store_config(config)?)?;
        tasks.push(sessions.spawn_sweeper(shutdown.clone()));

        let resolver = build_resolver(config, &shutdown, &mut tasks)?;
        let forwarder = Arc::new(HttpForwarder::new(forwarder_config(config)?));
        let router = SessionRouter::new(resolver, sessions.clone());
        let proxy = AdapterProxy::new(router, sessions, forwarder, shutdown);

        Ok(Self {
            state: Arc::new(AppState::new(proxy)),
            tasks,
        })
    }
}

pub fn load_config(path: &Path) -> Result<SystemConfig, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(SystemConfigLoader::from_str(&raw)?)
}

pub fn create_default_config(path: &Path) -> Result<String, AppError> {
    let content = SystemConfigLoader::default_template();
    std::fs::write(path, content.as_bytes())?;
    Ok(content)
}

pub fn session_store_config(config: &SystemConfig) -> Result<SessionStoreConfig, AppError> {
    Ok(SessionStoreConfig {
        absolute_expiration: config.get_seconds("session.absolute_expiration_seconds")?,
        sliding_window: config.get_seconds("session.sliding_window_seconds")?,
        sweep_interval: config.get_seconds("session.sweep_interval_seconds")?,
    })
}

pub fn tracker_settings(config: &SystemConfig) -> Result<TrackerSettings, AppError> {
    let port = config.get_positive("cluster.adapter_port")?;
    let adapter_port = u16::try_from(port).map_err(|_| {
        ConfigError::InvalidValue(
            "cluster.adapter_port".to_string(),
            format!("{port} is not a valid port"),
        )
    })?;
    Ok(TrackerSettings {
        namespace: config.get_string("cluster.namespace"),
        cluster_domain: config.get_string("cluster.domain"),
        adapter_port,
        retry_backoff: config.get_seconds("cluster.retry_backoff_seconds")?,
    })
}

pub fn forwarder_config(config: &SystemConfig) -> Result<HttpForwarderConfig, AppError> {
    Ok(HttpForwarderConfig {
        connect_timeout: config.get_millis("proxy.connect_timeout_ms")?,
        user_agent: config.get_string("proxy.user_agent"),
    })
}

fn build_durable_cache(config: &SystemConfig) -> Result<Arc<dyn DurableSessionCache>, AppError> {
    let redis_url = config.get_string("cache.redis_url");
    if redis_url.trim().is_empty() {
        info!("no redis url configured, sessions are kept in process memory");
        return Ok(InMemoryDurableCache::shared());
    }
    let store_config = RedisStoreConfig {
        key_prefix: config.get_string("cache.key_prefix"),
    };
    Ok(Arc::new(RedisSessionCache::open(redis_url.trim(), store_config)?))
}

fn build_resolver(
    config: &SystemConfig,
    shutdown: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<dyn AddressResolver>, AppError> {
    let static_backends = config.get_pairs("cluster.static_backends")?;
    if !static_backends.is_empty() {
        info!(adapters = static_backends.len(), "using static adapter backends");
        return Ok(Arc::new(StaticAddressResolver::new(static_backends)));
    }

    let registry = KubeInstanceRegistry::new(KubeRegistryConfig {
        namespace: config.get_string("cluster.namespace"),
        label_selector: config.get_string("cluster.label_selector"),
        field_selector: config.get_string("cluster.field_selector"),
    });
    let tracker = MembershipTracker::shared(tracker_settings(config)?);
    tasks.push(tracker.spawn(Arc::new(registry), shutdown.clone()));
    Ok(tracker)
}
