use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use control_plane::{MembershipTracker, SessionStore, TrackerError};
use http::{HeaderMap, Uri};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const SESSION_QUERY_PARAM: &str = "session_id";
pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no healthy backend for adapter {0}")]
    NoHealthyBackend(String),
    #[error("session id not found in the request")]
    SessionIdNotFound,
    #[error("session id is not valid, or has expired")]
    SessionInvalid,
    #[error("routing cancelled")]
    Cancelled,
}

/// Source of healthy backend addresses, keyed by instance id.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn get_addresses(
        &self,
        adapter: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>, TrackerError>;
}

#[async_trait]
impl AddressResolver for MembershipTracker {
    async fn get_addresses(
        &self,
        adapter: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>, TrackerError> {
        MembershipTracker::get_addresses(self, adapter, cancel).await
    }
}

/// Fixed adapter backends, one instance per adapter. Used when the gateway
/// runs outside a cluster.
#[derive(Clone, Debug, Default)]
pub struct StaticAddressResolver {
    backends: BTreeMap<String, String>,
}

impl StaticAddressResolver {
    pub fn new(backends: BTreeMap<String, String>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn get_addresses(
        &self,
        adapter: &str,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>, TrackerError> {
        Ok(self
            .backends
            .get(adapter)
            .map(|address| BTreeMap::from([(format!("{adapter}-0"), address.clone())]))
            .unwrap_or_default())
    }
}

/// Decides which backend serves a request. Never writes to the session store.
#[derive(Clone)]
pub struct SessionRouter {
    resolver: Arc<dyn AddressResolver>,
    sessions: Arc<dyn SessionStore>,
}

impl SessionRouter {
    pub fn new(resolver: Arc<dyn AddressResolver>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { resolver, sessions }
    }

    /// Picks a healthy instance uniformly at random.
    pub async fn new_session_target(
        &self,
        adapter: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RoutingError> {
        let addresses = match self.resolver.get_addresses(adapter, cancel).await {
            Ok(addresses) => addresses,
            Err(TrackerError::Cancelled) => return Err(RoutingError::Cancelled),
            Err(TrackerError::Stopped) => {
                return Err(RoutingError::NoHealthyBackend(adapter.to_string()))
            }
        };
        let candidates: Vec<String> = addresses.into_values().collect();
        pick_uniform(&candidates).ok_or_else(|| RoutingError::NoHealthyBackend(adapter.to_string()))
    }

    pub async fn existing_session_target(
        &self,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<String, RoutingError> {
        let session_id =
            session_id_from_request(uri, headers).ok_or(RoutingError::SessionIdNotFound)?;
        self.session_target(&session_id, uri.path()).await
    }

    pub async fn session_target(&self, session_id: &str, path: &str) -> Result<String, RoutingError> {
        match self.sessions.try_get(session_id).await {
            Ok(Some(target)) => {
                info!(session_id, path, "existing session found");
                Ok(target)
            }
            Ok(None) => {
                warn!(session_id, path, "unknown or expired session");
                Err(RoutingError::SessionInvalid)
            }
            Err(err) => {
                warn!(session_id, path, error = %err, "session lookup failed");
                Err(RoutingError::SessionInvalid)
            }
        }
    }
}

/// Query parameter `session_id` wins over the `mcp-session-id` header. Empty
/// values count as absent.
pub fn session_id_from_request(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let from_query = uri.query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == SESSION_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    if let Some(session_id) = from_query.filter(|value| !value.is_empty()) {
        return Some(session_id);
    }
    session_id_from_headers(headers)
}

pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn pick_uniform<T: Clone>(items: &[T]) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..items.len());
    items.get(index).cloned()
}
