mod forwarder;
mod proxy;
mod rewrite;
mod router;
mod types;

pub use forwarder::{
    build_upstream_request, copy_response_headers, rewrite_target, HttpForwarder,
    HttpForwarderConfig,
};
pub use proxy::AdapterProxy;
pub use rewrite::{
    relay_event_stream, relay_until_cancelled, rewrite_session_marker, MarkerRewrite,
    SSE_SESSION_MARKER,
};
pub use router::{
    pick_uniform, session_id_from_headers, session_id_from_request, AddressResolver,
    RoutingError, SessionRouter, StaticAddressResolver, SESSION_HEADER, SESSION_QUERY_PARAM,
};
pub use types::{
    ByteStream, ClientInfo, ProxyRequest, ProxyResponse, RequestBody, ResponseBody,
    UpstreamRequest, UpstreamResponse,
};

use async_trait::async_trait;
use control_plane::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Sends one request to a backend. A single attempt, no retries.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, KernelError>;
}
