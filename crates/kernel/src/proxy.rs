use std::sync::Arc;

use control_plane::SessionStore;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    build_upstream_request, relay_event_stream, relay_until_cancelled, session_id_from_headers, session_id_from_request,
    Forwarder, KernelError, ProxyRequest, ProxyResponse, ResponseBody, RoutingError,
    SessionRouter,
};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Ties routing, forwarding and session bookkeeping together for the
/// adapter endpoints.
#[derive(Clone)]
pub struct AdapterProxy {
    router: SessionRouter,
    sessions: Arc<dyn SessionStore>,
    forwarder: Arc<dyn Forwarder>,
    shutdown: CancellationToken,
}

impl AdapterProxy {
    pub fn new(
        router: SessionRouter,
        sessions: Arc<dyn SessionStore>,
        forwarder: Arc<dyn Forwarder>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            router,
            sessions,
            forwarder,
            shutdown,
        }
    }

    /// `POST /adapters/{name}/mcp`. Requests without a session id open a new
    /// session on a random healthy instance; the backend assigns the id.
    pub async fn forward_streamable(&self, request: ProxyRequest) -> Result<ProxyResponse, KernelError> {
        let adapter = request.adapter.clone();
        let (target, new_session) = match session_id_from_request(&request.uri, &request.headers) {
            Some(session_id) => (
                self.router.session_target(&session_id, request.uri.path()).await?,
                false,
            ),
            None => (
                self.router.new_session_target(&adapter, &self.shutdown).await?,
                true,
            ),
        };

        let upstream = build_upstream_request(request, &target)?;
        let response = self.forwarder.send(upstream).await?;

        if new_session && response.status.is_success() {
            if let Some(session_id) = session_id_from_headers(&response.headers) {
                self.sessions.set(&session_id, &target).await?;
                info!(adapter = %adapter, session_id = %session_id, target = %target, "new session");
            }
        }
        Ok(ProxyResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    /// Requests that must continue an existing session: legacy message posts
    /// and the modern transport's server event stream. Streamed bodies end
    /// on shutdown.
    pub async fn forward_existing(&self, request: ProxyRequest) -> Result<ProxyResponse, KernelError> {
        let target = self
            .router
            .existing_session_target(&request.uri, &request.headers)
            .await?;
        let upstream = build_upstream_request(request, &target)?;
        let response = self.forwarder.send(upstream).await?;
        let body = match response.body {
            ResponseBody::Stream(stream) => {
                ResponseBody::Stream(relay_until_cancelled(stream, self.shutdown.child_token()))
            }
            body => body,
        };
        Ok(ProxyResponse {
            status: response.status,
            headers: response.headers,
            body,
        })
    }

    /// `GET /adapters/{name}/sse`. Opens a legacy session and relays the
    /// event stream with the message endpoint re-rooted under the gateway.
    pub async fn forward_sse(&self, request: ProxyRequest) -> Result<ProxyResponse, KernelError> {
        let adapter = request.adapter.clone();
        let target = self.router.new_session_target(&adapter, &self.shutdown).await?;
        let upstream = build_upstream_request(request, &target)?;
        let response = self.forwarder.send(upstream).await?;

        if !response.status.is_success() {
            warn!(adapter = %adapter, status = %response.status, "event stream rejected by backend");
            return Ok(ProxyResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
            });
        }

        let mut headers = response.headers;
        headers.remove(CONTENT_LENGTH);
        headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
        let body = relay_event_stream(
            response.body.into_stream(),
            adapter,
            target,
            self.sessions.clone(),
            self.shutdown.child_token(),
        );
        Ok(ProxyResponse {
            status: response.status,
            headers,
            body: ResponseBody::Stream(body),
        })
    }

    /// `DELETE /adapters/{name}/mcp`. The session is forgotten once the owning
    /// backend confirms the termination.
    pub async fn terminate_session(&self, request: ProxyRequest) -> Result<ProxyResponse, KernelError> {
        let session_id = session_id_from_request(&request.uri, &request.headers)
            .ok_or(RoutingError::SessionIdNotFound)?;
        let target = self
            .router
            .session_target(&session_id, request.uri.path())
            .await?;
        let upstream = build_upstream_request(request, &target)?;
        let response = self.forwarder.send(upstream).await?;

        if response.status.is_success() {
            self.sessions.remove(&session_id).await?;
            info!(session_id = %session_id, target = %target, "session terminated");
        }
        Ok(ProxyResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }
}
