use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue, FORWARDED, HOST, TRANSFER_ENCODING, USER_AGENT};
use http::{HeaderMap, Uri};
use tracing::debug;
use url::Url;

use crate::{
    ClientInfo, Forwarder, KernelError, ProxyRequest, RequestBody, ResponseBody, UpstreamRequest,
    UpstreamResponse,
};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone, Debug)]
pub struct HttpForwarderConfig {
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: "mcpgw-gateway".to_string(),
        }
    }
}

/// reqwest-backed forwarder. Only the connect phase is bounded; event
/// streams stay open for as long as the backend keeps them open.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    config: HttpForwarderConfig,
}

impl HttpForwarder {
    pub fn new(config: HttpForwarderConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout.max(Duration::from_millis(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }

    async fn send_request(&self, upstream: UpstreamRequest) -> Result<UpstreamResponse, KernelError> {
        let UpstreamRequest {
            method,
            url,
            mut headers,
            body,
        } = upstream;
        if !headers.contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }

        let mut request = self.client.request(method, url).headers(headers);
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Bytes(bytes) => request.body(bytes),
            RequestBody::Stream(stream) => request.body(reqwest::Body::wrap_stream(stream)),
        };
        let response = request.send().await.map_err(upstream_error)?;

        let status = response.status();
        let headers = copy_response_headers(response.headers());
        let stream = response.bytes_stream().map(|item| {
            item.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
        });
        Ok(UpstreamResponse {
            status,
            headers,
            body: ResponseBody::Stream(Box::pin(stream)),
        })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, KernelError> {
        self.send_request(request).await
    }
}

fn upstream_error(err: reqwest::Error) -> KernelError {
    if err.is_timeout() {
        KernelError::UpstreamTimeout(err.to_string())
    } else {
        KernelError::Upstream(err.to_string())
    }
}

/// Maps `/adapters/{name}/rest?query` onto `{backend}/rest?query`.
pub fn rewrite_target(uri: &Uri, backend: &str) -> Result<Url, KernelError> {
    let mut segments = uri.path().trim_start_matches('/').splitn(3, '/');
    let prefix_ok = matches!(
        (segments.next(), segments.next()),
        (Some(first), Some(second)) if !first.is_empty() && !second.is_empty()
    );
    if !prefix_ok {
        return Err(KernelError::BadRequest(format!(
            "path {} has no adapter prefix",
            uri.path()
        )));
    }
    let mut path = format!("/{}", segments.next().unwrap_or_default());
    if path.ends_with("/messages") || path.ends_with("/mcp") {
        path.push('/');
    }

    let mut url = Url::parse(backend)
        .map_err(|err| KernelError::Internal(format!("invalid backend address {backend}: {err}")))?;
    url.set_path(&path);
    url.set_query(uri.query());
    Ok(url)
}

/// Turns an inbound request into the request sent to `backend`.
pub fn build_upstream_request(
    request: ProxyRequest,
    backend: &str,
) -> Result<UpstreamRequest, KernelError> {
    let url = rewrite_target(&request.uri, backend)?;
    let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
    for (name, value) in request.headers.iter() {
        if name == HOST || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    let forwarded = forwarded_value(&request.client);
    match HeaderValue::from_str(&forwarded) {
        Ok(value) => {
            headers.append(FORWARDED, value);
        }
        Err(_) => debug!(forwarded = %forwarded, "skipping unrepresentable forwarded header"),
    }

    Ok(UpstreamRequest {
        method: request.method,
        url,
        headers,
        body: request.body,
    })
}

pub fn copy_response_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source.iter() {
        if name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn forwarded_value(client: &ClientInfo) -> String {
    let mut parts = Vec::with_capacity(3);
    match client.remote_ip {
        Some(IpAddr::V4(ip)) => parts.push(format!("for={ip}")),
        Some(IpAddr::V6(ip)) => parts.push(format!("for=\"[{ip}]\"")),
        None => parts.push("for=unknown".to_string()),
    }
    let scheme = if client.scheme.is_empty() {
        "http"
    } else {
        client.scheme.as_str()
    };
    parts.push(format!("proto={scheme}"));
    if let Some(host) = client.host.as_deref().filter(|host| !host.is_empty()) {
        parts.push(format!("host={host}"));
    }
    parts.join(";")
}
