use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::response::Response;
use futures_util::TryStreamExt;
use kernel::{ClientInfo, ProxyRequest, ProxyResponse, RequestBody, ResponseBody};

use crate::error::AppError;
use crate::state::AppState;

/// Longest adapter name whose `{name}-service` still fits a DNS label.
const MAX_ADAPTER_NAME: usize = 55;

pub async fn ping() -> &'static str {
    "pong"
}

pub async fn streamable_post(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let request = proxy_request(name, req)?;
    let response = state.proxy.forward_streamable(request).await?;
    Ok(into_http_response(response))
}

pub async fn streamable_get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let request = proxy_request(name, req)?;
    let response = state.proxy.forward_existing(request).await?;
    Ok(into_http_response(response))
}

pub async fn streamable_delete(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let request = proxy_request(name, req)?;
    let response = state.proxy.terminate_session(request).await?;
    Ok(into_http_response(response))
}

pub async fn legacy_messages(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let request = proxy_request(name, req)?;
    let response = state.proxy.forward_existing(request).await?;
    Ok(into_http_response(response))
}

pub async fn legacy_sse(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let request = proxy_request(name, req)?;
    let response = state.proxy.forward_sse(request).await?;
    Ok(into_http_response(response))
}

/// Lowercase alphanumerics and inner dashes, as required for the service host.
fn validate_adapter_name(name: &str) -> Result<(), AppError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_ADAPTER_NAME
        && name
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(AppError::bad_request(format!("invalid adapter name: {name}")))
    }
}

fn proxy_request(adapter: String, req: Request) -> Result<ProxyRequest, AppError> {
    validate_adapter_name(&adapter)?;
    let (parts, body) = req.into_parts();
    let client = ClientInfo {
        remote_ip: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
        scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
        host: parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    let body = if has_body(&parts.method, &parts.headers) {
        let stream = body
            .into_data_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        RequestBody::Stream(Box::pin(stream))
    } else {
        RequestBody::Empty
    };
    Ok(ProxyRequest {
        adapter,
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        client,
    })
}

fn has_body(method: &Method, headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    match headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
    {
        Some(length) => length > 0,
        None => !matches!(*method, Method::GET | Method::HEAD | Method::DELETE),
    }
}

fn into_http_response(response: ProxyResponse) -> Response<Body> {
    let body = match response.body {
        ResponseBody::Bytes(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut out = Response::new(body);
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}
