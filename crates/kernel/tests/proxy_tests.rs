use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use control_plane::{
    DurableSessionCache, InMemoryDurableCache, NearSessionStore, SessionInfo, SessionStore,
    SessionStoreConfig, StoreError,
};
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use kernel::{
    AdapterProxy, ClientInfo, Forwarder, KernelError, ProxyRequest, RequestBody, ResponseBody,
    RoutingError, SessionRouter, StaticAddressResolver, UpstreamRequest, UpstreamResponse,
};
use tokio_util::sync::CancellationToken;

const ALPHA: &str = "http://alpha-0.test:8000";

type Responder = Box<dyn Fn() -> UpstreamResponse + Send + Sync>;

struct TestForwarder {
    respond: Responder,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl TestForwarder {
    fn new(respond: impl Fn() -> UpstreamResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_url(&self) -> Option<String> {
        self.urls.lock().expect("urls").last().cloned()
    }
}

#[async_trait]
impl Forwarder for TestForwarder {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, KernelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().expect("urls").push(request.url.to_string());
        Ok((self.respond)())
    }
}

struct FailingWrites;

#[async_trait]
impl DurableSessionCache for FailingWrites {
    async fn get(&self, _session_id: &str) -> Result<Option<SessionInfo>, StoreError> {
        Ok(None)
    }

    async fn set(
        &self,
        _session_id: &str,
        _info: &SessionInfo,
        _ttl: std::time::Duration,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("redis down".to_string()))
    }

    async fn remove(&self, _session_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("redis down".to_string()))
    }
}

fn response(status: u16, headers: &[(&'static str, &'static str)], body: &'static str) -> UpstreamResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(*name, HeaderValue::from_static(*value));
    }
    UpstreamResponse {
        status: StatusCode::from_u16(status).expect("status"),
        headers: map,
        body: ResponseBody::Bytes(Bytes::from_static(body.as_bytes())),
    }
}

fn request(method: Method, uri: &str, session_header: Option<&'static str>) -> ProxyRequest {
    let mut headers = HeaderMap::new();
    if let Some(session_id) = session_header {
        headers.insert("mcp-session-id", HeaderValue::from_static(session_id));
    }
    ProxyRequest {
        adapter: "alpha".to_string(),
        method,
        uri: uri.parse::<Uri>().expect("uri"),
        headers,
        body: RequestBody::Empty,
        client: ClientInfo::default(),
    }
}

fn proxy_with(
    store: Arc<dyn SessionStore>,
    forwarder: Arc<TestForwarder>,
    backends: &[(&str, &str)],
) -> AdapterProxy {
    let backends: BTreeMap<String, String> = backends
        .iter()
        .map(|(adapter, url)| (adapter.to_string(), url.to_string()))
        .collect();
    let router = SessionRouter::new(Arc::new(StaticAddressResolver::new(backends)), store.clone());
    AdapterProxy::new(router, store, forwarder, CancellationToken::new())
}

fn memory_store() -> Arc<NearSessionStore> {
    NearSessionStore::shared(InMemoryDurableCache::shared(), SessionStoreConfig::default())
        .expect("store")
}

#[tokio::test]
async fn new_streamable_session_is_recorded() {
    let store = memory_store();
    let forwarder = TestForwarder::new(|| response(200, &[("mcp-session-id", "s-new")], "{}"));
    let proxy = proxy_with(store.clone(), forwarder.clone(), &[("alpha", ALPHA)]);

    let result = proxy
        .forward_streamable(request(Method::POST, "/adapters/alpha/mcp", None))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.headers["mcp-session-id"], "s-new");
    assert_eq!(forwarder.last_url().as_deref(), Some("http://alpha-0.test:8000/mcp/"));
    assert_eq!(store.try_get("s-new").await.expect("get").as_deref(), Some(ALPHA));
}

#[tokio::test]
async fn failed_initialization_records_nothing() {
    let store = memory_store();
    let forwarder = TestForwarder::new(|| response(400, &[("mcp-session-id", "s-bad")], "bad"));
    let proxy = proxy_with(store.clone(), forwarder, &[("alpha", ALPHA)]);

    let result = proxy
        .forward_streamable(request(Method::POST, "/adapters/alpha/mcp", None))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::BAD_REQUEST);
    assert_eq!(result.body.into_bytes_async().await, b"bad");
    assert_eq!(store.try_get("s-bad").await.expect("get"), None);
}

#[tokio::test]
async fn continuation_goes_to_recorded_backend() {
    let store = memory_store();
    store.set("s1", "http://alpha-7.test:8000").await.expect("seed");
    let forwarder = TestForwarder::new(|| response(202, &[], ""));
    let proxy = proxy_with(store.clone(), forwarder.clone(), &[("alpha", ALPHA)]);

    let result = proxy
        .forward_streamable(request(Method::POST, "/adapters/alpha/mcp", Some("s1")))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::ACCEPTED);
    assert_eq!(forwarder.last_url().as_deref(), Some("http://alpha-7.test:8000/mcp/"));
}

#[tokio::test]
async fn unknown_session_is_not_forwarded() {
    let forwarder = TestForwarder::new(|| response(200, &[], ""));
    let proxy = proxy_with(memory_store(), forwarder.clone(), &[("alpha", ALPHA)]);

    let err = proxy
        .forward_streamable(request(Method::POST, "/adapters/alpha/mcp", Some("ghost")))
        .await
        .expect_err("invalid session");
    assert!(matches!(err, KernelError::Routing(RoutingError::SessionInvalid)));
    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn adapter_without_instances_is_unavailable() {
    let forwarder = TestForwarder::new(|| response(200, &[], ""));
    let proxy = proxy_with(memory_store(), forwarder.clone(), &[]);

    let err = proxy
        .forward_streamable(request(Method::POST, "/adapters/alpha/mcp", None))
        .await
        .expect_err("no backend");
    assert!(matches!(err, KernelError::Routing(RoutingError::NoHealthyBackend(_))));
    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn unrecordable_session_fails_the_request() {
    let store = NearSessionStore::shared(Arc::new(FailingWrites), SessionStoreConfig::default())
        .expect("store");
    let forwarder = TestForwarder::new(|| response(200, &[("mcp-session-id", "s-new")], "{}"));
    let proxy = proxy_with(store, forwarder, &[("alpha", ALPHA)]);

    let err = proxy
        .forward_streamable(request(Method::POST, "/adapters/alpha/mcp", None))
        .await
        .expect_err("store down");
    assert!(matches!(err, KernelError::Store(_)));
}

#[tokio::test]
async fn legacy_message_requires_session_id() {
    let forwarder = TestForwarder::new(|| response(202, &[], ""));
    let proxy = proxy_with(memory_store(), forwarder, &[("alpha", ALPHA)]);

    let err = proxy
        .forward_existing(request(Method::POST, "/adapters/alpha/messages", None))
        .await
        .expect_err("missing id");
    assert!(matches!(err, KernelError::Routing(RoutingError::SessionIdNotFound)));
}

#[tokio::test]
async fn legacy_message_uses_query_session() {
    let store = memory_store();
    store.set("abc", ALPHA).await.expect("seed");
    let forwarder = TestForwarder::new(|| response(202, &[], "Accepted"));
    let proxy = proxy_with(store, forwarder.clone(), &[("alpha", ALPHA)]);

    let result = proxy
        .forward_existing(request(Method::POST, "/adapters/alpha/messages?session_id=abc", None))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::ACCEPTED);
    assert_eq!(
        forwarder.last_url().as_deref(),
        Some("http://alpha-0.test:8000/messages/?session_id=abc")
    );
}

#[tokio::test]
async fn event_stream_is_rewritten_and_unbuffered() {
    let store = memory_store();
    let forwarder = TestForwarder::new(|| {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"event: endpoint\ndata: /messages/?session_id=XYZ123\n\n")),
            Ok(Bytes::from_static(b"event: message\ndata: {}\n\n")),
        ];
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers.insert("content-length", HeaderValue::from_static("75"));
        UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: ResponseBody::Stream(Box::pin(futures_util::stream::iter(chunks))),
        }
    });
    let proxy = proxy_with(store.clone(), forwarder.clone(), &[("alpha", ALPHA)]);

    let result = proxy
        .forward_sse(request(Method::GET, "/adapters/alpha/sse", None))
        .await
        .expect("response");
    assert_eq!(forwarder.last_url().as_deref(), Some("http://alpha-0.test:8000/sse"));
    assert!(result.headers.get("content-length").is_none());
    assert_eq!(result.headers["x-accel-buffering"], "no");
    assert_eq!(result.headers["content-type"], "text/event-stream");

    let ResponseBody::Stream(stream) = result.body else {
        panic!("event stream must stay streaming");
    };
    let chunks: Vec<Bytes> = stream.map(|chunk| chunk.expect("chunk")).collect().await;
    assert_eq!(
        chunks,
        vec![
            Bytes::from_static(b"event: endpoint\ndata: /adapters/alpha/messages/?session_id=XYZ123\n\n"),
            Bytes::from_static(b"event: message\ndata: {}\n\n"),
        ]
    );
    assert_eq!(store.try_get("XYZ123").await.expect("get").as_deref(), Some(ALPHA));
}

#[tokio::test]
async fn rejected_event_stream_passes_through() {
    let store = memory_store();
    let forwarder = TestForwarder::new(|| response(503, &[("content-length", "4")], "busy"));
    let proxy = proxy_with(store, forwarder, &[("alpha", ALPHA)]);

    let result = proxy
        .forward_sse(request(Method::GET, "/adapters/alpha/sse", None))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(result.headers.get("x-accel-buffering").is_none());
    assert_eq!(result.body.into_bytes_async().await, b"busy");
}

#[tokio::test]
async fn terminated_session_is_forgotten() {
    let store = memory_store();
    store.set("s1", ALPHA).await.expect("seed");
    let forwarder = TestForwarder::new(|| response(200, &[], ""));
    let proxy = proxy_with(store.clone(), forwarder, &[("alpha", ALPHA)]);

    let result = proxy
        .terminate_session(request(Method::DELETE, "/adapters/alpha/mcp", Some("s1")))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(store.try_get("s1").await.expect("get"), None);
}

#[tokio::test]
async fn refused_termination_keeps_session() {
    let store = memory_store();
    store.set("s1", ALPHA).await.expect("seed");
    let forwarder = TestForwarder::new(|| response(405, &[], ""));
    let proxy = proxy_with(store.clone(), forwarder, &[("alpha", ALPHA)]);

    let result = proxy
        .terminate_session(request(Method::DELETE, "/adapters/alpha/mcp", Some("s1")))
        .await
        .expect("response");
    assert_eq!(result.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(store.try_get("s1").await.expect("get").as_deref(), Some(ALPHA));
}

#[tokio::test]
async fn resumed_stream_ends_on_shutdown() {
    let store = memory_store();
    store.set("s1", ALPHA).await.expect("seed");
    let forwarder = TestForwarder::new(|| {
        let open = futures_util::stream::once(async {
            Ok::<Bytes, std::io::Error>(Bytes::from_static(b"event: ping\n\n"))
        })
        .chain(futures_util::stream::pending::<Result<Bytes, std::io::Error>>());
        UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ResponseBody::Stream(Box::pin(open)),
        }
    });
    let shutdown = CancellationToken::new();
    let router = SessionRouter::new(
        Arc::new(StaticAddressResolver::new(BTreeMap::new())),
        store.clone(),
    );
    let proxy = AdapterProxy::new(router, store, forwarder, shutdown.clone());

    let result = proxy
        .forward_existing(request(Method::GET, "/adapters/alpha/mcp", Some("s1")))
        .await
        .expect("response");
    let ResponseBody::Stream(mut stream) = result.body else {
        panic!("server stream must stay streaming");
    };
    let first = stream.next().await.expect("first event").expect("chunk");
    assert_eq!(first, Bytes::from_static(b"event: ping\n\n"));

    shutdown.cancel();
    let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream ends on shutdown");
    assert!(end.is_none());
}
