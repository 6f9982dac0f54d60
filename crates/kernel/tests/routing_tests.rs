use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use control_plane::{
    InMemoryDurableCache, InMemoryInstanceRegistry, InstanceRecord, MembershipTracker,
    NearSessionStore, SessionStore, SessionStoreConfig, StoreError, TrackerError, TrackerSettings,
};
use http::{HeaderMap, HeaderValue, Uri};
use kernel::{
    session_id_from_request, AddressResolver, RoutingError, SessionRouter, StaticAddressResolver,
};
use tokio_util::sync::CancellationToken;

struct FixedResolver(BTreeMap<String, String>);

#[async_trait]
impl AddressResolver for FixedResolver {
    async fn get_addresses(
        &self,
        _adapter: &str,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>, TrackerError> {
        Ok(self.0.clone())
    }
}

struct BrokenStore;

#[async_trait]
impl SessionStore for BrokenStore {
    async fn try_get(&self, _session_id: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("redis down".to_string()))
    }

    async fn set(&self, _session_id: &str, _target: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("redis down".to_string()))
    }

    async fn remove(&self, _session_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("redis down".to_string()))
    }
}

fn memory_store() -> Arc<NearSessionStore> {
    NearSessionStore::shared(InMemoryDurableCache::shared(), SessionStoreConfig::default())
        .expect("store")
}

fn session_header(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("mcp-session-id", HeaderValue::from_str(value).expect("header"));
    headers
}

fn uri(value: &str) -> Uri {
    value.parse().expect("uri")
}

#[tokio::test]
async fn new_session_without_healthy_instances_fails() {
    let router = SessionRouter::new(Arc::new(StaticAddressResolver::default()), memory_store());
    let err = router
        .new_session_target("alpha", &CancellationToken::new())
        .await
        .expect_err("no backend");
    assert!(matches!(err, RoutingError::NoHealthyBackend(ref adapter) if adapter == "alpha"));
}

#[tokio::test]
async fn new_sessions_spread_uniformly() {
    let addresses: BTreeMap<String, String> = (0..4)
        .map(|index| (format!("alpha-{index}"), format!("http://alpha-{index}:8000")))
        .collect();
    let router = SessionRouter::new(Arc::new(FixedResolver(addresses)), memory_store());
    let cancel = CancellationToken::new();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..8_000 {
        let target = router.new_session_target("alpha", &cancel).await.expect("target");
        *counts.entry(target).or_default() += 1;
    }
    assert_eq!(counts.len(), 4);
    for (target, count) in counts {
        assert!((1_600..=2_400).contains(&count), "{target} picked {count} times");
    }
}

#[tokio::test]
async fn new_session_does_not_touch_the_store() {
    let store = memory_store();
    let router = SessionRouter::new(
        Arc::new(StaticAddressResolver::new(BTreeMap::from([(
            "alpha".to_string(),
            "http://alpha:8000".to_string(),
        )]))),
        store.clone(),
    );
    let target = router
        .new_session_target("alpha", &CancellationToken::new())
        .await
        .expect("target");
    assert_eq!(target, "http://alpha:8000");
    assert_eq!(store.local_len(), 0);
}

#[tokio::test]
async fn continuation_without_session_id_is_rejected() {
    let router = SessionRouter::new(Arc::new(StaticAddressResolver::default()), memory_store());
    let err = router
        .existing_session_target(&uri("/adapters/alpha/messages"), &HeaderMap::new())
        .await
        .expect_err("missing id");
    assert!(matches!(err, RoutingError::SessionIdNotFound));
    assert_eq!(err.to_string(), "session id not found in the request");
}

#[tokio::test]
async fn unknown_session_is_invalid() {
    let router = SessionRouter::new(Arc::new(StaticAddressResolver::default()), memory_store());
    let err = router
        .existing_session_target(&uri("/adapters/alpha/messages?session_id=nope"), &HeaderMap::new())
        .await
        .expect_err("unknown id");
    assert!(matches!(err, RoutingError::SessionInvalid));
    assert_eq!(err.to_string(), "session id is not valid, or has expired");
}

#[tokio::test]
async fn known_session_routes_to_recorded_target() {
    let store = memory_store();
    store.set("s1", "http://alpha-1:8000").await.expect("set");
    let router = SessionRouter::new(Arc::new(StaticAddressResolver::default()), store);

    let target = router
        .existing_session_target(&uri("/adapters/alpha/mcp"), &session_header("s1"))
        .await
        .expect("target");
    assert_eq!(target, "http://alpha-1:8000");
}

#[tokio::test]
async fn failed_store_read_counts_as_unknown_session() {
    let router = SessionRouter::new(Arc::new(StaticAddressResolver::default()), Arc::new(BrokenStore));
    let err = router
        .existing_session_target(&uri("/adapters/alpha/mcp"), &session_header("s1"))
        .await
        .expect_err("store down");
    assert!(matches!(err, RoutingError::SessionInvalid));
}

#[test]
fn query_parameter_wins_over_header() {
    let found = session_id_from_request(
        &uri("/adapters/alpha/messages?session_id=from-query"),
        &session_header("from-header"),
    );
    assert_eq!(found.as_deref(), Some("from-query"));
}

#[test]
fn empty_query_value_falls_back_to_header() {
    let found = session_id_from_request(
        &uri("/adapters/alpha/messages?session_id="),
        &session_header("from-header"),
    );
    assert_eq!(found.as_deref(), Some("from-header"));
    assert_eq!(
        session_id_from_request(&uri("/adapters/alpha/mcp"), &session_header("")),
        None
    );
}

#[tokio::test]
async fn tracker_backed_routing_uses_cluster_addresses() {
    let registry = InMemoryInstanceRegistry::shared(vec![
        InstanceRecord::new("alpha-0", "alpha", true),
        InstanceRecord::new("alpha-1", "alpha", false),
    ]);
    let tracker = MembershipTracker::shared(TrackerSettings::default());
    let cancel = CancellationToken::new();
    let handle = tracker.spawn(registry, cancel.clone());
    let router = SessionRouter::new(tracker, memory_store());

    let target = router.new_session_target("alpha", &cancel).await.expect("target");
    assert_eq!(target, "http://alpha-0.alpha-service.adapter.svc.cluster.local:8000");
    let err = router
        .new_session_target("beta", &cancel)
        .await
        .expect_err("no beta instances");
    assert!(matches!(err, RoutingError::NoHealthyBackend(_)));

    cancel.cancel();
    handle.await.expect("tracker stops");
}

#[tokio::test]
async fn cancelled_wait_for_membership_is_reported() {
    let tracker = MembershipTracker::shared(TrackerSettings::default());
    let router = SessionRouter::new(tracker, memory_store());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = router
        .new_session_target("alpha", &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, RoutingError::Cancelled));
}
