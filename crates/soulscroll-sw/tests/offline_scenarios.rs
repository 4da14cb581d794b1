//! End-to-end offline scenarios against an in-memory origin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use soulscroll_net::{Fetcher, NetError, Request, Response};
use soulscroll_sw::{
    ClientEvent, ClientMessage, Lifecycle, MessageTarget, ResponseSource, ServiceWorkerError,
    ServiceWorkerState, SyncDisposition, WorkerConfig,
};
use tokio::sync::Notify;
use url::Url;

/// An origin that can go offline and 404 chosen paths.
struct FakeOrigin {
    online: AtomicBool,
    missing: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeOrigin {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            missing: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn set_missing(&self, path: &str) {
        self.missing.lock().unwrap().push(path.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeOrigin {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }
        let path = request.url.path().to_string();
        if self.missing.lock().unwrap().contains(&path) {
            return Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND));
        }
        Ok(Response::new(request.url.clone(), StatusCode::OK).with_body(format!("live {}", path)))
    }
}

/// An origin that parks the next request for one path until released.
struct GatedOrigin {
    path: &'static str,
    status: StatusCode,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
    hits: AtomicUsize,
}

impl GatedOrigin {
    fn new(path: &'static str, status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            path,
            status,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            hits: AtomicUsize::new(0),
        })
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for GatedOrigin {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let path = request.url.path().to_string();
        if path != self.path {
            return Ok(Response::new(request.url.clone(), StatusCode::OK).with_body(format!("live {}", path)));
        }

        self.hits.fetch_add(1, Ordering::SeqCst);
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Response::new(request.url.clone(), self.status).with_body(format!("live {}", path)))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn origin() -> Url {
    Url::parse("https://soulscroll.app/").unwrap()
}

fn page(path: &str) -> Url {
    origin().join(path).unwrap()
}

fn config(version: &str) -> WorkerConfig {
    WorkerConfig::default().with_origin(origin()).with_version(version)
}

#[tokio::test]
async fn activation_leaves_only_current_store() {
    init_tracing();
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());

    lifecycle.register(config("1")).await.unwrap();
    assert_eq!(lifecycle.caches().list_store_names().await, vec!["soulscroll-v1"]);

    lifecycle.register(config("2")).await.unwrap();
    assert_eq!(lifecycle.caches().list_store_names().await, vec!["soulscroll-v2"]);
}

#[tokio::test]
async fn cached_asset_served_without_network() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();

    let before = server.calls();
    let outcome = lifecycle.fetch(Request::get(page("/manifest.json"))).await.unwrap();

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(server.calls(), before);
}

#[tokio::test]
async fn navigation_is_network_first_with_offline_fallback() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();

    let online = lifecycle.fetch(Request::navigate(page("/"))).await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);
    assert_eq!(online.response.text().unwrap(), "live /");

    server.set_online(false);
    let offline = lifecycle.fetch(Request::navigate(page("/journal/new"))).await.unwrap();
    assert_eq!(offline.source, ResponseSource::OfflineFallback);
    assert_eq!(offline.response.text().unwrap(), "live /offline.html");
}

#[tokio::test]
async fn uncached_asset_offline_fails() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();

    server.set_online(false);
    let err = lifecycle.fetch(Request::get(page("/assets/chart.js"))).await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::Network(NetError::Offline)));
}

#[tokio::test]
async fn skip_waiting_on_active_worker_is_noop() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    let worker = lifecycle.register(config("1")).await.unwrap();
    let mut client = lifecycle.connect(page("/")).await;

    for _ in 0..2 {
        let reply = lifecycle
            .post_message(ClientMessage::SkipWaiting, MessageTarget::Active)
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    assert_eq!(lifecycle.active().await.unwrap().id(), worker.id());
    assert_eq!(lifecycle.caches().list_store_names().await, vec!["soulscroll-v1"]);
    assert!(client.try_recv().is_none());
}

#[tokio::test]
async fn get_version_matches_store_name() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    let worker = lifecycle.register(config("2024.06.1")).await.unwrap();

    let reply = lifecycle
        .post_message(ClientMessage::GetVersion, MessageTarget::Worker(worker.id()))
        .await
        .unwrap();

    match reply {
        Some(ClientMessage::VersionResponse { version, timestamp }) => {
            assert_eq!(format!("soulscroll-v{}", version), worker.store_name().to_string());
            assert!(timestamp > 0);
        }
        other => panic!("expected VERSION_RESPONSE, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_offline_page_fails_install_atomically() {
    init_tracing();
    let server = FakeOrigin::new();
    server.set_missing("/offline.html");
    let lifecycle = Lifecycle::new(server.clone());

    let err = lifecycle.register(config("1")).await.unwrap_err();

    assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));
    assert!(lifecycle.caches().list_store_names().await.is_empty());
    assert!(lifecycle.active().await.is_none());
    assert!(lifecycle.installing().await.is_none());
}

#[tokio::test]
async fn empty_push_shows_default_reminder() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();

    lifecycle.push(Some(b"{}")).await.unwrap();

    let shown = lifecycle.notifications().get_all().await;
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].body, "Time for your daily reflection with Luma");
}

#[tokio::test]
async fn all_clients_receive_same_update_broadcast() {
    init_tracing();
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();

    let mut first = lifecycle.connect(page("/")).await;
    let mut second = lifecycle.connect(page("/journal")).await;

    lifecycle.register(config("2")).await.unwrap();

    let mut seen = Vec::new();
    for client in [&mut first, &mut second] {
        client
            .wait_for_controller_change(Duration::from_secs(1))
            .await
            .unwrap();
        loop {
            match client.recv().await {
                Some(ClientEvent::Message(ClientMessage::SwUpdated { version, timestamp })) => {
                    seen.push((version, timestamp));
                    break;
                }
                Some(_) => continue,
                None => panic!("client closed before SW_UPDATED"),
            }
        }
    }

    assert_eq!(seen[0].0.as_str(), "2");
    assert_eq!(seen[0].0, seen[1].0);
    assert!(seen[0].1.abs_diff(seen[1].1) < 50);
}

#[tokio::test]
async fn failed_sync_is_retried_until_success() {
    let server = FakeOrigin::new();
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();
    lifecycle.register_sync("sync-journal-entries").await;

    server.set_missing("/api/sync-offline");
    let first = lifecycle.dispatch_sync().await;
    assert!(matches!(first[0].1, soulscroll_sw::SyncDisposition::RetryAfter(_)));
    assert_eq!(lifecycle.sync_tags().await, vec!["sync-journal-entries"]);

    server.missing.lock().unwrap().clear();
    let second = lifecycle.online().await;
    assert_eq!(second[0].1, soulscroll_sw::SyncDisposition::Completed);
}

#[tokio::test]
async fn overlapping_sync_dispatches_fire_a_tag_once() {
    init_tracing();
    let server = GatedOrigin::new("/api/sync-offline", StatusCode::SERVICE_UNAVAILABLE);
    let lifecycle = Lifecycle::new(server.clone());
    lifecycle.register(config("1")).await.unwrap();
    lifecycle.register_sync("sync-journal-entries").await;

    server.arm();
    let (first, second) = tokio::join!(lifecycle.dispatch_sync(), async {
        server.entered.notified().await;
        let overlapping = lifecycle.online().await;
        server.release.notify_one();
        overlapping
    });

    assert!(second.is_empty());
    assert_eq!(
        first,
        vec![(
            "sync-journal-entries".to_string(),
            SyncDisposition::RetryAfter(Duration::from_secs(30))
        )]
    );
    assert_eq!(server.hits(), 1);

    // One failure per round: the third round is the one that gives up.
    assert_eq!(
        lifecycle.online().await[0].1,
        SyncDisposition::RetryAfter(Duration::from_secs(60))
    );
    assert_eq!(lifecycle.online().await[0].1, SyncDisposition::Abandoned);
    assert!(lifecycle.sync_tags().await.is_empty());
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn activation_waits_for_in_flight_fetch() {
    init_tracing();
    let server = GatedOrigin::new("/assets/chart.js", StatusCode::OK);
    let lifecycle = Lifecycle::new(server.clone());
    let v1 = lifecycle.register(config("1")).await.unwrap();
    let _page = lifecycle.connect(page("/")).await;
    let mut update = config("2");
    update.skip_waiting_on_install = false;
    let v2 = lifecycle.register(update).await.unwrap();
    assert_eq!(v2.state(), ServiceWorkerState::Installed);

    server.arm();
    let (outcome, promoted) = tokio::join!(lifecycle.fetch(Request::get(page("/assets/chart.js"))), async {
        server.entered.notified().await;
        let promote = lifecycle.skip_waiting();
        tokio::pin!(promote);

        let blocked = tokio::time::timeout(Duration::from_millis(50), &mut promote).await;
        assert!(blocked.is_err(), "activation finished during an in-flight fetch");
        assert_eq!(v1.state(), ServiceWorkerState::Activated);
        assert_eq!(v2.state(), ServiceWorkerState::Installed);
        assert!(lifecycle
            .caches()
            .list_store_names()
            .await
            .contains(&"soulscroll-v1".to_string()));

        server.release.notify_one();
        promote.await
    });

    let outcome = outcome.unwrap();
    assert_eq!(outcome.source, ResponseSource::Network);
    assert_eq!(outcome.response.text().unwrap(), "live /assets/chart.js");
    assert!(promoted.unwrap());
    assert_eq!(v1.state(), ServiceWorkerState::Redundant);
    assert_eq!(v2.state(), ServiceWorkerState::Activated);
    assert_eq!(lifecycle.caches().list_store_names().await, vec!["soulscroll-v2"]);

    let after = lifecycle.fetch(Request::get(page("/manifest.json"))).await.unwrap();
    assert_eq!(after.source, ResponseSource::Cache);
}
