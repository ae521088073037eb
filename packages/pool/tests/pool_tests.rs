//! Pool scheduling behavior over deterministic in-memory h2 transports.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h2_alpn::{ConnectOptions, Error, Pool, PooledSession, PooledStream, TlsSessionCache};
use support::{get_request, post_request, MemoryFactory};

const AUTHORITY: &str = "https://origin.test";

fn pool_with(factory: Arc<MemoryFactory>, options: ConnectOptions) -> Pool {
    Pool::new(options.with_session_factory(factory))
}

/// Run a full request/response cycle and release the stream slot.
async fn roundtrip(session: &PooledSession) {
    let stream = session.request(get_request(AUTHORITY), true);
    finish(stream).await;
}

async fn finish(stream: PooledStream) {
    let response = stream.response().await.expect("response");
    assert_eq!(response.status(), http::StatusCode::OK);
    let mut body = response.into_body();
    let data = body.collect().await.expect("body");
    assert_eq!(&data[..], b"hello");
    drop(body);
    drop(stream);
}

async fn wait_closed(session: &PooledSession) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !session.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("session did not close");
}

#[tokio::test]
async fn allocates_the_same_session_for_one_identity() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory.clone(), ConnectOptions::default().with_keep_alive(true));
    let first = pool.connect(AUTHORITY);
    assert!(first.is_connecting());
    let second = pool.connect(AUTHORITY);
    first.ready().await.expect("first ready");
    second.ready().await.expect("second ready");
    assert!(first.session_id().is_some());
    assert_eq!(first.session_id(), second.session_id());
    assert_eq!(factory.created(), 1);
    assert_eq!(pool.origin_count(), 1);
    pool.destroy().await;
}

#[tokio::test]
async fn performs_a_request() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory, ConnectOptions::default().with_keep_alive(true));
    let session = pool.connect(AUTHORITY);
    roundtrip(&session).await;
    pool.destroy().await;
}

#[tokio::test]
async fn saturation_spawns_a_second_session() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory.clone(),
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1),
    );
    let first = pool.connect(AUTHORITY);
    let open = first.request(get_request(AUTHORITY), true);
    let second = pool.connect(AUTHORITY);
    first.ready().await.expect("first ready");
    second.ready().await.expect("second ready");
    assert_ne!(first.session_id(), second.session_id());
    assert_eq!(factory.created(), 2);
    finish(open).await;
    pool.destroy().await;
}

#[tokio::test]
async fn queues_fifo_when_max_sessions_reached() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory.clone(),
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1)
            .with_max_sessions(1),
    );
    let first = pool.connect(AUTHORITY);
    let open = first.request(get_request(AUTHORITY), true);
    first.ready().await.expect("first ready");

    let second = pool.connect(AUTHORITY);
    let third = pool.connect(AUTHORITY);
    assert!(second.session_id().is_none());
    assert!(third.session_id().is_none());
    let key = pool.connection_key(AUTHORITY).expect("key");
    assert_eq!(pool.origin_stats(&key).expect("stats").queued, 2);

    // Releasing the only stream serves the oldest queued request first.
    finish(open).await;
    assert_eq!(second.session_id(), first.session_id());
    assert!(third.session_id().is_none());

    roundtrip(&second).await;
    assert_eq!(third.session_id(), first.session_id());
    assert_eq!(factory.created(), 1);
    pool.destroy().await;
}

#[tokio::test]
async fn capacity_error_when_queueing_disabled() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory,
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1)
            .with_max_sessions(1)
            .with_queue_requests(false),
    );
    let first = pool.connect(AUTHORITY);
    let open = first.request(get_request(AUTHORITY), true);
    first.ready().await.expect("first ready");
    let second = pool.connect(AUTHORITY);
    let err = second.ready().await.expect_err("capacity exhausted");
    assert!(err.is_capacity());
    finish(open).await;
    pool.destroy().await;
}

#[tokio::test]
async fn revives_idle_sessions() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory.clone(), ConnectOptions::default().with_keep_alive(true));
    let key = pool.connection_key(AUTHORITY).expect("key");

    let first = pool.connect(AUTHORITY);
    roundtrip(&first).await;
    let stats = pool.origin_stats(&key).expect("stats");
    assert_eq!((stats.active, stats.idle), (0, 1));
    assert_eq!(pool.idle_len(), 1);

    let second = pool.connect(AUTHORITY);
    assert_eq!(second.session_id(), first.session_id());
    let stats = pool.origin_stats(&key).expect("stats");
    assert_eq!((stats.active, stats.idle), (1, 0));
    assert_eq!(pool.idle_len(), 0);
    assert_eq!(factory.created(), 1);
    pool.destroy().await;
}

#[tokio::test]
async fn closes_idle_sessions_when_keep_alive_is_disabled() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory.clone(), ConnectOptions::default());
    let first = pool.connect(AUTHORITY);
    roundtrip(&first).await;
    wait_closed(&first).await;
    assert_eq!(pool.idle_len(), 0);

    let second = pool.connect(AUTHORITY);
    second.ready().await.expect("second ready");
    assert_ne!(second.session_id(), first.session_id());
    assert_eq!(factory.created(), 2);
    pool.destroy().await;
}

#[tokio::test]
async fn closes_idle_sessions_when_max_free_is_zero() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory.clone(),
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_max_free_sessions(0),
    );
    let first = pool.connect(AUTHORITY);
    roundtrip(&first).await;
    wait_closed(&first).await;
    assert_eq!(pool.idle_len(), 0);
    let second = pool.connect(AUTHORITY);
    second.ready().await.expect("second ready");
    assert_ne!(second.session_id(), first.session_id());
    pool.destroy().await;
}

#[tokio::test]
async fn evicts_the_oldest_idle_session_first() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory.clone(),
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1)
            .with_max_free_sessions(1),
    );
    let key = pool.connection_key(AUTHORITY).expect("key");

    let first = pool.connect(AUTHORITY);
    let open_a = first.request(get_request(AUTHORITY), true);
    let second = pool.connect(AUTHORITY);
    let open_b = second.request(get_request(AUTHORITY), true);
    first.ready().await.expect("first ready");
    second.ready().await.expect("second ready");
    assert_ne!(first.session_id(), second.session_id());

    // A idles first, then B; admitting B evicts A (oldest inserted).
    finish(open_a).await;
    assert_eq!(pool.idle_len(), 1);
    finish(open_b).await;
    assert_eq!(pool.idle_len(), 1);
    let stats = pool.origin_stats(&key).expect("stats");
    assert_eq!(stats.idle, 1);
    wait_closed(&first).await;
    assert!(!second.is_closed());

    let third = pool.connect(AUTHORITY);
    assert_eq!(third.session_id(), second.session_id());
    pool.destroy().await;
}

#[tokio::test]
async fn destroying_a_session_with_an_error_evicts_its_ticket_once() {
    let cache = Arc::new(TlsSessionCache::default());
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory,
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_tls_session_cache(cache.clone()),
    );
    let session = pool.connect(AUTHORITY);
    session.ready().await.expect("ready");
    assert_eq!(cache.evictions(), 0);

    session.destroy(Some(Error::session("transmission error")));
    assert_eq!(cache.evictions(), 1);
    // A second destroy is a no-op; the eviction already happened.
    session.destroy(Some(Error::session("again")));
    assert_eq!(cache.evictions(), 1);

    let key = pool.connection_key(AUTHORITY).expect("key");
    assert!(cache.load(key.as_str()).is_none());
    assert_eq!(cache.misses(), 1);
    pool.destroy().await;
}

#[tokio::test]
async fn session_error_rejects_pending_streams_and_replaces_for_queued() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory.clone(),
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1)
            .with_max_sessions(1),
    );
    let first = pool.connect(AUTHORITY);
    let open = first.request(get_request(AUTHORITY), true);
    first.ready().await.expect("first ready");
    let queued = pool.connect(AUTHORITY);
    assert!(queued.session_id().is_none());

    first.destroy(Some(Error::session("boom")));
    // The queued request gets a fresh session attempt.
    queued.ready().await.expect("replacement ready");
    assert_ne!(queued.session_id(), first.session_id());
    assert_eq!(factory.created(), 2);
    // The stream on the destroyed session fails, siblings unaffected.
    assert!(open.response().await.is_err());
    roundtrip(&queued).await;
    pool.destroy().await;
}

#[tokio::test]
async fn buffers_writes_until_the_backend_binds() {
    let factory = Arc::new(MemoryFactory::with_delay(Duration::from_millis(50)));
    let pool = pool_with(factory, ConnectOptions::default().with_keep_alive(true));
    let session = pool.connect(AUTHORITY);
    let stream = session.request(post_request(AUTHORITY), false);
    // The backend session does not exist yet; this write buffers.
    let receipt = stream
        .send_data(Bytes::from_static(b"ping"), true)
        .expect("buffered write");
    receipt.acknowledged().await.expect("write replayed");
    let response = stream.response().await.expect("response");
    assert_eq!(response.status(), http::StatusCode::OK);
    pool.destroy().await;
}

#[tokio::test]
async fn closing_an_unbound_stream_releases_buffered_writes() {
    let factory = Arc::new(MemoryFactory::with_delay(Duration::from_millis(50)));
    let pool = pool_with(factory, ConnectOptions::default().with_keep_alive(true));
    let session = pool.connect(AUTHORITY);
    let stream = session.request(post_request(AUTHORITY), false);
    let receipt = stream
        .send_data(Bytes::from_static(b"never sent"), true)
        .expect("buffered write");
    stream.close();
    // The buffered write is released, not acked as a success.
    assert!(receipt.acknowledged().await.is_err());
    assert!(stream.response().await.is_err());
    pool.destroy().await;
}

#[tokio::test]
async fn closing_an_unbound_proxy_withdraws_its_queue_entry() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory.clone(),
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1)
            .with_max_sessions(1),
    );
    let first = pool.connect(AUTHORITY);
    let open = first.request(get_request(AUTHORITY), true);
    first.ready().await.expect("first ready");
    let abandoned = pool.connect(AUTHORITY);
    let waiting = pool.connect(AUTHORITY);
    abandoned.close().await;

    finish(open).await;
    // The cancelled entry is skipped; the next queued request is served.
    assert!(abandoned.session_id().is_none());
    assert_eq!(waiting.session_id(), first.session_id());
    pool.destroy().await;
}

#[tokio::test]
async fn destroy_closes_every_session_and_rejects_the_queue() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(
        factory,
        ConnectOptions::default()
            .with_keep_alive(true)
            .with_peer_max_concurrent_streams(1)
            .with_max_sessions(1),
    );
    let first = pool.connect(AUTHORITY);
    let open = first.request(get_request(AUTHORITY), true);
    first.ready().await.expect("first ready");
    let served = pool.connect(AUTHORITY);
    let starved = pool.connect(AUTHORITY);

    // Frees one slot: the oldest queued request binds, the other stays
    // queued until destroy rejects it.
    finish(open).await;
    assert_eq!(served.session_id(), first.session_id());
    assert!(starved.session_id().is_none());

    pool.destroy().await;
    assert_eq!(pool.origin_count(), 0);
    assert_eq!(pool.idle_len(), 0);
    assert!(first.is_closed());
    let err = starved.ready().await.expect_err("queued rejected");
    assert!(err.is_closed());
}

#[tokio::test]
async fn reclaims_an_origin_with_no_sessions() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory, ConnectOptions::default());
    let session = pool.connect(AUTHORITY);
    roundtrip(&session).await;
    wait_closed(&session).await;
    assert_eq!(pool.origin_count(), 0);
}

#[tokio::test]
async fn on_connect_fires_once_the_session_is_up() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory, ConnectOptions::default().with_keep_alive(true));
    let session = pool.connect(AUTHORITY);
    let (tx, rx) = tokio::sync::oneshot::channel();
    session.on_connect(move || {
        let _ = tx.send(());
    });
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("listener invoked")
        .expect("listener sent");
    pool.destroy().await;
}

#[tokio::test]
async fn forwards_backend_lifecycle_events_through_the_proxy() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory, ConnectOptions::default().with_keep_alive(true));
    let session = pool.connect(AUTHORITY);
    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        session.on_event(move |event| {
            seen.lock().unwrap().push(format!("{event:?}"));
        });
    }
    roundtrip(&session).await;
    let events = seen.lock().unwrap().clone();
    assert!(events.iter().any(|event| event == "Connected"));
    assert!(events.iter().any(|event| event == "StreamOpened"));
    assert!(events.iter().any(|event| event == "StreamClosed"));
    assert!(events.iter().any(|event| event == "Idle"));
    pool.destroy().await;
}

#[tokio::test]
async fn bad_authority_fails_the_handle() {
    let factory = Arc::new(MemoryFactory::new());
    let pool = pool_with(factory, ConnectOptions::default());
    let session = pool.connect("ftp://origin.test");
    let err = session.ready().await.expect_err("unsupported scheme");
    assert_eq!(err.kind(), h2_alpn::Kind::Builder);
}
