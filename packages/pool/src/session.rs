//! Pooled HTTP/2 session record.
//!
//! A `Session` wraps one multiplexed transport: the h2 stream-opening handle,
//! the spawned connection driver, an exact open-stream count, and the
//! lifecycle state machine. Origins schedule over these records; callers only
//! ever hold the [`crate::PooledSession`] proxy.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::SendStream;
use http::Request;
use tls_session_cache::TlsSessionCache;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::{AlpnProtocol, ConnectOptions};
use crate::error::{Error, Result};
use crate::events::EventListeners;
use crate::factory::{SessionFactory, SessionParts};
use crate::identity::{ConnectionKey, Endpoint};
use crate::proxy::deferred::Deferred;

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a pooled session.
///
/// `Destroyed` is the terminal error variant, reachable from any non-closed
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Idle,
    Closed,
    Destroyed,
}

/// Lifecycle events, forwarded verbatim through session proxies.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Connected,
    Active,
    Idle,
    StreamOpened,
    StreamClosed,
    Closed,
    Error(Error),
}

type FreeHook = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;
type CloseHook = Box<dyn FnOnce(&Arc<Session>, Option<&Error>) + Send>;

struct Inner {
    state: SessionState,
    closing: bool,
    finished: bool,
    send: Option<SendRequest<Bytes>>,
    driver: Option<JoinHandle<()>>,
    alpn_protocol: Option<AlpnProtocol>,
    on_free: Option<FreeHook>,
    close_hooks: Vec<CloseHook>,
}

pub(crate) struct Session {
    weak_self: Weak<Session>,
    id: u64,
    key: ConnectionKey,
    peer_max_concurrent_streams: u32,
    ticket_cache: Option<Arc<TlsSessionCache>>,
    resumption_enabled: bool,
    streams: AtomicU32,
    reffed: AtomicBool,
    ready: Deferred<()>,
    closed_cell: Deferred<()>,
    events: EventListeners<SessionEvent>,
    inner: Mutex<Inner>,
}

impl Session {
    /// Create a session record in the `Connecting` state. The transport is
    /// filled in later by [`complete`](Self::complete), so schedulers can
    /// count it against capacity immediately.
    pub(crate) fn connecting(
        key: ConnectionKey,
        options: &ConnectOptions,
        tls: bool,
    ) -> Arc<Session> {
        let id = SESSION_IDS.fetch_add(1, Ordering::Relaxed);
        debug!(target: "h2_alpn::session", id, key = %key, "creating new session");
        Arc::new_cyclic(|weak| Session {
            weak_self: weak.clone(),
            id,
            key,
            peer_max_concurrent_streams: options.peer_max_concurrent_streams,
            ticket_cache: options.tls_session_cache.clone(),
            resumption_enabled: tls && options.tls_session_cache.is_some(),
            streams: AtomicU32::new(0),
            reffed: AtomicBool::new(true),
            ready: Deferred::new(),
            closed_cell: Deferred::new(),
            events: EventListeners::new(),
            inner: Mutex::new(Inner {
                state: SessionState::Connecting,
                closing: false,
                finished: false,
                send: None,
                driver: None,
                alpn_protocol: None,
                on_free: None,
                close_hooks: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub(crate) fn alpn_protocol(&self) -> Option<AlpnProtocol> {
        self.lock().alpn_protocol
    }

    pub(crate) fn open_streams(&self) -> u32 {
        self.streams.load(Ordering::SeqCst)
    }

    /// Whether another stream fits under the peer's concurrency limit.
    pub(crate) fn has_available_streams(&self) -> bool {
        self.open_streams() < self.peer_max_concurrent_streams
    }

    pub(crate) fn events(&self) -> &EventListeners<SessionEvent> {
        &self.events
    }

    pub(crate) fn set_reffed(&self, reffed: bool) {
        self.reffed.store(reffed, Ordering::SeqCst);
    }

    pub(crate) fn is_reffed(&self) -> bool {
        self.reffed.load(Ordering::SeqCst)
    }

    /// Install the scheduler callback invoked whenever a stream slot frees.
    pub(crate) fn set_on_free<F>(&self, hook: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.lock().on_free = Some(Arc::new(hook));
    }

    /// Run `hook` once when the session leaves the open states.
    pub(crate) fn add_close_hook<F>(&self, hook: F)
    where
        F: FnOnce(&Arc<Session>, Option<&Error>) + Send + 'static,
    {
        self.lock().close_hooks.push(Box::new(hook));
    }

    pub(crate) fn mark_active(&self) {
        let mut inner = self.lock();
        if !inner.finished && inner.state == SessionState::Idle {
            inner.state = SessionState::Active;
        }
    }

    pub(crate) fn mark_idle(&self) {
        {
            let mut inner = self.lock();
            if inner.finished || inner.state != SessionState::Active {
                return;
            }
            inner.state = SessionState::Idle;
        }
        self.events.emit(&SessionEvent::Idle);
    }

    /// Count a stream against this session. The slot is released when the
    /// returned guard drops, which is when the stream is fully done.
    pub(crate) fn reserve(&self) -> StreamSlot {
        let previous = self.streams.fetch_add(1, Ordering::SeqCst);
        trace!(
            target: "h2_alpn::session",
            id = self.id,
            streams = previous + 1,
            "stream opened"
        );
        if previous == 0 {
            self.events.emit(&SessionEvent::Active);
        }
        self.events.emit(&SessionEvent::StreamOpened);
        StreamSlot {
            session: self.weak_self.clone(),
        }
    }

    /// Resolve once the transport is connected; fails if establishment
    /// failed or the session was torn down first.
    pub(crate) async fn ready(&self) -> Result<()> {
        self.ready.wait().await
    }

    /// Wait for the session to be fully closed.
    pub(crate) async fn wait_closed(&self) {
        let _ = self.closed_cell.wait().await;
    }

    /// Open one multiplexed stream.
    pub(crate) async fn send_request(
        &self,
        request: Request<()>,
        end_stream: bool,
    ) -> Result<(SendStream<Bytes>, ResponseFuture)> {
        let send = self.lock().send.clone();
        let Some(mut send) = send else {
            return Err(Error::closed().with_key(self.key.clone()));
        };
        std::future::poll_fn(|cx| send.poll_ready(cx))
            .await
            .map_err(Error::session)?;
        let (response, stream) = send
            .send_request(request, end_stream)
            .map_err(Error::stream)?;
        Ok((stream, response))
    }

    /// Attach the handshaken transport and start driving it.
    pub(crate) fn complete(&self, parts: SessionParts) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        {
            let mut inner = self.lock();
            if inner.finished || inner.closing {
                // Torn down while connecting; dropping the parts closes the
                // transport.
                drop(inner);
                self.finish_close(None, false);
                return;
            }
            inner.send = Some(parts.send);
            inner.alpn_protocol = Some(parts.alpn_protocol);
            inner.state = SessionState::Active;
            let connection = parts.connection;
            inner.driver = Some(tokio::spawn(async move {
                match connection.await {
                    Ok(()) => {
                        trace!(target: "h2_alpn::session", id = this.id, "transport closed");
                        this.finish_close(None, false);
                    }
                    Err(err) => {
                        debug!(target: "h2_alpn::session", id = this.id, %err, "transport failed");
                        this.finish_close(Some(Error::session(err)), true);
                    }
                }
            }));
        }
        debug!(target: "h2_alpn::session", id = self.id, "session connected");
        self.ready.fill(());
        self.events.emit(&SessionEvent::Connected);
        if self.open_streams() == 0 {
            // Connected with nothing reserved; let the scheduler park it.
            self.notify_free();
        }
    }

    /// Establishment failed. The establisher already evicted the ticket, so
    /// the close path must not evict it again.
    pub(crate) fn fail_connect(&self, error: Error) {
        debug!(target: "h2_alpn::session", id = self.id, %error, "session failed to connect");
        self.finish_close(Some(error), false);
    }

    /// Graceful close: no new streams, existing streams run to completion,
    /// then the transport shuts down.
    pub(crate) fn close(&self) {
        let (send, connected) = {
            let mut inner = self.lock();
            if inner.finished || inner.closing {
                return;
            }
            inner.closing = true;
            (inner.send.take(), inner.driver.is_some())
        };
        debug!(target: "h2_alpn::session", id = self.id, "closing session");
        drop(send);
        if !connected {
            // Never connected, so no driver will run the close path.
            self.finish_close(None, false);
        }
    }

    pub(crate) async fn close_and_wait(&self) {
        self.close();
        self.wait_closed().await;
    }

    /// Graceful close for reffed sessions, immediate teardown otherwise.
    pub(crate) fn close_by_policy(&self) {
        if self.is_reffed() {
            self.close();
        } else {
            self.destroy(None);
        }
    }

    /// Tear the session down now. Streams still open fail with a session
    /// error; an `error` cause evicts the identity's session ticket.
    pub(crate) fn destroy(&self, error: Option<Error>) {
        let driver = {
            let mut inner = self.lock();
            if inner.finished {
                return;
            }
            inner.send = None;
            inner.driver.take()
        };
        debug!(target: "h2_alpn::session", id = self.id, "destroying session");
        if let Some(driver) = driver {
            driver.abort();
        }
        let evict = error.is_some();
        self.finish_close(error, evict);
    }

    fn notify_free(&self) {
        if self.is_finished() {
            trace!(target: "h2_alpn::session", id = self.id, "not reusing closed session");
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let hook = self.lock().on_free.clone();
        if let Some(hook) = hook {
            hook(&this);
        }
    }

    /// The single exit point: runs at most once per session, from the
    /// driver, a failed establishment, or an explicit close/destroy.
    fn finish_close(&self, error: Option<Error>, evict_ticket: bool) {
        let hooks = {
            let mut inner = self.lock();
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.state = if error.is_some() {
                SessionState::Destroyed
            } else {
                SessionState::Closed
            };
            inner.send = None;
            inner.driver = None;
            inner.on_free = None;
            std::mem::take(&mut inner.close_hooks)
        };
        if evict_ticket && self.resumption_enabled {
            if let Some(cache) = &self.ticket_cache {
                cache.evict(self.key.as_str());
            }
        }
        match &error {
            Some(err) => {
                self.ready.fail(err.clone());
                self.events.emit(&SessionEvent::Error(err.clone()));
            }
            None => {
                // Rejects proxies still waiting on a session that will never
                // connect; a no-op when the session was already ready.
                self.ready.fail(Error::closed());
            }
        }
        if let Some(this) = self.weak_self.upgrade() {
            for hook in hooks {
                hook(&this, error.as_ref());
            }
        }
        self.events.emit(&SessionEvent::Closed);
        self.closed_cell.fill(());
        debug!(target: "h2_alpn::session", id = self.id, state = ?self.state(), "session removed");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("streams", &self.open_streams())
            .finish()
    }
}

/// Guard for one counted stream; dropping it frees the slot and notifies
/// the scheduler.
pub(crate) struct StreamSlot {
    session: Weak<Session>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let previous = session.streams.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "stream count underflow");
        trace!(
            target: "h2_alpn::session",
            id = session.id,
            streams = previous.saturating_sub(1),
            "stream closed"
        );
        session.events.emit(&SessionEvent::StreamClosed);
        session.notify_free();
    }
}

impl std::fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSlot").finish()
    }
}

/// Drive `factory` and settle the session record with the outcome.
pub(crate) async fn establish(
    session: Arc<Session>,
    factory: Arc<dyn SessionFactory>,
    endpoint: Endpoint,
    options: Arc<ConnectOptions>,
) {
    let key = session.key().clone();
    match factory.create(&endpoint, &key, &options).await {
        Ok(parts) => session.complete(parts),
        Err(error) => session.fail_connect(error),
    }
}
