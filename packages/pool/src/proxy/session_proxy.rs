//! Session proxy: the handle returned synchronously from `connect`.
//!
//! Wraps a deferred binding to the backend session record. Requests made
//! through an unbound proxy return stream proxies that buffer until the
//! origin scheduler settles the binding; backend lifecycle events republish
//! through the proxy unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::Request;
use tracing::trace;

use crate::config::AlpnProtocol;
use crate::error::{Error, Result};
use crate::events::{forward, EventListeners};
use crate::identity::ConnectionKey;
use crate::proxy::deferred::Deferred;
use crate::proxy::stream_proxy::PooledStream;
use crate::proxy::stream_proxy::StreamInner;
use crate::session::{Session, SessionEvent, SessionState, StreamSlot};

struct ProxyInner {
    key: Option<ConnectionKey>,
    backend: Deferred<Arc<Session>>,
    events: Arc<EventListeners<SessionEvent>>,
    closed: AtomicBool,
    desired_ref: AtomicBool,
}

/// Handle to a pooled (possibly not-yet-connected) HTTP/2 session.
#[derive(Clone)]
pub struct PooledSession {
    inner: Arc<ProxyInner>,
}

impl PooledSession {
    pub(crate) fn new(key: ConnectionKey) -> PooledSession {
        PooledSession {
            inner: Arc::new(ProxyInner {
                key: Some(key),
                backend: Deferred::new(),
                events: Arc::new(EventListeners::new()),
                closed: AtomicBool::new(false),
                desired_ref: AtomicBool::new(true),
            }),
        }
    }

    /// A handle that fails every operation with `error`; used when the
    /// authority cannot be parsed at all.
    pub(crate) fn failed(error: Error) -> PooledSession {
        let proxy = PooledSession {
            inner: Arc::new(ProxyInner {
                key: None,
                backend: Deferred::new(),
                events: Arc::new(EventListeners::new()),
                closed: AtomicBool::new(true),
                desired_ref: AtomicBool::new(true),
            }),
        };
        proxy.inner.backend.fail(error);
        proxy
    }

    pub(crate) fn backend(&self) -> &Deferred<Arc<Session>> {
        &self.inner.backend
    }

    /// Republish backend session events through this proxy once the backend
    /// is known, and apply a deferred `unref`.
    pub(crate) fn wire_backend_events(&self) {
        if let Some(session) = self.inner.backend.peek_value() {
            forward(session.events(), self.inner.events.clone());
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Ok(session) = inner.backend.wait().await {
                forward(session.events(), inner.events.clone());
                if !inner.desired_ref.load(Ordering::SeqCst) {
                    session.set_reffed(false);
                }
            }
        });
    }

    /// The connection identity this handle pools under.
    pub fn connection_key(&self) -> Option<&ConnectionKey> {
        self.inner.key.as_ref()
    }

    /// Open a stream. Returns synchronously; the stream proxy buffers writes
    /// until a backend session (and stream) is bound.
    pub fn request(&self, request: Request<()>, end_stream: bool) -> PooledStream {
        let stream = PooledStream::new();
        if self.inner.closed.load(Ordering::SeqCst) {
            stream.inner().fail(Error::closed());
            return stream;
        }
        let stream_inner = stream.inner().clone();
        match self.inner.backend.peek() {
            Some(Ok(session)) => {
                // Count the stream against the session now so concurrent
                // scheduling sees it; the h2 stream opens asynchronously.
                let slot = session.reserve();
                tokio::spawn(bind_stream(session, slot, request, end_stream, stream_inner));
            }
            Some(Err(error)) => {
                stream_inner.fail(error);
            }
            None => {
                trace!(target: "h2_alpn::proxy", "request before session binding");
                let backend = self.inner.backend.clone();
                tokio::spawn(async move {
                    match backend.wait().await {
                        Ok(session) => {
                            let slot = session.reserve();
                            bind_stream(session, slot, request, end_stream, stream_inner).await;
                        }
                        Err(error) => stream_inner.fail(error),
                    }
                });
            }
        }
        stream
    }

    /// Resolve once the backend session is connected.
    pub async fn ready(&self) -> Result<()> {
        let session = self.inner.backend.wait().await?;
        session.ready().await
    }

    /// Run `listener` once the session is connected; dropped on failure.
    pub fn on_connect<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let proxy = self.clone();
        tokio::spawn(async move {
            if proxy.ready().await.is_ok() {
                listener();
            }
        });
    }

    /// Subscribe to backend session lifecycle events.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener);
    }

    /// Gracefully close the backend session and wait for it to finish.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        match self.inner.backend.peek() {
            Some(Ok(session)) => session.close_and_wait().await,
            Some(Err(_)) => {}
            None => {
                // Not yet bound: withdraw from the queue.
                self.inner.backend.cancel();
            }
        }
    }

    /// Tear the backend session down now. An `error` cause evicts the
    /// identity's session ticket.
    pub fn destroy(&self, error: Option<Error>) {
        self.inner.closed.store(true, Ordering::SeqCst);
        match self.inner.backend.peek() {
            Some(Ok(session)) => session.destroy(error),
            Some(Err(_)) => {}
            None => {
                self.inner.backend.cancel();
            }
        }
    }

    /// Keep the backend session eligible for graceful teardown while idle.
    pub fn ref_session(&self) {
        self.inner.desired_ref.store(true, Ordering::SeqCst);
        if let Some(session) = self.inner.backend.peek_value() {
            session.set_reffed(true);
        }
    }

    /// Mark the backend session as not worth waiting for at teardown.
    pub fn unref_session(&self) {
        self.inner.desired_ref.store(false, Ordering::SeqCst);
        if let Some(session) = self.inner.backend.peek_value() {
            session.set_reffed(false);
        }
    }

    /// Stable identifier of the bound backend session, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.inner.backend.peek_value().map(|session| session.id())
    }

    pub fn alpn_protocol(&self) -> Option<AlpnProtocol> {
        self.inner
            .backend
            .peek_value()
            .and_then(|session| session.alpn_protocol())
    }

    /// True until a backend session is bound and its transport connected.
    pub fn is_connecting(&self) -> bool {
        match self.inner.backend.peek() {
            None => true,
            Some(Ok(session)) => session.state() == SessionState::Connecting,
            Some(Err(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.backend.peek() {
            Some(Ok(session)) => session.is_finished(),
            Some(Err(_)) => true,
            None => false,
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.inner.key)
            .field("backend", &self.inner.backend)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Wait for the session transport, open the h2 stream, and bind it to the
/// stream proxy.
async fn bind_stream(
    session: Arc<Session>,
    slot: StreamSlot,
    request: Request<()>,
    end_stream: bool,
    inner: Arc<StreamInner>,
) {
    if let Err(error) = session.ready().await {
        inner.fail(error);
        return;
    }
    match session.send_request(request, end_stream).await {
        Ok((send, response)) => inner.bind(send, response, slot),
        Err(error) => inner.fail(error),
    }
}

/// Wrap an already-established session record in a public handle.
pub(crate) fn bound(session: Arc<Session>) -> PooledSession {
    let proxy = PooledSession::new(session.key().clone());
    proxy.inner.backend.fill(session);
    proxy.wire_backend_events();
    proxy
}
