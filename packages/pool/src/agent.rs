//! ALPN agent: negotiated connections with flat per-identity reuse.
//!
//! Where the [`crate::Pool`] schedules many sessions per origin, the agent
//! keeps exactly one shared HTTP/2 session per identity (reused by peeking)
//! and a LIFO stack of idle HTTP/1.1 byte streams (reused by popping), with
//! ALPN deciding which side a negotiated connection lands on.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::cache::SocketCache;
use crate::config::{AlpnProtocol, ConnectOptions, DEFAULT_PROTOCOLS};
use crate::connect::{AlpnConnector, MaybeTlsStream, Negotiated};
use crate::error::Result;
use crate::factory::handshake_h2;
use crate::identity::{connection_key, ConnectionKey, Endpoint};
use crate::proxy::session_proxy::{self, PooledSession};
use crate::session::Session;

struct AgentInner {
    connector: AlpnConnector,
    options: ConnectOptions,
    h1: Mutex<SocketCache<MaybeTlsStream>>,
    h2: Mutex<SocketCache<Arc<Session>>>,
}

/// Client agent that negotiates HTTP/2 vs HTTP/1.1 per destination and
/// caches the results.
#[derive(Clone)]
pub struct AlpnAgent {
    inner: Arc<AgentInner>,
}

impl AlpnAgent {
    pub fn new(options: ConnectOptions) -> AlpnAgent {
        AlpnAgent {
            inner: Arc::new(AgentInner {
                connector: AlpnConnector::new(),
                options,
                h1: Mutex::new(SocketCache::new()),
                h2: Mutex::new(SocketCache::new()),
            }),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn connection_key(&self, authority: &str) -> Result<ConnectionKey> {
        let endpoint = Endpoint::parse(authority)?;
        Ok(connection_key(&endpoint, &self.inner.options))
    }

    /// Dial `authority` offering `[h2, http/1.1]` and report what the peer
    /// picked. The negotiated connection is cached on the matching side, so
    /// a follow-up `create_h1_connection` or `create_h2_session` reuses it.
    pub async fn negotiate(&self, authority: &str) -> Result<AlpnProtocol> {
        let endpoint = Endpoint::parse(authority)?;
        let negotiated = self
            .inner
            .connector
            .connect(&endpoint, &DEFAULT_PROTOCOLS, &self.inner.options)
            .await?;
        let protocol = negotiated.protocol;
        debug!(target: "h2_alpn::agent", %protocol, "caching negotiated connection");
        match protocol {
            AlpnProtocol::H2 => {
                self.adopt_h2(negotiated).await?;
            }
            AlpnProtocol::Http11 => {
                self.inner
                    .lock_h1()
                    .push(negotiated.key, negotiated.stream);
            }
        }
        Ok(protocol)
    }

    /// A raw byte stream negotiated for HTTP/1.1: the most recently released
    /// idle stream for the identity, or a fresh connection.
    pub async fn create_h1_connection(&self, authority: &str) -> Result<MaybeTlsStream> {
        let endpoint = Endpoint::parse(authority)?;
        let key = connection_key(&endpoint, &self.inner.options);
        if let Some(conn) = self.inner.lock_h1().pop(&key) {
            debug!(target: "h2_alpn::agent", %key, "use cached h1 connection");
            return Ok(conn);
        }
        debug!(target: "h2_alpn::agent", %key, "create new h1 connection");
        let negotiated = self
            .inner
            .connector
            .connect(&endpoint, &[AlpnProtocol::Http11], &self.inner.options)
            .await?;
        Ok(negotiated.stream)
    }

    /// Return an idle HTTP/1.1 stream to the stack for reuse.
    pub fn release_h1_connection(&self, authority: &str, conn: MaybeTlsStream) -> Result<()> {
        let endpoint = Endpoint::parse(authority)?;
        let key = connection_key(&endpoint, &self.inner.options);
        self.inner.lock_h1().push(key, conn);
        Ok(())
    }

    /// The shared HTTP/2 session for the identity, or a fresh one negotiated
    /// with `[h2]`. Reuse peeks rather than pops: one multiplexed session
    /// serves every caller.
    pub async fn create_h2_session(&self, authority: &str) -> Result<PooledSession> {
        let endpoint = Endpoint::parse(authority)?;
        let key = connection_key(&endpoint, &self.inner.options);
        let cached = self.inner.lock_h2().peek(&key).cloned();
        if let Some(session) = cached {
            if !session.is_finished() {
                debug!(target: "h2_alpn::agent", %key, "use cached h2 connection");
                return Ok(session_proxy::bound(session));
            }
        }
        debug!(target: "h2_alpn::agent", %key, "create new h2 connection");
        let negotiated = self
            .inner
            .connector
            .connect(&endpoint, &[AlpnProtocol::H2], &self.inner.options)
            .await?;
        let session = self.adopt_h2(negotiated).await?;
        Ok(session_proxy::bound(session))
    }

    /// Handshake h2 over a negotiated stream and park the session in the
    /// shared slot. A session that errors or closes removes itself.
    async fn adopt_h2(&self, negotiated: Negotiated) -> Result<Arc<Session>> {
        let tls = negotiated.stream.is_tls();
        let Negotiated { stream, protocol, key } = negotiated;
        let parts = handshake_h2(stream, protocol).await?;
        let session = Session::connecting(key.clone(), &self.inner.options, tls);
        let weak = Arc::downgrade(&self.inner);
        {
            let key = key.clone();
            session.add_close_hook(move |session, _error| {
                if let Some(agent) = weak.upgrade() {
                    let id = session.id();
                    agent.lock_h2().remove_where(&key, |entry| entry.id() == id);
                }
            });
        }
        session.complete(parts);
        self.inner.lock_h2().push(key, session.clone());
        Ok(session)
    }

    /// Forcibly close every cached connection and clear both caches.
    pub fn destroy(&self) {
        debug!(target: "h2_alpn::agent", "destroying agent caches");
        self.inner.lock_h1().dispose(drop);
        self.inner.lock_h2().dispose(|session| session.close());
    }
}

impl AgentInner {
    fn lock_h1(&self) -> MutexGuard<'_, SocketCache<MaybeTlsStream>> {
        match self.h1.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_h2(&self) -> MutexGuard<'_, SocketCache<Arc<Session>>> {
        match self.h2.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for AlpnAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpnAgent")
            .field("h1", &self.inner.lock_h1().len())
            .field("h2", &self.inner.lock_h2().len())
            .finish()
    }
}
