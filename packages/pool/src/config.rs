//! Connection and pool options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tls_session_cache::TlsSessionCache;

use crate::abort::AbortSignal;
use crate::dns::Resolve;
use crate::factory::SessionFactory;

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &str = "h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_H1: &str = "http/1.1";

/// Protocols offered when negotiating, in priority order.
pub const DEFAULT_PROTOCOLS: [AlpnProtocol; 2] = [AlpnProtocol::H2, AlpnProtocol::Http11];

pub const DEFAULT_MAX_SESSIONS: usize = 8;
pub const DEFAULT_MAX_FREE_SESSIONS: usize = 1;
/// Streams allowed per session until the peer is assumed saturated.
pub const DEFAULT_PEER_MAX_CONCURRENT_STREAMS: u32 = 100;
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// An application protocol negotiable over ALPN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlpnProtocol {
    H2,
    Http11,
}

impl AlpnProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            AlpnProtocol::H2 => ALPN_H2,
            AlpnProtocol::Http11 => ALPN_H1,
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Map a negotiated wire identifier back to a protocol.
    pub fn from_wire(wire: &[u8]) -> Option<AlpnProtocol> {
        match wire {
            b"h2" => Some(AlpnProtocol::H2),
            b"http/1.1" => Some(AlpnProtocol::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for AlpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for connection establishment and pooling.
///
/// The same options drive the [`crate::AlpnAgent`] and the
/// [`crate::Pool`]; pool-only knobs (`max_sessions`, `max_free_sessions`,
/// `keep_alive`) are ignored by the agent's flat caches.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Park idle sessions for reuse instead of closing them.
    pub keep_alive: bool,
    /// TCP keep-alive probe interval applied to every socket.
    pub keep_alive_interval: Duration,
    /// Disable Nagle's algorithm on every socket.
    pub no_delay: bool,
    /// Active + idle sessions allowed per origin.
    pub max_sessions: usize,
    /// Pool-wide cap on parked idle sessions.
    pub max_free_sessions: usize,
    /// Queue session requests past capacity instead of failing them.
    pub queue_requests: bool,
    /// Verify the peer certificate chain.
    pub reject_unauthorized: bool,
    /// Protocols to offer via ALPN, in priority order.
    pub alpn_protocols: Vec<AlpnProtocol>,
    /// Ticket cache consulted and refreshed around every TLS handshake.
    /// `None` disables session resumption.
    pub tls_session_cache: Option<Arc<TlsSessionCache>>,
    /// Streams scheduled onto one session before a new one is opened.
    pub peer_max_concurrent_streams: u32,
    /// Custom address resolution; `None` uses the system resolver.
    pub resolver: Option<Arc<dyn Resolve>>,
    /// Deadline for the whole DNS + TCP + TLS establishment.
    pub connect_timeout: Option<Duration>,
    /// External cancellation for in-flight connection attempts.
    pub signal: Option<AbortSignal>,
    /// SNI override; defaults to the destination host.
    pub server_name: Option<String>,
    /// Session transport factory; `None` uses the ALPN establisher.
    pub session_factory: Option<Arc<dyn SessionFactory>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            no_delay: true,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_free_sessions: DEFAULT_MAX_FREE_SESSIONS,
            queue_requests: true,
            reject_unauthorized: true,
            alpn_protocols: vec![AlpnProtocol::H2],
            tls_session_cache: None,
            peer_max_concurrent_streams: DEFAULT_PEER_MAX_CONCURRENT_STREAMS,
            resolver: None,
            connect_timeout: None,
            signal: None,
            server_name: None,
            session_factory: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_max_free_sessions(mut self, max_free_sessions: usize) -> Self {
        self.max_free_sessions = max_free_sessions;
        self
    }

    pub fn with_queue_requests(mut self, queue_requests: bool) -> Self {
        self.queue_requests = queue_requests;
        self
    }

    pub fn with_reject_unauthorized(mut self, reject_unauthorized: bool) -> Self {
        self.reject_unauthorized = reject_unauthorized;
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<AlpnProtocol>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn with_tls_session_cache(mut self, cache: Arc<TlsSessionCache>) -> Self {
        self.tls_session_cache = Some(cache);
        self
    }

    pub fn without_tls_session_cache(mut self) -> Self {
        self.tls_session_cache = None;
        self
    }

    pub fn with_peer_max_concurrent_streams(mut self, streams: u32) -> Self {
        self.peer_max_concurrent_streams = streams;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = Some(factory);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("keep_alive", &self.keep_alive)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("no_delay", &self.no_delay)
            .field("max_sessions", &self.max_sessions)
            .field("max_free_sessions", &self.max_free_sessions)
            .field("queue_requests", &self.queue_requests)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("tls_session_cache", &self.tls_session_cache.is_some())
            .field(
                "peer_max_concurrent_streams",
                &self.peer_max_concurrent_streams,
            )
            .field("resolver", &self.resolver)
            .field("connect_timeout", &self.connect_timeout)
            .field("server_name", &self.server_name)
            .field("session_factory", &self.session_factory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pool_policy() {
        let options = ConnectOptions::default();
        assert!(!options.keep_alive);
        assert_eq!(options.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(options.max_free_sessions, DEFAULT_MAX_FREE_SESSIONS);
        assert!(options.reject_unauthorized);
        assert_eq!(options.alpn_protocols, vec![AlpnProtocol::H2]);
        assert!(options.queue_requests);
    }

    #[test]
    fn alpn_wire_roundtrip() {
        assert_eq!(AlpnProtocol::from_wire(b"h2"), Some(AlpnProtocol::H2));
        assert_eq!(
            AlpnProtocol::from_wire(b"http/1.1"),
            Some(AlpnProtocol::Http11)
        );
        assert_eq!(AlpnProtocol::from_wire(b"spdy/3"), None);
    }
}
