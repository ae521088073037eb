//! # h2-alpn
//!
//! Client-side network transport that negotiates TLS/ALPN to pick HTTP/2 or
//! HTTP/1.1 per destination, resumes TLS sessions across reconnects, and
//! pools multiplexed HTTP/2 sessions per origin under concurrency and
//! capacity limits, queueing requests when saturated.
//!
//! - **[`AlpnConnector`]** opens TCP/TLS sockets, offers a protocol list via
//!   ALPN, and keeps the [`TlsSessionCache`] honest around every handshake.
//! - **[`AlpnAgent`]** layers flat per-identity reuse on top: a LIFO stack
//!   of idle HTTP/1.1 streams and one shared HTTP/2 session per identity.
//! - **[`Pool`]** schedules many HTTP/2 sessions per origin: reuse the
//!   oldest active session with spare stream capacity, revive the most
//!   recently idled one, create a new session under the per-origin cap,
//!   otherwise queue FIFO.
//! - **[`PooledSession`] / [`PooledStream`]** are returned synchronously
//!   before the backend exists; writes buffer and replay once a real
//!   session and stream are bound.
//!
//! There are no process-wide singletons: construct a [`Pool`] (and a
//! [`TlsSessionCache`], if resumption is wanted) in top-level wiring and
//! share them explicitly.

pub mod abort;
pub mod agent;
pub mod cache;
pub mod config;
pub mod connect;
pub mod dns;
pub mod error;
pub mod events;
pub mod factory;
pub mod identity;
pub mod pool;
pub mod proxy;
mod session;

pub use abort::{AbortController, AbortSignal};
pub use agent::AlpnAgent;
pub use cache::SocketCache;
pub use config::{
    AlpnProtocol, ConnectOptions, ALPN_H1, ALPN_H2, DEFAULT_MAX_FREE_SESSIONS,
    DEFAULT_MAX_SESSIONS, DEFAULT_PEER_MAX_CONCURRENT_STREAMS, DEFAULT_PROTOCOLS,
};
pub use connect::{AlpnConnector, MaybeTlsStream, Negotiated};
pub use dns::{GaiResolver, HickoryResolver, Resolve};
pub use error::{ConnectPhase, Error, Kind, Result};
pub use events::EventListeners;
pub use factory::{AlpnSessionFactory, SessionFactory, SessionParts};
pub use identity::{connection_key, ConnectionKey, Endpoint, Scheme};
pub use pool::{OriginStats, Pool};
pub use proxy::deferred::Deferred;
pub use proxy::{Body, PooledSession, PooledStream, WriteReceipt};
pub use session::{SessionEvent, SessionState};
pub use tls_session_cache::{SessionTicket, TlsSessionCache};
