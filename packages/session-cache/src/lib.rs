//! TLS session ticket cache
//!
//! A bounded least-recently-used store mapping a connection identity (the
//! canonical `host:port:options` name used for pooling) to the opaque
//! resumable TLS session state produced by a completed handshake. Connection
//! establishers `load` a ticket before dialing, `save` the refreshed ticket
//! after a successful handshake, and `evict` the identity when the transport
//! fails, so a stale ticket is never replayed against a broken destination.
//!
//! Hit, miss, and eviction counters are exact, not sampled.

pub mod cache;
pub mod ticket;

pub use cache::{TlsSessionCache, DEFAULT_TLS_SESSION_CACHE_SIZE};
pub use ticket::SessionTicket;
