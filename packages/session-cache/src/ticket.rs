//! Opaque resumable TLS session state.

use std::sync::Arc;

use rustls::client::{ClientSessionMemoryCache, ClientSessionStore, Resumption};

/// Tickets a server may hand out per connection before the next full
/// handshake refreshes the entry. TLS 1.3 tickets are single-use, so the
/// underlying store keeps a small reserve rather than exactly one.
const TICKETS_PER_IDENTITY: usize = 4;

/// Opaque resumable TLS session state for one connection identity.
///
/// rustls never exposes raw ticket bytes to the application; resumption data
/// flows through a [`ClientSessionStore`] plugged into the client config.
/// A `SessionTicket` therefore owns a private per-identity store. Supplying
/// the same ticket to a later connection attempt lets rustls skip the full
/// handshake; dropping the ticket (cache eviction) forgets the session state
/// and forces a fresh handshake.
#[derive(Clone, Debug)]
pub struct SessionTicket {
    store: Arc<ClientSessionMemoryCache>,
}

impl SessionTicket {
    /// An empty ticket, ready to capture the state of the next handshake.
    pub fn fresh() -> Self {
        Self {
            store: Arc::new(ClientSessionMemoryCache::new(TICKETS_PER_IDENTITY)),
        }
    }

    /// The resumption configuration carrying this ticket, to be assigned to
    /// a `rustls::ClientConfig` for one connection attempt.
    pub fn resumption(&self) -> Resumption {
        Resumption::store(self.store.clone() as Arc<dyn ClientSessionStore>)
    }
}

impl Default for SessionTicket {
    fn default() -> Self {
        Self::fresh()
    }
}
