//! Bounded LRU ticket store with exact counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::ticket::SessionTicket;

/// Default number of identities the cache tracks before evicting.
pub const DEFAULT_TLS_SESSION_CACHE_SIZE: usize = 4096;

struct Entry {
    ticket: SessionTicket,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Monotonic recency clock; bumped on every load and save.
    clock: u64,
}

/// Bounded least-recently-used mapping from connection identity to
/// [`SessionTicket`].
///
/// Capacity is fixed at construction. Both `load` and `save` refresh an
/// entry's recency; inserting past capacity removes the least-recently-used
/// entry. All operations are synchronous and take `&self`, so the cache is
/// shared as an `Arc<TlsSessionCache>` between the establisher and the pool.
pub struct TlsSessionCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TlsSessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up the ticket for `name`, counting a hit or a miss.
    pub fn load(&self, name: &str) -> Option<SessionTicket> {
        let mut inner = self.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        match inner.entries.get_mut(name) {
            Some(entry) => {
                entry.last_used = stamp;
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(name, "session ticket hit");
                Some(entry.ticket.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(name, "session ticket miss");
                None
            }
        }
    }

    /// Store `ticket` under `name`, overwriting any previous ticket for the
    /// same identity. May push out the least-recently-used entry.
    pub fn save(&self, name: &str, ticket: SessionTicket) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        if !inner.entries.contains_key(name) && inner.entries.len() >= self.capacity {
            // Overflow removal is LRU bookkeeping, not an eviction: the
            // evictions counter only tracks explicit evict() calls.
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(name, _)| name.clone())
            {
                inner.entries.remove(&oldest);
                trace!(name = %oldest, "session ticket aged out");
            }
        }
        trace!(name, "session ticket saved");
        inner.entries.insert(
            name.to_owned(),
            Entry {
                ticket,
                last_used: stamp,
            },
        );
    }

    /// Forget the ticket for `name`. Removing an absent entry is a no-op,
    /// but the eviction counter always advances, one bump per failed
    /// transport that had resumption enabled.
    pub fn evict(&self, name: &str) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(name, "session ticket evicted");
        self.lock().entries.remove(name);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TlsSessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TLS_SESSION_CACHE_SIZE)
    }
}

impl std::fmt::Debug for TlsSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSessionCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("evictions", &self.evictions())
            .finish()
    }
}
