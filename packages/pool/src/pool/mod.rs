//! Pool registry.
//!
//! Top-level map from connection identity to [`Origin`], plus the pool-wide
//! idle-session set. The idle set is insertion-ordered and bounded by
//! `max_free_sessions`; admitting a session past the cap evicts the set's
//! oldest member through its owning origin. A session re-idled after a
//! revive re-enters at the back, so eviction order is insertion order,
//! re-stamped per idle transition.

pub(crate) mod origin;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::config::ConnectOptions;
use crate::error::Result;
use crate::factory::{AlpnSessionFactory, SessionFactory};
use crate::identity::{connection_key, ConnectionKey, Endpoint};
use crate::proxy::PooledSession;
use crate::session::Session;

pub(crate) use origin::Origin;

/// Counts for one origin: sessions currently active, parked idle, and
/// requests queued for a free session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OriginStats {
    pub active: usize,
    pub idle: usize,
    pub queued: usize,
}

struct IdleEntry {
    session: Arc<Session>,
    origin: Weak<Origin>,
}

pub(crate) struct PoolInner {
    options: Arc<ConnectOptions>,
    factory: Arc<dyn SessionFactory>,
    origins: Mutex<HashMap<ConnectionKey, Arc<Origin>>>,
    idle: Mutex<VecDeque<IdleEntry>>,
}

impl PoolInner {
    pub(crate) fn keep_alive(&self) -> bool {
        self.options.keep_alive
    }

    /// Admit `session` to the pool-wide idle set, evicting the oldest
    /// member if the set is full. Returns `false` when the session could not
    /// be admitted (the cap is zero) and should be closed instead.
    pub(crate) fn push_idle(&self, origin: &Arc<Origin>, session: &Arc<Session>) -> bool {
        let max = self.options.max_free_sessions;
        if max == 0 {
            return false;
        }
        loop {
            let victim = {
                let mut idle = self.lock_idle();
                if idle.len() < max {
                    idle.push_back(IdleEntry {
                        session: session.clone(),
                        origin: Arc::downgrade(origin),
                    });
                    return true;
                }
                idle.pop_front()
            };
            match victim {
                Some(entry) => {
                    debug!(target: "h2_alpn::pool", id = entry.session.id(), "evicting oldest idle session");
                    match entry.origin.upgrade() {
                        Some(owner) => owner.evict_idle(&entry.session),
                        None => entry.session.close(),
                    }
                }
                None => return false,
            }
        }
    }

    /// Called when an origin revives one of its idle sessions.
    pub(crate) fn remove_idle(&self, session: &Arc<Session>) {
        self.lock_idle()
            .retain(|entry| !Arc::ptr_eq(&entry.session, session));
    }

    /// Drop an origin that no longer holds sessions or queued requests.
    pub(crate) fn reclaim(&self, key: &ConnectionKey, origin: &Arc<Origin>) {
        let mut origins = self.lock_origins();
        if let Some(current) = origins.get(key) {
            if Arc::ptr_eq(current, origin) && origin.is_empty() {
                debug!(target: "h2_alpn::pool", key = %key, "reclaiming empty origin");
                origins.remove(key);
            }
        }
    }

    fn lock_origins(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Arc<Origin>>> {
        match self.origins.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleEntry>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Pool of multiplexed HTTP/2 sessions, grouped by connection identity.
///
/// There is no process-wide default pool; top-level wiring constructs one
/// (and its ticket cache) explicitly and passes it around.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(options: ConnectOptions) -> Pool {
        let factory: Arc<dyn SessionFactory> = match options.session_factory.clone() {
            Some(factory) => factory,
            None => Arc::new(AlpnSessionFactory::new()),
        };
        Pool {
            inner: Arc::new(PoolInner {
                options: Arc::new(options),
                factory,
                origins: Mutex::new(HashMap::new()),
                idle: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// The canonical pooling key this pool derives for `authority`.
    pub fn connection_key(&self, authority: &str) -> Result<ConnectionKey> {
        let endpoint = Endpoint::parse(authority)?;
        Ok(connection_key(&endpoint, &self.inner.options))
    }

    /// Get a session handle for `authority`, synchronously.
    ///
    /// The handle is usable immediately: requests made before the backend
    /// session is connected (or even chosen, when the origin is saturated
    /// and the request is queued) buffer and replay once one is bound.
    pub fn connect(&self, authority: &str) -> PooledSession {
        debug!(target: "h2_alpn::pool", authority, "connect");
        let endpoint = match Endpoint::parse(authority) {
            Ok(endpoint) => endpoint,
            Err(error) => return PooledSession::failed(error),
        };
        let key = connection_key(&endpoint, &self.inner.options);
        let origin = {
            let mut origins = self.inner.lock_origins();
            origins
                .entry(key.clone())
                .or_insert_with(|| {
                    Origin::new(
                        key.clone(),
                        endpoint,
                        self.inner.options.clone(),
                        self.inner.factory.clone(),
                        Arc::downgrade(&self.inner),
                    )
                })
                .clone()
        };
        let proxy = PooledSession::new(key);
        origin.assign(proxy.backend());
        proxy.wire_backend_events();
        proxy
    }

    /// Close every session in every origin and wait for completion.
    pub async fn destroy(&self) {
        let origins: Vec<Arc<Origin>> = {
            let mut map = self.inner.lock_origins();
            map.drain().map(|(_, origin)| origin).collect()
        };
        self.inner.lock_idle().clear();
        debug!(target: "h2_alpn::pool", origins = origins.len(), "destroying pool");
        futures::future::join_all(origins.iter().map(|origin| origin.destroy())).await;
    }

    pub fn origin_count(&self) -> usize {
        self.inner.lock_origins().len()
    }

    /// Sessions currently parked in the pool-wide idle set.
    pub fn idle_len(&self) -> usize {
        self.inner.lock_idle().len()
    }

    pub fn origin_stats(&self, key: &ConnectionKey) -> Option<OriginStats> {
        self.inner.lock_origins().get(key).map(|origin| origin.stats())
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("origins", &self.origin_count())
            .field("idle", &self.idle_len())
            .finish()
    }
}
