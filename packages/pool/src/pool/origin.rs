//! Per-identity session scheduler.
//!
//! An origin owns every pooled session for one connection identity,
//! partitioned into an active list, an idle list, and a FIFO queue of
//! pending session requests. The decision order on every request:
//! reuse the oldest active session with spare stream capacity, revive the
//! most recently idled session, create a new session while under the
//! per-origin cap, otherwise queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::config::ConnectOptions;
use crate::error::Error;
use crate::factory::SessionFactory;
use crate::identity::{ConnectionKey, Endpoint};
use crate::pool::{OriginStats, PoolInner};
use crate::proxy::deferred::Deferred;
use crate::session::{establish, Session};

struct OriginState {
    active: Vec<Arc<Session>>,
    idle: Vec<Arc<Session>>,
    queued: VecDeque<Deferred<Arc<Session>>>,
}

pub(crate) struct Origin {
    weak_self: Weak<Origin>,
    key: ConnectionKey,
    endpoint: Endpoint,
    options: Arc<ConnectOptions>,
    factory: Arc<dyn SessionFactory>,
    pool: Weak<PoolInner>,
    state: Mutex<OriginState>,
}

enum Assignment {
    Reuse(Arc<Session>),
    Revive(Arc<Session>),
    Created(Arc<Session>),
    Queued,
    Fail(Error),
}

impl Origin {
    pub(crate) fn new(
        key: ConnectionKey,
        endpoint: Endpoint,
        options: Arc<ConnectOptions>,
        factory: Arc<dyn SessionFactory>,
        pool: Weak<PoolInner>,
    ) -> Arc<Origin> {
        Arc::new_cyclic(|weak| Origin {
            weak_self: weak.clone(),
            key,
            endpoint,
            options,
            factory,
            pool,
            state: Mutex::new(OriginState {
                active: Vec::new(),
                idle: Vec::new(),
                queued: VecDeque::new(),
            }),
        })
    }

    pub(crate) fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Pick or create a session for one request and settle `backend` with
    /// it, or queue `backend` until a session frees up.
    pub(crate) fn assign(&self, backend: &Deferred<Arc<Session>>) {
        let assignment = {
            let mut state = self.lock();
            // Oldest still-active session with spare capacity wins.
            if let Some(session) = state
                .active
                .iter()
                .find(|session| session.has_available_streams())
                .cloned()
            {
                debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "reusing active session");
                Assignment::Reuse(session)
            } else if let Some(session) = state.idle.pop() {
                // Most recently idled first: it is the most likely still warm.
                state.active.push(session.clone());
                debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "reusing idle session");
                Assignment::Revive(session)
            } else if state.active.len() + state.idle.len() < self.options.max_sessions {
                Assignment::Created(self.spawn_session(&mut state))
            } else if self.options.queue_requests {
                debug!(
                    target: "h2_alpn::origin",
                    key = %self.key,
                    queued = state.queued.len() + 1,
                    "queueing session request"
                );
                state.queued.push_back(backend.clone());
                Assignment::Queued
            } else {
                Assignment::Fail(Error::capacity().with_key(self.key.clone()))
            }
        };
        match assignment {
            Assignment::Reuse(session) | Assignment::Created(session) => {
                backend.fill(session);
            }
            Assignment::Revive(session) => {
                session.mark_active();
                session.set_reffed(true);
                if let Some(pool) = self.pool.upgrade() {
                    pool.remove_idle(&session);
                }
                backend.fill(session);
            }
            Assignment::Queued => {}
            Assignment::Fail(error) => {
                backend.fail(error);
            }
        }
    }

    /// A stream slot freed on `session`: serve the oldest queued request if
    /// the session has spare capacity, otherwise park the session once its
    /// stream count reaches zero.
    pub(crate) fn handle_free(&self, session: &Arc<Session>) {
        if session.is_finished() {
            return;
        }
        enum Outcome {
            Dequeued,
            Park,
            Keep,
        }
        let outcome = {
            let mut state = self.lock();
            let mut served = false;
            if session.has_available_streams() {
                while let Some(waiter) = state.queued.pop_front() {
                    if waiter.fill(session.clone()) {
                        served = true;
                        debug!(
                            target: "h2_alpn::origin",
                            key = %self.key,
                            remaining = state.queued.len(),
                            "dequeueing session request"
                        );
                        break;
                    }
                    // The waiter gave up (proxy closed); try the next one.
                }
            }
            if served {
                Outcome::Dequeued
            } else if session.open_streams() == 0 {
                if let Some(pos) = state
                    .active
                    .iter()
                    .position(|entry| Arc::ptr_eq(entry, session))
                {
                    state.active.remove(pos);
                    Outcome::Park
                } else {
                    Outcome::Keep
                }
            } else {
                Outcome::Keep
            }
        };
        if matches!(outcome, Outcome::Park) {
            self.park_idle(session);
        }
    }

    /// Move a drained session to the idle lists, or close it when the pool
    /// is not keeping sessions alive or has no space left.
    fn park_idle(&self, session: &Arc<Session>) {
        let Some(pool) = self.pool.upgrade() else {
            session.close();
            return;
        };
        if !pool.keep_alive() {
            debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "closing idle session due to disinterest");
            session.close();
            return;
        }
        session.mark_idle();
        session.set_reffed(false);
        self.lock().idle.push(session.clone());
        let admitted = match self.weak_self.upgrade() {
            Some(this) => pool.push_idle(&this, session),
            None => false,
        };
        if !admitted {
            debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "closing idle session due to lack of space");
            let mut state = self.lock();
            if let Some(pos) = state
                .idle
                .iter()
                .position(|entry| Arc::ptr_eq(entry, session))
            {
                state.idle.remove(pos);
            }
            drop(state);
            session.close();
        } else {
            debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "remembering idle session");
        }
    }

    /// Close `session` out of the idle list on behalf of the pool's
    /// idle-capacity eviction.
    pub(crate) fn evict_idle(&self, session: &Arc<Session>) {
        let found = {
            let mut state = self.lock();
            match state
                .idle
                .iter()
                .position(|entry| Arc::ptr_eq(entry, session))
            {
                Some(pos) => {
                    state.idle.remove(pos);
                    true
                }
                None => false,
            }
        };
        if found {
            debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "evicting idle session");
            session.close();
        }
    }

    /// Close-hook: drop the session from whichever list holds it, start a
    /// replacement if requests are still queued, and let the pool reclaim
    /// this origin once nothing references it.
    pub(crate) fn remove_session(&self, session: &Arc<Session>) {
        let (respawn, empty) = {
            let mut state = self.lock();
            state.active.retain(|entry| !Arc::ptr_eq(entry, session));
            state.idle.retain(|entry| !Arc::ptr_eq(entry, session));
            let respawn = !state.queued.is_empty()
                && state.active.len() + state.idle.len() < self.options.max_sessions;
            let empty =
                state.active.is_empty() && state.idle.is_empty() && state.queued.is_empty();
            (respawn, empty)
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_idle(session);
        }
        debug!(target: "h2_alpn::origin", key = %self.key, id = session.id(), "removed session");
        if respawn {
            // Queued requests outlive the session that died; requeue them
            // onto a fresh attempt, up to its stream capacity.
            debug!(target: "h2_alpn::origin", key = %self.key, "replacing session for queued requests");
            let mut state = self.lock();
            let replacement = self.spawn_session(&mut state);
            let mut slots = self.options.peer_max_concurrent_streams;
            while slots > 0 {
                match state.queued.pop_front() {
                    Some(waiter) => {
                        if waiter.fill(replacement.clone()) {
                            slots -= 1;
                        }
                    }
                    None => break,
                }
            }
        } else if empty {
            if let (Some(pool), Some(this)) = (self.pool.upgrade(), self.weak_self.upgrade()) {
                pool.reclaim(&self.key, &this);
            }
        }
    }

    /// Close every session and reject every queued request.
    pub(crate) async fn destroy(&self) {
        let (sessions, waiters) = {
            let mut state = self.lock();
            let mut sessions: Vec<Arc<Session>> = state.active.drain(..).collect();
            sessions.extend(state.idle.drain(..));
            let waiters: Vec<Deferred<Arc<Session>>> = state.queued.drain(..).collect();
            (sessions, waiters)
        };
        for waiter in waiters {
            waiter.fail(Error::closed().with_key(self.key.clone()));
        }
        debug!(
            target: "h2_alpn::origin",
            key = %self.key,
            sessions = sessions.len(),
            "destroying remaining sessions"
        );
        futures::future::join_all(sessions.iter().map(|session| async move {
            if session.is_reffed() {
                session.close_and_wait().await;
            } else {
                session.destroy(None);
                session.wait_closed().await;
            }
        }))
        .await;
    }

    pub(crate) fn stats(&self) -> OriginStats {
        let state = self.lock();
        OriginStats {
            active: state.active.len(),
            idle: state.idle.len(),
            queued: state.queued.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let state = self.lock();
        state.active.is_empty() && state.idle.is_empty() && state.queued.is_empty()
    }

    /// Create a `Connecting` session inside the active list and kick off
    /// establishment. Called with the state lock held so capacity accounting
    /// cannot race.
    fn spawn_session(&self, state: &mut OriginState) -> Arc<Session> {
        let session = Session::connecting(self.key.clone(), &self.options, self.endpoint.is_tls());
        let weak = self.weak_self.clone();
        {
            let weak = weak.clone();
            session.set_on_free(move |session| {
                if let Some(origin) = weak.upgrade() {
                    origin.handle_free(session);
                }
            });
        }
        session.add_close_hook(move |session, _error| {
            if let Some(origin) = weak.upgrade() {
                origin.remove_session(session);
            }
        });
        state.active.push(session.clone());
        tokio::spawn(establish(
            session.clone(),
            self.factory.clone(),
            self.endpoint.clone(),
            self.options.clone(),
        ));
        session
    }

    fn lock(&self) -> MutexGuard<'_, OriginState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Origin")
            .field("key", &self.key)
            .field("active", &stats.active)
            .field("idle", &stats.idle)
            .field("queued", &stats.queued)
            .finish()
    }
}
