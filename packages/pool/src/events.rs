//! Typed event listeners with transparent forwarding.
//!
//! Proxy handles republish their backend's lifecycle events under the same
//! names; [`forward`] subscribes once on the source and re-emits on the
//! target, so consumers cannot tell a proxied session from a direct one.

use std::sync::{Arc, Mutex};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A list of subscribers for one event type.
pub struct EventListeners<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.lock().push(Arc::new(listener));
    }

    /// Invoke every subscriber with `event`. Listeners run outside the
    /// internal lock, so a listener may subscribe or emit re-entrantly.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self.lock().clone();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener<E>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Republish every event emitted on `source` through `target`, verbatim.
pub fn forward<E>(source: &EventListeners<E>, target: Arc<EventListeners<E>>)
where
    E: Clone + Send + Sync + 'static,
{
    source.subscribe(move |event| target.emit(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_to_every_subscriber() {
        let events = EventListeners::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            events.subscribe(move |n| {
                seen.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }
        events.emit(&2);
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn forwarding_republishes_unchanged() {
        let source = EventListeners::<&'static str>::new();
        let target = Arc::new(EventListeners::<&'static str>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            target.subscribe(move |event| seen.lock().unwrap().push(*event));
        }
        forward(&source, target);
        source.emit(&"connect");
        source.emit(&"close");
        assert_eq!(*seen.lock().unwrap(), vec!["connect", "close"]);
    }
}
