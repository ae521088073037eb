//! Single-assignment future cell.
//!
//! A `Deferred<T>` is either empty-with-waiters or settled. It supports a
//! synchronous peek and an asynchronous wait, which is what lets a pool hand
//! out a usable session handle before the backend session exists: the handle
//! owns the cell, the scheduler settles it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

enum State<T> {
    Pending(Vec<Waker>),
    Ready(Result<T>),
    Cancelled,
}

/// A shareable cell settled at most once with a value, an error, or a
/// cancellation.
pub struct Deferred<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.lock() {
            State::Pending(_) => "pending",
            State::Ready(Ok(_)) => "filled",
            State::Ready(Err(_)) => "failed",
            State::Cancelled => "cancelled",
        };
        write!(f, "Deferred({state})")
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Settle with a value. Returns `false` if the cell was already settled.
    pub fn fill(&self, value: T) -> bool {
        self.settle(State::Ready(Ok(value)))
    }

    /// Settle with an error. Returns `false` if the cell was already settled.
    pub fn fail(&self, error: Error) -> bool {
        self.settle(State::Ready(Err(error)))
    }

    /// Cancel the pending assignment; waiters observe a closed-handle error.
    pub fn cancel(&self) -> bool {
        self.settle(State::Cancelled)
    }

    /// Synchronous, non-blocking read of the settled result.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.lock() {
            State::Pending(_) => None,
            State::Ready(result) => Some(result.clone()),
            State::Cancelled => Some(Err(Error::closed())),
        }
    }

    /// The settled value, if the cell was filled successfully.
    pub fn peek_value(&self) -> Option<T> {
        match self.peek() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(&*self.lock(), State::Pending(_))
    }

    /// Wait until the cell settles.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            deferred: self.clone(),
        }
    }

    fn settle(&self, next: State<T>) -> bool {
        let mut state = self.lock();
        match &mut *state {
            State::Pending(wakers) => {
                let wakers = std::mem::take(wakers);
                *state = next;
                drop(state);
                for waker in wakers {
                    waker.wake();
                }
                true
            }
            _ => false,
        }
    }

}

impl<T> Deferred<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Deferred::wait`].
pub struct Wait<T> {
    deferred: Deferred<T>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.deferred.lock();
        match &mut *state {
            State::Pending(wakers) => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            State::Ready(result) => Poll::Ready(result.clone()),
            State::Cancelled => Poll::Ready(Err(Error::closed())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_resolves_waiters() {
        let deferred = Deferred::new();
        let waiter = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(deferred.fill(7));
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn peek_is_synchronous() {
        let deferred = Deferred::new();
        assert!(deferred.peek().is_none());
        deferred.fill("ready");
        assert_eq!(deferred.peek_value(), Some("ready"));
        assert_eq!(deferred.wait().await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn settles_at_most_once() {
        let deferred = Deferred::new();
        assert!(deferred.fill(1));
        assert!(!deferred.fill(2));
        assert!(!deferred.cancel());
        assert_eq!(deferred.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_rejects_waiters() {
        let deferred: Deferred<u32> = Deferred::new();
        deferred.cancel();
        assert!(deferred.wait().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn fail_propagates_the_error() {
        let deferred: Deferred<u32> = Deferred::new();
        deferred.fail(Error::capacity());
        assert!(deferred.wait().await.unwrap_err().is_capacity());
    }
}
