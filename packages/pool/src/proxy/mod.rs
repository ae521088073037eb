//! Proxy handles returned before a backend exists.
//!
//! `connect` returns a [`PooledSession`] synchronously and `request` returns
//! a [`PooledStream`] synchronously; both own a deferred binding to the real
//! backend and replay or forward once it arrives.

pub mod deferred;
pub mod session_proxy;
pub mod stream_proxy;

pub use session_proxy::PooledSession;
pub use stream_proxy::{Body, PooledStream, WriteReceipt};
