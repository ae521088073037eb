//! Stream proxy: a request handle bound to its backend after the fact.
//!
//! Writes made before a backend stream exists buffer in arrival order, each
//! tagged with an ack; binding replays them against the real stream in the
//! same order. Closing an unbound proxy cancels the pending binding and
//! releases the buffered writes without acking them as successes.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use h2::client::ResponseFuture;
use h2::{Reason, RecvStream, SendStream};
use http::HeaderMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};
use crate::proxy::deferred::Deferred;
use crate::session::StreamSlot;

struct PendingWrite {
    data: Bytes,
    end_stream: bool,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct Backend {
    send: SendStream<Bytes>,
    response: Option<ResponseFuture>,
    slot: Option<Arc<StreamSlot>>,
    ended: bool,
}

enum StreamState {
    Buffering {
        writes: Vec<PendingWrite>,
        trailers: Option<HeaderMap>,
    },
    Bound(Backend),
    Closed,
}

pub(crate) struct StreamInner {
    bound: Deferred<()>,
    state: Mutex<StreamState>,
}

impl StreamInner {
    fn new() -> Arc<StreamInner> {
        Arc::new(StreamInner {
            bound: Deferred::new(),
            state: Mutex::new(StreamState::Buffering {
                writes: Vec::new(),
                trailers: None,
            }),
        })
    }

    /// Attach the real h2 stream, replaying buffered writes in order.
    pub(crate) fn bind(&self, send: SendStream<Bytes>, response: ResponseFuture, slot: StreamSlot) {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, StreamState::Closed) {
            StreamState::Buffering { writes, trailers } => {
                let mut send = send;
                let mut ended = false;
                trace!(target: "h2_alpn::stream", buffered = writes.len(), "binding stream backend");
                for write in writes {
                    let end_stream = write.end_stream;
                    match send.send_data(write.data, end_stream) {
                        Ok(()) => {
                            ended |= end_stream;
                            if let Some(ack) = write.ack {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Err(err) => {
                            let error = Error::stream(err);
                            if let Some(ack) = write.ack {
                                let _ = ack.send(Err(error.clone()));
                            }
                            drop(state);
                            self.bound.fail(error);
                            return;
                        }
                    }
                }
                if let Some(trailers) = trailers {
                    if let Err(err) = send.send_trailers(trailers) {
                        let error = Error::stream(err);
                        drop(state);
                        self.bound.fail(error);
                        return;
                    }
                    ended = true;
                }
                *state = StreamState::Bound(Backend {
                    send,
                    response: Some(response),
                    slot: Some(Arc::new(slot)),
                    ended,
                });
                drop(state);
                self.bound.fill(());
            }
            // Closed before the backend arrived: dropping `send` resets the
            // h2 stream and dropping `slot` frees the session's counter.
            StreamState::Closed => {}
            StreamState::Bound(backend) => {
                // A second binding cannot happen; keep the first.
                *state = StreamState::Bound(backend);
            }
        }
    }

    /// Reject the proxy before (or instead of) a binding.
    pub(crate) fn fail(&self, error: Error) {
        let writes = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, StreamState::Closed) {
                StreamState::Buffering { writes, .. } => writes,
                StreamState::Bound(backend) => {
                    drop(backend);
                    Vec::new()
                }
                StreamState::Closed => Vec::new(),
            }
        };
        for write in writes {
            if let Some(ack) = write.ack {
                let _ = ack.send(Err(error.clone()));
            }
        }
        self.bound.fail(error);
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Acknowledgement for one proxied write.
///
/// Resolves `Ok` once the write reached the backend stream; resolves with an
/// error if the write failed or the proxy was closed before a backend was
/// bound.
#[derive(Debug)]
pub struct WriteReceipt {
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl WriteReceipt {
    fn done() -> Self {
        Self { rx: None }
    }

    fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx: Some(rx) }
    }

    pub async fn acknowledged(self) -> Result<()> {
        match self.rx {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(result) => result,
                // Sender dropped without acking: the write was released, not
                // completed.
                Err(_) => Err(Error::closed()),
            },
        }
    }
}

/// A request stream handle, returned synchronously from
/// [`crate::PooledSession::request`].
pub struct PooledStream {
    inner: Arc<StreamInner>,
}

impl PooledStream {
    pub(crate) fn new() -> PooledStream {
        PooledStream {
            inner: StreamInner::new(),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<StreamInner> {
        &self.inner
    }

    /// Send (or buffer) one chunk of request body data.
    pub fn send_data(&self, data: impl Into<Bytes>, end_stream: bool) -> Result<WriteReceipt> {
        let data = data.into();
        let mut state = self.inner.lock();
        match &mut *state {
            StreamState::Buffering { writes, .. } => {
                trace!(target: "h2_alpn::stream", len = data.len(), "buffering write");
                let (tx, rx) = oneshot::channel();
                writes.push(PendingWrite {
                    data,
                    end_stream,
                    ack: Some(tx),
                });
                Ok(WriteReceipt::pending(rx))
            }
            StreamState::Bound(backend) => {
                if backend.ended {
                    return Err(Error::stream("stream already ended"));
                }
                backend.send.send_data(data, end_stream).map_err(Error::stream)?;
                backend.ended = end_stream;
                Ok(WriteReceipt::done())
            }
            StreamState::Closed => Err(Error::closed()),
        }
    }

    /// Send (or buffer) the trailing header block, ending the stream.
    pub fn send_trailers(&self, trailers: HeaderMap) -> Result<()> {
        let mut state = self.inner.lock();
        match &mut *state {
            StreamState::Buffering {
                trailers: pending, ..
            } => {
                *pending = Some(trailers);
                Ok(())
            }
            StreamState::Bound(backend) => {
                if backend.ended {
                    return Err(Error::stream("stream already ended"));
                }
                backend.send.send_trailers(trailers).map_err(Error::stream)?;
                backend.ended = true;
                Ok(())
            }
            StreamState::Closed => Err(Error::closed()),
        }
    }

    /// Await the response head. The body keeps the stream's session slot
    /// occupied until it is dropped or fully consumed.
    pub async fn response(&self) -> Result<http::Response<Body>> {
        self.inner.bound.wait().await?;
        let (future, slot) = {
            let mut state = self.inner.lock();
            match &mut *state {
                StreamState::Bound(backend) => (backend.response.take(), backend.slot.clone()),
                _ => (None, None),
            }
        };
        let Some(future) = future else {
            return Err(Error::closed());
        };
        let response = future.await.map_err(Error::stream)?;
        let (parts, recv) = response.into_parts();
        Ok(http::Response::from_parts(parts, Body::new(recv, slot)))
    }

    /// Graceful close: half-close the request side if it is still open and
    /// free the session slot. Buffered writes on an unbound proxy are
    /// released without being acked.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        match &mut *state {
            StreamState::Buffering { .. } => {
                *state = StreamState::Closed;
                drop(state);
                self.inner.bound.cancel();
            }
            StreamState::Bound(backend) => {
                if !backend.ended {
                    let _ = backend.send.send_data(Bytes::new(), true);
                    backend.ended = true;
                }
                backend.slot = None;
            }
            StreamState::Closed => {}
        }
    }

    /// Abort the stream. Bound streams are reset with CANCEL; unbound
    /// proxies cancel their pending binding.
    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        match std::mem::replace(&mut *state, StreamState::Closed) {
            StreamState::Buffering { writes, .. } => {
                drop(state);
                drop(writes);
                self.inner.bound.cancel();
            }
            StreamState::Bound(mut backend) => {
                backend.send.send_reset(Reason::CANCEL);
                drop(state);
            }
            StreamState::Closed => {}
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(&*self.inner.lock(), StreamState::Bound(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.lock(), StreamState::Closed)
    }
}

impl std::fmt::Debug for PooledStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.lock() {
            StreamState::Buffering { writes, .. } => format!("buffering({})", writes.len()),
            StreamState::Bound(_) => "bound".to_owned(),
            StreamState::Closed => "closed".to_owned(),
        };
        f.debug_struct("PooledStream").field("state", &state).finish()
    }
}

/// Response body with consumer-driven flow control.
///
/// Receive-window capacity returns to the peer only as chunks are read, so
/// an unread backlog pauses the sender; resuming reads resumes it.
pub struct Body {
    recv: RecvStream,
    _slot: Option<Arc<StreamSlot>>,
}

impl Body {
    fn new(recv: RecvStream, slot: Option<Arc<StreamSlot>>) -> Body {
        Body { recv, _slot: slot }
    }

    /// The next chunk of body data, or `None` at end of stream.
    pub async fn data(&mut self) -> Option<Result<Bytes>> {
        let chunk = std::future::poll_fn(|cx| self.recv.poll_data(cx)).await?;
        match chunk {
            Ok(bytes) => {
                let _ = self.recv.flow_control().release_capacity(bytes.len());
                Some(Ok(bytes))
            }
            Err(err) => Some(Err(Error::stream(err))),
        }
    }

    pub async fn trailers(&mut self) -> Result<Option<HeaderMap>> {
        std::future::poll_fn(|cx| self.recv.poll_trailers(cx))
            .await
            .map_err(Error::stream)
    }

    pub fn is_end_stream(&self) -> bool {
        self.recv.is_end_stream()
    }

    /// Read the remaining body into one buffer.
    pub async fn collect(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.data().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("end_stream", &self.is_end_stream())
            .finish()
    }
}
