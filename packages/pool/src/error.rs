//! Error type for the transport layer.
//!
//! One crate-level [`Error`] with a [`Kind`] discriminant. Connection
//! establishment failures carry the phase they occurred in (DNS, TCP, TLS)
//! so callers can tell a resolution failure from a refused socket from a
//! broken handshake without string matching.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::identity::ConnectionKey;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while establishing connections or using pooled sessions.
#[derive(Clone)]
pub struct Error {
    inner: Box<Inner>,
}

#[derive(Clone)]
struct Inner {
    kind: Kind,
    // Shared so clones keep the source chain.
    source: Option<Arc<dyn StdError + Send + Sync>>,
    key: Option<ConnectionKey>,
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Invalid authority or options.
    Builder,
    /// Address resolution failed.
    Dns,
    /// The TCP connection could not be opened.
    Connect,
    /// The TLS handshake failed.
    TlsHandshake,
    /// ALPN produced no acceptable protocol.
    Negotiation,
    /// One multiplexed stream failed; sibling streams are unaffected.
    Stream,
    /// Transport-level failure affecting every stream on a session.
    Session,
    /// Capacity exhausted while queueing is disabled.
    Capacity,
    /// The connection attempt timed out.
    Timeout,
    /// The operation was cancelled by an abort signal.
    Aborted,
    /// The handle was already closed.
    Closed,
}

/// The connection-establishment phase an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Dns,
    Tcp,
    Tls,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(Inner {
                kind,
                source: None,
                key: None,
            }),
        }
    }

    pub(crate) fn with<E>(mut self, source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.inner.source = Some(Arc::from(source.into()));
        self
    }

    pub(crate) fn with_key(mut self, key: ConnectionKey) -> Error {
        self.inner.key = Some(key);
        self
    }

    pub(crate) fn builder<E>(source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::Builder).with(source)
    }

    pub(crate) fn dns<E>(source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::Dns).with(source)
    }

    pub(crate) fn connect<E>(source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::Connect).with(source)
    }

    pub(crate) fn tls_handshake<E>(source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::TlsHandshake).with(source)
    }

    pub(crate) fn negotiation() -> Error {
        Error::new(Kind::Negotiation)
    }

    /// A failure scoped to one multiplexed stream. Public so callers can
    /// destroy a stream with an explicit cause.
    pub fn stream<E>(source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::Stream).with(source)
    }

    /// A transport-level failure affecting a whole session. Public so
    /// callers can destroy a session with an explicit cause.
    pub fn session<E>(source: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new(Kind::Session).with(source)
    }

    pub(crate) fn capacity() -> Error {
        Error::new(Kind::Capacity)
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn aborted() -> Error {
        Error::new(Kind::Aborted)
    }

    pub(crate) fn closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// The connection identity the failure relates to, when known.
    pub fn connection_key(&self) -> Option<&ConnectionKey> {
        self.inner.key.as_ref()
    }

    /// The establishment phase, for connection-level errors.
    pub fn connect_phase(&self) -> Option<ConnectPhase> {
        match self.inner.kind {
            Kind::Dns => Some(ConnectPhase::Dns),
            Kind::Connect | Kind::Timeout => Some(ConnectPhase::Tcp),
            Kind::TlsHandshake | Kind::Negotiation => Some(ConnectPhase::Tls),
            _ => None,
        }
    }

    pub fn is_dns(&self) -> bool {
        self.inner.kind == Kind::Dns
    }

    pub fn is_connect(&self) -> bool {
        self.inner.kind == Kind::Connect
    }

    pub fn is_tls_handshake(&self) -> bool {
        self.inner.kind == Kind::TlsHandshake
    }

    pub fn is_negotiation(&self) -> bool {
        self.inner.kind == Kind::Negotiation
    }

    pub fn is_stream(&self) -> bool {
        self.inner.kind == Kind::Stream
    }

    pub fn is_session(&self) -> bool {
        self.inner.kind == Kind::Session
    }

    pub fn is_capacity(&self) -> bool {
        self.inner.kind == Kind::Capacity
    }

    pub fn is_timeout(&self) -> bool {
        self.inner.kind == Kind::Timeout
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.kind == Kind::Aborted
    }

    pub fn is_closed(&self) -> bool {
        self.inner.kind == Kind::Closed
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("h2_alpn::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref key) = self.inner.key {
            f.field("key", key);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.inner.kind {
            Kind::Builder => "invalid authority or options",
            Kind::Dns => "address resolution error",
            Kind::Connect => "connection error",
            Kind::TlsHandshake => "TLS handshake error",
            Kind::Negotiation => "ALPN negotiated no acceptable protocol",
            Kind::Stream => "stream error",
            Kind::Session => "session error",
            Kind::Capacity => "session capacity exhausted",
            Kind::Timeout => "connection attempt timed out",
            Kind::Aborted => "operation aborted",
            Kind::Closed => "handle is closed",
        };
        if let Some(ref key) = self.inner.key {
            write!(f, "{what} ({key})")?;
        } else {
            f.write_str(what)?;
        }
        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|err| &**err as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_phase_maps_kinds() {
        assert_eq!(Error::dns("nx").connect_phase(), Some(ConnectPhase::Dns));
        assert_eq!(
            Error::connect("refused").connect_phase(),
            Some(ConnectPhase::Tcp)
        );
        assert_eq!(
            Error::tls_handshake("bad cert").connect_phase(),
            Some(ConnectPhase::Tls)
        );
        assert_eq!(Error::negotiation().connect_phase(), Some(ConnectPhase::Tls));
        assert_eq!(Error::capacity().connect_phase(), None);
    }

    #[test]
    fn clones_keep_the_source() {
        let err = Error::session("connection reset");
        let clone = err.clone();
        assert!(clone.source().is_some());
        assert_eq!(clone.kind(), Kind::Session);
    }
}
