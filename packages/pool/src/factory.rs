//! Session transport construction.
//!
//! The scheduler decides *when* a session is created; a [`SessionFactory`]
//! decides *how*. The default factory dials through the ALPN establisher and
//! performs the h2 handshake; tests substitute in-memory transports.

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use h2::client::SendRequest;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{AlpnProtocol, ConnectOptions};
use crate::connect::AlpnConnector;
use crate::error::{Error, Result};
use crate::identity::{ConnectionKey, Endpoint};

/// A freshly handshaken HTTP/2 transport.
pub struct SessionParts {
    /// Stream-opening handle.
    pub send: SendRequest<Bytes>,
    /// The connection task; runs until the transport closes or fails.
    pub connection: BoxFuture<'static, std::result::Result<(), h2::Error>>,
    /// Protocol the transport was negotiated for.
    pub alpn_protocol: AlpnProtocol,
}

impl fmt::Debug for SessionParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParts")
            .field("alpn_protocol", &self.alpn_protocol)
            .finish()
    }
}

/// Creates the multiplexed transport backing one pooled session.
pub trait SessionFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        endpoint: &Endpoint,
        key: &ConnectionKey,
        options: &ConnectOptions,
    ) -> BoxFuture<'static, Result<SessionParts>>;
}

/// Perform the client-side h2 handshake over an established byte stream.
pub(crate) async fn handshake_h2<T>(io: T, protocol: AlpnProtocol) -> Result<SessionParts>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = h2::client::Builder::new();
    builder.enable_push(false);
    let (send, connection) = builder
        .handshake::<_, Bytes>(io)
        .await
        .map_err(Error::session)?;
    Ok(SessionParts {
        send,
        connection: Box::pin(connection),
        alpn_protocol: protocol,
    })
}

/// Default factory: ALPN establishment pinned to `h2`, then the h2
/// handshake.
#[derive(Clone, Debug)]
pub struct AlpnSessionFactory {
    connector: AlpnConnector,
}

impl AlpnSessionFactory {
    pub fn new() -> Self {
        Self {
            connector: AlpnConnector::new(),
        }
    }

    pub fn with_connector(connector: AlpnConnector) -> Self {
        Self { connector }
    }
}

impl Default for AlpnSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for AlpnSessionFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        _key: &ConnectionKey,
        options: &ConnectOptions,
    ) -> BoxFuture<'static, Result<SessionParts>> {
        let connector = self.connector.clone();
        let endpoint = endpoint.clone();
        let options = options.clone();
        Box::pin(async move {
            let negotiated = connector
                .connect(&endpoint, &[AlpnProtocol::H2], &options)
                .await?;
            handshake_h2(negotiated.stream, negotiated.protocol).await
        })
    }
}
