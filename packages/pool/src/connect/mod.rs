//! ALPN connection establisher.
//!
//! Opens a TCP/TLS socket for a destination, offering a protocol list via
//! ALPN and consuming/refreshing session tickets around the handshake. The
//! result is either a raw byte stream (`http/1.1`) or a stream ready for
//! HTTP/2 session construction (`h2`).

pub mod stream;
pub(crate) mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tls_session_cache::SessionTicket;
use tracing::{debug, trace};

use crate::config::{AlpnProtocol, ConnectOptions};
use crate::dns::{GaiResolver, Resolve};
use crate::error::{Error, Result};
use crate::identity::{connection_key, ConnectionKey, Endpoint};

pub use stream::MaybeTlsStream;
use tls::TlsContext;

/// Outcome of a successful establishment.
#[derive(Debug)]
pub struct Negotiated {
    pub stream: MaybeTlsStream,
    pub protocol: AlpnProtocol,
    pub key: ConnectionKey,
}

/// Opens sockets, negotiates ALPN, and keeps the ticket cache honest.
#[derive(Clone, Debug)]
pub struct AlpnConnector {
    tls: TlsContext,
}

impl AlpnConnector {
    pub fn new() -> Self {
        Self {
            tls: TlsContext::new(),
        }
    }

    /// Establish a connection to `endpoint`, offering `protocols` in
    /// priority order.
    ///
    /// On any failure — resolution, refused socket, handshake, rejected
    /// negotiation, timeout, or abort — the identity's session ticket is
    /// evicted when resumption was enabled, so the next attempt starts from
    /// a full handshake.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        protocols: &[AlpnProtocol],
        options: &ConnectOptions,
    ) -> Result<Negotiated> {
        let key = connection_key(endpoint, options);
        if let Some(signal) = &options.signal {
            // An already-aborted signal rejects before any I/O.
            if signal.is_aborted() {
                return Err(Error::aborted().with_key(key));
            }
        }

        let attempt = self.attempt(endpoint, protocols, options, &key);
        let attempt = async {
            match options.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout()),
                },
                None => attempt.await,
            }
        };
        let result = match &options.signal {
            Some(signal) => {
                tokio::select! {
                    _ = signal.aborted() => Err(Error::aborted()),
                    result = attempt => result,
                }
            }
            None => attempt.await,
        };

        match result {
            Ok(negotiated) => Ok(negotiated),
            Err(err) => {
                if endpoint.is_tls() {
                    if let Some(cache) = &options.tls_session_cache {
                        cache.evict(key.as_str());
                    }
                }
                Err(err.with_key(key))
            }
        }
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        protocols: &[AlpnProtocol],
        options: &ConnectOptions,
        key: &ConnectionKey,
    ) -> Result<Negotiated> {
        trace!(target: "h2_alpn::dns", host = %endpoint.host, "resolving");
        let resolver: Arc<dyn Resolve> = options
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::new(GaiResolver));
        let addrs = resolver.resolve(&endpoint.host, endpoint.port).await?;

        let tcp = Self::open_tcp(&addrs).await?;
        trace!(target: "h2_alpn::tcp", peer = %endpoint, "connected");
        apply_socket_options(&tcp, options);

        if !endpoint.is_tls() {
            // No ALPN without TLS; the protocol is fixed by configuration.
            let protocol = protocols
                .first()
                .copied()
                .ok_or_else(|| Error::builder("no protocols configured"))?;
            return Ok(Negotiated {
                stream: MaybeTlsStream::Plain(tcp),
                protocol,
                key: key.clone(),
            });
        }

        let ticket = match &options.tls_session_cache {
            Some(cache) => cache.load(key.as_str()),
            None => None,
        }
        .unwrap_or_else(SessionTicket::fresh);

        let config = self
            .tls
            .client_config(options, protocols, ticket.resumption());
        let server_name = options
            .server_name
            .clone()
            .unwrap_or_else(|| endpoint.host.clone());
        let server_name = rustls::pki_types::ServerName::try_from(server_name)
            .map_err(Error::tls_handshake)?;

        debug!(target: "h2_alpn::tls", peer = %endpoint, offer = ?protocols, "handshaking");
        let connector = tokio_rustls::TlsConnector::from(config);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(Error::tls_handshake)?;

        let negotiated = stream
            .get_ref()
            .1
            .alpn_protocol()
            .and_then(AlpnProtocol::from_wire);
        let protocol = match negotiated {
            Some(proto) if protocols.contains(&proto) => proto,
            _ => return Err(Error::negotiation()),
        };
        debug!(target: "h2_alpn::tls", peer = %endpoint, %protocol, "negotiated");

        // The handshake refreshed the ticket's resumption state; persist it
        // before handing the stream out.
        if let Some(cache) = &options.tls_session_cache {
            cache.save(key.as_str(), ticket);
        }

        Ok(Negotiated {
            stream: MaybeTlsStream::Tls(Box::new(stream)),
            protocol,
            key: key.clone(),
        })
    }

    async fn open_tcp(addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    trace!(target: "h2_alpn::tcp", %addr, %err, "address failed");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => Error::connect(err),
            None => Error::connect("no addresses to connect to"),
        })
    }
}

impl Default for AlpnConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep-alive and no-delay tuning. Failures here degrade performance, not
/// correctness, so they are logged and swallowed.
fn apply_socket_options(tcp: &TcpStream, options: &ConnectOptions) {
    if options.no_delay {
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(target: "h2_alpn::tcp", %err, "failed to set TCP_NODELAY");
        }
    }
    if options.keep_alive {
        let keepalive = TcpKeepalive::new().with_time(options.keep_alive_interval);
        if let Err(err) = SockRef::from(tcp).set_tcp_keepalive(&keepalive) {
            debug!(target: "h2_alpn::tcp", %err, "failed to set keep-alive");
        }
    }
}
