//! Shared helpers: an in-memory h2 session factory and a TLS loopback
//! server with configurable ALPN.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use h2_alpn::{AlpnProtocol, ConnectOptions, ConnectionKey, Endpoint, SessionFactory, SessionParts};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;

/// Session factory backed by an in-process h2 server over a duplex pipe.
/// No sockets, no TLS; establishment order and counts are deterministic.
#[derive(Debug)]
pub struct MemoryFactory {
    created: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Delay establishment, to exercise the not-yet-connected proxy paths.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            created: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    /// Transports created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MemoryFactory {
    fn create(
        &self,
        _endpoint: &Endpoint,
        _key: &ConnectionKey,
        _options: &ConnectOptions,
    ) -> BoxFuture<'static, h2_alpn::Result<SessionParts>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let (client_io, server_io) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve_h2(server_io));
            let mut builder = h2::client::Builder::new();
            builder.enable_push(false);
            let (send, connection) = builder
                .handshake::<_, Bytes>(client_io)
                .await
                .expect("in-memory h2 handshake");
            Ok(SessionParts {
                send,
                connection: Box::pin(connection),
                alpn_protocol: AlpnProtocol::H2,
            })
        })
    }
}

/// Minimal h2 origin: answers every request with 200 and a short body,
/// draining whatever body the client sends.
pub async fn serve_h2<T>(io: T)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = match h2::server::handshake(io).await {
        Ok(conn) => conn,
        Err(_) => return,
    };
    while let Some(accepted) = conn.accept().await {
        let Ok((request, mut respond)) = accepted else {
            return;
        };
        tokio::spawn(async move {
            let mut body = request.into_body();
            let response = http::Response::builder()
                .status(http::StatusCode::OK)
                .body(())
                .expect("response head");
            if let Ok(mut send) = respond.send_response(response, false) {
                let _ = send.send_data(Bytes::from_static(b"hello"), true);
            }
            while let Some(chunk) = std::future::poll_fn(|cx| body.poll_data(cx)).await {
                match chunk {
                    Ok(data) => {
                        let _ = body.flow_control().release_capacity(data.len());
                    }
                    Err(_) => break,
                }
            }
        });
    }
}

/// TLS loopback server with a self-signed certificate for `localhost` and a
/// configurable ALPN offer. Serves h2 when h2 is negotiated; otherwise holds
/// the connection open.
pub struct TlsServer {
    port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl TlsServer {
    pub async fn start(alpn: &[&[u8]]) -> TlsServer {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed certificate");
        let cert_der = certified.cert.der().clone();
        let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(
            certified.signing_key.serialize_der(),
        );
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("server tls config");
        config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    if tls.get_ref().1.alpn_protocol() == Some(b"h2") {
                        serve_h2(tls).await;
                    } else {
                        // http/1.1 fallback transport: keep the socket open
                        // until the peer hangs up.
                        let mut tls = tls;
                        let mut buf = [0u8; 1024];
                        loop {
                            match tls.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                        }
                    }
                });
            }
        });
        TlsServer { port, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        format!("https://localhost:{}", self.port)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for TlsServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// TCP listener that accepts connections but never speaks TLS; handshakes
/// against it hang until cancelled or timed out.
pub struct SilentServer {
    port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl SilentServer {
    pub async fn start() -> SilentServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                held.push(tcp);
            }
        });
        SilentServer { port, handle }
    }

    pub fn authority(&self) -> String {
        format!("https://localhost:{}", self.port)
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

pub fn get_request(authority: &str) -> http::Request<()> {
    http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("{authority}/"))
        .body(())
        .expect("request head")
}

pub fn post_request(authority: &str) -> http::Request<()> {
    http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("{authority}/upload"))
        .body(())
        .expect("request head")
}
