//! Client TLS configuration.
//!
//! Trust roots are loaded once per [`TlsContext`]; each connection attempt
//! gets its own `ClientConfig` because the ALPN offer and the resumption
//! store vary per attempt.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::config::{AlpnProtocol, ConnectOptions};

#[derive(Clone)]
pub(crate) struct TlsContext {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl TlsContext {
    /// Load webpki roots plus whatever the platform store yields. Unreadable
    /// platform certificates are skipped, not fatal.
    pub(crate) fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            debug!(
                errors = native.errors.len(),
                "some platform certificates failed to load"
            );
        }
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        Self {
            roots: Arc::new(roots),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Build the config for one connection attempt: protocol offer in
    /// priority order, the identity's resumption store, and certificate
    /// verification unless the caller turned it off.
    pub(crate) fn client_config(
        &self,
        options: &ConnectOptions,
        protocols: &[AlpnProtocol],
        resumption: Resumption,
    ) -> Arc<ClientConfig> {
        let mut config = if options.reject_unauthorized {
            ClientConfig::builder()
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                    provider: self.provider.clone(),
                }))
                .with_no_client_auth()
        };
        config.alpn_protocols = protocols
            .iter()
            .map(|proto| proto.as_bytes().to_vec())
            .collect();
        config.resumption = resumption;
        Arc::new(config)
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// Verifier for `reject_unauthorized: false`: signatures are still checked,
/// the chain is not.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
