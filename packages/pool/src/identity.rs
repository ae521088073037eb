//! Connection identity.
//!
//! Every cache in this crate (ticket cache, socket cache, origin map) is
//! keyed by the same canonical name derived from the destination and the
//! TLS options that make two connections interchangeable. The format follows
//! the host agent-name convention, `host:port:extraOptionsDigest`, so this
//! pool and any coexisting default transport agent agree on identity for the
//! same logical destination.

use std::fmt;
use std::sync::Arc;

use crate::config::ConnectOptions;
use crate::error::{Error, Result};

/// Canonical pooling key for one logical destination.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey(Arc<str>);

impl ConnectionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionKey({})", self.0)
    }
}

impl AsRef<str> for ConnectionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Transport scheme of a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Https => 443,
            Scheme::Http => 80,
        }
    }
}

/// A parsed destination: scheme, host, and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse an authority such as `https://example.com:8443`,
    /// `http://example.com`, or a bare `example.com:443` (bare authorities
    /// default to `https`). Any path, query, or fragment is ignored.
    pub fn parse(authority: &str) -> Result<Endpoint> {
        let (scheme, rest) = if let Some(rest) = authority.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = authority.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if authority.contains("://") {
            return Err(Error::builder(format!(
                "unsupported scheme in authority {authority:?}"
            )));
        } else {
            (Scheme::Https, authority)
        };

        let rest = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        if rest.is_empty() {
            return Err(Error::builder(format!("empty host in authority {authority:?}")));
        }

        // Bracketed IPv6 hosts keep their colons.
        let (host, port) = if let Some(end) = rest.find(']') {
            if !rest.starts_with('[') {
                return Err(Error::builder(format!("malformed host in {authority:?}")));
            }
            let host = &rest[1..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => Some(p),
                None if rest[end + 1..].is_empty() => None,
                None => {
                    return Err(Error::builder(format!("malformed port in {authority:?}")))
                }
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(Error::builder(format!("empty host in authority {authority:?}")));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|err| Error::builder(format!("invalid port {p:?}: {err}")))?,
            None => scheme.default_port(),
        };

        Ok(Endpoint::new(scheme, host, port))
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// The `scheme://host:port` form used as the `:authority` base.
    pub fn authority(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Derive the canonical pooling key for `endpoint` under `options`.
///
/// The digest covers the options that make connections non-interchangeable:
/// the scheme, disabled peer verification, and an SNI override. The ALPN
/// list deliberately stays out, so a connection negotiated with a protocol
/// preference list and one pinned to a single protocol share identity, the
/// way the host agent computes names.
pub fn connection_key(endpoint: &Endpoint, options: &ConnectOptions) -> ConnectionKey {
    let mut name = format!(
        "{}:{}:{}",
        endpoint.host,
        endpoint.port,
        endpoint.scheme.as_str()
    );
    if !options.reject_unauthorized {
        name.push_str(":insecure");
    }
    if let Some(ref server_name) = options.server_name {
        name.push_str(":sni=");
        name.push_str(server_name);
    }
    ConnectionKey(Arc::from(name))
}
