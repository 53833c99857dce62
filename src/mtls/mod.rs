//! Mutual TLS for both frontends.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (rustls verifies the client chain against tls.clientCA)
//!   → AuthInfo extracted from the peer certificate + handshake state
//!   → ConnectionContext shared by every call on the connection
//!   → [AuthPipeline runs per call]
//! ```
//!
//! # Modules
//!
//! - [`provider`] - builds server configs per [`Edge`] and the client config
//! - [`cert_manager`] - PEM loading and certificate generation
//!
//! # Quick start
//!
//! ```yaml
//! tls:
//!   server:
//!     certFile: /etc/flowgate/tls/server.crt
//!     keyFile:  /etc/flowgate/tls/server.key
//!   clientCA:   /etc/flowgate/tls/ca.crt
//!   requireClientAuth: true
//! ```

pub mod cert_manager;
pub mod provider;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cert_manager::{
    CaParams, CertGenerator, GeneratedCert, LeafCertParams, load_certs, load_crls,
    load_private_key, parse_certs, parse_private_key,
};
pub use provider::{RPC_ALPN, TlsConfigProvider, TlsMaterial, crypto_provider};

/// Which frontend accepted a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Binary RPC frontend.
    Rpc,
    /// HTTP/JSON gateway.
    Http,
}

impl Edge {
    /// Label used in `AuthInfo::extra_properties`, logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
