//! TLS configuration provider.
//!
//! Builds the rustls server configs for both edges and the client config
//! used by [`RpcClient`](crate::rpc::RpcClient) from one set of PEM
//! material. Everything is built once at startup; handshakes only clone the
//! shared `Arc`s.

use std::fmt;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::config::TlsConfig;
use crate::mtls::Edge;
use crate::mtls::cert_manager::{load_certs, load_crls, load_private_key};
use crate::{Error, Result};

/// ALPN identifier of the binary RPC protocol.
pub const RPC_ALPN: &[u8] = b"flowgate-rpc/1";

/// Raw material the provider is built from.
pub struct TlsMaterial {
    /// Server chain, leaf first.
    pub server_certs: Vec<CertificateDer<'static>>,
    /// Server private key.
    pub server_key: PrivateKeyDer<'static>,
    /// CAs trusted to sign client certificates.
    pub client_ca: Vec<CertificateDer<'static>>,
    /// Revocation lists checked against client chains.
    pub crls: Vec<CertificateRevocationListDer<'static>>,
    /// Reject peers without a trusted certificate.
    pub require_client_auth: bool,
    /// Client chain and key presented by outbound connections.
    pub client_identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    /// CAs the client trusts for the server; `client_ca` when empty.
    pub client_roots: Vec<CertificateDer<'static>>,
    /// Server name the client verifies.
    pub server_name: String,
}

/// Shared TLS configuration for both frontends and outbound clients.
#[derive(Clone)]
pub struct TlsConfigProvider {
    rpc: Arc<ServerConfig>,
    http: Arc<ServerConfig>,
    client: Option<Arc<ClientConfig>>,
    anonymous_client: Arc<ClientConfig>,
    server_name: String,
    require_client_auth: bool,
}

impl fmt::Debug for TlsConfigProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfigProvider")
            .field("server_name", &self.server_name)
            .field("require_client_auth", &self.require_client_auth)
            .field("client_identity", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl TlsConfigProvider {
    /// Load PEM files named in the `tls` config block.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a file is missing or unparsable, and
    /// `Error::Tls` when rustls rejects the material.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let client_ca = if config.client_ca.is_empty() {
            Vec::new()
        } else {
            load_certs(&config.client_ca)?
        };
        let crls = match config.crl_file.as_deref() {
            Some(path) => load_crls(path)?,
            None => Vec::new(),
        };
        let client_identity = match (
            config.client.cert_file.as_deref(),
            config.client.key_file.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "tls.client.certFile and tls.client.keyFile must be set together".to_string(),
                ));
            }
        };
        let client_roots = match config.client.root_ca.as_deref() {
            Some(path) => load_certs(path)?,
            None => Vec::new(),
        };

        let provider = Self::from_material(TlsMaterial {
            server_certs: load_certs(&config.server.cert_file)?,
            server_key: load_private_key(&config.server.key_file)?,
            client_ca,
            crls,
            require_client_auth: config.require_client_auth,
            client_identity,
            client_roots,
            server_name: config.client.server_name.clone(),
        })?;

        debug!(
            server_cert = %config.server.cert_file,
            client_ca = %config.client_ca,
            crl = config.crl_file.is_some(),
            require_client_auth = config.require_client_auth,
            "TLS configs built"
        );
        Ok(provider)
    }

    /// Build from already-parsed material.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` when rustls rejects the material (cert/key
    /// mismatch, empty trust store with client auth required, …).
    pub fn from_material(material: TlsMaterial) -> Result<Self> {
        let crypto = crypto_provider();

        let mut client_ca_store = RootCertStore::empty();
        for cert in &material.client_ca {
            client_ca_store
                .add(cert.clone())
                .map_err(|e| Error::Tls(format!("Failed to add CA cert to trust store: {e}")))?;
        }

        let verifier = if client_ca_store.is_empty() && !material.require_client_auth {
            WebPkiClientVerifier::no_client_auth()
        } else {
            let builder =
                WebPkiClientVerifier::builder_with_provider(Arc::new(client_ca_store), crypto.clone())
                    .with_crls(material.crls);
            let builder = if material.require_client_auth {
                builder
            } else {
                builder.allow_unauthenticated()
            };
            builder
                .build()
                .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?
        };

        let server_config = |alpn: Vec<Vec<u8>>| -> Result<Arc<ServerConfig>> {
            let mut config = ServerConfig::builder_with_provider(crypto.clone())
                .with_protocol_versions(&[&rustls::version::TLS13])
                .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
                .with_client_cert_verifier(verifier.clone())
                .with_single_cert(material.server_certs.clone(), material.server_key.clone_key())
                .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;
            config.alpn_protocols = alpn;
            Ok(Arc::new(config))
        };
        let rpc = server_config(vec![RPC_ALPN.to_vec()])?;
        // Prefer HTTP/2, fall back to HTTP/1.1
        let http = server_config(vec![b"h2".to_vec(), b"http/1.1".to_vec()])?;

        let roots = if material.client_roots.is_empty() {
            &material.client_ca
        } else {
            &material.client_roots
        };
        let mut root_store = RootCertStore::empty();
        for cert in roots {
            root_store
                .add(cert.clone())
                .map_err(|e| Error::Tls(format!("Failed to add root cert: {e}")))?;
        }

        let client_builder = || {
            ClientConfig::builder_with_provider(crypto.clone())
                .with_protocol_versions(&[&rustls::version::TLS13])
                .map(|b| b.with_root_certificates(root_store.clone()))
                .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))
        };
        let client = material
            .client_identity
            .map(|(certs, key)| {
                client_builder()?
                    .with_client_auth_cert(certs, key)
                    .map(Arc::new)
                    .map_err(|e| Error::Tls(format!("Invalid client identity: {e}")))
            })
            .transpose()?;
        let anonymous_client = Arc::new(client_builder()?.with_no_client_auth());

        Ok(Self {
            rpc,
            http,
            client,
            anonymous_client,
            server_name: material.server_name,
            require_client_auth: material.require_client_auth,
        })
    }

    /// Server config for one edge. Both share trust anchors and policy and
    /// differ only in ALPN.
    #[must_use]
    pub fn server_config(&self, edge: Edge) -> Arc<ServerConfig> {
        match edge {
            Edge::Rpc => Arc::clone(&self.rpc),
            Edge::Http => Arc::clone(&self.http),
        }
    }

    /// Client config presenting the configured client certificate.
    ///
    /// # Errors
    ///
    /// `Error::Config` when no client identity was configured.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.client
            .clone()
            .ok_or_else(|| Error::Config("no client identity configured under tls.client".to_string()))
    }

    /// Client config that trusts the server but presents no certificate.
    #[must_use]
    pub fn anonymous_client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.anonymous_client)
    }

    /// Name clients expect in the server certificate.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether handshakes without a client certificate are rejected.
    #[must_use]
    pub fn require_client_auth(&self) -> bool {
        self.require_client_auth
    }
}

/// The crypto backend, passed explicitly so no process-wide default is
/// installed.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
