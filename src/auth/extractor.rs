//! Peer identity extraction.
//!
//! Turns a completed rustls server handshake into an [`AuthInfo`]: the CN,
//! `O` and `OU` of the verified leaf certificate plus SNI and ALPN from the
//! handshake state.
//!
//! # No unsafe
//!
//! `x509-parser` performs minimal `unsafe` internally for ASN.1 parsing;
//! this module itself contains no `unsafe` code and simply calls the safe
//! public API.

use std::net::SocketAddr;

use rustls::ServerConnection;
use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use crate::auth::auth_info::{
    AuthInfo, PROP_FRONTEND_EDGE, PROP_PEER_ADDRESS, PROP_TLS_VERSION, TlsConnection, TlsSubject,
};
use crate::mtls::Edge;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Handshake → AuthInfo
// ─────────────────────────────────────────────────────────────────────────────

/// Build the connection-scoped [`AuthInfo`] from a finished handshake.
///
/// `tls_subject` is `None` when the peer sent no certificate (only possible
/// when client auth is optional). The chain has already been verified by
/// rustls at this point; we only read the leaf.
///
/// # Errors
///
/// Returns `Error::Tls` if the leaf certificate cannot be parsed.
pub fn extract_auth_info(
    conn: &ServerConnection,
    edge: Edge,
    peer: SocketAddr,
) -> Result<AuthInfo> {
    let tls_subject = conn
        .peer_certificates()
        .and_then(<[CertificateDer<'_>]>::first)
        .map(|leaf| subject_from_der(leaf.as_ref()))
        .transpose()?;

    let tls_connection = TlsConnection {
        server_name: conn.server_name().unwrap_or_default().to_owned(),
        negotiated_protocol: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default(),
    };

    let mut info = AuthInfo {
        tls_subject,
        tls_connection: Some(tls_connection),
        auth_token: None,
        extra_properties: Default::default(),
    };
    info.extra_properties
        .insert(PROP_PEER_ADDRESS.to_owned(), peer.to_string());
    info.extra_properties
        .insert(PROP_FRONTEND_EDGE.to_owned(), edge.as_str().to_owned());
    if let Some(version) = conn.protocol_version() {
        info.extra_properties
            .insert(PROP_TLS_VERSION.to_owned(), format!("{version:?}"));
    }
    Ok(info)
}

/// Parse a DER-encoded certificate and extract its subject fields.
///
/// # Errors
///
/// Returns `Error::Tls` if the certificate cannot be parsed.
pub fn subject_from_der(der: &[u8]) -> Result<TlsSubject> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Tls(format!("Failed to parse client certificate: {e}")))?;
    let subject = cert.subject();

    Ok(TlsSubject {
        common_name: extract_cn(subject),
        organization: subject
            .iter_organization()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_owned)
            .collect(),
        organizational_unit: subject
            .iter_organizational_unit()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_owned)
            .collect(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

/// First CN attribute of the subject DN, empty when absent.
fn extract_cn(subject: &X509Name<'_>) -> String {
    subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
