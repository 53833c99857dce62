//! Normalized peer identity attached to every accepted connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Extra property: remote socket address of the peer.
pub const PROP_PEER_ADDRESS: &str = "peer.address";
/// Extra property: which frontend accepted the connection (`rpc` / `http`).
pub const PROP_FRONTEND_EDGE: &str = "frontend.edge";
/// Extra property: negotiated TLS protocol version.
pub const PROP_TLS_VERSION: &str = "tls.version";

/// Distinguished-name fields of the peer leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsSubject {
    /// Subject Common Name, copied verbatim.
    pub common_name: String,
    /// Subject `O` attributes, in certificate order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
    /// Subject `OU` attributes, in certificate order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizational_unit: Vec<String>,
}

/// Handshake facts as seen by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsConnection {
    /// SNI value sent by the client (empty when none was sent).
    pub server_name: String,
    /// ALPN protocol agreed on (empty when none was negotiated).
    pub negotiated_protocol: String,
}

/// Peer identity record handed to the claim mapper.
///
/// Created once per connection at handshake completion, then cloned into
/// each call (where a per-call bearer token may be added).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Subject of the verified client certificate, if one was presented.
    pub tls_subject: Option<TlsSubject>,
    /// Handshake details.
    pub tls_connection: Option<TlsConnection>,
    /// Non-TLS bearer credential that accompanied the call.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    /// Transport-specific augmentations.
    #[serde(default)]
    pub extra_properties: BTreeMap<String, String>,
}

impl AuthInfo {
    /// CN of the verified peer, if any.
    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.tls_subject
            .as_ref()
            .map(|s| s.common_name.as_str())
            .filter(|cn| !cn.is_empty())
    }

    /// `true` when the record carries something a claim mapper can use.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.tls_subject.is_some() || self.auth_token.is_some()
    }

    /// Copy of this record carrying the given per-call bearer token.
    #[must_use]
    pub fn with_auth_token(&self, token: Option<String>) -> Self {
        let mut info = self.clone();
        if token.is_some() {
            info.auth_token = token;
        }
        info
    }

    /// Label for logs: the CN, or `<anonymous>`.
    #[must_use]
    pub fn subject_label(&self) -> &str {
        self.common_name().unwrap_or("<anonymous>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_has_no_credentials() {
        let info = AuthInfo::default();
        assert!(!info.has_credentials());
        assert_eq!(info.subject_label(), "<anonymous>");
    }

    #[test]
    fn token_alone_counts_as_credentials() {
        let info = AuthInfo::default().with_auth_token(Some("t".to_string()));
        assert!(info.has_credentials());
    }

    #[test]
    fn with_auth_token_none_keeps_existing_token() {
        let info = AuthInfo {
            auth_token: Some("conn".to_string()),
            ..AuthInfo::default()
        };
        assert_eq!(info.with_auth_token(None).auth_token.as_deref(), Some("conn"));
    }

    #[test]
    fn token_is_never_serialized() {
        // GIVEN: a record with a bearer token
        let info = AuthInfo {
            auth_token: Some("super-secret".to_string()),
            ..AuthInfo::default()
        };
        // THEN: serialized form (used in logs) omits it
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("super-secret"));
    }

    #[test]
    fn empty_common_name_is_treated_as_absent() {
        let info = AuthInfo {
            tls_subject: Some(TlsSubject::default()),
            ..AuthInfo::default()
        };
        assert!(info.common_name().is_none());
    }
}
