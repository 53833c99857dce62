//! Configuration management

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Listener configuration for both edges
    pub frontend: FrontendConfig,
    /// TLS material and client-auth policy
    pub tls: TlsConfig,
    /// Claim mapper / authorizer selection
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from an optional YAML file, then environment
    /// variables prefixed `FLOWGATE_` (nesting separator `__`, keys keep
    /// their case, e.g. `FLOWGATE_tls__requireClientAuth=false`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("FLOWGATE_").split("__").lowercase(false));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.frontend.rpc_address()?;
        if self.frontend.http.enabled {
            let http = self.frontend.http_address()?;
            if http == self.frontend.rpc_address()? && http.port() != 0 {
                return Err(Error::Config(
                    "frontend.rpc.address and frontend.http.address must differ".to_string(),
                ));
            }
        }
        if self.frontend.max_call_timeout < self.frontend.default_call_timeout {
            return Err(Error::Config(
                "frontend.maxCallTimeout must not be shorter than frontend.defaultCallTimeout"
                    .to_string(),
            ));
        }
        if self.tls.server.cert_file.is_empty() || self.tls.server.key_file.is_empty() {
            return Err(Error::Config(
                "tls.server.certFile and tls.server.keyFile are required".to_string(),
            ));
        }
        if self.tls.require_client_auth && self.tls.client_ca.is_empty() {
            return Err(Error::Config(
                "tls.clientCA is required when tls.requireClientAuth is true".to_string(),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frontend
// ─────────────────────────────────────────────────────────────────────────────

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrontendConfig {
    /// Binary RPC frontend
    pub rpc: RpcListenerConfig,
    /// HTTP/JSON gateway
    pub http: HttpListenerConfig,
    /// Deadline applied when the caller sends none
    #[serde(with = "humantime_serde")]
    pub default_call_timeout: Duration,
    /// Upper bound on any caller-supplied deadline
    #[serde(with = "humantime_serde")]
    pub max_call_timeout: Duration,
    /// Time allowed for a TLS handshake to complete
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            rpc: RpcListenerConfig::default(),
            http: HttpListenerConfig::default(),
            default_call_timeout: Duration::from_secs(30),
            max_call_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl FrontendConfig {
    /// Parsed `frontend.rpc.address`.
    pub fn rpc_address(&self) -> Result<SocketAddr> {
        parse_address("frontend.rpc.address", &self.rpc.address)
    }

    /// Parsed `frontend.http.address`.
    pub fn http_address(&self) -> Result<SocketAddr> {
        parse_address("frontend.http.address", &self.http.address)
    }
}

fn parse_address(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {key} '{value}': {e}")))
}

/// RPC listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcListenerConfig {
    /// `host:port` to bind
    pub address: String,
}

impl Default for RpcListenerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7134".to_string(),
        }
    }
}

/// HTTP gateway listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpListenerConfig {
    /// Start the gateway
    pub enabled: bool,
    /// `host:port` to bind
    pub address: String,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:7243".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS
// ─────────────────────────────────────────────────────────────────────────────

/// TLS configuration shared by both edges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    /// Server identity
    pub server: ServerTlsConfig,
    /// PEM bundle of CAs trusted to sign client certificates
    #[serde(rename = "clientCA")]
    pub client_ca: String,
    /// Reject peers without a trusted certificate at the handshake
    pub require_client_auth: bool,
    /// Optional PEM certificate revocation list
    pub crl_file: Option<String>,
    /// Client identity used by tooling and cross-wiring
    pub client: ClientTlsConfig,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            server: ServerTlsConfig::default(),
            client_ca: String::new(),
            require_client_auth: true,
            crl_file: None,
            client: ClientTlsConfig::default(),
        }
    }
}

/// Server certificate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerTlsConfig {
    /// PEM certificate chain
    pub cert_file: String,
    /// PEM private key
    pub key_file: String,
    /// Informational SNI name of the server
    pub sni_name: Option<String>,
}

/// Client identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientTlsConfig {
    /// PEM certificate chain
    pub cert_file: Option<String>,
    /// PEM private key
    pub key_file: Option<String>,
    /// CA bundle used to verify the server (defaults to `tls.clientCA`)
    #[serde(rename = "rootCA")]
    pub root_ca: Option<String>,
    /// Name the client expects in the server certificate
    pub server_name: String,
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            root_ca: None,
            server_name: "localhost".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

/// `auth.claimMapper`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimMapperSetting {
    /// CN-table mapper
    #[default]
    Default,
    /// Every caller becomes a system admin
    Noop,
    /// Implementation injected at startup
    Pluggable,
}

/// `auth.authorizer`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizerSetting {
    /// Role-based authorizer
    #[default]
    Default,
    /// Allow every call
    AllowAll,
    /// Implementation injected at startup
    Pluggable,
}

/// Authentication / authorization configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Claim mapper selection
    pub claim_mapper: ClaimMapperSetting,
    /// Authorizer selection
    pub authorizer: AuthorizerSetting,
    /// Run the claim mapper even for callers without any credential
    pub auth_info_required: bool,
    /// CN → role table used by the default claim mapper
    pub principals: Vec<PrincipalConfig>,
}

/// One entry of the CN → role table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrincipalConfig {
    /// Certificate Common Name
    pub common_name: String,
    /// System-wide role
    pub system: Role,
    /// Namespace → role grants
    pub namespaces: HashMap<String, Role>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.tls.server.cert_file = "server.pem".to_string();
        config.tls.server.key_file = "server.key".to_string();
        config.tls.client_ca = "ca.pem".to_string();
        config
    }

    #[test]
    fn defaults_require_client_auth() {
        let config = Config::default();
        assert!(config.tls.require_client_auth);
        assert_eq!(config.frontend.rpc.address, "127.0.0.1:7134");
        assert_eq!(config.auth.claim_mapper, ClaimMapperSetting::Default);
        assert_eq!(config.auth.authorizer, AuthorizerSetting::Default);
    }

    #[test]
    fn camel_case_yaml_deserialises() {
        // GIVEN: a config using the documented key names
        let yaml = r#"
frontend:
  rpc: { address: "0.0.0.0:7134" }
  http: { address: "0.0.0.0:7243" }
  defaultCallTimeout: 5s
tls:
  server: { certFile: s.pem, keyFile: s.key, sniName: frontend.local }
  clientCA: ca.pem
  requireClientAuth: false
auth:
  claimMapper: noop
  authorizer: allowAll
  principals:
    - commonName: client.tls-sample.temporal.io
      system: admin
      namespaces: { default: writer }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        // THEN: every field landed where expected
        assert_eq!(config.frontend.default_call_timeout, Duration::from_secs(5));
        assert_eq!(config.tls.client_ca, "ca.pem");
        assert!(!config.tls.require_client_auth);
        assert_eq!(config.tls.server.sni_name.as_deref(), Some("frontend.local"));
        assert_eq!(config.auth.claim_mapper, ClaimMapperSetting::Noop);
        assert_eq!(config.auth.authorizer, AuthorizerSetting::AllowAll);
        assert_eq!(config.auth.principals[0].system, Role::Admin);
        assert_eq!(
            config.auth.principals[0].namespaces.get("default"),
            Some(&Role::Writer)
        );
    }

    #[test]
    fn unknown_authorizer_value_is_rejected() {
        let yaml = "authorizer: everything";
        let result: std::result::Result<AuthConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_server_cert() {
        let mut config = valid();
        config.tls.server.cert_file.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_missing_client_ca_when_required() {
        let mut config = valid();
        config.tls.client_ca.clear();
        assert!(config.validate().is_err());
        config.tls.require_client_auth = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_address() {
        let mut config = valid();
        config.frontend.rpc.address = "not-an-address".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("frontend.rpc.address"));
    }

    #[test]
    fn validate_rejects_shared_address() {
        let mut config = valid();
        config.frontend.http.address = config.frontend.rpc.address.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/flowgate.yaml")));
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("not found")));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgate.yaml");
        std::fs::write(
            &path,
            "tls:\n  server: { certFile: a, keyFile: b }\n  clientCA: c\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.tls.server.cert_file, "a");
    }
}
