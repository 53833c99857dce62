//! Claim mappers: `AuthInfo` → `Claims`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::auth::auth_info::AuthInfo;
use crate::auth::claims::{Claims, Role};
use crate::auth::error::AuthError;
use crate::config::{AuthConfig, ClaimMapperSetting, PrincipalConfig};
use crate::{Error, Result};

/// Turns a peer identity into a principal.
///
/// Implementations are shared across all connections; any internal state
/// must be synchronized by the implementation.
#[async_trait]
pub trait ClaimMapper: Send + Sync {
    /// Map `auth_info` to claims. `Err(Unauthenticated)` rejects the call.
    async fn get_claims(&self, auth_info: &Arc<AuthInfo>) -> std::result::Result<Claims, AuthError>;

    /// When `true` the mapper is consulted even for callers that carry no
    /// certificate subject and no token.
    fn auth_info_required(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Default mapper
// ─────────────────────────────────────────────────────────────────────────────

/// Roles granted to one certificate CN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalGrant {
    /// System-wide role.
    pub system: Role,
    /// Per-namespace roles.
    pub namespaces: HashMap<String, Role>,
}

/// CN-table based mapper.
///
/// Subject is the certificate CN, or a fingerprint of the bearer token when
/// one is present. Roles come from the CN table. The inbound `AuthInfo` is
/// always placed in `Claims::extensions`.
#[derive(Debug, Clone, Default)]
pub struct DefaultClaimMapper {
    principals: HashMap<String, PrincipalGrant>,
    auth_info_required: bool,
}

impl DefaultClaimMapper {
    /// Mapper with an empty CN table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `auth` config block.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let principals = config
            .principals
            .iter()
            .map(|p: &PrincipalConfig| {
                (
                    p.common_name.clone(),
                    PrincipalGrant {
                        system: p.system,
                        namespaces: p.namespaces.clone(),
                    },
                )
            })
            .collect();
        Self {
            principals,
            auth_info_required: config.auth_info_required,
        }
    }

    /// Add or replace the grant for `common_name`.
    #[must_use]
    pub fn with_principal(mut self, common_name: impl Into<String>, grant: PrincipalGrant) -> Self {
        self.principals.insert(common_name.into(), grant);
        self
    }

    /// Require auth info for every call.
    #[must_use]
    pub fn require_auth_info(mut self, required: bool) -> Self {
        self.auth_info_required = required;
        self
    }
}

#[async_trait]
impl ClaimMapper for DefaultClaimMapper {
    async fn get_claims(&self, auth_info: &Arc<AuthInfo>) -> std::result::Result<Claims, AuthError> {
        let common_name = auth_info.common_name();
        let token = auth_info.auth_token.as_deref().filter(|t| !t.is_empty());

        let subject = match (token, common_name) {
            (Some(token), _) => token_subject(token),
            (None, Some(cn)) => cn.to_owned(),
            (None, None) => {
                return Err(AuthError::Unauthenticated(
                    "no client certificate subject or bearer token".to_string(),
                ));
            }
        };

        let grant = common_name
            .and_then(|cn| self.principals.get(cn))
            .cloned()
            .unwrap_or_default();

        Ok(Claims {
            subject,
            system: grant.system,
            namespaces: grant.namespaces,
            extensions: Some(Arc::clone(auth_info) as _),
        })
    }

    fn auth_info_required(&self) -> bool {
        self.auth_info_required
    }
}

/// Stable, non-reversible subject for a bearer token.
fn token_subject(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex = hex::encode(digest.as_slice());
    format!("token:{}", &hex[..16])
}

// ─────────────────────────────────────────────────────────────────────────────
// Configured variants
// ─────────────────────────────────────────────────────────────────────────────

/// The mapper selected by `auth.claimMapper`.
#[derive(Clone)]
pub enum ClaimMapperKind {
    /// [`DefaultClaimMapper`].
    Default(DefaultClaimMapper),
    /// Every caller is a system admin.
    NoOp,
    /// Injected implementation (`pluggable`).
    Custom(Arc<dyn ClaimMapper>),
}

impl ClaimMapperKind {
    /// Select the mapper from config.
    ///
    /// # Errors
    ///
    /// `pluggable` without an injected implementation is a config error.
    pub fn from_config(config: &AuthConfig, custom: Option<Arc<dyn ClaimMapper>>) -> Result<Self> {
        match config.claim_mapper {
            ClaimMapperSetting::Default => Ok(Self::Default(DefaultClaimMapper::from_config(config))),
            ClaimMapperSetting::Noop => Ok(Self::NoOp),
            ClaimMapperSetting::Pluggable => custom.map(Self::Custom).ok_or_else(|| {
                Error::Config(
                    "auth.claimMapper is 'pluggable' but no claim mapper was provided".to_string(),
                )
            }),
        }
    }

    /// Label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default(_) => "default",
            Self::NoOp => "noop",
            Self::Custom(_) => "pluggable",
        }
    }
}

#[async_trait]
impl ClaimMapper for ClaimMapperKind {
    async fn get_claims(&self, auth_info: &Arc<AuthInfo>) -> std::result::Result<Claims, AuthError> {
        match self {
            Self::Default(mapper) => mapper.get_claims(auth_info).await,
            Self::NoOp => Ok(Claims {
                subject: auth_info.common_name().unwrap_or_default().to_owned(),
                system: Role::Admin,
                namespaces: HashMap::new(),
                extensions: Some(Arc::clone(auth_info) as _),
            }),
            Self::Custom(mapper) => mapper.get_claims(auth_info).await,
        }
    }

    fn auth_info_required(&self) -> bool {
        match self {
            Self::Default(mapper) => mapper.auth_info_required(),
            Self::NoOp => false,
            Self::Custom(mapper) => mapper.auth_info_required(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Closure adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Mapper backed by a synchronous closure.
pub struct FnClaimMapper<F>(F);

/// Wrap a closure as a [`ClaimMapper`].
pub fn claim_mapper_fn<F>(f: F) -> Arc<dyn ClaimMapper>
where
    F: Fn(&Arc<AuthInfo>) -> std::result::Result<Claims, AuthError> + Send + Sync + 'static,
{
    Arc::new(FnClaimMapper(f))
}

#[async_trait]
impl<F> ClaimMapper for FnClaimMapper<F>
where
    F: Fn(&Arc<AuthInfo>) -> std::result::Result<Claims, AuthError> + Send + Sync + 'static,
{
    async fn get_claims(&self, auth_info: &Arc<AuthInfo>) -> std::result::Result<Claims, AuthError> {
        (self.0)(auth_info)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::auth_info::TlsSubject;

    fn info_with_cn(cn: &str) -> Arc<AuthInfo> {
        Arc::new(AuthInfo {
            tls_subject: Some(TlsSubject {
                common_name: cn.to_string(),
                ..TlsSubject::default()
            }),
            ..AuthInfo::default()
        })
    }

    #[tokio::test]
    async fn default_mapper_uses_cn_as_subject() {
        let mapper = DefaultClaimMapper::new();
        let claims = mapper.get_claims(&info_with_cn("worker-1")).await.unwrap();
        assert_eq!(claims.subject, "worker-1");
        assert_eq!(claims.system, Role::Undefined);
    }

    #[tokio::test]
    async fn default_mapper_assigns_roles_from_cn_table() {
        // GIVEN: a CN table entry granting writer on "default"
        let mut namespaces = HashMap::new();
        namespaces.insert("default".to_string(), Role::Writer);
        let mapper = DefaultClaimMapper::new().with_principal(
            "worker-1",
            PrincipalGrant {
                system: Role::Reader,
                namespaces,
            },
        );
        // WHEN: mapping that CN
        let claims = mapper.get_claims(&info_with_cn("worker-1")).await.unwrap();
        // THEN: both grants applied
        assert_eq!(claims.system, Role::Reader);
        assert_eq!(claims.namespace_role("default"), Role::Writer);
    }

    #[tokio::test]
    async fn default_mapper_rejects_missing_identity() {
        let mapper = DefaultClaimMapper::new();
        let err = mapper
            .get_claims(&Arc::new(AuthInfo::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn token_wins_subject_but_subject_kept_in_extensions() {
        // GIVEN: both a certificate subject and a bearer token
        let info = Arc::new(info_with_cn("worker-1").with_auth_token(Some("abc".to_string())));
        let mapper = DefaultClaimMapper::new();
        // WHEN: mapping
        let claims = mapper.get_claims(&info).await.unwrap();
        // THEN: the token decides the subject, the TLS subject survives
        assert!(claims.subject.starts_with("token:"));
        assert_eq!(claims.subject.len(), "token:".len() + 16);
        assert!(!claims.subject.contains("abc"));
        let carried = claims.extension::<AuthInfo>().unwrap();
        assert_eq!(carried.common_name(), Some("worker-1"));
    }

    #[tokio::test]
    async fn default_mapper_passes_the_same_auth_info_through() {
        let info = info_with_cn("worker-1");
        let claims = DefaultClaimMapper::new().get_claims(&info).await.unwrap();
        let carried = claims.extension_arc::<AuthInfo>().unwrap();
        assert!(Arc::ptr_eq(&carried, &info));
    }

    #[tokio::test]
    async fn noop_mapper_grants_admin() {
        let claims = ClaimMapperKind::NoOp
            .get_claims(&info_with_cn("anyone"))
            .await
            .unwrap();
        assert_eq!(claims.system, Role::Admin);
        assert_eq!(claims.subject, "anyone");
    }

    #[test]
    fn pluggable_without_implementation_is_config_error() {
        let config = AuthConfig {
            claim_mapper: ClaimMapperSetting::Pluggable,
            ..AuthConfig::default()
        };
        let result = ClaimMapperKind::from_config(&config, None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn closure_mapper_is_invoked() {
        let mapper = claim_mapper_fn(|info| {
            Ok(Claims {
                subject: info.subject_label().to_owned(),
                system: Role::Writer,
                ..Claims::default()
            })
        });
        let claims = mapper.get_claims(&info_with_cn("c")).await.unwrap();
        assert_eq!(claims.system, Role::Writer);
    }
}
