//! Authorizers: `(Claims, CallTarget)` → allow / deny.

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::claims::{Access, AuthzResult, CallTarget, Claims, Role};
use crate::auth::error::AuthError;
use crate::config::{AuthConfig, AuthorizerSetting};
use crate::pipeline::CallContext;
use crate::{Error, Result};

/// Decides whether a principal may make a call.
///
/// Implementations must be deterministic for identical inputs; any
/// internal state must be synchronized by the implementation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Evaluate the call. An `Err` is treated as a deny.
    async fn authorize(
        &self,
        ctx: &CallContext,
        claims: &Claims,
        target: &CallTarget,
    ) -> std::result::Result<AuthzResult, AuthError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Default authorizer
// ─────────────────────────────────────────────────────────────────────────────

/// Role-based authorizer.
///
/// Checks, in order: public method, system admin, system role for
/// non-namespaced methods, namespace role. Anything else is denied with the
/// failing check as the reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAuthorizer;

impl DefaultAuthorizer {
    /// Evaluate against the access level the method was registered with.
    #[must_use]
    pub fn evaluate(claims: &Claims, target: &CallTarget, access: Access) -> AuthzResult {
        let Some(required) = access.required_role() else {
            return AuthzResult::allow("public method");
        };

        if claims.system >= Role::Admin {
            return AuthzResult::allow("system admin");
        }

        if claims.is_unauthenticated() {
            return AuthzResult::deny("unauthenticated principal");
        }

        if target.namespace.is_empty() {
            if claims.system >= required {
                return AuthzResult::allow(format!("system role {}", claims.system));
            }
            return AuthzResult::deny(format!(
                "system role {} is below required {required}",
                claims.system
            ));
        }

        let granted = claims.namespace_role(&target.namespace);
        if granted >= required {
            return AuthzResult::allow(format!(
                "namespace role {granted} on {}",
                target.namespace
            ));
        }
        AuthzResult::deny(format!(
            "namespace role {granted} on {} is below required {required}",
            target.namespace
        ))
    }
}

#[async_trait]
impl Authorizer for DefaultAuthorizer {
    async fn authorize(
        &self,
        ctx: &CallContext,
        claims: &Claims,
        target: &CallTarget,
    ) -> std::result::Result<AuthzResult, AuthError> {
        Ok(Self::evaluate(claims, target, ctx.access()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configured variants
// ─────────────────────────────────────────────────────────────────────────────

/// The authorizer selected by `auth.authorizer`.
#[derive(Clone)]
pub enum AuthorizerKind {
    /// [`DefaultAuthorizer`].
    Default(DefaultAuthorizer),
    /// Allows every call.
    AllowAll,
    /// Injected implementation (`pluggable`).
    Custom(Arc<dyn Authorizer>),
}

impl AuthorizerKind {
    /// Select the authorizer from config.
    ///
    /// # Errors
    ///
    /// `pluggable` without an injected implementation is a config error.
    pub fn from_config(config: &AuthConfig, custom: Option<Arc<dyn Authorizer>>) -> Result<Self> {
        match config.authorizer {
            AuthorizerSetting::Default => Ok(Self::Default(DefaultAuthorizer)),
            AuthorizerSetting::AllowAll => Ok(Self::AllowAll),
            AuthorizerSetting::Pluggable => custom.map(Self::Custom).ok_or_else(|| {
                Error::Config(
                    "auth.authorizer is 'pluggable' but no authorizer was provided".to_string(),
                )
            }),
        }
    }

    /// Label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default(_) => "default",
            Self::AllowAll => "allowAll",
            Self::Custom(_) => "pluggable",
        }
    }
}

#[async_trait]
impl Authorizer for AuthorizerKind {
    async fn authorize(
        &self,
        ctx: &CallContext,
        claims: &Claims,
        target: &CallTarget,
    ) -> std::result::Result<AuthzResult, AuthError> {
        match self {
            Self::Default(authorizer) => authorizer.authorize(ctx, claims, target).await,
            Self::AllowAll => Ok(AuthzResult::allow("allow all")),
            Self::Custom(authorizer) => authorizer.authorize(ctx, claims, target).await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Closure adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Authorizer backed by a synchronous closure.
pub struct FnAuthorizer<F>(F);

/// Wrap a closure as an [`Authorizer`].
pub fn authorizer_fn<F>(f: F) -> Arc<dyn Authorizer>
where
    F: Fn(&CallContext, &Claims, &CallTarget) -> std::result::Result<AuthzResult, AuthError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnAuthorizer(f))
}

#[async_trait]
impl<F> Authorizer for FnAuthorizer<F>
where
    F: Fn(&CallContext, &Claims, &CallTarget) -> std::result::Result<AuthzResult, AuthError>
        + Send
        + Sync
        + 'static,
{
    async fn authorize(
        &self,
        ctx: &CallContext,
        claims: &Claims,
        target: &CallTarget,
    ) -> std::result::Result<AuthzResult, AuthError> {
        (self.0)(ctx, claims, target)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::Value;

    use super::*;
    use crate::auth::claims::Decision;

    fn target(namespace: &str) -> CallTarget {
        CallTarget {
            api_name: "/svc/Method".to_string(),
            namespace: namespace.to_string(),
            request: Arc::new(Value::Null),
        }
    }

    fn claims(system: Role, grants: &[(&str, Role)]) -> Claims {
        Claims {
            subject: "tester".to_string(),
            system,
            namespaces: grants
                .iter()
                .map(|(ns, role)| ((*ns).to_string(), *role))
                .collect::<HashMap<_, _>>(),
            extensions: None,
        }
    }

    #[test]
    fn admin_is_allowed_everywhere() {
        let result =
            DefaultAuthorizer::evaluate(&claims(Role::Admin, &[]), &target("ns"), Access::Admin);
        assert!(result.is_allowed());
    }

    #[test]
    fn unauthenticated_principal_is_denied_non_public_methods() {
        let result = DefaultAuthorizer::evaluate(&Claims::anonymous(), &target(""), Access::Reader);
        assert_eq!(result.decision, Decision::Deny);
        assert!(result.reason.contains("unauthenticated"));
    }

    #[test]
    fn unauthenticated_principal_may_call_public_methods() {
        let result = DefaultAuthorizer::evaluate(&Claims::anonymous(), &target(""), Access::Public);
        assert!(result.is_allowed());
    }

    #[test]
    fn namespace_role_meeting_minimum_is_allowed() {
        let c = claims(Role::Undefined, &[("orders", Role::Writer)]);
        assert!(DefaultAuthorizer::evaluate(&c, &target("orders"), Access::Writer).is_allowed());
        assert!(DefaultAuthorizer::evaluate(&c, &target("orders"), Access::Reader).is_allowed());
    }

    #[test]
    fn namespace_role_below_minimum_is_denied_with_reason() {
        // GIVEN: reader on "orders"
        let c = claims(Role::Undefined, &[("orders", Role::Reader)]);
        // WHEN: a writer method is called there
        let result = DefaultAuthorizer::evaluate(&c, &target("orders"), Access::Writer);
        // THEN: denied, reason names the failing check
        assert_eq!(result.decision, Decision::Deny);
        assert!(result.reason.contains("namespace role reader on orders"));
    }

    #[test]
    fn grant_in_other_namespace_does_not_leak() {
        let c = claims(Role::Undefined, &[("orders", Role::Admin)]);
        let result = DefaultAuthorizer::evaluate(&c, &target("billing"), Access::Reader);
        assert_eq!(result.decision, Decision::Deny);
    }

    #[test]
    fn system_role_covers_non_namespaced_methods() {
        let c = claims(Role::Reader, &[]);
        assert!(DefaultAuthorizer::evaluate(&c, &target(""), Access::Reader).is_allowed());
        assert!(!DefaultAuthorizer::evaluate(&c, &target(""), Access::Writer).is_allowed());
    }

    #[test]
    fn evaluation_is_idempotent() {
        let c = claims(Role::Undefined, &[("orders", Role::Reader)]);
        let first = DefaultAuthorizer::evaluate(&c, &target("orders"), Access::Writer);
        let second = DefaultAuthorizer::evaluate(&c, &target("orders"), Access::Writer);
        assert_eq!(first, second);
    }

    #[test]
    fn allow_all_is_selected_from_config() {
        let config = AuthConfig {
            authorizer: AuthorizerSetting::AllowAll,
            ..AuthConfig::default()
        };
        let kind = AuthorizerKind::from_config(&config, None).unwrap();
        assert_eq!(kind.name(), "allowAll");
    }

    #[test]
    fn pluggable_without_implementation_is_config_error() {
        let config = AuthConfig {
            authorizer: AuthorizerSetting::Pluggable,
            ..AuthConfig::default()
        };
        assert!(matches!(
            AuthorizerKind::from_config(&config, None),
            Err(Error::Config(_))
        ));
    }
}
