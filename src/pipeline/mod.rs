//! The per-call authentication / authorization pipeline.
//!
//! Both frontends funnel every call through [`AuthPipeline::invoke`]:
//!
//! ```text
//! bind AuthInfo ─▶ claim mapper ─▶ authorizer ─▶ handler
//!                      │               │
//!                Unauthenticated  PermissionDenied
//! ```
//!
//! Every step races the call's deadline and cancellation. A panic inside a
//! hook aborts only the call, with `Internal`.
//!
//! The call's namespace is the one every hook and the handler see: a request
//! body naming a different namespace is refused before claims are resolved.

mod context;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use telemetry_metrics::counter;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub use context::{CallContext, CallPhase, ConnectionContext};

use crate::Result;
use crate::auth::{
    AuthError, AuthInfo, Authorizer, AuthorizerKind, CallTarget, ClaimMapper, ClaimMapperKind,
    Claims, Decision, ObserverHooks,
};
use crate::config::{Config, FrontendConfig};
use crate::rpc::Status;
use crate::service::{MethodKind, ServiceRegistry};

/// Handler output handed back to the frontend.
pub enum Dispatch {
    /// Unary response.
    Unary(Value),
    /// Server-streaming responses, already bounded by the call deadline.
    Stream(BoxStream<'static, std::result::Result<Value, Status>>),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(value) => f.debug_tuple("Unary").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Deadline policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Applied when the caller sends no deadline.
    pub default: Duration,
    /// Caller deadlines are clamped to this.
    pub max: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        let frontend = FrontendConfig::default();
        Self::from(&frontend)
    }
}

impl From<&FrontendConfig> for CallTimeouts {
    fn from(config: &FrontendConfig) -> Self {
        Self {
            default: config.default_call_timeout,
            max: config.max_call_timeout,
        }
    }
}

/// Injected hook implementations for `pluggable` settings.
#[derive(Default, Clone)]
pub struct PluggableHooks {
    /// Used when `auth.claimMapper: pluggable`.
    pub claim_mapper: Option<Arc<dyn ClaimMapper>>,
    /// Used when `auth.authorizer: pluggable`.
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

/// Shared by all connections of both frontends.
pub struct AuthPipeline {
    claim_mapper: ClaimMapperKind,
    authorizer: AuthorizerKind,
    hooks: ObserverHooks,
    registry: Arc<ServiceRegistry>,
    timeouts: CallTimeouts,
}

impl AuthPipeline {
    /// Assemble a pipeline from explicit parts.
    #[must_use]
    pub fn new(
        claim_mapper: ClaimMapperKind,
        authorizer: AuthorizerKind,
        registry: Arc<ServiceRegistry>,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            claim_mapper,
            authorizer,
            hooks: ObserverHooks::default(),
            registry,
            timeouts,
        }
    }

    /// Assemble a pipeline from config.
    ///
    /// # Errors
    ///
    /// `Error::Config` when a `pluggable` hook was selected but not supplied.
    pub fn from_config(
        config: &Config,
        registry: Arc<ServiceRegistry>,
        pluggable: PluggableHooks,
    ) -> Result<Self> {
        let claim_mapper = ClaimMapperKind::from_config(&config.auth, pluggable.claim_mapper)?;
        let authorizer = AuthorizerKind::from_config(&config.auth, pluggable.authorizer)?;
        debug!(
            claim_mapper = claim_mapper.name(),
            authorizer = authorizer.name(),
            methods = registry.len(),
            "Auth pipeline configured"
        );
        Ok(Self::new(
            claim_mapper,
            authorizer,
            registry,
            CallTimeouts::from(&config.frontend),
        ))
    }

    /// Observer hook slots.
    #[must_use]
    pub fn hooks(&self) -> &ObserverHooks {
        &self.hooks
    }

    /// Method table.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Effective deadline for a call that arrives now with `requested`.
    #[must_use]
    pub fn deadline_for(&self, requested: Option<Duration>) -> Instant {
        let timeout = requested.map_or(self.timeouts.default, |t| t.min(self.timeouts.max));
        Instant::now() + timeout
    }

    /// Run one call through the pipeline.
    ///
    /// # Errors
    ///
    /// The status the call terminates with when it does not reach a handler
    /// or the handler fails.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        api_name: &str,
        namespace: &str,
        request: Value,
    ) -> std::result::Result<Dispatch, Status> {
        let result = self.run(ctx, api_name, namespace, request).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(status) => status.code.as_str(),
        };
        counter!(
            "flowgate_calls_total",
            "edge" => ctx.edge().as_str(),
            "outcome" => outcome
        )
        .increment(1);
        if let Err(status) = &result {
            if !ctx.phase().is_terminal() {
                ctx.advance(CallPhase::Aborted);
            }
            debug!(
                edge = %ctx.edge(),
                method = %api_name,
                namespace = %namespace,
                code = %status.code,
                "Call rejected"
            );
        }
        result
    }

    async fn run(
        &self,
        ctx: &CallContext,
        api_name: &str,
        namespace: &str,
        request: Value,
    ) -> std::result::Result<Dispatch, Status> {
        ctx.advance(CallPhase::AuthInfoBound);
        check_request_namespace(namespace, &request)?;

        let claims = self.resolve_claims(ctx, api_name).await?;
        ctx.advance(CallPhase::ClaimsResolved);

        let method = self.registry.get(api_name);
        if let Some(method) = method {
            ctx.set_access(method.access);
        }
        let target = CallTarget {
            api_name: api_name.to_owned(),
            namespace: namespace.to_owned(),
            request: Arc::new(request),
        };
        self.authorize(ctx, &claims, &target).await?;
        ctx.advance(CallPhase::Authorized);

        if let Some(status) = ctx.check() {
            return Err(status);
        }
        let Some(method) = method else {
            ctx.advance(CallPhase::Completed);
            return Err(Status::unimplemented(api_name));
        };

        ctx.advance(CallPhase::Dispatched);
        let request = Arc::unwrap_or_clone(target.request);
        match &method.kind {
            MethodKind::Unary(handler) => {
                let response = ctx.guard(handler(ctx.clone(), request)).await?;
                ctx.advance(CallPhase::Completed);
                response.map(Dispatch::Unary)
            }
            MethodKind::ServerStreaming(handler) => {
                let stream = handler(ctx.clone(), request);
                Ok(Dispatch::Stream(bounded(ctx.clone(), stream)))
            }
        }
    }

    /// Claims for this call, computed at most once.
    async fn resolve_claims(
        &self,
        ctx: &CallContext,
        api_name: &str,
    ) -> std::result::Result<Claims, Status> {
        let mapper: &dyn ClaimMapper = match self.hooks.on_get_claims() {
            Some(hook) => hook.as_ref(),
            None => &self.claim_mapper,
        };
        let auth_info = ctx
            .auth_info()
            .cloned()
            .unwrap_or_else(|| Arc::new(AuthInfo::default()));

        if !auth_info.has_credentials() && !mapper.auth_info_required() {
            return Ok(ctx
                .claims_cell()
                .get_or_init(|| async { Claims::anonymous() })
                .await
                .clone());
        }

        let claims = ctx
            .claims_cell()
            .get_or_try_init(|| async {
                let mapped = ctx
                    .guard(AssertUnwindSafe(mapper.get_claims(&auth_info)).catch_unwind())
                    .await?;
                let claims: std::result::Result<Claims, Status> = match mapped {
                    Ok(Ok(claims)) => Ok(claims),
                    Ok(Err(AuthError::Unauthenticated(reason))) => {
                        ctx.advance(CallPhase::Unauthenticated);
                        counter!("flowgate_unauthenticated_total", "edge" => ctx.edge().as_str())
                            .increment(1);
                        warn!(
                            edge = %ctx.edge(),
                            method = %api_name,
                            subject = %auth_info.subject_label(),
                            reason = %reason,
                            "Claim mapper rejected caller"
                        );
                        Err(Status::unauthenticated(reason))
                    }
                    Ok(Err(AuthError::Internal(detail))) => {
                        error!(
                            edge = %ctx.edge(),
                            method = %api_name,
                            subject = %auth_info.subject_label(),
                            detail = %detail,
                            "Claim mapper failed"
                        );
                        Err(Status::internal())
                    }
                    Err(panic) => {
                        error!(
                            edge = %ctx.edge(),
                            method = %api_name,
                            subject = %auth_info.subject_label(),
                            panic = %panic_message(panic.as_ref()),
                            "Claim mapper panicked"
                        );
                        Err(Status::internal())
                    }
                };
                claims
            })
            .await?;
        Ok(claims.clone())
    }

    async fn authorize(
        &self,
        ctx: &CallContext,
        claims: &Claims,
        target: &CallTarget,
    ) -> std::result::Result<(), Status> {
        let authorizer: &dyn Authorizer = match self.hooks.on_authorize() {
            Some(hook) => hook.as_ref(),
            None => &self.authorizer,
        };
        let outcome = ctx
            .guard(AssertUnwindSafe(authorizer.authorize(ctx, claims, target)).catch_unwind())
            .await?;

        match outcome {
            Ok(Ok(result)) if result.decision == Decision::Allow => Ok(()),
            Ok(Ok(result)) => {
                ctx.advance(CallPhase::Denied);
                counter!("flowgate_denied_total", "edge" => ctx.edge().as_str()).increment(1);
                debug!(
                    method = %target.api_name,
                    namespace = %target.namespace,
                    subject = %claims.subject,
                    reason = %result.reason,
                    "Call denied"
                );
                Err(Status::permission_denied(result.reason))
            }
            Ok(Err(err)) => {
                ctx.advance(CallPhase::Denied);
                warn!(
                    method = %target.api_name,
                    namespace = %target.namespace,
                    subject = %claims.subject,
                    error = %err,
                    "Authorizer returned an error, denying"
                );
                Err(Status::permission_denied("authorizer error"))
            }
            Err(panic) => {
                error!(
                    method = %target.api_name,
                    namespace = %target.namespace,
                    subject = %claims.subject,
                    panic = %panic_message(panic.as_ref()),
                    "Authorizer panicked"
                );
                Err(Status::internal())
            }
        }
    }
}

/// Stop `inner` at the call's deadline or cancellation, ending with that
/// status.
fn bounded(
    ctx: CallContext,
    inner: BoxStream<'static, std::result::Result<Value, Status>>,
) -> BoxStream<'static, std::result::Result<Value, Status>> {
    futures::stream::unfold(Some((ctx, inner)), |state| async move {
        let (ctx, mut inner) = state?;
        match ctx.guard(inner.next()).await {
            Ok(Some(Ok(item))) => Some((Ok(item), Some((ctx, inner)))),
            Ok(Some(Err(status))) => {
                ctx.advance(CallPhase::Completed);
                Some((Err(status), None))
            }
            Ok(None) => {
                ctx.advance(CallPhase::Completed);
                None
            }
            Err(status) => {
                ctx.advance(CallPhase::Aborted);
                Some((Err(status), None))
            }
        }
    })
    .boxed()
}

/// A request body that names a namespace must name the one the call is
/// authorized against.
fn check_request_namespace(namespace: &str, request: &Value) -> std::result::Result<(), Status> {
    match request.get("namespace") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(named)) if named == namespace => Ok(()),
        Some(Value::String(named)) => Err(Status::invalid_argument(format!(
            "request namespace {named:?} does not match call namespace {namespace:?}"
        ))),
        Some(_) => Err(Status::invalid_argument("request namespace must be a string")),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::auth::{
        Access, AuthzResult, DefaultAuthorizer, DefaultClaimMapper, PrincipalGrant, Role,
        TlsSubject, authorizer_fn, claim_mapper_fn,
    };
    use crate::mtls::Edge;
    use crate::rpc::Code;

    const ECHO: &str = "/test.Svc/Echo";
    const PUBLIC: &str = "/test.Svc/Ping";
    const SLOW: &str = "/test.Svc/Slow";
    const COUNT: &str = "/test.Svc/Count";

    struct Fixture {
        pipeline: AuthPipeline,
        handled: Arc<AtomicUsize>,
    }

    fn fixture(mapper: ClaimMapperKind, authorizer: AuthorizerKind) -> Fixture {
        let handled = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        let counter = Arc::clone(&handled);
        registry
            .unary(ECHO, Access::Writer, move |_, req| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(req) }
            })
            .unary(PUBLIC, Access::Public, |_, _| async {
                Ok(serde_json::json!({"pong": true}))
            })
            .unary(SLOW, Access::Public, |_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            })
            .server_streaming(COUNT, Access::Reader, |_, _| {
                futures::stream::iter((0..3).map(|i| Ok(serde_json::json!(i))))
            });
        Fixture {
            pipeline: AuthPipeline::new(mapper, authorizer, Arc::new(registry), CallTimeouts::default()),
            handled,
        }
    }

    fn default_fixture() -> Fixture {
        let mut namespaces = std::collections::HashMap::new();
        namespaces.insert("default".to_string(), Role::Writer);
        let mapper = DefaultClaimMapper::new().with_principal(
            "writer",
            PrincipalGrant {
                system: Role::Undefined,
                namespaces,
            },
        );
        fixture(
            ClaimMapperKind::Default(mapper),
            AuthorizerKind::Default(DefaultAuthorizer),
        )
    }

    fn ctx(cn: Option<&str>, deadline: Option<Instant>) -> CallContext {
        let info = cn.map(|cn| AuthInfo {
            tls_subject: Some(TlsSubject {
                common_name: cn.to_string(),
                ..TlsSubject::default()
            }),
            ..AuthInfo::default()
        });
        let conn = ConnectionContext::new(
            Edge::Rpc,
            "127.0.0.1:4000".parse().unwrap(),
            info,
            CancellationToken::new(),
        );
        CallContext::new(conn, deadline, None)
    }

    fn ctx_for(cn: &str) -> CallContext {
        ctx(Some(cn), None)
    }

    #[tokio::test]
    async fn allowed_call_reaches_handler() {
        // GIVEN: a writer on "default"
        let f = default_fixture();
        let ctx = ctx(Some("writer"), None);
        // WHEN: calling a writer method there
        let result = f
            .pipeline
            .invoke(&ctx, ECHO, "default", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        // THEN: the handler ran and the call completed
        assert!(matches!(result, Dispatch::Unary(v) if v == serde_json::json!({"x": 1})));
        assert_eq!(f.handled.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.phase(), CallPhase::Completed);
        assert_eq!(ctx.claims().unwrap().subject, "writer");
    }

    #[tokio::test]
    async fn denied_call_never_reaches_handler() {
        let f = default_fixture();
        let ctx = ctx(Some("writer"), None);
        let status = f
            .pipeline
            .invoke(&ctx, ECHO, "other", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::PermissionDenied);
        assert!(status.message.contains("namespace role undefined on other"));
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.phase(), CallPhase::Denied);
    }

    #[tokio::test]
    async fn anonymous_caller_reaches_public_method_only() {
        let f = default_fixture();
        let public = f
            .pipeline
            .invoke(&ctx(None, None), PUBLIC, "", Value::Null)
            .await;
        assert!(public.is_ok());

        let private = f
            .pipeline
            .invoke(&ctx(None, None), ECHO, "default", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(private.code, Code::PermissionDenied);
    }

    #[tokio::test]
    async fn mapper_rejection_is_unauthenticated() {
        // GIVEN: a mapper that requires auth info and rejects everyone
        let mapper = claim_mapper_fn(|_| Err(AuthError::Unauthenticated("nope".to_string())));
        let f = fixture(
            ClaimMapperKind::Custom(mapper),
            AuthorizerKind::AllowAll,
        );
        let ctx = ctx(Some("someone"), None);
        // WHEN: calling
        let status = f.pipeline.invoke(&ctx, ECHO, "", Value::Null).await.unwrap_err();
        // THEN: unauthenticated, authorizer and handler skipped
        assert_eq!(status, Status::unauthenticated("nope"));
        assert_eq!(ctx.phase(), CallPhase::Unauthenticated);
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mapper_error_is_internal_without_detail() {
        // GIVEN: a mapper failing with an internal detail
        let mapper = claim_mapper_fn(|_| Err(AuthError::Internal("secret".to_string())));
        let f = fixture(ClaimMapperKind::Custom(mapper), AuthorizerKind::AllowAll);
        // WHEN: calling
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), None), ECHO, "", Value::Null)
            .await
            .unwrap_err();
        // THEN: a bare internal status, handler skipped
        assert_eq!(status, Status::internal());
        assert!(!status.message.contains("secret"));
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_mapper_yields_internal() {
        let mapper = claim_mapper_fn(|_| panic!("secret mapper state"));
        let f = fixture(ClaimMapperKind::Custom(mapper), AuthorizerKind::AllowAll);
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), None), ECHO, "", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(status, Status::internal());
        assert!(!status.message.contains("secret"));
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_namespace_must_match_call_namespace() {
        // GIVEN: a writer on "default" only
        let f = default_fixture();
        let ctx = ctx(Some("writer"), None);
        // WHEN: the call addresses "default" but the body names "orders"
        let status = f
            .pipeline
            .invoke(&ctx, ECHO, "default", serde_json::json!({"namespace": "orders"}))
            .await
            .unwrap_err();
        // THEN: rejected before any hook ran
        assert_eq!(status.code, Code::InvalidArgument);
        assert!(ctx.claims().is_none());
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);

        // AND: an empty call namespace cannot carry one in either
        let status = f
            .pipeline
            .invoke(
                &ctx_for("writer"),
                ECHO,
                "",
                serde_json::json!({"namespace": "orders"}),
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);

        // AND: a matching body goes through
        f.pipeline
            .invoke(
                &ctx_for("writer"),
                ECHO,
                "default",
                serde_json::json!({"namespace": "default"}),
            )
            .await
            .unwrap();
        assert_eq!(f.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorizer_error_is_treated_as_deny() {
        let authorizer = authorizer_fn(|_, _, _| Err(AuthError::Internal("db down".to_string())));
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::Custom(authorizer));
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), None), ECHO, "", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::PermissionDenied);
        assert!(!status.message.contains("db down"));
    }

    #[tokio::test]
    async fn panicking_authorizer_yields_internal_and_pipeline_survives() {
        // GIVEN: an authorizer that panics on one method only
        let authorizer = authorizer_fn(|_, _, target| {
            assert!(target.api_name != ECHO, "boom with secret payload");
            Ok(AuthzResult::allow("ok"))
        });
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::Custom(authorizer));
        // WHEN: the panicking method is called
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), None), ECHO, "", Value::Null)
            .await
            .unwrap_err();
        // THEN: internal, with a fixed message
        assert_eq!(status, Status::internal());
        // AND: other calls still work
        assert!(
            f.pipeline
                .invoke(&ctx(Some("c"), None), PUBLIC, "", Value::Null)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented_after_authorization() {
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::AllowAll);
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), None), "/test.Svc/Nope", "", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::Unimplemented);

        // Unknown methods are admin-only for the default authorizer
        let f = default_fixture();
        let status = f
            .pipeline
            .invoke(&ctx(Some("writer"), None), "/test.Svc/Nope", "default", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::PermissionDenied);
    }

    #[tokio::test]
    async fn slow_handler_hits_deadline() {
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::AllowAll);
        let deadline = Instant::now() + Duration::from_millis(50);
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), Some(deadline)), SLOW, "", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn slow_authorizer_hits_deadline_without_allow() {
        // GIVEN: an authorizer slower than the deadline
        struct Slow(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl Authorizer for Slow {
            async fn authorize(
                &self,
                _: &CallContext,
                _: &Claims,
                _: &CallTarget,
            ) -> std::result::Result<AuthzResult, AuthError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(AuthzResult::allow("late"))
            }
        }
        let allows = Arc::new(AtomicUsize::new(0));
        let f = fixture(
            ClaimMapperKind::NoOp,
            AuthorizerKind::Custom(Arc::new(Slow(Arc::clone(&allows)))),
        );
        // WHEN: calling with a short deadline
        let deadline = Instant::now() + Duration::from_millis(30);
        let status = f
            .pipeline
            .invoke(&ctx(Some("c"), Some(deadline)), ECHO, "", Value::Null)
            .await
            .unwrap_err();
        // THEN: deadline exceeded, no allow recorded, handler not run
        assert_eq!(status.code, Code::DeadlineExceeded);
        assert_eq!(allows.load(Ordering::SeqCst), 0);
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_call_never_reaches_handler() {
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::AllowAll);
        let ctx = ctx(Some("c"), None);
        ctx.cancel();
        let status = f.pipeline.invoke(&ctx, ECHO, "", Value::Null).await.unwrap_err();
        assert_eq!(status.code, Code::Cancelled);
        assert_eq!(f.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streaming_method_yields_all_items() {
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::AllowAll);
        let ctx = ctx(Some("c"), None);
        let Dispatch::Stream(stream) = f.pipeline.invoke(&ctx, COUNT, "", Value::Null).await.unwrap()
        else {
            panic!("expected a stream");
        };
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(ctx.phase(), CallPhase::Completed);
    }

    #[tokio::test]
    async fn observer_hooks_replace_configured_hooks() {
        // GIVEN: a default pipeline that would deny, plus a recorder
        let f = default_fixture();
        let recorder = Arc::new(crate::auth::CallRecorder::new());
        recorder.install(f.pipeline.hooks()).unwrap();
        // WHEN: an unknown CN calls a writer method
        let result = f
            .pipeline
            .invoke(&ctx(Some("stranger"), None), ECHO, "default", Value::Null)
            .await;
        // THEN: the recorder allowed it and saw the AuthInfo
        assert!(result.is_ok());
        assert_eq!(
            recorder.auth_info(ECHO).unwrap().common_name(),
            Some("stranger")
        );
    }

    #[tokio::test]
    async fn claims_are_resolved_once_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mapper = claim_mapper_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Claims {
                system: Role::Admin,
                ..Claims::default()
            })
        });
        let f = fixture(ClaimMapperKind::Custom(mapper), AuthorizerKind::AllowAll);
        let ctx = ctx(Some("c"), None);
        f.pipeline.invoke(&ctx, PUBLIC, "", Value::Null).await.unwrap();
        f.pipeline.invoke(&ctx, PUBLIC, "", Value::Null).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caller_deadline_is_clamped() {
        let f = fixture(ClaimMapperKind::NoOp, AuthorizerKind::AllowAll);
        let now = Instant::now();
        let deadline = f.pipeline.deadline_for(Some(Duration::from_secs(86_400)));
        assert!(deadline <= now + CallTimeouts::default().max + Duration::from_secs(1));
        let deadline = f.pipeline.deadline_for(None);
        assert!(deadline >= now + CallTimeouts::default().default);
    }
}
