//! Authentication and authorization.
//!
//! # Flow
//!
//! ```text
//! handshake ─▶ AuthInfo ─▶ ClaimMapper ─▶ Claims ─▶ Authorizer ─▶ allow / deny
//! ```
//!
//! - [`auth_info`] - normalized peer identity
//! - [`extractor`] - builds `AuthInfo` from a finished rustls handshake
//! - [`claims`] - roles, claims, call targets and decisions
//! - [`claim_mapper`] / [`authorizer`] - pluggable hooks and their defaults
//! - [`observer`] - set-once observer hooks and [`CallRecorder`]

pub mod auth_info;
pub mod authorizer;
pub mod claim_mapper;
pub mod claims;
pub mod error;
pub mod extractor;
pub mod observer;

pub use auth_info::{
    AuthInfo, PROP_FRONTEND_EDGE, PROP_PEER_ADDRESS, PROP_TLS_VERSION, TlsConnection, TlsSubject,
};
pub use authorizer::{Authorizer, AuthorizerKind, DefaultAuthorizer, FnAuthorizer, authorizer_fn};
pub use claim_mapper::{
    ClaimMapper, ClaimMapperKind, DefaultClaimMapper, FnClaimMapper, PrincipalGrant,
    claim_mapper_fn,
};
pub use claims::{Access, AuthzResult, CallTarget, Claims, Decision, Extension, Role};
pub use error::AuthError;
pub use extractor::{extract_auth_info, subject_from_der};
pub use observer::{CallRecorder, ObserverHooks};
