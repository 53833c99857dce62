//! Principal types: roles, claims and call targets.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role granted to a principal, system-wide or within one namespace.
///
/// Ordered: `Undefined < Reader < Writer < Admin`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No role.
    #[default]
    Undefined,
    /// Read-only access.
    Reader,
    /// Read and mutate.
    Writer,
    /// Everything.
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "undefined",
            Self::Reader => "reader",
            Self::Writer => "writer",
            Self::Admin => "admin",
        })
    }
}

/// Minimum access a method requires, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Callable by any principal, including the unauthenticated one.
    Public,
    /// Requires at least [`Role::Reader`].
    Reader,
    /// Requires at least [`Role::Writer`].
    Writer,
    /// Requires [`Role::Admin`].
    Admin,
}

impl Access {
    /// Role a principal needs to hold, `None` for public methods.
    #[must_use]
    pub fn required_role(self) -> Option<Role> {
        match self {
            Self::Public => None,
            Self::Reader => Some(Role::Reader),
            Self::Writer => Some(Role::Writer),
            Self::Admin => Some(Role::Admin),
        }
    }
}

/// Opaque value carried from the claim mapper to the authorizer.
pub type Extension = Arc<dyn Any + Send + Sync>;

/// Principal derived from an [`AuthInfo`](crate::auth::AuthInfo).
#[derive(Clone, Default)]
pub struct Claims {
    /// Identity of the caller (CN by default).
    pub subject: String,
    /// System-wide role.
    pub system: Role,
    /// Per-namespace roles.
    pub namespaces: HashMap<String, Role>,
    /// Carry-through data for authorizers; the default mapper stores the
    /// originating `AuthInfo` here.
    pub extensions: Option<Extension>,
}

impl Claims {
    /// The unauthenticated principal.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// `true` for a principal with no role anywhere.
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        self.system == Role::Undefined
            && self.namespaces.values().all(|role| *role == Role::Undefined)
    }

    /// Role held in `namespace` (not counting the system role).
    #[must_use]
    pub fn namespace_role(&self, namespace: &str) -> Role {
        self.namespaces.get(namespace).copied().unwrap_or_default()
    }

    /// Downcast the carry-through extension.
    #[must_use]
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions.as_deref()?.downcast_ref::<T>()
    }

    /// Shared handle to the carry-through extension, downcast.
    #[must_use]
    pub fn extension_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(self.extensions.as_ref()?).downcast::<T>().ok()
    }
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claims")
            .field("subject", &self.subject)
            .field("system", &self.system)
            .field("namespaces", &self.namespaces)
            .field("extensions", &self.extensions.as_ref().map(|_| ".."))
            .finish()
    }
}

/// What the authorizer is asked about.
#[derive(Debug, Clone)]
pub struct CallTarget {
    /// Fully-qualified method, `/<service>/<method>`. The same string on
    /// both frontends for the same operation.
    pub api_name: String,
    /// Addressed namespace, empty when not namespaced.
    pub namespace: String,
    /// Decoded request payload.
    pub request: Arc<Value>,
}

/// Authorizer verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Let the call through.
    Allow,
    /// Reject with `PermissionDenied`.
    Deny,
}

/// Decision plus the check that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthzResult {
    /// The verdict.
    pub decision: Decision,
    /// Which check decided (shown to callers on deny).
    pub reason: String,
}

impl AuthzResult {
    /// An `Allow` verdict.
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    /// A `Deny` verdict.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    /// `true` for [`Decision::Allow`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}
