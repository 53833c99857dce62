//! Observer hooks and a recorder built on them.
//!
//! An observer replaces the configured claim mapper / authorizer for the
//! pipeline it is installed on, which lets integration tests watch exactly
//! what reached the authorization layer.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::auth::auth_info::AuthInfo;
use crate::auth::authorizer::Authorizer;
use crate::auth::claim_mapper::ClaimMapper;
use crate::auth::claims::{AuthzResult, CallTarget, Claims, Decision, Role};
use crate::auth::error::AuthError;
use crate::pipeline::CallContext;
use crate::{Error, Result};

/// Set-once observer slots held by a pipeline.
#[derive(Default)]
pub struct ObserverHooks {
    on_get_claims: OnceLock<Arc<dyn ClaimMapper>>,
    on_authorize: OnceLock<Arc<dyn Authorizer>>,
}

impl ObserverHooks {
    /// Install the claim-mapper observer.
    ///
    /// # Errors
    ///
    /// `Error::Config` if one is already installed.
    pub fn set_on_get_claims(&self, hook: Arc<dyn ClaimMapper>) -> Result<()> {
        self.on_get_claims
            .set(hook)
            .map_err(|_| Error::Config("on_get_claims hook is already installed".to_string()))
    }

    /// Install the authorizer observer.
    ///
    /// # Errors
    ///
    /// `Error::Config` if one is already installed.
    pub fn set_on_authorize(&self, hook: Arc<dyn Authorizer>) -> Result<()> {
        self.on_authorize
            .set(hook)
            .map_err(|_| Error::Config("on_authorize hook is already installed".to_string()))
    }

    /// Installed claim-mapper observer.
    pub fn on_get_claims(&self) -> Option<&Arc<dyn ClaimMapper>> {
        self.on_get_claims.get()
    }

    /// Installed authorizer observer.
    pub fn on_authorize(&self) -> Option<&Arc<dyn Authorizer>> {
        self.on_authorize.get()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call recorder
// ─────────────────────────────────────────────────────────────────────────────

/// Records the `AuthInfo` seen by the authorizer for each API name.
///
/// Its claim mapper grants system admin and carries the inbound `AuthInfo`
/// in the extensions; its authorizer stores that `AuthInfo` under the
/// call's API name and allows the call unless the API name was listed in
/// [`CallRecorder::deny`].
#[derive(Default)]
pub struct CallRecorder {
    auth_infos: DashMap<String, Arc<AuthInfo>>,
    decisions: DashMap<String, Vec<Decision>>,
    denied: HashSet<String>,
}

impl CallRecorder {
    /// Recorder that allows everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny calls to `api_name` (they are still recorded).
    #[must_use]
    pub fn deny(mut self, api_name: impl Into<String>) -> Self {
        self.denied.insert(api_name.into());
        self
    }

    /// Install as both observers on `hooks`.
    ///
    /// # Errors
    ///
    /// `Error::Config` if either observer slot is already taken.
    pub fn install(self: &Arc<Self>, hooks: &ObserverHooks) -> Result<()> {
        hooks.set_on_get_claims(Arc::clone(self) as Arc<dyn ClaimMapper>)?;
        hooks.set_on_authorize(Arc::clone(self) as Arc<dyn Authorizer>)
    }

    /// Last `AuthInfo` the authorizer saw for `api_name`.
    #[must_use]
    pub fn auth_info(&self, api_name: &str) -> Option<Arc<AuthInfo>> {
        self.auth_infos.get(api_name).map(|entry| Arc::clone(entry.value()))
    }

    /// Every decision taken for `api_name`, in order.
    #[must_use]
    pub fn decisions(&self, api_name: &str) -> Vec<Decision> {
        self.decisions
            .get(api_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Number of API names the authorizer was consulted for.
    #[must_use]
    pub fn api_count(&self) -> usize {
        self.decisions.len()
    }
}

#[async_trait]
impl ClaimMapper for CallRecorder {
    async fn get_claims(&self, auth_info: &Arc<AuthInfo>) -> std::result::Result<Claims, AuthError> {
        Ok(Claims {
            subject: auth_info.subject_label().to_owned(),
            system: Role::Admin,
            extensions: Some(Arc::clone(auth_info) as _),
            ..Claims::default()
        })
    }

    fn auth_info_required(&self) -> bool {
        true
    }
}

#[async_trait]
impl Authorizer for CallRecorder {
    async fn authorize(
        &self,
        _ctx: &CallContext,
        claims: &Claims,
        target: &CallTarget,
    ) -> std::result::Result<AuthzResult, AuthError> {
        if let Some(info) = claims.extension_arc::<AuthInfo>() {
            self.auth_infos.insert(target.api_name.clone(), info);
        }
        let result = if self.denied.contains(&target.api_name) {
            AuthzResult::deny(format!("{} is denied by the recorder", target.api_name))
        } else {
            AuthzResult::allow("recorded")
        };
        self.decisions
            .entry(target.api_name.clone())
            .or_default()
            .push(result.decision);
        Ok(result)
    }
}
