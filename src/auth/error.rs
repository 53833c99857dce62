//! Errors returned by claim mappers and authorizers.

use thiserror::Error;

/// Failure reported by a pluggable hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable identity; surfaces as `Unauthenticated`.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Unexpected hook failure. The text is logged, never sent to callers.
    #[error("hook failure: {0}")]
    Internal(String),
}
