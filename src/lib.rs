//! flowgate
//!
//! Workflow-service frontend with mutual-TLS authentication and pluggable
//! authorization.
//!
//! # Features
//!
//! - **Two edges, one identity**: a binary RPC listener and an HTTP/JSON
//!   gateway share TLS material and the auth pipeline
//! - **Peer identity**: CN / O / OU of the verified client certificate, SNI
//!   and ALPN, exposed to hooks as [`auth::AuthInfo`]
//! - **Pluggable hooks**: claim mapper and authorizer selected by config or
//!   injected at startup, with set-once observer hooks for tests
//! - **Deadlines and cancellation** enforced at every pipeline step

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod frontend;
pub mod mtls;
pub mod pipeline;
pub mod rpc;
pub mod service;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
    }
}
