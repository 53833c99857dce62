//! Frontends: the binary RPC listener and the HTTP/JSON gateway.
//!
//! Both share one [`TlsConfigProvider`] and one [`AuthPipeline`], so a
//! caller gets the same identity and the same decisions on either edge.

pub mod http;
mod rpc;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::serve::Listener as _;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use http::{HttpPeer, TlsListener};
pub use routes::{GatewayState, REQUEST_TIMEOUT_HEADER, create_router, status_response};

use crate::config::FrontendConfig;
use crate::mtls::{Edge, TlsConfigProvider};
use crate::pipeline::AuthPipeline;
use crate::{Error, Result};

/// Configured but not yet listening.
pub struct Frontend {
    config: FrontendConfig,
    tls: Arc<TlsConfigProvider>,
    pipeline: Arc<AuthPipeline>,
}

impl Frontend {
    /// Assemble both edges.
    #[must_use]
    pub fn new(
        config: FrontendConfig,
        tls: Arc<TlsConfigProvider>,
        pipeline: Arc<AuthPipeline>,
    ) -> Self {
        Self {
            config,
            tls,
            pipeline,
        }
    }

    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unparsable address, `Error::Io` when binding
    /// fails.
    pub async fn start(self) -> Result<RunningFrontend> {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let rpc_listener = TcpListener::bind(self.config.rpc_address()?).await?;
        let rpc_addr = rpc_listener.local_addr()?;
        let rpc = rpc::RpcServer {
            acceptor: TlsAcceptor::from(self.tls.server_config(Edge::Rpc)),
            pipeline: Arc::clone(&self.pipeline),
            handshake_timeout: self.config.handshake_timeout,
        };
        tasks.push(tokio::spawn(rpc.serve(rpc_listener, shutdown.child_token())));
        info!(address = %rpc_addr, "RPC frontend listening");

        let http_addr = if self.config.http.enabled {
            let listener = TcpListener::bind(self.config.http_address()?).await?;
            let listener = TlsListener::spawn(
                listener,
                TlsAcceptor::from(self.tls.server_config(Edge::Http)),
                self.config.handshake_timeout,
                shutdown.child_token(),
            )?;
            let addr = listener.local_addr()?.remote_addr;
            let app = create_router(GatewayState {
                pipeline: Arc::clone(&self.pipeline),
            });
            let stop = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let served = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<HttpPeer>(),
                )
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
                if let Err(e) = served {
                    warn!(error = %e, "HTTP gateway stopped with error");
                }
            }));
            info!(address = %addr, "HTTP gateway listening");
            Some(addr)
        } else {
            None
        };

        Ok(RunningFrontend {
            rpc_addr,
            http_addr,
            shutdown,
            tasks,
        })
    }
}

/// Handle to listening frontends.
pub struct RunningFrontend {
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningFrontend {
    /// Bound RPC address.
    #[must_use]
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound HTTP address, when the gateway is enabled.
    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Token that stops both edges and cancels every in-flight call.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting, cancel in-flight calls and wait up to `grace` for
    /// the listeners to wind down.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        self.shutdown.cancel();
        let joined = futures::future::join_all(self.tasks);
        match tokio::time::timeout(grace, joined).await {
            Ok(results) => {
                for result in results {
                    result.map_err(|e| Error::Internal(format!("frontend task failed: {e}")))?;
                }
                info!("Frontends stopped");
                Ok(())
            }
            Err(_) => {
                warn!(grace = ?grace, "Frontends did not stop within grace period");
                Ok(())
            }
        }
    }

    /// Wait until the frontends stop (after the shutdown token fires).
    pub async fn wait(self) -> Result<()> {
        for task in self.tasks {
            task.await
                .map_err(|e| Error::Internal(format!("frontend task failed: {e}")))?;
        }
        Ok(())
    }
}
