//! Connection- and call-scoped state.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{Access, AuthInfo, Claims};
use crate::mtls::Edge;
use crate::rpc::Status;

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by every call on one accepted connection.
pub struct ConnectionContext {
    edge: Edge,
    peer_addr: SocketAddr,
    auth_info: Option<Arc<AuthInfo>>,
    cancel: CancellationToken,
}

impl ConnectionContext {
    /// Bind a connection. `cancel` is usually a child of the server's
    /// shutdown token.
    #[must_use]
    pub fn new(
        edge: Edge,
        peer_addr: SocketAddr,
        auth_info: Option<AuthInfo>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            edge,
            peer_addr,
            auth_info: auth_info.map(Arc::new),
            cancel,
        })
    }

    /// Frontend that accepted the connection.
    #[must_use]
    pub fn edge(&self) -> Edge {
        self.edge
    }

    /// Remote socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Identity extracted at handshake completion.
    #[must_use]
    pub fn auth_info(&self) -> Option<&Arc<AuthInfo>> {
        self.auth_info.as_ref()
    }

    /// Cancel every call on this connection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Connection-wide cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("edge", &self.edge)
            .field("peer_addr", &self.peer_addr)
            .field(
                "subject",
                &self.auth_info.as_ref().map(|info| info.subject_label()),
            )
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call phase
// ─────────────────────────────────────────────────────────────────────────────

/// Where a call is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    /// Received, nothing checked yet.
    Accepted,
    /// Connection identity (plus any per-call token) bound to the call.
    AuthInfoBound,
    /// Claim mapper produced claims.
    ClaimsResolved,
    /// Authorizer allowed the call.
    Authorized,
    /// Handler running.
    Dispatched,
    /// Handler finished.
    Completed,
    /// Claim mapper rejected the caller.
    Unauthenticated,
    /// Authorizer denied the call.
    Denied,
    /// Deadline, cancellation or internal failure stopped the call.
    Aborted,
}

impl CallPhase {
    /// `true` once no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Unauthenticated | Self::Denied | Self::Aborted
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call
// ─────────────────────────────────────────────────────────────────────────────

/// State of one in-flight call. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<CallInner>,
}

struct CallInner {
    conn: Arc<ConnectionContext>,
    auth_info: Option<Arc<AuthInfo>>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    claims: OnceCell<Claims>,
    access: OnceLock<Access>,
    phase: Mutex<CallPhase>,
}

impl CallContext {
    /// Start a call on `conn`.
    ///
    /// A per-call `auth_token` is layered on a copy of the connection
    /// identity; without one the call shares the connection's `AuthInfo`.
    #[must_use]
    pub fn new(
        conn: Arc<ConnectionContext>,
        deadline: Option<Instant>,
        auth_token: Option<String>,
    ) -> Self {
        let auth_token = auth_token.filter(|t| !t.is_empty());
        let auth_info = match (conn.auth_info(), auth_token) {
            (Some(info), None) => Some(Arc::clone(info)),
            (Some(info), token @ Some(_)) => Some(Arc::new(info.with_auth_token(token))),
            (None, token @ Some(_)) => Some(Arc::new(AuthInfo::default().with_auth_token(token))),
            (None, None) => None,
        };
        let cancel = conn.cancellation().child_token();
        Self {
            inner: Arc::new(CallInner {
                conn,
                auth_info,
                deadline,
                cancel,
                claims: OnceCell::new(),
                access: OnceLock::new(),
                phase: Mutex::new(CallPhase::Accepted),
            }),
        }
    }

    /// Owning connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.inner.conn
    }

    /// Frontend the call arrived on.
    #[must_use]
    pub fn edge(&self) -> Edge {
        self.inner.conn.edge()
    }

    /// Identity bound to this call.
    #[must_use]
    pub fn auth_info(&self) -> Option<&Arc<AuthInfo>> {
        self.inner.auth_info.as_ref()
    }

    /// Effective deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Claims, once resolved.
    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.inner.claims.get()
    }

    pub(crate) fn claims_cell(&self) -> &OnceCell<Claims> {
        &self.inner.claims
    }

    /// Minimum access of the called method. Unknown methods are treated as
    /// admin-only.
    #[must_use]
    pub fn access(&self) -> Access {
        self.inner.access.get().copied().unwrap_or(Access::Admin)
    }

    pub(crate) fn set_access(&self, access: Access) {
        let _ = self.inner.access.set(access);
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        *self.inner.phase.lock()
    }

    /// Move to `next`. Terminal phases are sticky.
    pub(crate) fn advance(&self, next: CallPhase) {
        let mut phase = self.inner.phase.lock();
        if !phase.is_terminal() {
            *phase = next;
        }
    }

    /// Cancel this call only.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Call-scoped cancellation token (child of the connection's).
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// `true` once the call or its connection was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Status to abort with if the call can no longer proceed.
    #[must_use]
    pub fn check(&self) -> Option<Status> {
        if self.is_cancelled() {
            return Some(Status::cancelled());
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Status::deadline_exceeded()),
            _ => None,
        }
    }

    /// Run `fut` unless the call is cancelled or its deadline passes first.
    ///
    /// # Errors
    ///
    /// `Cancelled` or `DeadlineExceeded`; `fut` is dropped in that case.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Status> {
        if let Some(status) = self.check() {
            return Err(status);
        }
        let deadline = async {
            match self.inner.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(Status::cancelled()),
            () = deadline => Err(Status::deadline_exceeded()),
            output = fut => Ok(output),
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("edge", &self.edge())
            .field("phase", &self.phase())
            .field("deadline", &self.inner.deadline)
            .finish_non_exhaustive()
    }
}
