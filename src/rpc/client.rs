//! Client for the binary RPC frontend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mtls::RPC_ALPN;
use crate::rpc::codec::{CallFrame, ClientCodec, ClientFrame, ServerFrame};
use crate::rpc::status::Status;
use crate::{Error, Result};

/// Grace added to a call's timeout before the client gives up locally.
const LOCAL_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline relative to send time.
    pub timeout: Option<Duration>,
    /// Bearer credential sent alongside the certificate.
    pub auth_token: Option<String>,
}

impl CallOptions {
    /// Options with a timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Add a bearer token.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Multiplexing client over one TLS connection.
///
/// Calls are independent: each gets its own id and its own response
/// channel. Dropping the client closes the connection.
pub struct RpcClient {
    outbound: mpsc::Sender<ClientFrame>,
    pending: Arc<DashMap<u64, mpsc::UnboundedSender<ServerFrame>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl RpcClient {
    /// Connect and complete the TLS handshake.
    ///
    /// # Errors
    ///
    /// `Error::Transport` when the TCP connect or the handshake fails,
    /// `Error::Tls` for an invalid server name.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<Self> {
        let mut config = (*config).clone();
        config.alpn_protocols = vec![RPC_ALPN.to_vec()];
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| Error::Tls(format!("Invalid server name '{server_name}': {e}")))?;

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to {addr}: {e}")))?;
        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Transport(format!("TLS handshake with {addr} failed: {e}")))?;

        let (mut sink, mut frames) = Framed::new(tls, ClientCodec::new()).split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientFrame>(64);
        let pending: Arc<DashMap<u64, mpsc::UnboundedSender<ServerFrame>>> =
            Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        // Writer
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_closed.cancelled() => break,
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                debug!(error = %e, "RPC client write failed");
                                writer_closed.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        // Reader
        let reader_pending = Arc::clone(&pending);
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = reader_closed.cancelled() => break,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(frame)) => {
                        let call_id = frame.call_id();
                        let is_end = matches!(frame, ServerFrame::End { .. });
                        if let Some(sender) = reader_pending.get(&call_id) {
                            let _ = sender.send(frame);
                        }
                        if is_end {
                            reader_pending.remove(&call_id);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "RPC client connection failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_closed.cancel();
            reader_pending.clear();
        });

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        })
    }

    /// `true` once the connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Unary call.
    ///
    /// # Errors
    ///
    /// `Error::Status` when the server ends the call with a non-OK status,
    /// `Error::Transport` when the connection fails first.
    pub async fn call(
        &self,
        method: &str,
        namespace: &str,
        request: &Value,
        options: CallOptions,
    ) -> Result<Value> {
        let timeout = options.timeout;
        let (call_id, mut responses) = self.start(method, namespace, request, options).await?;

        let receive = async {
            let mut message = None;
            loop {
                match responses.recv().await {
                    Some(ServerFrame::Message { body, .. }) => message = Some(body),
                    Some(ServerFrame::End { status, .. }) if status.is_ok() => {
                        return decode_body(message.as_ref());
                    }
                    Some(ServerFrame::End { status, .. }) => return Err(Error::Status(status)),
                    None => return Err(connection_lost()),
                }
            }
        };

        match timeout {
            Some(timeout) => {
                if let Ok(result) = tokio::time::timeout(timeout + LOCAL_TIMEOUT_GRACE, receive).await
                {
                    result
                } else {
                    self.cancel(call_id).await;
                    Err(Error::Status(Status::deadline_exceeded()))
                }
            }
            None => receive.await,
        }
    }

    /// Server-streaming call. The stream ends after the last message; a
    /// non-OK end status is yielded as the final `Err` item.
    ///
    /// # Errors
    ///
    /// `Error::Transport` when the call could not be sent.
    pub async fn call_streaming(
        &self,
        method: &str,
        namespace: &str,
        request: &Value,
        options: CallOptions,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let (_, responses) = self.start(method, namespace, request, options).await?;
        Ok(futures::stream::unfold(Some(responses), |state| async move {
            let mut responses = state?;
            match responses.recv().await {
                Some(ServerFrame::Message { body, .. }) => {
                    Some((decode_body(Some(&body)), Some(responses)))
                }
                Some(ServerFrame::End { status, .. }) if status.is_ok() => None,
                Some(ServerFrame::End { status, .. }) => Some((Err(Error::Status(status)), None)),
                None => Some((Err(connection_lost()), None)),
            }
        })
        .boxed())
    }

    /// Ask the server to abandon a call.
    pub async fn cancel(&self, call_id: u64) {
        self.pending.remove(&call_id);
        let _ = self.outbound.send(ClientFrame::Cancel { call_id }).await;
    }

    async fn start(
        &self,
        method: &str,
        namespace: &str,
        request: &Value,
        options: CallOptions,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ServerFrame>)> {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = Bytes::from(serde_json::to_vec(request)?);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(call_id, tx);

        if self.closed.is_cancelled() {
            self.pending.remove(&call_id);
            return Err(connection_lost());
        }

        let frame = ClientFrame::Call(CallFrame {
            call_id,
            timeout: options.timeout,
            method: method.to_owned(),
            namespace: namespace.to_owned(),
            auth_token: options.auth_token,
            body,
        });
        if self.outbound.send(frame).await.is_err() {
            self.pending.remove(&call_id);
            return Err(connection_lost());
        }
        Ok((call_id, rx))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn decode_body(body: Option<&Bytes>) -> Result<Value> {
    match body {
        Some(body) if !body.is_empty() => Ok(serde_json::from_slice(body)?),
        _ => Ok(Value::Null),
    }
}

fn connection_lost() -> Error {
    Error::Transport("connection closed before the call completed".to_string())
}
