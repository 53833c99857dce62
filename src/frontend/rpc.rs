//! Binary RPC frontend.
//!
//! One task per connection reads frames; every call runs in its own task
//! and writes its responses through a shared writer task, so a slow call
//! never blocks others on the same connection. Closing the connection
//! cancels every call still in flight on it.
//!
//! A call id stays reserved from the moment its `Call` frame is read until
//! its `End` frame is queued, cancelled or not. A second `Call` with a
//! reserved id ends at once with `InvalidArgument`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use telemetry_metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::extract_auth_info;
use crate::mtls::Edge;
use crate::pipeline::{AuthPipeline, CallContext, ConnectionContext, Dispatch};
use crate::rpc::{CallFrame, ClientFrame, ServerCodec, ServerFrame, Status};

/// Frames buffered between call tasks and the connection writer.
const WRITE_QUEUE: usize = 64;

pub(crate) struct RpcServer {
    pub(crate) acceptor: TlsAcceptor,
    pub(crate) pipeline: Arc<AuthPipeline>,
    pub(crate) handshake_timeout: Duration,
}

impl RpcServer {
    /// Accept connections until `shutdown` fires.
    pub(crate) async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        let server = Arc::new(self);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        let conn_shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer, conn_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "RPC accept failed"),
                },
            }
        }
        info!("RPC frontend stopped accepting");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) {
        let tls = match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                counter!("flowgate_handshake_failures_total", "edge" => "rpc").increment(1);
                debug!(peer = %peer, error = %e, "RPC TLS handshake failed");
                return;
            }
            Err(_) => {
                counter!("flowgate_handshake_failures_total", "edge" => "rpc").increment(1);
                debug!(peer = %peer, "RPC TLS handshake timed out");
                return;
            }
        };

        let auth_info = match extract_auth_info(tls.get_ref().1, Edge::Rpc, peer) {
            Ok(info) => info,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejecting connection with unreadable certificate");
                return;
            }
        };
        debug!(peer = %peer, subject = %auth_info.subject_label(), "RPC connection accepted");
        let conn = ConnectionContext::new(Edge::Rpc, peer, Some(auth_info), cancel);

        let (mut sink, mut frames) = Framed::new(tls, ServerCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<ServerFrame>(WRITE_QUEUE);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "RPC write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let calls: Arc<DashMap<u64, CancellationToken>> = Arc::new(DashMap::new());
        loop {
            let frame = tokio::select! {
                () = conn.cancellation().cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(ClientFrame::Call(mut call))) => {
                    let call_id = call.call_id;
                    let deadline = self.pipeline.deadline_for(call.timeout);
                    let ctx =
                        CallContext::new(Arc::clone(&conn), Some(deadline), call.auth_token.take());
                    let admitted = match calls.entry(call_id) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(slot) => {
                            slot.insert(ctx.cancellation().clone());
                            true
                        }
                    };
                    if admitted {
                        let pipeline = Arc::clone(&self.pipeline);
                        let tx = tx.clone();
                        let calls = Arc::clone(&calls);
                        tokio::spawn(run_call(pipeline, ctx, call, tx, calls));
                    } else {
                        debug!(peer = %peer, call_id, "Rejecting call id already in flight");
                        let status = Status::invalid_argument(format!(
                            "call id {call_id} is already in flight"
                        ));
                        let _ = tx.send(ServerFrame::End { call_id, status }).await;
                    }
                }
                Some(Ok(ClientFrame::Cancel { call_id })) => {
                    if let Some(token) = calls.get(&call_id) {
                        token.cancel();
                    }
                }
                Some(Err(e)) => {
                    debug!(peer = %peer, error = %e, "RPC connection error");
                    break;
                }
                None => break,
            }
        }

        conn.cancel();
        debug!(peer = %peer, "RPC connection closed");
    }
}

async fn run_call(
    pipeline: Arc<AuthPipeline>,
    ctx: CallContext,
    call: CallFrame,
    tx: mpsc::Sender<ServerFrame>,
    calls: Arc<DashMap<u64, CancellationToken>>,
) {
    let call_id = call.call_id;
    let status = match decode_request(&call.body) {
        Err(status) => status,
        Ok(request) => match pipeline
            .invoke(&ctx, &call.method, &call.namespace, request)
            .await
        {
            Ok(Dispatch::Unary(response)) => send_message(&tx, call_id, &response)
                .await
                .unwrap_or_else(|status| status),
            Ok(Dispatch::Stream(mut stream)) => loop {
                match stream.next().await {
                    Some(Ok(item)) => {
                        if let Err(status) = send_message(&tx, call_id, &item).await {
                            break status;
                        }
                    }
                    Some(Err(status)) => break status,
                    None => break Status::ok(),
                }
            },
            Err(status) => status,
        },
    };

    calls.remove(&call_id);
    let _ = tx.send(ServerFrame::End { call_id, status }).await;
}

/// Send one message. Returns `Ok` status on success so unary calls can use
/// the result as their end status directly.
async fn send_message(
    tx: &mpsc::Sender<ServerFrame>,
    call_id: u64,
    value: &Value,
) -> Result<Status, Status> {
    let body = serde_json::to_vec(value).map_err(|_| Status::internal())?;
    tx.send(ServerFrame::Message {
        call_id,
        body: Bytes::from(body),
    })
    .await
    .map_err(|_| Status::cancelled())?;
    Ok(Status::ok())
}

fn decode_request(body: &Bytes) -> Result<Value, Status> {
    if body.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(body)
        .map_err(|e| Status::invalid_argument(format!("request is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Code;

    #[test]
    fn empty_body_decodes_to_empty_object() {
        assert_eq!(decode_request(&Bytes::new()).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn malformed_body_is_invalid_argument() {
        let status = decode_request(&Bytes::from_static(b"{oops")).unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);
    }
}
