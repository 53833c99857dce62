//! HTTP/JSON gateway transport.
//!
//! TLS is terminated here rather than by axum: a background task accepts
//! TCP connections, rejects plaintext with a raw `400`, completes the
//! handshake, extracts the peer identity and hands the stream to axum
//! through [`TlsListener`]. The identity reaches handlers as
//! `ConnectInfo<HttpPeer>`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use telemetry_metrics::counter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::extract_auth_info;
use crate::mtls::Edge;
use crate::pipeline::ConnectionContext;

/// First byte of every TLS record carrying a handshake message.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Upper bound on the request head read from a plaintext client.
const PLAINTEXT_HEAD_LIMIT: usize = 8 * 1024;

/// Time allowed for a plaintext client to finish sending its request head.
const PLAINTEXT_READ_TIMEOUT: Duration = Duration::from_secs(2);

const PLAINTEXT_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Connection: close\r\n\
Content-Length: 48\r\n\
\r\n\
Client sent an HTTP request to an HTTPS server.\n";

/// Connection info handed to axum handlers.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// Connection state; `None` only for the listener's own address.
    pub connection: Option<Arc<ConnectionContext>>,
}

impl Connected<IncomingStream<'_, TlsListener>> for HttpPeer {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        stream.remote_addr().clone()
    }
}

/// Listener yielding connections whose TLS handshake already completed.
pub struct TlsListener {
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, HttpPeer)>,
    local_addr: SocketAddr,
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = HttpPeer;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // The accept task is gone; axum is about to be shut down.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(HttpPeer {
            remote_addr: self.local_addr,
            connection: None,
        })
    }
}

impl TlsListener {
    /// Start accepting on `listener`. The accept task stops when `shutdown`
    /// fires.
    pub(crate) fn spawn(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(64);
        tokio::spawn(accept_loop(listener, acceptor, tx, handshake_timeout, shutdown));
        Ok(Self {
            incoming,
            local_addr,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, HttpPeer)>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let tx = tx.clone();
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Some(conn) =
                            handshake(stream, peer, acceptor, handshake_timeout, cancel).await
                        {
                            let _ = tx.send(conn).await;
                        }
                    });
                }
                Err(e) => warn!(error = %e, "HTTP accept failed"),
            },
        }
    }
    info!("HTTP gateway stopped accepting");
}

async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) -> Option<(TlsStream<TcpStream>, HttpPeer)> {
    let mut first = [0u8; 1];
    match tokio::time::timeout(handshake_timeout, stream.peek(&mut first)).await {
        Ok(Ok(1)) => {}
        _ => return None,
    }
    if first[0] != TLS_HANDSHAKE_RECORD {
        counter!("flowgate_plaintext_rejected_total").increment(1);
        debug!(peer = %peer, "Rejecting plaintext HTTP on TLS port");
        reject_plaintext(stream).await;
        return None;
    }

    let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            counter!("flowgate_handshake_failures_total", "edge" => "http").increment(1);
            debug!(peer = %peer, error = %e, "HTTP TLS handshake failed");
            return None;
        }
        Err(_) => {
            counter!("flowgate_handshake_failures_total", "edge" => "http").increment(1);
            debug!(peer = %peer, "HTTP TLS handshake timed out");
            return None;
        }
    };

    let auth_info = match extract_auth_info(tls.get_ref().1, Edge::Http, peer) {
        Ok(info) => info,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting connection with unreadable certificate");
            return None;
        }
    };
    debug!(peer = %peer, subject = %auth_info.subject_label(), "HTTP connection accepted");
    let connection = ConnectionContext::new(Edge::Http, peer, Some(auth_info), cancel);
    Some((
        tls,
        HttpPeer {
            remote_addr: peer,
            connection: Some(connection),
        },
    ))
}

/// Drain the request head, answer `400` and close.
async fn reject_plaintext(mut stream: TcpStream) {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    let read_head = async {
        while head.len() < PLAINTEXT_HEAD_LIMIT {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
            }
        }
    };
    let _ = tokio::time::timeout(PLAINTEXT_READ_TIMEOUT, read_head).await;
    let _ = stream.write_all(PLAINTEXT_RESPONSE).await;
    let _ = stream.shutdown().await;
}
