//! Binary framing for the RPC frontend.
//!
//! Every frame is length-delimited (4-byte big-endian length prefix, at most
//! [`MAX_FRAME_LENGTH`] bytes) and starts with a one-byte kind and the
//! 64-bit call id that multiplexes calls over one connection.
//!
//! ```text
//! client → server
//!   call:    0x01 | call_id u64 | timeout_ms u32 | method str16 | namespace str16 | token str16 | json body
//!   cancel:  0x02 | call_id u64
//! server → client
//!   message: 0x01 | call_id u64 | json body
//!   end:     0x02 | call_id u64 | code u8 | utf-8 message
//! ```
//!
//! `str16` is a u16 length followed by UTF-8 bytes. `timeout_ms == 0` means
//! the caller sent no deadline; an empty token means no bearer credential.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::rpc::status::{Code, Status};
use crate::{Error, Result};

/// Upper bound on a single frame, header included.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

const KIND_CALL: u8 = 0x01;
const KIND_CANCEL: u8 = 0x02;
const KIND_MESSAGE: u8 = 0x01;
const KIND_END: u8 = 0x02;

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

/// Opening frame of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Connection-unique call id chosen by the client.
    pub call_id: u64,
    /// Caller deadline relative to receipt.
    pub timeout: Option<Duration>,
    /// Fully-qualified method name, `/<service>/<method>`.
    pub method: String,
    /// Addressed namespace, empty when the call is not namespaced.
    pub namespace: String,
    /// Bearer credential sent alongside the certificate.
    pub auth_token: Option<String>,
    /// JSON-encoded request payload.
    pub body: Bytes,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Start a call.
    Call(CallFrame),
    /// Abandon an in-flight call.
    Cancel {
        /// Call to cancel.
        call_id: u64,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// A response message; unary calls send exactly one before `End`.
    Message {
        /// Call the message belongs to.
        call_id: u64,
        /// JSON-encoded response payload.
        body: Bytes,
    },
    /// Terminal status of a call.
    End {
        /// Call being terminated.
        call_id: u64,
        /// Final status.
        status: Status,
    },
}

impl ServerFrame {
    /// Call id of the frame.
    #[must_use]
    pub fn call_id(&self) -> u64 {
        match self {
            Self::Message { call_id, .. } | Self::End { call_id, .. } => *call_id,
        }
    }
}

/// A frame that knows its own byte layout.
pub trait WireFrame: Sized {
    /// Append the frame payload (without the length prefix) to `dst`.
    fn write_to(&self, dst: &mut BytesMut) -> Result<()>;
    /// Parse one frame payload.
    fn read_from(src: Bytes) -> Result<Self>;
}

impl WireFrame for ClientFrame {
    fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Call(call) => {
                dst.put_u8(KIND_CALL);
                dst.put_u64(call.call_id);
                let timeout_ms = call
                    .timeout
                    .map_or(0, |t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX).max(1));
                dst.put_u32(timeout_ms);
                put_str16(dst, &call.method)?;
                put_str16(dst, &call.namespace)?;
                put_str16(dst, call.auth_token.as_deref().unwrap_or(""))?;
                dst.put_slice(&call.body);
            }
            Self::Cancel { call_id } => {
                dst.put_u8(KIND_CANCEL);
                dst.put_u64(*call_id);
            }
        }
        Ok(())
    }

    fn read_from(mut src: Bytes) -> Result<Self> {
        let kind = get_u8(&mut src)?;
        let call_id = get_u64(&mut src)?;
        match kind {
            KIND_CALL => {
                let timeout_ms = get_u32(&mut src)?;
                let method = get_str16(&mut src)?;
                let namespace = get_str16(&mut src)?;
                let token = get_str16(&mut src)?;
                Ok(Self::Call(CallFrame {
                    call_id,
                    timeout: (timeout_ms > 0).then(|| Duration::from_millis(u64::from(timeout_ms))),
                    method,
                    namespace,
                    auth_token: (!token.is_empty()).then_some(token),
                    body: src,
                }))
            }
            KIND_CANCEL => Ok(Self::Cancel { call_id }),
            other => Err(Error::Protocol(format!("unknown client frame kind {other:#04x}"))),
        }
    }
}

impl WireFrame for ServerFrame {
    fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Message { call_id, body } => {
                dst.put_u8(KIND_MESSAGE);
                dst.put_u64(*call_id);
                dst.put_slice(body);
            }
            Self::End { call_id, status } => {
                dst.put_u8(KIND_END);
                dst.put_u64(*call_id);
                dst.put_u8(status.code as u8);
                dst.put_slice(status.message.as_bytes());
            }
        }
        Ok(())
    }

    fn read_from(mut src: Bytes) -> Result<Self> {
        let kind = get_u8(&mut src)?;
        let call_id = get_u64(&mut src)?;
        match kind {
            KIND_MESSAGE => Ok(Self::Message { call_id, body: src }),
            KIND_END => {
                let code = Code::from_u8(get_u8(&mut src)?);
                let message = String::from_utf8(src.to_vec())
                    .map_err(|_| Error::Protocol("status message is not UTF-8".to_string()))?;
                Ok(Self::End {
                    call_id,
                    status: Status { code, message },
                })
            }
            other => Err(Error::Protocol(format!("unknown server frame kind {other:#04x}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Length-delimited codec decoding `In` frames and encoding `Out` frames.
#[derive(Debug)]
pub struct FrameCodec<In, Out> {
    inner: LengthDelimitedCodec,
    _frames: PhantomData<fn() -> (In, Out)>,
}

/// Codec used by the server side of a connection.
pub type ServerCodec = FrameCodec<ClientFrame, ServerFrame>;

/// Codec used by [`crate::rpc::RpcClient`].
pub type ClientCodec = FrameCodec<ServerFrame, ClientFrame>;

impl<In, Out> FrameCodec<In, Out> {
    /// Create a codec with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _frames: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: WireFrame, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>> {
        match self.inner.decode(src)? {
            Some(frame) => In::read_from(frame.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl<In, Out: WireFrame> Encoder<Out> for FrameCodec<In, Out> {
    type Error = Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        item.write_to(&mut payload)?;
        self.inner.encode(payload.freeze(), dst)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field helpers
// ─────────────────────────────────────────────────────────────────────────────

fn put_str16(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Protocol(format!("field longer than {} bytes", u16::MAX)))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn ensure(src: &Bytes, needed: usize) -> Result<()> {
    if src.remaining() < needed {
        return Err(Error::Protocol("truncated frame".to_string()));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn get_u32(src: &mut Bytes) -> Result<u32> {
    ensure(src, 4)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> Result<u64> {
    ensure(src, 8)?;
    Ok(src.get_u64())
}

fn get_str16(src: &mut Bytes) -> Result<String> {
    ensure(src, 2)?;
    let len = usize::from(src.get_u16());
    ensure(src, len)?;
    String::from_utf8(src.split_to(len).to_vec())
        .map_err(|_| Error::Protocol("string field is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(token: Option<&str>, timeout: Option<Duration>) -> ClientFrame {
        ClientFrame::Call(CallFrame {
            call_id: 7,
            timeout,
            method: "/temporal.api.workflowservice.v1.WorkflowService/ListNamespaces".to_string(),
            namespace: String::new(),
            auth_token: token.map(str::to_owned),
            body: Bytes::from_static(b"{}"),
        })
    }

    #[test]
    fn call_frame_survives_the_codec() {
        // GIVEN: a call frame with a deadline and a token
        let frame = call(Some("secret"), Some(Duration::from_millis(250)));
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        // WHEN: encoded by the client and decoded by the server
        client.encode(frame.clone(), &mut buf).unwrap();
        let decoded = server.decode(&mut buf).unwrap().unwrap();
        // THEN: identical, nothing left over
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_timeout_and_empty_token_decode_as_absent() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        client.encode(call(None, None), &mut buf).unwrap();
        let ClientFrame::Call(decoded) = server.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected a call frame");
        };
        assert!(decoded.timeout.is_none());
        assert!(decoded.auth_token.is_none());
    }

    #[test]
    fn sub_millisecond_timeout_is_not_lost() {
        // GIVEN: a deadline shorter than the wire resolution
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        client
            .encode(call(None, Some(Duration::from_micros(10))), &mut buf)
            .unwrap();
        let ClientFrame::Call(decoded) = server.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected a call frame");
        };
        // THEN: it still arrives as a (1ms) deadline rather than "no deadline"
        assert_eq!(decoded.timeout, Some(Duration::from_millis(1)));
    }

    #[test]
    fn end_frame_carries_status() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        let frame = ServerFrame::End {
            call_id: 3,
            status: Status::permission_denied("denied by policy"),
        };
        server.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(client.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut full = BytesMut::new();
        client.encode(call(None, None), &mut full).unwrap();
        let mut partial = full.split_to(full.len() - 1);
        assert!(server.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_a_protocol_error() {
        let result = ClientFrame::read_from(Bytes::from_static(&[KIND_CALL, 0, 0]));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u8(0x7f);
        raw.put_u64(1);
        let result = ServerFrame::read_from(raw.freeze());
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
