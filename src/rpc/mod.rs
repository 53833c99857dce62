//! Binary RPC protocol: status codes, framing and the client.
//!
//! - [`status`] - call status codes shared by both frontends
//! - [`codec`] - length-delimited frames multiplexing calls on one connection
//! - [`client`] - [`RpcClient`]

pub mod client;
pub mod codec;
pub mod status;

pub use client::{CallOptions, RpcClient};
pub use codec::{CallFrame, ClientCodec, ClientFrame, ServerCodec, ServerFrame};
pub use status::{Code, Status};
