//! Transport layer.
//!
//! - **[`Codec`]**: encodes request frames and responses (MessagePack or JSON)
//! - **[`TcpTransport`]**: connect + length-prefixed framing over any async stream
//! - **[`FrameServer`]**: in-process server speaking the same framing
//!
//! # Wire Format
//!
//! `[4-byte length prefix as u32 big-endian] + [encoded frame]`, frames are
//! capped at 16 MB.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::{Codec, JsonCodec, MessagePackCodec, RequestFrame};
pub use tcp::{TcpTransport, MAX_FRAME_SIZE};
pub use tcp_server::{serve_stream, FrameServer, ServerHandle};
