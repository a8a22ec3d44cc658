use serde::{Deserialize, Serialize};

use crate::protocol::error::Result;
use crate::protocol::{Request, RequestCode, RequestId, Response};

/// A request as written on the wire: the request plus its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub sync: RequestId,
    pub code: RequestCode,
    pub body: serde_json::Value,
}

impl RequestFrame {
    pub fn new(sync: RequestId, request: Request) -> Self {
        RequestFrame {
            sync,
            code: request.code,
            body: request.body,
        }
    }
}

/// Codec for encoding/decoding frames.
///
/// MessagePack is the default; JSON is kept for debugging and for peers that
/// cannot speak MessagePack.
///
/// # Example
///
/// ```
/// use tupledb_common::transport::{Codec, RequestFrame};
/// use tupledb_common::protocol::Request;
/// use serde_json::json;
///
/// let codec = Codec::default();
/// let frame = RequestFrame::new(1, Request::call("echo", json!([42])));
///
/// let encoded = codec.encode_request(&frame).unwrap();
/// let decoded = codec.decode_request(&encoded).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    MessagePack,
    Json,
}

impl Codec {
    pub fn encode_request(&self, frame: &RequestFrame) -> Result<Vec<u8>> {
        match self {
            Codec::MessagePack => MessagePackCodec::encode(frame),
            Codec::Json => JsonCodec::encode(frame),
        }
    }

    pub fn decode_request(&self, data: &[u8]) -> Result<RequestFrame> {
        match self {
            Codec::MessagePack => MessagePackCodec::decode(data),
            Codec::Json => JsonCodec::decode(data),
        }
    }

    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        match self {
            Codec::MessagePack => MessagePackCodec::encode(response),
            Codec::Json => JsonCodec::encode(response),
        }
    }

    pub fn decode_response(&self, data: &[u8]) -> Result<Response> {
        match self {
            Codec::MessagePack => MessagePackCodec::decode(data),
            Codec::Json => JsonCodec::decode(data),
        }
    }
}

/// MessagePack codec. Structs are written as maps with named fields so the
/// frames stay self-describing.
pub struct MessagePackCodec;

impl MessagePackCodec {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// JSON codec.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}
