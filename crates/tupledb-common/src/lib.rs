//! tupledb common types and transport
//!
//! Shared building blocks of the tupledb client:
//!
//! - [`address`] - `ServerAddress` parsing (`host:port`, `[ipv6]:port`, `user:pass@host:port`)
//! - [`protocol`] - requests, responses and the `ClientError` taxonomy
//! - [`transport`] - frame codecs and async TCP framing
//!
//! # Example
//!
//! ```
//! use tupledb_common::{Request, Response, ServerAddress};
//! use serde_json::json;
//!
//! let address: ServerAddress = "user:pass@[::1]:3301".parse().unwrap();
//! assert_eq!(address.host(), "::1");
//!
//! let request = Request::call("box.info", json!([]));
//! let response = Response::success(1, json!({"status": "running"}));
//! assert!(response.into_result().is_ok());
//! ```

pub mod address;
pub mod protocol;
pub mod transport;

pub use address::{ServerAddress, DEFAULT_PORT};
pub use protocol::*;
