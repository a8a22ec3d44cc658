//! Response types.
//!
//! The server answers every request with a [`Response`] carrying the same
//! correlation id. Two error conventions exist:
//!
//! - a non-zero `code`: the request failed and `body.error` holds the message
//! - `code == 0` but `body.data` is a two-element array `[nil, err]`: the
//!   called function reported an application error
//!
//! [`Response::into_result`] folds both into [`ClientError::Server`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{ClientError, Result};
use super::RequestId;

/// Code used for application errors that carry no code of their own.
pub const ER_PROC_LUA: u32 = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Correlation id copied from the request
    pub sync: RequestId,
    /// 0 on success, the server error code otherwise
    pub code: u32,
    pub body: Value,
}

impl Response {
    pub fn success(sync: RequestId, data: Value) -> Self {
        Response {
            sync,
            code: 0,
            body: json!({ "data": data }),
        }
    }

    pub fn error(sync: RequestId, code: u32, message: impl Into<String>) -> Self {
        Response {
            sync,
            code,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    /// Decodes the payload, applying both error conventions.
    pub fn into_result(self) -> Result<Value> {
        if self.code != 0 {
            let message = self
                .body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            return Err(ClientError::Server {
                code: self.code,
                message,
            });
        }

        let data = match self.body {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
            Value::Null => Value::Null,
            other => {
                return Err(ClientError::Protocol(format!(
                    "Unexpected response body shape: {}",
                    other
                )))
            }
        };

        if let Some(err) = nil_error(&data) {
            return Err(err);
        }
        Ok(data)
    }
}

/// Recognizes the `[nil, err]` convention.
fn nil_error(data: &Value) -> Option<ClientError> {
    let items = data.as_array()?;
    if items.len() != 2 || !items[0].is_null() || items[1].is_null() {
        return None;
    }

    let err = &items[1];
    let (code, message) = match err {
        Value::String(message) => (ER_PROC_LUA, message.clone()),
        Value::Object(map) => {
            let code = map
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(ER_PROC_LUA);
            let message = map
                .get("message")
                .or_else(|| map.get("err"))
                .or_else(|| map.get("str"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            (code, message)
        }
        other => (ER_PROC_LUA, other.to_string()),
    };
    Some(ClientError::Server { code, message })
}
