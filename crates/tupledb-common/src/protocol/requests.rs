//! Request types.
//!
//! A [`Request`] is the unit the client submits. It carries no correlation id;
//! the connection assigns one when the request is written (see
//! [`RequestFrame`](crate::transport::RequestFrame)).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Per-connection correlation id.
pub type RequestId = u64;

/// Tuple, key or argument list.
pub type Tuple = Value;

/// Operation requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCode {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Call,
    Eval,
    Upsert,
    Ping,
    Auth,
}

/// Index iterator for `select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IteratorType {
    #[default]
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub code: RequestCode,
    pub body: Value,
}

impl Request {
    pub fn new(code: RequestCode, body: Value) -> Self {
        Request { code, body }
    }

    pub fn ping() -> Self {
        Request::new(RequestCode::Ping, Value::Null)
    }

    pub fn auth(user: impl Into<String>, password: impl Into<String>) -> Self {
        Request::new(
            RequestCode::Auth,
            json!({ "user": user.into(), "password": password.into() }),
        )
    }

    pub fn call(function: impl Into<String>, args: Tuple) -> Self {
        Request::new(
            RequestCode::Call,
            json!({ "function": function.into(), "args": normalize_tuple(args) }),
        )
    }

    pub fn eval(expression: impl Into<String>, args: Tuple) -> Self {
        Request::new(
            RequestCode::Eval,
            json!({ "expression": expression.into(), "args": normalize_tuple(args) }),
        )
    }

    pub fn select(
        space_id: u32,
        index_id: u32,
        key: Tuple,
        iterator: IteratorType,
        limit: u32,
        offset: u32,
    ) -> Self {
        Request::new(
            RequestCode::Select,
            json!({
                "space_id": space_id,
                "index_id": index_id,
                "key": normalize_tuple(key),
                "iterator": iterator,
                "limit": limit,
                "offset": offset,
            }),
        )
    }

    pub fn insert(space_id: u32, tuple: Tuple) -> Self {
        Request::new(
            RequestCode::Insert,
            json!({ "space_id": space_id, "tuple": tuple }),
        )
    }

    pub fn replace(space_id: u32, tuple: Tuple) -> Self {
        Request::new(
            RequestCode::Replace,
            json!({ "space_id": space_id, "tuple": tuple }),
        )
    }

    pub fn delete(space_id: u32, index_id: u32, key: Tuple) -> Self {
        Request::new(
            RequestCode::Delete,
            json!({ "space_id": space_id, "index_id": index_id, "key": normalize_tuple(key) }),
        )
    }

    pub fn update(space_id: u32, index_id: u32, key: Tuple, operations: Value) -> Self {
        Request::new(
            RequestCode::Update,
            json!({
                "space_id": space_id,
                "index_id": index_id,
                "key": normalize_tuple(key),
                "ops": operations,
            }),
        )
    }

    pub fn upsert(space_id: u32, tuple: Tuple, operations: Value) -> Self {
        Request::new(
            RequestCode::Upsert,
            json!({ "space_id": space_id, "tuple": tuple, "ops": operations }),
        )
    }
}

/// Keys and argument lists travel as arrays; a scalar becomes a one-element
/// array and `null` an empty one.
fn normalize_tuple(value: Tuple) -> Tuple {
    match value {
        Value::Array(_) => value,
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other]),
    }
}
