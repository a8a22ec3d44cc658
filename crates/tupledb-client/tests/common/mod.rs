//! In-process tuple-store peer for integration tests.
//!
//! Serves one `users` space (id 512, primary index on field 0, `by_name`
//! index on field 1) and a handful of stored functions:
//!
//! - `whoami` returns the server's name
//! - `echo` returns its arguments
//! - `fail_once` fails with a server error on every other call
//! - `sleep` sleeps for `args[0]` milliseconds
//!
//! Authentication accepts `admin` / `secret`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tupledb_common::protocol::responses::ER_PROC_LUA;
use tupledb_common::protocol::{RequestCode, Response};
use tupledb_common::transport::{Codec, FrameServer, RequestFrame, ServerHandle};
use tupledb_common::ServerAddress;

pub const USERS_SPACE_ID: u64 = 512;

struct State {
    name: String,
    requests: AtomicUsize,
    flips: AtomicUsize,
    tuples: Mutex<BTreeMap<u64, Value>>,
}

pub struct FakeServer {
    state: Arc<State>,
    handle: ServerHandle,
}

impl FakeServer {
    pub async fn start(name: &str) -> Self {
        let state = Arc::new(State {
            name: name.to_string(),
            requests: AtomicUsize::new(0),
            flips: AtomicUsize::new(0),
            tuples: Mutex::new(BTreeMap::new()),
        });

        let server = FrameServer::bind("127.0.0.1:0", Codec::MessagePack)
            .await
            .unwrap();
        let handler_state = state.clone();
        let handle = server
            .spawn_with_handler(move |frame: RequestFrame| {
                let state = handler_state.clone();
                async move { respond(&state, frame).await }
            })
            .unwrap();

        Self { state, handle }
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::from(self.handle.local_addr())
    }

    pub fn address_string(&self) -> String {
        self.handle.local_addr().to_string()
    }

    /// Requests served so far, handshakes included.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.handle.accepted()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

fn users_schema() -> (Vec<Value>, Vec<Value>) {
    let spaces = vec![json!([
        USERS_SPACE_ID,
        1,
        "users",
        "memtx",
        2,
        {},
        [{"name": "id", "type": "unsigned"}, {"name": "name", "type": "string"}]
    ])];
    let indexes = vec![
        json!([USERS_SPACE_ID, 0, "primary", "TREE", {"unique": true}, [{"field": 0, "type": "unsigned"}]]),
        json!([USERS_SPACE_ID, 1, "by_name", "TREE", {"unique": false}, [[1, "string"]]]),
    ];
    (spaces, indexes)
}

async fn respond(state: &State, frame: RequestFrame) -> Option<Response> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let sync = frame.sync;
    let body = &frame.body;

    let response = match frame.code {
        RequestCode::Ping => Response::success(sync, Value::Null),
        RequestCode::Auth => {
            if body["user"] == "admin" && body["password"] == "secret" {
                Response::success(sync, Value::Null)
            } else {
                Response::error(sync, 47, "Incorrect password supplied for user")
            }
        }
        RequestCode::Call => call(state, sync, body).await,
        RequestCode::Eval => Response::success(sync, body["args"].clone()),
        RequestCode::Select => select(state, sync, body),
        RequestCode::Insert | RequestCode::Replace => {
            let tuple = body["tuple"].clone();
            let key = tuple[0].as_u64().unwrap_or(0);
            let mut tuples = state.tuples.lock().unwrap();
            if frame.code == RequestCode::Insert && tuples.contains_key(&key) {
                Response::error(sync, 3, "Duplicate key exists in unique index 'primary' in space 'users'")
            } else {
                tuples.insert(key, tuple.clone());
                Response::success(sync, json!([tuple]))
            }
        }
        RequestCode::Delete => {
            let key = body["key"][0].as_u64().unwrap_or(0);
            let removed = state.tuples.lock().unwrap().remove(&key);
            Response::success(sync, json!(removed.into_iter().collect::<Vec<_>>()))
        }
        RequestCode::Update => {
            let key = body["key"][0].as_u64().unwrap_or(0);
            let mut tuples = state.tuples.lock().unwrap();
            match tuples.get_mut(&key) {
                Some(tuple) => {
                    apply_assignments(tuple, &body["ops"]);
                    Response::success(sync, json!([tuple.clone()]))
                }
                None => Response::success(sync, json!([])),
            }
        }
        RequestCode::Upsert => {
            let tuple = body["tuple"].clone();
            let key = tuple[0].as_u64().unwrap_or(0);
            let mut tuples = state.tuples.lock().unwrap();
            match tuples.get_mut(&key) {
                Some(existing) => apply_assignments(existing, &body["ops"]),
                None => {
                    tuples.insert(key, tuple);
                }
            }
            Response::success(sync, json!([]))
        }
    };
    Some(response)
}

async fn call(state: &State, sync: u64, body: &Value) -> Response {
    let function = body["function"].as_str().unwrap_or_default();
    match function {
        "whoami" => Response::success(sync, json!([state.name])),
        "echo" => Response::success(sync, body["args"].clone()),
        "fail_once" => {
            if state.flips.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Response::error(sync, ER_PROC_LUA, "transient failure")
            } else {
                Response::success(sync, json!(["recovered"]))
            }
        }
        "sleep" => {
            let millis = body["args"][0].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Response::success(sync, json!([millis]))
        }
        other => Response::error(sync, 33, format!("Procedure '{}' is not defined", other)),
    }
}

fn select(state: &State, sync: u64, body: &Value) -> Response {
    let (spaces, indexes) = users_schema();
    let data = match body["space_id"].as_u64() {
        Some(281) => spaces,
        Some(289) => indexes,
        Some(USERS_SPACE_ID) => {
            let tuples = state.tuples.lock().unwrap();
            let key = &body["key"];
            match body["index_id"].as_u64() {
                Some(0) => match key[0].as_u64() {
                    Some(id) => tuples.get(&id).cloned().into_iter().collect(),
                    None => tuples.values().cloned().collect(),
                },
                _ => tuples
                    .values()
                    .filter(|t| key.get(0).map_or(true, |name| &t[1] == name))
                    .cloned()
                    .collect(),
            }
        }
        Some(other) => {
            return Response::error(sync, 36, format!("Space '{}' does not exist", other));
        }
        None => return Response::error(sync, 1, "Illegal parameters"),
    };
    Response::success(sync, Value::Array(data))
}

/// Applies `["=", field, value]` operations; other operators are ignored.
fn apply_assignments(tuple: &mut Value, operations: &Value) {
    let Some(operations) = operations.as_array() else {
        return;
    };
    for operation in operations {
        if operation[0] != "=" {
            continue;
        }
        if let (Some(field), Some(fields)) = (operation[1].as_u64(), tuple.as_array_mut()) {
            if let Some(slot) = fields.get_mut(field as usize) {
                *slot = operation[2].clone();
            }
        }
    }
}
