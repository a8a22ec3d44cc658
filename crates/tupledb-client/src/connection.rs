//! One ordered, authenticated channel to a single server.
//!
//! A connection splits its stream into a writer task, fed by an ordered queue
//! of encoded frames, and a reader task that decodes responses and fulfils
//! the matching correlation slot. Responses may arrive in any order.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::protocol::{Request, Response};
use tupledb_common::transport::{Codec, RequestFrame, TcpTransport};
use tupledb_common::ServerAddress;

use crate::config::Credentials;
use crate::correlation::{CorrelationTable, SlotGuard};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticated,
            _ => ConnectionState::Closed,
        }
    }
}

/// State shared between the connection handle and its I/O tasks.
struct Shared {
    address: ServerAddress,
    state: AtomicU8,
    table: CorrelationTable,
    closed: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `Closed` and fails every pending request. Idempotent.
    fn shut_down(&self, reason: ClientError) -> usize {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        let failed = self.table.fail_all(reason);
        self.closed.notify_waiters();
        if failed > 0 {
            debug!("Failed {} pending requests on {}", failed, self.address);
        }
        failed
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    codec: Codec,
    read_timeout: Duration,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Starts the I/O tasks over `stream` and authenticates when
    /// `credentials` are given.
    ///
    /// # Arguments
    /// * `address` - The server this stream is connected to
    /// * `stream` - Any bidirectional byte stream
    /// * `codec` - Frame encoding
    /// * `credentials` - User and password, or `None` to stay a guest
    /// * `read_timeout` - Budget for a single response
    pub async fn handshake<S>(
        address: ServerAddress,
        stream: S,
        codec: Codec,
        credentials: Option<&Credentials>,
        read_timeout: Duration,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let shared = Arc::new(Shared {
            address,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            table: CorrelationTable::new(),
            closed: Notify::new(),
        });

        let writer_shared = shared.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = TcpTransport::write_frame(&mut writer, &frame).await {
                    info!("Write to {} failed: {}", writer_shared.address, e);
                    writer_shared.shut_down(ClientError::ConnectionClosed(e.to_string()));
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                let data = match TcpTransport::read_frame(&mut reader).await {
                    Ok(Some(data)) => data,
                    Ok(None) => break "connection closed by peer".to_string(),
                    Err(e) => break e.to_string(),
                };

                let response = match codec.decode_response(&data) {
                    Ok(response) => response,
                    Err(e) => break format!("undecodable response: {}", e),
                };

                let sync = response.sync;
                if !reader_shared.table.complete(sync, Ok(response)) {
                    debug!(sync, "Discarding response with no waiting request");
                }
            };

            info!("Connection to {} lost: {}", reader_shared.address, reason);
            reader_shared.shut_down(ClientError::ConnectionClosed(reason));
        });

        let connection = Self {
            shared,
            codec,
            read_timeout,
            outbound,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        };

        if let Some(credentials) = credentials {
            let auth = Request::auth(&credentials.user, &credentials.password);
            if let Err(e) = connection.send(auth).await {
                connection.close();
                return Err(match e {
                    ClientError::Server { message, .. } => ClientError::Auth(message),
                    other => other,
                });
            }
        }

        connection
            .shared
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Authenticated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| {
                ClientError::ConnectionClosed(format!(
                    "connection to {} closed during handshake",
                    connection.address()
                ))
            })?;

        debug!("Connection to {} established", connection.address());
        Ok(connection)
    }

    pub fn address(&self) -> &ServerAddress {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves once the connection has closed, for whatever reason.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Number of requests waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.table.len()
    }

    /// Sends `request` and decodes the response payload.
    pub async fn send(&self, request: Request) -> Result<Value> {
        self.send_raw(request).await?.into_result()
    }

    /// Sends `request` and waits for the matching response frame.
    ///
    /// Abandoning the returned future (or hitting the read timeout) removes
    /// the correlation slot, so a response arriving later is discarded.
    pub async fn send_raw(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let (sync, slot) = self.shared.table.register()?;
        let _guard = SlotGuard::new(&self.shared.table, sync);

        let encoded = self.codec.encode_request(&RequestFrame::new(sync, request))?;
        self.outbound.send(encoded).map_err(|_| self.closed_error())?;
        debug!(sync, address = %self.address(), "Request queued");

        match tokio::time::timeout(self.read_timeout, slot).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                debug!(sync, "No response within {}ms", self.read_timeout.as_millis());
                Err(ClientError::Timeout(self.read_timeout.as_millis() as u64))
            }
        }
    }

    /// Closes the connection and fails every pending request.
    pub fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if tasks.is_empty() {
            return;
        }
        self.shared
            .shut_down(ClientError::ConnectionClosed("closed by client".to_string()));
        for task in tasks {
            task.abort();
        }
        debug!("Connection to {} closed", self.address());
    }

    fn closed_error(&self) -> ClientError {
        ClientError::ConnectionClosed(format!("connection to {} is closed", self.address()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", self.address())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Connection to an in-memory peer that answers every request with its body.
#[cfg(test)]
pub(crate) async fn echo_connection(address: ServerAddress) -> Connection {
    delayed_echo_connection(address, Duration::ZERO).await
}

/// Like [`echo_connection`], but every answer is held back for `delay`.
#[cfg(test)]
pub(crate) async fn delayed_echo_connection(address: ServerAddress, delay: Duration) -> Connection {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(tupledb_common::transport::serve_stream(
        server,
        Codec::default(),
        Arc::new(move |frame: RequestFrame| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some(Response::success(frame.sync, frame.body))
        }),
    ));
    Connection::handshake(address, client, Codec::default(), None, Duration::from_secs(5))
        .await
        .expect("in-memory handshake")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tupledb_common::protocol::RequestCode;
    use tupledb_common::transport::serve_stream;

    fn address() -> ServerAddress {
        ServerAddress::new("test", 3301).unwrap()
    }

    /// Wires a connection to an in-memory peer driven by `handler`.
    async fn connect_to<F, Fut>(handler: F, read_timeout: Duration) -> Result<Connection>
    where
        F: Fn(RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Response>> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_stream(server, Codec::default(), Arc::new(handler)));
        Connection::handshake(address(), client, Codec::default(), None, read_timeout).await
    }

    async fn echo(frame: RequestFrame) -> Option<Response> {
        Some(Response::success(frame.sync, frame.body))
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let conn = connect_to(echo, Duration::from_secs(5)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        let result = conn.send(Request::call("echo", json!([1, 2]))).await.unwrap();
        assert_eq!(result["function"], "echo");
        assert_eq!(result["args"], json!([1, 2]));
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let conn = connect_to(
            |frame: RequestFrame| async move {
                let delay = frame.body["args"][0].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Some(Response::success(frame.sync, json!(delay)))
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (slow, fast) = tokio::join!(
            conn.send(Request::call("sleep", json!([80]))),
            conn.send(Request::call("sleep", json!([5]))),
        );
        assert_eq!(slow.unwrap(), json!(80));
        assert_eq!(fast.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_server_error_is_decoded() {
        let conn = connect_to(
            |frame: RequestFrame| async move {
                Some(Response::error(frame.sync, 33, "Procedure 'nope' is not defined"))
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = conn.send(Request::call("nope", json!([]))).await.unwrap_err();
        assert!(err.is_no_such_procedure());
    }

    #[tokio::test]
    async fn test_read_timeout_removes_slot() {
        let conn = connect_to(|_frame: RequestFrame| async { None }, Duration::from_millis(50))
            .await
            .unwrap();

        let err = conn.send(Request::ping()).await.unwrap_err();
        assert_eq!(err, ClientError::Timeout(50));
        assert_eq!(conn.in_flight(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_all_pending() {
        let conn = Arc::new(
            connect_to(|_frame: RequestFrame| async { None }, Duration::from_secs(30))
                .await
                .unwrap(),
        );

        let pending = 7;
        let mut waiters = Vec::new();
        for _ in 0..pending {
            let conn = conn.clone();
            waiters.push(tokio::spawn(async move { conn.send(Request::ping()).await }));
        }
        while conn.in_flight() < pending {
            tokio::task::yield_now().await;
        }

        conn.close();

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(ClientError::ConnectionClosed(_))));
        }
        assert_eq!(conn.in_flight(), 0);
        assert!(matches!(
            conn.send(Request::ping()).await,
            Err(ClientError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_pending() {
        let (client, server) = tokio::io::duplex(1024);
        let conn = Arc::new(
            Connection::handshake(address(), client, Codec::default(), None, Duration::from_secs(30))
                .await
                .unwrap(),
        );

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(Request::ping()).await })
        };
        while conn.in_flight() < 1 {
            tokio::task::yield_now().await;
        }

        drop(server);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed(_))));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let conn = Arc::new(echo_connection(address()).await);
        let watcher = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(!watcher.is_finished());

        conn.close();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        // Already closed: returns immediately.
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_authentication() {
        let auth_requests = Arc::new(AtomicUsize::new(0));
        let counter = auth_requests.clone();
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(serve_stream(
            server,
            Codec::default(),
            Arc::new(move |frame: RequestFrame| {
                let counter = counter.clone();
                async move {
                    if frame.code == RequestCode::Auth {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if frame.body["password"] != "secret" {
                            return Some(Response::error(frame.sync, 47, "Incorrect password"));
                        }
                    }
                    Some(Response::success(frame.sync, Value::Null))
                }
            }),
        ));

        let credentials = Credentials::new("admin", "secret");
        let conn = Connection::handshake(
            address(),
            client,
            Codec::default(),
            Some(&credentials),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(auth_requests.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(serve_stream(
            server,
            Codec::default(),
            Arc::new(|frame: RequestFrame| async move {
                Some(Response::error(frame.sync, 47, "Incorrect password"))
            }),
        ));

        let credentials = Credentials::new("admin", "wrong");
        let err = Connection::handshake(
            address(),
            client,
            Codec::default(),
            Some(&credentials),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert_eq!(err, ClientError::Auth("Incorrect password".into()));
    }
}
