use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::error::{ClientError, Result};
use crate::protocol::Response;
use crate::transport::codec::{Codec, RequestFrame};
use crate::transport::tcp::TcpTransport;

/// Async frame server.
///
/// Speaks the client's framing and hands every decoded request to a handler.
/// Each request is handled on its own task, so responses leave in completion
/// order rather than request order. Used as an in-process peer for tests and
/// demos.
pub struct FrameServer {
    listener: TcpListener,
    codec: Codec,
}

/// Handle to a server spawned with [`FrameServer::spawn_with_handler`].
pub struct ServerHandle {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stops accepting and drops every open connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FrameServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "127.0.0.1:0")
    pub async fn bind(bind_addr: &str, codec: Codec) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ClientError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener, codec })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ClientError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the accept loop on a background task.
    pub fn spawn_with_handler<F, Fut>(self, handler: F) -> Result<ServerHandle>
    where
        F: Fn(RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        let addr = self.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run_with_handler(handler, counter, shutdown_rx).await {
                debug!("Frame server stopped: {}", e);
            }
        });

        Ok(ServerHandle {
            addr,
            accepted,
            shutdown,
            task,
        })
    }

    async fn run_with_handler<F, Fut>(
        self,
        handler: F,
        accepted: Arc<AtomicUsize>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        F: Fn(RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| ClientError::Connection(format!("Failed to accept connection: {}", e)))?;

            accepted.fetch_add(1, Ordering::SeqCst);
            debug!("Connection established from {}", peer_addr);

            let handler = handler.clone();
            let codec = self.codec;
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = serve_stream(stream, codec, handler) => {
                        if let Err(e) = result {
                            debug!("Connection error: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            });
        }
    }
}

/// Serves one stream until the peer disconnects.
///
/// A handler returning `None` leaves the request unanswered, which lets tests
/// model lost responses.
pub async fn serve_stream<S, F, Fut>(stream: S, codec: Codec, handler: Arc<F>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Fn(RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if TcpTransport::write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let data = match TcpTransport::read_frame(&mut reader).await {
            Ok(Some(data)) => data,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        let request = match codec.decode_request(&data) {
            Ok(request) => request,
            Err(e) => break Err(e),
        };

        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handler(request).await {
                if let Ok(encoded) = codec.encode_response(&response) {
                    let _ = tx.send(encoded);
                }
            }
        });
    };

    drop(tx);
    writer_task.abort();
    result
}
