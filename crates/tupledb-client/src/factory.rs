use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tupledb_common::protocol::error::Result;
use tupledb_common::transport::{Codec, TcpTransport};
use tupledb_common::ServerAddress;

use crate::config::{ClientConfig, Credentials};
use crate::connection::Connection;

/// Opens ready-to-use connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> Result<Arc<Connection>>;
}

/// Plain TCP connections, authenticated when credentials are configured.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
    read_timeout: Duration,
    codec: Codec,
    credentials: Option<Credentials>,
}

impl TcpConnectionFactory {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            codec: config.codec,
            credentials: config.credentials.clone(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, address: &ServerAddress) -> Result<Arc<Connection>> {
        debug!("Connecting to {}", address);
        let stream = TcpTransport::connect(address, self.connect_timeout).await?;
        let connection = Connection::handshake(
            address.clone(),
            stream,
            self.codec,
            self.credentials.as_ref(),
            self.read_timeout,
        )
        .await?;
        Ok(Arc::new(connection))
    }
}
