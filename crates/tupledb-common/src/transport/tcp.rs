use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::ServerAddress;
use crate::protocol::error::{ClientError, Result};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Async TCP transport.
///
/// # Wire Protocol
///
/// Frames are sent with a 4-byte length prefix (big-endian u32) followed by
/// the encoded frame:
///
/// ```text
/// [4-byte length] [encoded frame]
/// ```
///
/// The framing helpers are generic over the stream so connections can run on
/// anything that is `AsyncRead + AsyncWrite` (TCP, TLS wrappers, in-memory
/// pipes in tests).
pub struct TcpTransport;

impl TcpTransport {
    /// Connects to a server address.
    ///
    /// The address may resolve to multiple socket addresses; each is tried in
    /// turn until one succeeds. `connect_timeout` bounds the name lookup and
    /// every single attempt.
    pub async fn connect(address: &ServerAddress, connect_timeout: Duration) -> Result<TcpStream> {
        let socket_addrs = tokio::time::timeout(connect_timeout, address.resolve())
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "Failed to resolve {}: timed out after {}ms",
                    address,
                    connect_timeout.as_millis()
                ))
            })??;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| ClientError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    last_err = Some(format!("timed out after {}ms", connect_timeout.as_millis()));
                }
            }
        }

        Err(ClientError::Connection(format!(
            "Failed to connect to {}: {}",
            address,
            last_err.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    /// Writes one length-prefixed frame and flushes.
    pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ClientError::Protocol(format!(
                "Frame too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_FRAME_SIZE
            )));
        }
        let len = data.len() as u32;

        writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing frame"))?;
        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Reads one length-prefixed frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// frames.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Self::map_io_error(e, "reading length prefix")),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ClientError::Protocol(format!(
                "Frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading frame"))?;

        Ok(Some(buf))
    }

    /// Map IO errors to `ClientError` variants, keeping the context.
    fn map_io_error(err: std::io::Error, context: &str) -> ClientError {
        match ClientError::from(err) {
            ClientError::ConnectionClosed(msg) => {
                ClientError::ConnectionClosed(format!("{}: {}", context, msg))
            }
            ClientError::Connection(msg) => ClientError::Connection(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_is_bounded_including_lookup() {
        let address = ServerAddress::new("no-such-host.invalid", 3301).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            TcpTransport::connect(&address, Duration::from_millis(300)),
        )
        .await
        .expect("connect outlived its timeout");
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::from(listener.local_addr().unwrap());
        let stream = TcpTransport::connect(&address, Duration::from_secs(1)).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            TcpTransport::write_frame(&mut client, b"hello").await.unwrap();
            TcpTransport::write_frame(&mut client, b"").await.unwrap();
        });

        assert_eq!(
            TcpTransport::read_frame(&mut server).await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(TcpTransport::read_frame(&mut server).await.unwrap(), Some(Vec::new()));
        writer.await.unwrap();

        // Writer half dropped: clean EOF between frames.
        assert_eq!(TcpTransport::read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len).await.unwrap();

        let result = TcpTransport::read_frame(&mut server).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_connection_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &10u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc").await.unwrap();
        drop(client);

        let result = TcpTransport::read_frame(&mut server).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let address = ServerAddress::new("127.0.0.1", port).unwrap();
        let result = TcpTransport::connect(&address, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }
}
