use thiserror::Error;

/// Server error code reported when a called function does not exist.
pub const ER_NO_SUCH_PROC: u32 = 33;

/// Every failure the client can surface.
///
/// The enum is `Clone` so a single failure can be delivered to many waiters
/// (all pending requests of a dropped connection, every task attached to a
/// coalesced metadata fetch). Foreign error types are converted into the
/// string-carrying variants at the boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("No available connection")]
    NoAvailableConnection,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("Space not found: {0}")]
    NoSuchSpace(String),

    #[error("Index not found: {0}")]
    NoSuchIndex(String),

    #[error("Attempts limit reached after {attempts} attempts: {source}")]
    AttemptsExhausted {
        attempts: usize,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Operation timeout after {timeout_ms}ms{}", .last.as_ref().map(|e| format!(", last error: {}", e)).unwrap_or_default())]
    OperationTimeout {
        timeout_ms: u64,
        last: Option<Box<ClientError>>,
    },
}

impl ClientError {
    /// Descends through retry wrappers to the failure that started it all.
    pub fn root_cause(&self) -> &ClientError {
        match self {
            ClientError::AttemptsExhausted { source, .. } => source.root_cause(),
            ClientError::OperationTimeout { last: Some(last), .. } => last.root_cause(),
            other => other,
        }
    }

    /// Transport-level failures: connect errors, timeouts, dropped connections.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_)
                | ClientError::ConnectionClosed(_)
                | ClientError::Timeout(_)
                | ClientError::NoAvailableConnection
        )
    }

    /// Server reported that the called function is not defined.
    pub fn is_no_such_procedure(&self) -> bool {
        match self {
            ClientError::Server { code, message } => {
                *code == ER_NO_SUCH_PROC
                    || (message.starts_with("Procedure '") && message.ends_with("' is not defined"))
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => ClientError::ConnectionClosed(err.to_string()),
            _ => ClientError::Connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ClientError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ClientError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_exhaustion() {
        let err = ClientError::AttemptsExhausted {
            attempts: 3,
            source: Box::new(ClientError::Timeout(50)),
        };
        assert_eq!(err.root_cause(), &ClientError::Timeout(50));
    }

    #[test]
    fn test_root_cause_unwraps_nested_wrappers() {
        let err = ClientError::OperationTimeout {
            timeout_ms: 200,
            last: Some(Box::new(ClientError::AttemptsExhausted {
                attempts: 1,
                source: Box::new(ClientError::NoAvailableConnection),
            })),
        };
        assert_eq!(err.root_cause(), &ClientError::NoAvailableConnection);
    }

    #[test]
    fn test_root_cause_of_bare_timeout_is_itself() {
        let err = ClientError::OperationTimeout {
            timeout_ms: 200,
            last: None,
        };
        assert_eq!(err.root_cause(), &err);
    }

    #[test]
    fn test_network_classification() {
        assert!(ClientError::Connection("refused".into()).is_network_error());
        assert!(ClientError::ConnectionClosed("eof".into()).is_network_error());
        assert!(ClientError::Timeout(10).is_network_error());
        assert!(ClientError::NoAvailableConnection.is_network_error());

        assert!(!ClientError::Protocol("bad frame".into()).is_network_error());
        assert!(!ClientError::Config("bad".into()).is_network_error());
        assert!(!ClientError::Server {
            code: 1,
            message: "boom".into()
        }
        .is_network_error());
    }

    #[test]
    fn test_no_such_procedure_by_code_and_message() {
        assert!(ClientError::Server {
            code: ER_NO_SUCH_PROC,
            message: "whatever".into()
        }
        .is_no_such_procedure());
        assert!(ClientError::Server {
            code: 0,
            message: "Procedure 'crud.select' is not defined".into()
        }
        .is_no_such_procedure());
        assert!(!ClientError::Server {
            code: 1,
            message: "Duplicate key".into()
        }
        .is_no_such_procedure());
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(ClientError::from(eof), ClientError::ConnectionClosed(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ClientError::from(refused), ClientError::Connection(_)));
    }

    #[test]
    fn test_operation_timeout_display_includes_last_error() {
        let err = ClientError::OperationTimeout {
            timeout_ms: 200,
            last: Some(Box::new(ClientError::Timeout(50))),
        };
        assert_eq!(
            err.to_string(),
            "Operation timeout after 200ms, last error: Request timeout after 50ms"
        );
    }
}
