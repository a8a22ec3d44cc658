use std::sync::Arc;
use std::time::Duration;

use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::transport::Codec;

use crate::retry::{
    AttemptsBoundRetryPolicyFactory, Backoff, ErrorClassifier, InfiniteRetryPolicyFactory,
    RetryPolicyFactory,
};
use crate::strategy::StrategyKind;

/// User name and password sent during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Which retry policy wraps requests issued through the client.
#[derive(Debug, Clone, Default)]
pub enum RetryConfig {
    /// Every request is attempted once.
    #[default]
    None,
    /// Up to `attempts` retries after the first failure.
    Attempts {
        attempts: usize,
        backoff: Backoff,
        classifier: ErrorClassifier,
    },
    /// Retry until `operation_timeout` elapses.
    Unbounded {
        operation_timeout: Duration,
        backoff: Backoff,
        classifier: ErrorClassifier,
    },
}

impl RetryConfig {
    /// Bounded retries of network failures with no delay.
    pub fn attempts(attempts: usize) -> Self {
        RetryConfig::Attempts {
            attempts,
            backoff: Backoff::default(),
            classifier: ErrorClassifier::default(),
        }
    }

    /// Unbounded retries of network failures with no delay.
    pub fn unbounded(operation_timeout: Duration) -> Self {
        RetryConfig::Unbounded {
            operation_timeout,
            backoff: Backoff::default(),
            classifier: ErrorClassifier::default(),
        }
    }

    /// Builds the policy factory, or `None` when retries are off.
    pub fn factory(&self, request_timeout: Duration) -> Option<Arc<dyn RetryPolicyFactory>> {
        match self {
            RetryConfig::None => None,
            RetryConfig::Attempts {
                attempts,
                backoff,
                classifier,
            } => Some(Arc::new(
                AttemptsBoundRetryPolicyFactory::new(*attempts)
                    .with_request_timeout(request_timeout)
                    .with_backoff(backoff.clone())
                    .with_classifier(classifier.clone()),
            )),
            RetryConfig::Unbounded {
                operation_timeout,
                backoff,
                classifier,
            } => Some(Arc::new(
                InfiniteRetryPolicyFactory::new(*operation_timeout)
                    .with_request_timeout(request_timeout)
                    .with_backoff(backoff.clone())
                    .with_classifier(classifier.clone()),
            )),
        }
    }
}

/// Client configuration.
///
/// # Default Configuration
///
/// - `connect_timeout`: 1000ms
/// - `read_timeout`: 1000ms
/// - `request_timeout`: 2000ms
/// - `connections`: 1 per address
/// - `strategy`: parallel round-robin
/// - `retry`: none
/// - `credentials`: none (guest)
/// - `codec`: MessagePack
/// - `drain_timeout`: same as `request_timeout`
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tupledb_client::{ClientConfig, RetryConfig, StrategyKind};
///
/// let config = ClientConfig::default()
///     .with_connections(4)
///     .with_strategy(StrategyKind::RoundRobin)
///     .with_retry(RetryConfig::attempts(3))
///     .with_request_timeout(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Budget for establishing one TCP connection
    pub connect_timeout: Duration,
    /// Budget for one response on a connection
    pub read_timeout: Duration,
    /// Budget for one attempt through the request pipeline
    pub request_timeout: Duration,
    /// Connections opened per server address
    pub connections: usize,
    pub strategy: StrategyKind,
    pub retry: RetryConfig,
    pub credentials: Option<Credentials>,
    pub codec: Codec,
    /// How long a removed connection may keep serving in-flight requests
    pub drain_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(2000),
            connections: 1,
            strategy: StrategyKind::default(),
            retry: RetryConfig::None,
            credentials: None,
            codec: Codec::default(),
            drain_timeout: Duration::from_millis(2000),
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the per-attempt budget. Also moves the drain timeout along with it.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.drain_timeout = timeout;
        self
    }

    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(user, password));
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Rejects values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("request_timeout", self.request_timeout),
            ("drain_timeout", self.drain_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ClientError::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.connections == 0 {
            return Err(ClientError::Config(
                "connections must be at least 1".to_string(),
            ));
        }

        if let RetryConfig::Unbounded {
            operation_timeout, ..
        } = &self.retry
        {
            if operation_timeout.is_zero() {
                return Err(ClientError::Config(
                    "operation_timeout must be greater than zero".to_string(),
                ));
            }
        }

        if let Some(credentials) = &self.credentials {
            if credentials.user.is_empty() {
                return Err(ClientError::Config("user must not be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Retry policy factory for this configuration.
    pub fn retry_factory(&self) -> Option<Arc<dyn RetryPolicyFactory>> {
        self.retry.factory(self.request_timeout)
    }
}
