use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::protocol::Request;

use crate::pool::ConnectionPool;
use crate::retry::{self, RetryPolicyFactory};

/// Anything that can carry a request to a server and return its payload.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Value>;
}

#[async_trait]
impl RequestExecutor for ConnectionPool {
    async fn execute(&self, request: Request) -> Result<Value> {
        self.send(request).await
    }
}

#[async_trait]
impl<E: RequestExecutor + ?Sized> RequestExecutor for Arc<E> {
    async fn execute(&self, request: Request) -> Result<Value> {
        (**self).execute(request).await
    }
}

/// Selection, correlation and optional retries for one request.
///
/// Without a retry policy every request gets a single attempt bounded by
/// `request_timeout`. With one, the policy owns the attempt budget and the
/// request is rebuilt for every attempt, so a retry may land on another
/// connection.
#[derive(Clone)]
pub struct RequestPipeline {
    executor: Arc<dyn RequestExecutor>,
    retry: Option<Arc<dyn RetryPolicyFactory>>,
    request_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        retry: Option<Arc<dyn RetryPolicyFactory>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            retry,
            request_timeout,
        }
    }

    /// Same executor and timeout, different retry policy.
    pub fn with_retry(&self, retry: Option<Arc<dyn RetryPolicyFactory>>) -> Self {
        Self {
            executor: self.executor.clone(),
            retry,
            request_timeout: self.request_timeout,
        }
    }

    pub fn executor(&self) -> &Arc<dyn RequestExecutor> {
        &self.executor
    }

    /// Sends the request built by `request_factory` and decodes the payload.
    ///
    /// `request_factory` is called once per attempt.
    pub async fn submit<T, F, D>(&self, request_factory: F, decoder: D) -> Result<T>
    where
        F: Fn() -> Result<Request> + Send + Sync,
        D: Fn(Value) -> Result<T> + Send + Sync,
    {
        let (request_factory, decoder, executor) = (&request_factory, &decoder, &self.executor);
        let attempt = move || async move {
            let request = request_factory()?;
            let payload = executor.execute(request).await?;
            decoder(payload)
        };

        match &self.retry {
            Some(factory) => retry::execute(factory.create(), attempt).await,
            None => match tokio::time::timeout(self.request_timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(self.request_timeout.as_millis() as u64)),
            },
        }
    }

    /// [`submit`](Self::submit) for a ready request with the raw payload.
    pub async fn send(&self, request: Request) -> Result<Value> {
        self.submit(|| Ok(request.clone()), Ok).await
    }
}

#[async_trait]
impl RequestExecutor for RequestPipeline {
    async fn execute(&self, request: Request) -> Result<Value> {
        self.send(request).await
    }
}
