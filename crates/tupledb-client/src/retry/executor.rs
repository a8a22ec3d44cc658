//! Retrying operation driver.
//!
//! [`execute`] repeatedly invokes an operation factory, racing every attempt
//! against the policy's request timeout. When the policy carries an
//! operation timeout, the whole sequence is raced against it as well.
//!
//! The result is the single output of one future, so it is produced exactly
//! once whichever path gets there first (attempt success, policy refusal,
//! operation deadline). Losing branches are dropped, which cancels their
//! timers and abandons the in-flight attempt.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};
use tupledb_common::protocol::error::{ClientError, Result};

use super::policy::RetryPolicy;

/// State threaded through one retrying call.
#[derive(Default)]
pub struct PendingOperation {
    attempts: AtomicUsize,
    last_error: Mutex<Option<ClientError>>,
}

impl PendingOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the operation factory has been invoked.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, error: ClientError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    /// Runs attempts until success or until the policy refuses a retry.
    pub async fn drive<T, F, Fut>(&self, policy: &mut dyn RetryPolicy, operation: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let request_timeout = policy.request_timeout();

            let error = match tokio::time::timeout(request_timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => ClientError::Timeout(request_timeout.as_millis() as u64),
            };

            self.record(error.clone());

            if !policy.can_retry(error.root_cause()) {
                debug!(attempt, error = %error, "Giving up on operation");
                return Err(policy.on_exhausted(error));
            }

            let delay = policy.delay();
            warn!(
                "Attempt {} failed: {}, retrying in {}ms",
                attempt,
                error,
                delay.as_millis()
            );

            if delay.is_zero() {
                // Keep the sequence cancellable even when attempts fail
                // without ever suspending.
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Executes `operation` under `policy`.
///
/// `operation` must build a new attempt on every call.
///
/// # Example
///
/// ```no_run
/// # use tupledb_client::retry::{execute, AttemptsBoundRetryPolicyFactory, RetryPolicyFactory};
/// # use tupledb_common::protocol::error::Result;
/// # async fn fetch() -> Result<u32> { Ok(1) }
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let factory = AttemptsBoundRetryPolicyFactory::new(3);
/// let value = execute(factory.create(), || fetch()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn execute<T, F, Fut>(policy: Box<dyn RetryPolicy>, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_tracked(policy, operation, &PendingOperation::new()).await
}

/// Like [`execute`], but exposes the operation state to the caller.
pub async fn execute_tracked<T, F, Fut>(
    mut policy: Box<dyn RetryPolicy>,
    mut operation: F,
    pending: &PendingOperation,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match policy.operation_timeout() {
        None => pending.drive(policy.as_mut(), &mut operation).await,
        Some(limit) => {
            let sequence = pending.drive(policy.as_mut(), &mut operation);
            match tokio::time::timeout(limit, sequence).await {
                Ok(result) => result,
                Err(_) => {
                    let last = pending.last_error();
                    warn!(
                        "Operation timed out after {}ms and {} attempts",
                        limit.as_millis(),
                        pending.attempts()
                    );
                    Err(ClientError::OperationTimeout {
                        timeout_ms: limit.as_millis() as u64,
                        last: last.map(Box::new),
                    })
                }
            }
        }
    }
}
