use std::time::Duration;

use tupledb_common::protocol::error::ClientError;

use super::classifier::ErrorClassifier;

/// Default budget for a single attempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Wait schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * multiplier^n`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(retry.min(i32::MAX as u32) as i32);
                let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::ZERO)
    }
}

/// Retry decision object backing one logical operation.
///
/// Implementations may be stateful (an attempts counter, a backoff step), so
/// an instance must never be shared between operations; obtain a fresh one
/// from a [`RetryPolicyFactory`] per call.
pub trait RetryPolicy: Send {
    /// Consulted once after every failed attempt. May mutate internal state,
    /// so it must not be called twice for the same failure.
    fn can_retry(&mut self, error: &ClientError) -> bool;

    /// Budget for a single attempt.
    fn request_timeout(&self) -> Duration;

    /// Wait before the next attempt.
    fn delay(&mut self) -> Duration;

    /// Ceiling on the whole retrying sequence, if any.
    fn operation_timeout(&self) -> Option<Duration> {
        None
    }

    /// Terminal error once `can_retry` said no.
    fn on_exhausted(&self, last: ClientError) -> ClientError;
}

/// Produces a fresh [`RetryPolicy`] per operation.
pub trait RetryPolicyFactory: Send + Sync {
    fn create(&self) -> Box<dyn RetryPolicy>;
}

impl<F> RetryPolicyFactory for F
where
    F: Fn() -> Box<dyn RetryPolicy> + Send + Sync,
{
    fn create(&self) -> Box<dyn RetryPolicy> {
        self()
    }
}

/// Retries at most `attempts` times after the initial call.
#[derive(Debug)]
pub struct AttemptsBoundRetryPolicy {
    attempts: usize,
    remaining: usize,
    retries: u32,
    exhausted: bool,
    request_timeout: Duration,
    backoff: Backoff,
    classifier: ErrorClassifier,
}

impl AttemptsBoundRetryPolicy {
    pub fn new(
        attempts: usize,
        request_timeout: Duration,
        backoff: Backoff,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            attempts,
            remaining: attempts,
            retries: 0,
            exhausted: false,
            request_timeout,
            backoff,
            classifier,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl RetryPolicy for AttemptsBoundRetryPolicy {
    fn can_retry(&mut self, error: &ClientError) -> bool {
        if !self.classifier.test(error) {
            self.exhausted = false;
            return false;
        }
        if self.remaining == 0 {
            self.exhausted = true;
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn delay(&mut self) -> Duration {
        let delay = self.backoff.delay_for(self.retries);
        self.retries = self.retries.saturating_add(1);
        delay
    }

    fn on_exhausted(&self, last: ClientError) -> ClientError {
        if self.exhausted {
            ClientError::AttemptsExhausted {
                attempts: self.attempts + 1,
                source: Box::new(last),
            }
        } else {
            last
        }
    }
}

/// Retries for as long as the classifier accepts the failure, bounded only
/// by `operation_timeout`.
#[derive(Debug)]
pub struct InfiniteRetryPolicy {
    retries: u32,
    request_timeout: Duration,
    operation_timeout: Duration,
    backoff: Backoff,
    classifier: ErrorClassifier,
}

impl InfiniteRetryPolicy {
    pub fn new(
        request_timeout: Duration,
        operation_timeout: Duration,
        backoff: Backoff,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            retries: 0,
            request_timeout,
            operation_timeout,
            backoff,
            classifier,
        }
    }
}

impl RetryPolicy for InfiniteRetryPolicy {
    fn can_retry(&mut self, error: &ClientError) -> bool {
        self.classifier.test(error)
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn delay(&mut self) -> Duration {
        let delay = self.backoff.delay_for(self.retries);
        self.retries = self.retries.saturating_add(1);
        delay
    }

    fn operation_timeout(&self) -> Option<Duration> {
        Some(self.operation_timeout)
    }

    fn on_exhausted(&self, last: ClientError) -> ClientError {
        last
    }
}

/// Factory for [`AttemptsBoundRetryPolicy`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tupledb_client::retry::{AttemptsBoundRetryPolicyFactory, Backoff, ErrorClassifier, RetryPolicyFactory};
///
/// let factory = AttemptsBoundRetryPolicyFactory::new(3)
///     .with_request_timeout(Duration::from_millis(500))
///     .with_backoff(Backoff::Fixed(Duration::from_millis(10)))
///     .with_classifier(ErrorClassifier::retry_network_errors());
///
/// let policy = factory.create();
/// assert_eq!(policy.request_timeout(), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct AttemptsBoundRetryPolicyFactory {
    pub attempts: usize,
    pub request_timeout: Duration,
    pub backoff: Backoff,
    pub classifier: ErrorClassifier,
}

impl AttemptsBoundRetryPolicyFactory {
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: Backoff::default(),
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

impl RetryPolicyFactory for AttemptsBoundRetryPolicyFactory {
    fn create(&self) -> Box<dyn RetryPolicy> {
        Box::new(AttemptsBoundRetryPolicy::new(
            self.attempts,
            self.request_timeout,
            self.backoff.clone(),
            self.classifier.clone(),
        ))
    }
}

/// Factory for [`InfiniteRetryPolicy`].
#[derive(Debug, Clone)]
pub struct InfiniteRetryPolicyFactory {
    pub request_timeout: Duration,
    pub operation_timeout: Duration,
    pub backoff: Backoff,
    pub classifier: ErrorClassifier,
}

impl InfiniteRetryPolicyFactory {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            operation_timeout,
            backoff: Backoff::default(),
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

impl RetryPolicyFactory for InfiniteRetryPolicyFactory {
    fn create(&self) -> Box<dyn RetryPolicy> {
        Box::new(InfiniteRetryPolicy::new(
            self.request_timeout,
            self.operation_timeout,
            self.backoff.clone(),
            self.classifier.clone(),
        ))
    }
}
