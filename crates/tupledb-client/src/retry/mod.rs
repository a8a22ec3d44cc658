//! Retry and timeout policies.
//!
//! A [`RetryPolicyFactory`] produces a fresh [`RetryPolicy`] for every logical
//! operation; [`execute`] drives the operation under that policy.

pub mod classifier;
pub mod executor;
pub mod policy;

pub use classifier::ErrorClassifier;
pub use executor::{execute, execute_tracked, PendingOperation};
pub use policy::{
    AttemptsBoundRetryPolicy, AttemptsBoundRetryPolicyFactory, Backoff, InfiniteRetryPolicy,
    InfiniteRetryPolicyFactory, RetryPolicy, RetryPolicyFactory, DEFAULT_REQUEST_TIMEOUT,
};
