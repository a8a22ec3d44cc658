//! Resilient client for tupledb servers.
//!
//! The request path runs top-down: the [`Client`] facade resolves names
//! through the [`MetadataCache`], the [`RequestPipeline`] applies the retry
//! policy, the [`ConnectionPool`] picks a connection with its
//! [`SelectionStrategy`], and the [`Connection`] correlates the response
//! with its request.

pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod discovery;
pub mod factory;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod retry;
pub mod strategy;

pub use client::{Client, RetryingClient, Space};
pub use config::{ClientConfig, Credentials, RetryConfig};
pub use connection::{Connection, ConnectionState};
pub use correlation::CorrelationTable;
pub use discovery::{AddressProvider, DynamicAddressProvider, StaticAddressProvider};
pub use factory::{ConnectionFactory, TcpConnectionFactory};
pub use metadata::{
    DdlMetadataProvider, IndexMetadata, MetadataCache, MetadataProvider, MetadataSnapshot,
    SpaceMetadata, SystemSpacesMetadataProvider,
};
pub use pipeline::{RequestExecutor, RequestPipeline};
pub use pool::{ConnectionPool, ReconcileReport};
pub use retry::{
    AttemptsBoundRetryPolicyFactory, Backoff, ErrorClassifier, InfiniteRetryPolicyFactory,
    RetryPolicy, RetryPolicyFactory,
};
pub use strategy::{ParallelRoundRobin, RoundRobin, SelectionStrategy, StrategyKind};
pub use tupledb_common::{ClientError, Result, ServerAddress};
