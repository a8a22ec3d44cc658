use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::protocol::{IteratorType, Request, Tuple};

use crate::config::ClientConfig;
use crate::discovery::{AddressProvider, StaticAddressProvider};
use crate::factory::TcpConnectionFactory;
use crate::metadata::{MetadataCache, MetadataProvider, SystemSpacesMetadataProvider};
use crate::pipeline::{RequestExecutor, RequestPipeline};
use crate::pool::ConnectionPool;
use crate::retry::RetryPolicyFactory;

/// Client for a tuple-store cluster.
///
/// Cheap to clone; clones share the pool and the metadata cache.
///
/// # Example
///
/// ```rust,no_run
/// use serde_json::json;
/// use tupledb_client::{Client, ClientConfig, RetryConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::default()
///     .with_credentials("admin", "secret")
///     .with_retry(RetryConfig::attempts(3));
/// let client = Client::connect(config, &["10.0.0.1:3301", "10.0.0.2:3301"]).await?;
///
/// let result = client.call("box.info", json!([])).await?;
/// let users = client.space("users").select("primary", json!([42])).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    pool: Arc<ConnectionPool>,
    pipeline: RequestPipeline,
    metadata: Arc<MetadataCache>,
    config: ClientConfig,
}

impl Client {
    /// Connects to a fixed list of addresses.
    pub async fn connect<S: AsRef<str>>(config: ClientConfig, addresses: &[S]) -> Result<Self> {
        let provider = StaticAddressProvider::parse(addresses)?;
        Self::with_address_provider(config, Arc::new(provider)).await
    }

    /// Connects to whatever `provider` reports and follows its changes.
    pub async fn with_address_provider(
        config: ClientConfig,
        provider: Arc<dyn AddressProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let factory = Arc::new(TcpConnectionFactory::new(&config));
        let pool = ConnectionPool::connect(factory, provider, config.strategy.build(), &config).await?;
        info!("Client connected to {} addresses", pool.addresses().len());

        Ok(Self::from_parts(Arc::new(pool), None, config))
    }

    /// Assembles a client from an existing pool.
    ///
    /// Without a metadata cache, one backed by the system spaces is created.
    pub fn from_parts(
        pool: Arc<ConnectionPool>,
        metadata: Option<Arc<MetadataCache>>,
        config: ClientConfig,
    ) -> Self {
        let executor: Arc<dyn RequestExecutor> = pool.clone();
        let pipeline = RequestPipeline::new(executor, config.retry_factory(), config.request_timeout);

        let metadata = metadata.unwrap_or_else(|| {
            let provider = SystemSpacesMetadataProvider::new(Arc::new(pipeline.clone()));
            Arc::new(MetadataCache::new(Arc::new(provider)))
        });

        Self {
            pool,
            pipeline,
            metadata,
            config,
        }
    }

    /// Replaces the metadata source, e.g. with a [`DdlMetadataProvider`].
    ///
    /// [`DdlMetadataProvider`]: crate::metadata::DdlMetadataProvider
    pub fn with_metadata_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Arc::new(MetadataCache::new(provider));
        self
    }

    /// Executor that goes through this client's pipeline, for building
    /// metadata providers.
    pub fn executor(&self) -> Arc<dyn RequestExecutor> {
        Arc::new(self.pipeline.clone())
    }

    /// Sends the request built by `request_factory` and decodes the result
    /// with `decoder`, under the client's retry policy.
    pub async fn submit<T, F, D>(&self, request_factory: F, decoder: D) -> Result<T>
    where
        F: Fn() -> Result<Request> + Send + Sync,
        D: Fn(Value) -> Result<T> + Send + Sync,
    {
        self.pipeline.submit(request_factory, decoder).await
    }

    /// View of this client that retries under `factory` instead of the
    /// configured policy.
    pub fn with_retry(&self, factory: Arc<dyn RetryPolicyFactory>) -> RetryingClient {
        RetryingClient {
            pipeline: self.pipeline.with_retry(Some(factory)),
        }
    }

    /// Calls a stored function.
    pub async fn call(&self, function: &str, args: Tuple) -> Result<Value> {
        self.pipeline.send(Request::call(function, args)).await
    }

    /// Evaluates an expression on the server.
    pub async fn eval(&self, expression: &str, args: Tuple) -> Result<Value> {
        self.pipeline.send(Request::eval(expression, args)).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.pipeline.send(Request::ping()).await.map(|_| ())
    }

    /// Operations on the named space. Names are resolved on use.
    pub fn space(&self, name: impl Into<String>) -> Space {
        Space {
            client: self.clone(),
            name: name.into(),
        }
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Closes every connection. Requests in flight fail.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// A client view with its own retry policy.
#[derive(Clone)]
pub struct RetryingClient {
    pipeline: RequestPipeline,
}

impl RetryingClient {
    pub async fn submit<T, F, D>(&self, request_factory: F, decoder: D) -> Result<T>
    where
        F: Fn() -> Result<Request> + Send + Sync,
        D: Fn(Value) -> Result<T> + Send + Sync,
    {
        self.pipeline.submit(request_factory, decoder).await
    }

    pub async fn call(&self, function: &str, args: Tuple) -> Result<Value> {
        self.pipeline.send(Request::call(function, args)).await
    }

    pub async fn eval(&self, expression: &str, args: Tuple) -> Result<Value> {
        self.pipeline.send(Request::eval(expression, args)).await
    }
}

/// Operations on one space, addressed by name.
pub struct Space {
    client: Client,
    name: String,
}

impl Space {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn space_id(&self) -> Result<u32> {
        Ok(self.client.metadata.get_space_by_name(&self.name).await?.id)
    }

    async fn index_ids(&self, index_name: &str) -> Result<(u32, u32)> {
        let index = self
            .client
            .metadata
            .get_index_by_name(&self.name, index_name)
            .await?;
        Ok((index.space_id, index.id))
    }

    /// Tuples whose key equals `key` in the named index.
    pub async fn select(&self, index_name: &str, key: Tuple) -> Result<Vec<Tuple>> {
        self.select_with(index_name, key, IteratorType::Eq, u32::MAX, 0)
            .await
    }

    pub async fn select_with(
        &self,
        index_name: &str,
        key: Tuple,
        iterator: IteratorType,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Tuple>> {
        let (space_id, index_id) = self.index_ids(index_name).await?;
        self.client
            .submit(
                || Ok(Request::select(space_id, index_id, key.clone(), iterator, limit, offset)),
                into_tuples,
            )
            .await
    }

    pub async fn insert(&self, tuple: Tuple) -> Result<Vec<Tuple>> {
        let space_id = self.space_id().await?;
        self.client
            .submit(|| Ok(Request::insert(space_id, tuple.clone())), into_tuples)
            .await
    }

    pub async fn replace(&self, tuple: Tuple) -> Result<Vec<Tuple>> {
        let space_id = self.space_id().await?;
        self.client
            .submit(|| Ok(Request::replace(space_id, tuple.clone())), into_tuples)
            .await
    }

    pub async fn delete(&self, index_name: &str, key: Tuple) -> Result<Vec<Tuple>> {
        let (space_id, index_id) = self.index_ids(index_name).await?;
        self.client
            .submit(|| Ok(Request::delete(space_id, index_id, key.clone())), into_tuples)
            .await
    }

    /// Applies update `operations` (e.g. `[["=", 1, "x"]]`) to the tuple at `key`.
    pub async fn update(&self, index_name: &str, key: Tuple, operations: Value) -> Result<Vec<Tuple>> {
        let (space_id, index_id) = self.index_ids(index_name).await?;
        self.client
            .submit(
                || Ok(Request::update(space_id, index_id, key.clone(), operations.clone())),
                into_tuples,
            )
            .await
    }

    /// Inserts `tuple`, or applies `operations` when it already exists.
    pub async fn upsert(&self, tuple: Tuple, operations: Value) -> Result<Vec<Tuple>> {
        let space_id = self.space_id().await?;
        self.client
            .submit(
                || Ok(Request::upsert(space_id, tuple.clone(), operations.clone())),
                into_tuples,
            )
            .await
    }
}

/// Data-manipulation results are lists of tuples.
fn into_tuples(value: Value) -> Result<Vec<Tuple>> {
    match value {
        Value::Array(tuples) => Ok(tuples),
        Value::Null => Ok(Vec::new()),
        other => Err(ClientError::Serialization(format!(
            "Expected a list of tuples, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_into_tuples() {
        assert_eq!(into_tuples(json!([[1, "a"]])).unwrap(), vec![json!([1, "a"])]);
        assert!(into_tuples(Value::Null).unwrap().is_empty());
        assert!(matches!(into_tuples(json!(5)), Err(ClientError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ClientConfig::default().with_connections(0);
        let result = Client::connect(config, &["127.0.0.1:3301"]).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let result = Client::connect(ClientConfig::default(), &["localhost:70000"]).await;
        assert!(matches!(result, Err(ClientError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::default().with_connect_timeout(Duration::from_millis(200));
        let result = Client::connect(config, &[addr.to_string()]).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }
}
