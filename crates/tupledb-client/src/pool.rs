use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::protocol::Request;
use tupledb_common::ServerAddress;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::discovery::AddressProvider;
use crate::factory::ConnectionFactory;
use crate::retry::Backoff;
use crate::strategy::SelectionStrategy;

/// Interval at which a draining connection is checked for idleness.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait between background passes while an address stays under-filled.
const RECONNECT_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_millis(50),
    max: Duration::from_secs(5),
    multiplier: 2.0,
};

/// Immutable view of the pool's connections.
///
/// Readers take an `Arc` to the current membership and never see it change
/// underneath them; reconciliation builds a new one and swaps it in.
#[derive(Default)]
struct Membership {
    by_address: Vec<(ServerAddress, Vec<Arc<Connection>>)>,
    /// All connections, address by address, in a stable order.
    connections: Vec<Arc<Connection>>,
    /// Some address holds fewer connections than configured.
    under_filled: bool,
}

impl Membership {
    fn new(by_address: Vec<(ServerAddress, Vec<Arc<Connection>>)>, per_address: usize) -> Self {
        let connections = by_address
            .iter()
            .flat_map(|(_, conns)| conns.iter().cloned())
            .collect();
        let under_filled = by_address.iter().any(|(_, conns)| conns.len() < per_address);
        Self {
            by_address,
            connections,
            under_filled,
        }
    }

    fn open_for(&self, address: &ServerAddress) -> Vec<Arc<Connection>> {
        self.by_address
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, conns)| conns.iter().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }
}

/// Outcome of one [`ConnectionPool::reconcile`] pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Connections opened during the pass
    pub opened: usize,
    /// Connections taken out of the pool (removed addresses or closed)
    pub removed: usize,
    /// Addresses that could not be fully connected, with the last error
    pub failed: Vec<(ServerAddress, ClientError)>,
}

/// Connection pool over a changing set of server addresses.
///
/// The pool keeps `connections` open connections per address and hands them
/// out through a [`SelectionStrategy`]. Membership is an immutable snapshot
/// swapped atomically on every change, so selection never blocks behind a
/// reconnect.
///
/// # Lifecycle
///
/// - Construction connects to every address; unreachable addresses are
///   logged and skipped.
/// - When the address provider publishes changes, a background task
///   reconciles the pool against the new set.
/// - A connection that closes, or an address that could not be filled,
///   triggers background reconnects with exponential backoff until every
///   address holds its full count or is removed.
/// - Removed connections keep serving their in-flight requests until idle or
///   until the drain timeout, then close.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    provider: Arc<dyn AddressProvider>,
    strategy: Arc<dyn SelectionStrategy>,
    connections_per_address: usize,
    drain_timeout: Duration,
    membership: RwLock<Arc<Membership>>,
    /// Serializes reconciliation passes.
    reconcile_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Connects to every address the provider reports.
    ///
    /// # Arguments
    /// * `factory` - Opens individual connections
    /// * `provider` - Source of server addresses; subscribed to when it supports changes
    /// * `strategy` - Picks a connection per request
    /// * `config` - Supplies the per-address connection count and drain timeout
    ///
    /// # Errors
    ///
    /// Fails when the provider has addresses but none of them could be
    /// connected. An empty address set yields an empty pool.
    pub async fn connect(
        factory: Arc<dyn ConnectionFactory>,
        provider: Arc<dyn AddressProvider>,
        strategy: Arc<dyn SelectionStrategy>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            factory,
            provider,
            strategy,
            connections_per_address: config.connections.max(1),
            drain_timeout: config.drain_timeout,
            membership: RwLock::new(Arc::new(Membership::default())),
            reconcile_lock: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let addresses = inner.provider.addresses().await?;
        let report = inner.reconcile(addresses.clone()).await;

        let open = inner.snapshot().connections.len();
        if !addresses.is_empty() && open == 0 {
            let error = report
                .failed
                .into_iter()
                .last()
                .map(|(_, e)| e)
                .unwrap_or(ClientError::NoAvailableConnection);
            return Err(error);
        }

        info!(
            "Connection pool ready: {} connections to {} of {} addresses",
            open,
            inner.snapshot().by_address.iter().filter(|(_, c)| !c.is_empty()).count(),
            addresses.len()
        );
        if !report.failed.is_empty() {
            inner.schedule_reconnect();
        }

        let watcher = inner.provider.subscribe().map(|mut changes| {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    let addresses = changes.borrow_and_update().clone();
                    let Some(inner) = weak.upgrade() else { break };
                    if inner.is_closed() {
                        break;
                    }
                    debug!("Address set changed: {} addresses", addresses.len());
                    if !inner.reconcile(addresses).await.failed.is_empty() {
                        inner.schedule_reconnect();
                    }
                }
            })
        });

        Ok(Self {
            inner,
            watcher: Mutex::new(watcher),
        })
    }

    /// Picks a connection for the next request.
    ///
    /// Fails with [`ClientError::NoAvailableConnection`] when nothing is open.
    /// Either that or an under-filled address schedules a reconnect in the
    /// background.
    pub fn select(&self) -> Result<Arc<Connection>> {
        if self.inner.is_closed() {
            return Err(ClientError::ConnectionClosed(
                "connection pool is closed".to_string(),
            ));
        }

        let membership = self.inner.snapshot();
        if membership.under_filled {
            self.inner.schedule_reconnect();
        }
        match self.inner.strategy.select(&membership.connections) {
            Some(connection) => Ok(connection),
            None => {
                self.inner.schedule_reconnect();
                Err(ClientError::NoAvailableConnection)
            }
        }
    }

    /// Sends `request` over a selected connection.
    pub async fn send(&self, request: Request) -> Result<Value> {
        self.select()?.send(request).await
    }

    /// Brings the pool in line with `addresses`.
    ///
    /// New addresses are connected concurrently, closed connections are
    /// replaced, and connections to addresses no longer present are drained
    /// in the background.
    pub async fn reconcile(&self, addresses: Vec<ServerAddress>) -> ReconcileReport {
        self.inner.reconcile(addresses).await
    }

    /// Re-reads the provider's addresses and reconciles against them.
    pub async fn refresh(&self) -> Result<ReconcileReport> {
        self.inner.refresh().await
    }

    /// Every connection currently in the pool.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.snapshot().connections.clone()
    }

    /// Addresses with at least one connection.
    pub fn addresses(&self) -> Vec<ServerAddress> {
        self.inner
            .snapshot()
            .by_address
            .iter()
            .filter(|(_, conns)| !conns.is_empty())
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stops watching for address changes and closes every connection.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watcher.abort();
        }
        let membership = self.inner.swap(Membership::default());
        for connection in &membership.connections {
            connection.close();
        }
        info!("Connection pool closed ({} connections)", membership.connections.len());
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolInner {
    fn snapshot(&self) -> Arc<Membership> {
        self.membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn swap(&self, membership: Membership) -> Arc<Membership> {
        let mut current = self.membership.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, Arc::new(membership))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn refresh(self: &Arc<Self>) -> Result<ReconcileReport> {
        let addresses = self.provider.addresses().await?;
        Ok(self.reconcile(addresses).await)
    }

    async fn reconcile(self: &Arc<Self>, addresses: Vec<ServerAddress>) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let mut report = ReconcileReport::default();
        if self.is_closed() {
            return report;
        }

        let mut seen = HashSet::new();
        let addresses: Vec<_> = addresses.into_iter().filter(|a| seen.insert(a.clone())).collect();

        let current = self.snapshot();
        let attempts = addresses.iter().map(|address| {
            let existing = current.open_for(address);
            self.fill(address.clone(), existing)
        });
        let results = join_all(attempts).await;

        let mut by_address = Vec::with_capacity(results.len());
        for (address, connections, opened, error) in results {
            report.opened += opened;
            if let Some(error) = error {
                report.failed.push((address.clone(), error));
            }
            by_address.push((address, connections));
        }

        let next = Membership::new(by_address, self.connections_per_address);
        if self.is_closed() {
            // Closed while connecting; nothing may be published any more.
            for connection in &next.connections {
                connection.close();
            }
            return report;
        }

        let previous = self.swap(next);
        let kept = self.snapshot();
        for connection in &previous.connections {
            if kept.connections.iter().any(|c| Arc::ptr_eq(c, connection)) {
                continue;
            }
            report.removed += 1;
            if !connection.is_closed() {
                self.drain(connection.clone());
            }
        }

        if report.opened > 0 || report.removed > 0 {
            info!(
                "Pool reconciled: {} opened, {} removed, {} addresses failed",
                report.opened,
                report.removed,
                report.failed.len()
            );
        }
        report
    }

    /// Tops `existing` up to the configured count for one address.
    async fn fill(
        self: &Arc<Self>,
        address: ServerAddress,
        mut connections: Vec<Arc<Connection>>,
    ) -> (ServerAddress, Vec<Arc<Connection>>, usize, Option<ClientError>) {
        let mut opened = 0;
        let mut error = None;

        while connections.len() < self.connections_per_address {
            match self.factory.connect(&address).await {
                Ok(connection) => {
                    self.watch_connection(&connection);
                    connections.push(connection);
                    opened += 1;
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", address, e);
                    error = Some(e);
                    break;
                }
            }
        }

        (address, connections, opened, error)
    }

    /// Schedules a reconnect once `connection` closes.
    fn watch_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        let weak: Weak<PoolInner> = Arc::downgrade(self);
        let connection = connection.clone();
        tokio::spawn(async move {
            connection.closed().await;
            let Some(inner) = weak.upgrade() else { return };
            let still_member = inner
                .snapshot()
                .connections
                .iter()
                .any(|c| Arc::ptr_eq(c, &connection));
            if still_member && !inner.is_closed() {
                debug!("Connection to {} closed, reconnecting", connection.address());
                inner.schedule_reconnect();
            }
        });
    }

    /// Starts a background reconnect loop unless one is already running.
    ///
    /// The loop refreshes against the provider's addresses until a pass
    /// leaves no address short of connections, backing off between passes.
    /// It ends early when the pool closes or is dropped.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closed() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut pass = 0;
            loop {
                let Some(inner) = weak.upgrade() else { return };
                if inner.is_closed() {
                    break;
                }
                let filled = match inner.refresh().await {
                    Ok(report) => report.failed.is_empty(),
                    Err(e) => {
                        warn!("Failed to refresh pool addresses: {}", e);
                        false
                    }
                };
                if filled || inner.is_closed() {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                drop(inner);

                let delay = RECONNECT_BACKOFF.delay_for(pass);
                debug!("Pool still under-filled, next reconnect in {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
                pass = pass.saturating_add(1);
            }
        });
    }

    /// Closes `connection` once it has no requests in flight, or after the
    /// drain timeout.
    fn drain(&self, connection: Arc<Connection>) {
        let deadline = Instant::now() + self.drain_timeout;
        tokio::spawn(async move {
            while connection.in_flight() > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
            if connection.in_flight() > 0 {
                debug!(
                    "Drain timeout for {} with {} requests in flight",
                    connection.address(),
                    connection.in_flight()
                );
            }
            connection.close();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::delayed_echo_connection;
    use crate::discovery::{DynamicAddressProvider, StaticAddressProvider};
    use crate::strategy::RoundRobin;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Opens in-memory echo connections; ports listed in `refuse` fail.
    #[derive(Default)]
    struct EchoFactory {
        connects: AtomicUsize,
        refuse: Mutex<HashSet<u16>>,
        delay: Duration,
    }

    impl EchoFactory {
        fn refusing(ports: &[u16]) -> Self {
            let factory = Self::default();
            factory.refuse.lock().unwrap().extend(ports);
            factory
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for EchoFactory {
        async fn connect(&self, address: &ServerAddress) -> Result<Arc<Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse.lock().unwrap().contains(&address.port()) {
                return Err(ClientError::Connection(format!("{} refused", address)));
            }
            Ok(Arc::new(delayed_echo_connection(address.clone(), self.delay).await))
        }
    }

    fn addr(port: u16) -> ServerAddress {
        ServerAddress::new("node", port).unwrap()
    }

    async fn pool_with(
        factory: Arc<EchoFactory>,
        provider: Arc<dyn AddressProvider>,
        connections: usize,
    ) -> Result<ConnectionPool> {
        let config = ClientConfig::default()
            .with_connections(connections)
            .with_drain_timeout(Duration::from_millis(500));
        ConnectionPool::connect(factory, provider, Arc::new(RoundRobin::new()), &config).await
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connections_per_address() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let pool = pool_with(factory.clone(), provider, 3).await.unwrap();

        assert_eq!(pool.connections().len(), 6);
        assert_eq!(pool.addresses(), vec![addr(1), addr(2)]);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_unreachable_address_is_skipped() {
        let factory = Arc::new(EchoFactory::refusing(&[2]));
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2), addr(3)]));
        let pool = pool_with(factory, provider, 1).await.unwrap();

        assert_eq!(pool.addresses(), vec![addr(1), addr(3)]);
        let result = pool.send(Request::call("f", json!([1]))).await.unwrap();
        assert_eq!(result["args"], json!([1]));
    }

    #[tokio::test]
    async fn test_init_fails_when_nothing_connects() {
        let factory = Arc::new(EchoFactory::refusing(&[1, 2]));
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let err = pool_with(factory, provider, 1).await.err().unwrap();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_connection() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![]));
        let pool = pool_with(factory, provider, 1).await.unwrap();

        assert_eq!(pool.select().unwrap_err(), ClientError::NoAvailableConnection);
    }

    #[tokio::test]
    async fn test_round_robin_over_pool() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let pool = pool_with(factory, provider, 2).await.unwrap();

        let picks: Vec<_> = (0..8).map(|_| pool.select().unwrap()).collect();
        for conn in pool.connections() {
            let hits = picks.iter().filter(|p| Arc::ptr_eq(p, &conn)).count();
            assert_eq!(hits, 2);
        }
    }

    #[tokio::test]
    async fn test_reconcile_adds_and_drains() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let pool = pool_with(factory, provider, 1).await.unwrap();
        let removed = pool
            .connections()
            .into_iter()
            .find(|c| c.address() == &addr(1))
            .unwrap();

        let report = pool.reconcile(vec![addr(2), addr(3)]).await;
        assert_eq!(report.opened, 1);
        assert_eq!(report.removed, 1);
        assert!(report.failed.is_empty());
        assert_eq!(pool.addresses(), vec![addr(2), addr(3)]);

        // Idle, so it closes on the first drain check.
        eventually(|| removed.is_closed()).await;
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1)]));
        let pool = pool_with(factory.clone(), provider, 1).await.unwrap();

        pool.connections()[0].close();
        eventually(|| {
            let conns = pool.connections();
            conns.len() == 1 && !conns[0].is_closed()
        })
        .await;
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dynamic_provider_changes_membership() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(DynamicAddressProvider::new(vec![addr(1)]));
        let pool = pool_with(factory, provider.clone(), 1).await.unwrap();
        assert_eq!(pool.addresses(), vec![addr(1)]);

        provider.set_addresses(vec![addr(4), addr(5)]);
        eventually(|| pool.addresses() == vec![addr(4), addr(5)]).await;

        provider.set_addresses(vec![]);
        eventually(|| pool.connections().is_empty()).await;
        assert_eq!(pool.select().unwrap_err(), ClientError::NoAvailableConnection);
    }

    #[tokio::test]
    async fn test_close_closes_everything() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let pool = pool_with(factory, provider, 2).await.unwrap();
        let connections = pool.connections();

        pool.close();

        assert!(pool.is_closed());
        assert!(connections.iter().all(|c| c.is_closed()));
        assert!(matches!(pool.select(), Err(ClientError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_lost_address_keeps_being_reconnected() {
        let factory = Arc::new(EchoFactory::default());
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let pool = pool_with(factory.clone(), provider, 1).await.unwrap();

        factory.refuse.lock().unwrap().insert(1);
        let lost = pool
            .connections()
            .into_iter()
            .find(|c| c.address() == &addr(1))
            .unwrap();
        lost.close();
        eventually(|| pool.addresses() == vec![addr(2)]).await;

        // Several reconnects fail while the server refuses.
        eventually(|| factory.connects.load(Ordering::SeqCst) >= 5).await;
        factory.refuse.lock().unwrap().clear();

        eventually(|| pool.addresses() == vec![addr(1), addr(2)]).await;
        for i in 0..10 {
            let result = pool.send(Request::call("f", json!([i]))).await.unwrap();
            assert_eq!(result["args"], json!([i]));
        }
        assert!(pool.connections().iter().all(|c| !c.is_closed()));
    }

    #[tokio::test]
    async fn test_unreachable_address_joins_once_it_accepts() {
        let factory = Arc::new(EchoFactory::refusing(&[2]));
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1), addr(2)]));
        let pool = pool_with(factory.clone(), provider, 2).await.unwrap();
        assert_eq!(pool.addresses(), vec![addr(1)]);

        factory.refuse.lock().unwrap().clear();
        eventually(|| {
            let _ = pool.select();
            pool.connections().len() == 4
        })
        .await;
        assert_eq!(pool.addresses(), vec![addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn test_removed_connection_finishes_in_flight_request() {
        let factory = Arc::new(EchoFactory::slow(Duration::from_millis(200)));
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1)]));
        let pool = pool_with(factory, provider, 1).await.unwrap();
        let connection = pool.select().unwrap();

        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send(Request::call("f", json!([7]))).await }
        });
        eventually(|| connection.in_flight() == 1).await;

        let report = pool.reconcile(vec![addr(2)]).await;
        assert_eq!(report.removed, 1);
        assert!(!connection.is_closed());

        let result = request.await.unwrap().unwrap();
        assert_eq!(result["args"], json!([7]));
        eventually(|| connection.is_closed()).await;
    }

    #[tokio::test]
    async fn test_drain_timeout_closes_busy_connection() {
        let factory = Arc::new(EchoFactory::slow(Duration::from_secs(3)));
        let provider = Arc::new(StaticAddressProvider::new(vec![addr(1)]));
        let pool = pool_with(factory, provider, 1).await.unwrap();
        let connection = pool.select().unwrap();

        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send(Request::ping()).await }
        });
        eventually(|| connection.in_flight() == 1).await;

        let started = Instant::now();
        let report = pool.reconcile(vec![]).await;
        assert_eq!(report.removed, 1);

        // The 500ms drain timeout fires long before the 3s answer.
        let result = request.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed(_))));
        assert!(connection.is_closed());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
