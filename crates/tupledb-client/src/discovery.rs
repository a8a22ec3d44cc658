//! Sources of server addresses for the pool.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::watch;
use tupledb_common::protocol::error::Result;
use tupledb_common::ServerAddress;

/// Supplies the set of addresses the pool should be connected to.
#[async_trait]
pub trait AddressProvider: Send + Sync {
    /// Current address set.
    async fn addresses(&self) -> Result<Vec<ServerAddress>>;

    /// Change notifications, for providers whose set can change.
    fn subscribe(&self) -> Option<watch::Receiver<Vec<ServerAddress>>> {
        None
    }
}

/// A fixed list of addresses.
#[derive(Debug, Clone)]
pub struct StaticAddressProvider {
    addresses: Vec<ServerAddress>,
}

impl StaticAddressProvider {
    pub fn new(addresses: Vec<ServerAddress>) -> Self {
        Self {
            addresses: dedup(addresses),
        }
    }

    /// Parses every entry with [`ServerAddress::parse`].
    pub fn parse<S: AsRef<str>>(addresses: &[S]) -> Result<Self> {
        let parsed = addresses
            .iter()
            .map(|a| ServerAddress::parse(a.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(parsed))
    }
}

#[async_trait]
impl AddressProvider for StaticAddressProvider {
    async fn addresses(&self) -> Result<Vec<ServerAddress>> {
        Ok(self.addresses.clone())
    }
}

/// An address set that can be replaced at runtime.
///
/// Whatever discovers servers (a service registry, a config reload, a
/// cluster topology call) pushes the new set through [`set_addresses`];
/// subscribed pools reconcile against it.
///
/// [`set_addresses`]: DynamicAddressProvider::set_addresses
pub struct DynamicAddressProvider {
    sender: watch::Sender<Vec<ServerAddress>>,
}

impl DynamicAddressProvider {
    pub fn new(initial: Vec<ServerAddress>) -> Self {
        let (sender, _) = watch::channel(dedup(initial));
        Self { sender }
    }

    /// Replaces the address set. Returns `false` if it did not change.
    pub fn set_addresses(&self, addresses: Vec<ServerAddress>) -> bool {
        let addresses = dedup(addresses);
        self.sender.send_if_modified(|current| {
            if *current == addresses {
                false
            } else {
                *current = addresses;
                true
            }
        })
    }

    pub fn current(&self) -> Vec<ServerAddress> {
        self.sender.borrow().clone()
    }
}

#[async_trait]
impl AddressProvider for DynamicAddressProvider {
    async fn addresses(&self) -> Result<Vec<ServerAddress>> {
        Ok(self.current())
    }

    fn subscribe(&self) -> Option<watch::Receiver<Vec<ServerAddress>>> {
        Some(self.sender.subscribe())
    }
}

/// Drops repeated addresses, keeping first occurrences in order.
fn dedup(addresses: Vec<ServerAddress>) -> Vec<ServerAddress> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_static_provider_dedups_in_order() {
        let provider = StaticAddressProvider::parse(&["b:1", "a:1", "b:1", "c"]).unwrap();
        let addresses = provider.addresses().await.unwrap();
        assert_eq!(addresses, vec![addr("b:1"), addr("a:1"), addr("c:3301")]);
        assert!(provider.subscribe().is_none());
    }

    #[test]
    fn test_static_provider_rejects_bad_address() {
        assert!(StaticAddressProvider::parse(&["host:0"]).is_err());
    }

    #[tokio::test]
    async fn test_dynamic_provider_notifies_on_change() {
        let provider = DynamicAddressProvider::new(vec![addr("a:1")]);
        let mut rx = provider.subscribe().unwrap();

        assert!(!provider.set_addresses(vec![addr("a:1"), addr("a:1")]));
        assert!(provider.set_addresses(vec![addr("a:1"), addr("b:2")]));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec![addr("a:1"), addr("b:2")]);
        assert_eq!(provider.addresses().await.unwrap().len(), 2);
    }
}
