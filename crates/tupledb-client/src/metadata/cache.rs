use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use tupledb_common::protocol::error::{ClientError, Result};

use super::provider::MetadataProvider;
use super::single_flight::SingleFlight;
use super::snapshot::MetadataSnapshot;
use super::types::{IndexMetadata, SpaceMetadata};

type Slot = Arc<RwLock<Option<Arc<MetadataSnapshot>>>>;

/// Lazily populated, refreshable schema cache.
///
/// The cache starts empty. The first read fetches a snapshot from the
/// provider and waits for it; concurrent first reads share that one fetch.
/// [`refresh`](Self::refresh) fetches again and swaps the whole snapshot in
/// one step, so readers see either the old snapshot or the new one. A failed
/// fetch leaves the current snapshot in place. Snapshots are published in
/// the order their fetches were started.
pub struct MetadataCache {
    provider: Arc<dyn MetadataProvider>,
    current: Slot,
    fetch: SingleFlight<Result<Arc<MetadataSnapshot>>>,
}

impl MetadataCache {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            current: Arc::new(RwLock::new(None)),
            fetch: SingleFlight::new(),
        }
    }

    /// Current snapshot, fetching the first one if needed.
    pub async fn snapshot(&self) -> Result<Arc<MetadataSnapshot>> {
        if let Some(snapshot) = self.loaded() {
            return Ok(snapshot);
        }
        self.fetch.run(|| self.load()).await
    }

    /// Fetches a new snapshot and replaces the current one.
    ///
    /// The fetch always starts after the call, so a refresh issued after a
    /// schema change sees that change. When a fetch is already running, one
    /// more is queued behind it; concurrent refreshes share that queued fetch.
    pub async fn refresh(&self) -> Result<Arc<MetadataSnapshot>> {
        self.fetch.run_fresh(|| self.load()).await
    }

    /// Whether a snapshot has been loaded.
    pub fn is_initialized(&self) -> bool {
        self.loaded().is_some()
    }

    pub async fn get_space_by_name(&self, name: &str) -> Result<SpaceMetadata> {
        self.snapshot()
            .await?
            .space_by_name(name)
            .cloned()
            .ok_or_else(|| ClientError::NoSuchSpace(name.to_string()))
    }

    pub async fn get_space_by_id(&self, id: u32) -> Result<SpaceMetadata> {
        self.snapshot()
            .await?
            .space_by_id(id)
            .cloned()
            .ok_or_else(|| ClientError::NoSuchSpace(format!("id {}", id)))
    }

    pub async fn get_index_by_name(&self, space_name: &str, index_name: &str) -> Result<IndexMetadata> {
        let snapshot = self.snapshot().await?;
        if snapshot.space_by_name(space_name).is_none() {
            return Err(ClientError::NoSuchSpace(space_name.to_string()));
        }
        snapshot
            .index_by_name(space_name, index_name)
            .cloned()
            .ok_or_else(|| ClientError::NoSuchIndex(format!("{}.{}", space_name, index_name)))
    }

    pub async fn get_index_by_id(&self, space_id: u32, index_id: u32) -> Result<IndexMetadata> {
        let snapshot = self.snapshot().await?;
        if snapshot.space_by_id(space_id).is_none() {
            return Err(ClientError::NoSuchSpace(format!("id {}", space_id)));
        }
        snapshot
            .index_by_id(space_id, index_id)
            .cloned()
            .ok_or_else(|| ClientError::NoSuchIndex(format!("{}.{}", space_id, index_id)))
    }

    /// Indexes of a space, ordered by id.
    pub async fn get_indexes(&self, space_name: &str) -> Result<Vec<IndexMetadata>> {
        self.snapshot()
            .await?
            .indexes(space_name)
            .map(<[IndexMetadata]>::to_vec)
            .ok_or_else(|| ClientError::NoSuchSpace(space_name.to_string()))
    }

    pub async fn get_spaces(&self) -> Result<Vec<SpaceMetadata>> {
        Ok(self.snapshot().await?.spaces().to_vec())
    }

    fn loaded(&self) -> Option<Arc<MetadataSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One fetch that publishes its snapshot on success.
    fn load(&self) -> impl Future<Output = Result<Arc<MetadataSnapshot>>> + Send + 'static {
        let provider = self.provider.clone();
        let current = self.current.clone();
        async move {
            match provider.fetch().await {
                Ok(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    *current.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
                    info!("Metadata loaded: {} spaces", snapshot.len());
                    Ok(snapshot)
                }
                Err(e) => {
                    warn!("Failed to load metadata: {}", e);
                    Err(e)
                }
            }
        }
    }
}
