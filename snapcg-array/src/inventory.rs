//! Array inventory cache
//!
//! Lazily fetches volumes, storage pools and reserve-capacity (concat)
//! volumes. Each accessor fetches at most once per reconciliation run; a
//! cache is created per run and dropped with it.

use snapcg_core::{ConcatVolume, SnapError, StoragePool, Volume};
use std::collections::HashMap;
use tracing::debug;

use crate::endpoints;
use crate::transport::ArrayClient;

/// Volumes keyed by id and by name
#[derive(Debug, Default, Clone)]
pub struct VolumeIndex {
    by_id: HashMap<String, Volume>,
    id_by_name: HashMap<String, String>,
}

impl VolumeIndex {
    pub fn from_volumes(volumes: impl IntoIterator<Item = Volume>) -> Self {
        let mut index = Self::default();
        for volume in volumes {
            index.id_by_name.insert(volume.name.clone(), volume.id.clone());
            index.by_id.insert(volume.id.clone(), volume);
        }
        index
    }

    pub fn by_id(&self, id: &str) -> Option<&Volume> {
        self.by_id.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Volume> {
        self.id_by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Storage pools keyed by id and by name
#[derive(Debug, Default, Clone)]
pub struct PoolIndex {
    by_id: HashMap<String, StoragePool>,
    id_by_name: HashMap<String, String>,
}

impl PoolIndex {
    pub fn from_pools(pools: impl IntoIterator<Item = StoragePool>) -> Self {
        let mut index = Self::default();
        for pool in pools {
            index.id_by_name.insert(pool.name.clone(), pool.id.clone());
            index.by_id.insert(pool.id.clone(), pool);
        }
        index
    }

    pub fn by_id(&self, id: &str) -> Option<&StoragePool> {
        self.by_id.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&StoragePool> {
        self.id_by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Display name of a pool, falling back to its id
    pub fn name_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.by_id.get(id).map(|p| p.name.as_str()).unwrap_or(id)
    }
}

/// Per-run memoizing inventory
pub struct InventoryCache {
    client: ArrayClient,
    volumes: Option<VolumeIndex>,
    pools: Option<PoolIndex>,
    concat: Option<HashMap<String, ConcatVolume>>,
    fetches: usize,
}

impl InventoryCache {
    pub fn new(client: ArrayClient) -> Self {
        Self {
            client,
            volumes: None,
            pools: None,
            concat: None,
            fetches: 0,
        }
    }

    /// Client the cache reads through
    pub fn client(&self) -> &ArrayClient {
        &self.client
    }

    /// Number of backing fetches issued so far
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    /// All thick and thin volumes
    pub async fn volumes(&mut self) -> Result<&VolumeIndex, SnapError> {
        if self.volumes.is_none() {
            let mut volumes: Vec<Volume> = self
                .client
                .get(endpoints::VOLUMES)
                .await
                .map_err(|e| SnapError::lookup(endpoints::VOLUMES, e))?;
            let thin: Vec<Volume> = self
                .client
                .get(endpoints::THIN_VOLUMES)
                .await
                .map_err(|e| SnapError::lookup(endpoints::THIN_VOLUMES, e))?;
            volumes.extend(thin);
            self.fetches += 1;

            debug!(count = volumes.len(), "Fetched volume inventory");
            self.volumes = Some(VolumeIndex::from_volumes(volumes));
        }
        Ok(self.volumes.get_or_insert_with(VolumeIndex::default))
    }

    /// All storage pools and volume groups
    pub async fn storage_pools(&mut self) -> Result<&PoolIndex, SnapError> {
        if self.pools.is_none() {
            let pools: Vec<StoragePool> = self
                .client
                .get(endpoints::STORAGE_POOLS)
                .await
                .map_err(|e| SnapError::lookup(endpoints::STORAGE_POOLS, e))?;
            self.fetches += 1;

            debug!(count = pools.len(), "Fetched storage pool inventory");
            self.pools = Some(PoolIndex::from_pools(pools));
        }
        Ok(self.pools.get_or_insert_with(PoolIndex::default))
    }

    /// Reserve chain of a concat volume
    pub async fn reserve_chain(&mut self, concat_id: &str) -> Result<Option<&ConcatVolume>, SnapError> {
        if self.concat.is_none() {
            let concat: Vec<ConcatVolume> = self
                .client
                .get(endpoints::CONCAT_VOLUMES)
                .await
                .map_err(|e| SnapError::lookup(endpoints::CONCAT_VOLUMES, e))?;
            self.fetches += 1;

            debug!(count = concat.len(), "Fetched reserve capacity volumes");
            self.concat = Some(concat.into_iter().map(|c| (c.id.clone(), c)).collect());
        }
        Ok(self
            .concat
            .get_or_insert_with(HashMap::new)
            .get(concat_id))
    }
}
