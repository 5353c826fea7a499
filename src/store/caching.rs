//! A slow store fronted by a fast one.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use super::{ChunkIter, DataStore, StoreContext};
use crate::error::TabularError;
use crate::types::StorageTarget;

/// Reads come from `cache` once it holds a copy of `source`; writes go to
/// `source` and invalidate the cache.
///
/// Tables cross this store in their `Default` shape; each inner store
/// conforms them to its own target.
pub struct CachingStore {
    context: StoreContext,
    source: Arc<dyn DataStore>,
    cache: Arc<dyn DataStore>,
}

impl CachingStore {
    pub fn new(source: Arc<dyn DataStore>, cache: Arc<dyn DataStore>) -> Self {
        Self {
            context: source.context().clone(),
            source,
            cache,
        }
    }

    pub fn invalidate(&self) -> Result<(), TabularError> {
        if self.cache.exists()? {
            log::debug!("Invalidating cache {}", self.cache.describe());
            self.cache.delete()?;
        }
        Ok(())
    }
}

impl DataStore for CachingStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        StorageTarget::Default
    }

    fn describe(&self) -> String {
        format!("{} cached in {}", self.source.describe(), self.cache.describe())
    }

    fn exists(&self) -> Result<bool, TabularError> {
        self.source.exists()
    }

    fn delete(&self) -> Result<(), TabularError> {
        self.invalidate()?;
        self.source.delete()
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        if self.cache.exists()? {
            log::debug!("Cache hit in {}", self.cache.describe());
            return self.cache.load();
        }
        let table = self.source.load()?;
        match self.cache.store(&table) {
            Ok(()) => {}
            // Some caches refuse empty tables; the load itself still succeeds.
            Err(TabularError::EmptyStore { store }) => {
                log::warn!("Not caching empty table in {}", store);
            }
            Err(e) => return Err(e),
        }
        Ok(table)
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        self.source.store(table)?;
        self.invalidate()
    }

    fn store_chunks_raw(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        self.source.store_chunks(chunks)?;
        self.invalidate()
    }

    fn update(&self, table: &RecordBatch) -> Result<(), TabularError> {
        self.source.update(table)?;
        self.invalidate()
    }
}

impl std::fmt::Debug for CachingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingStore")
            .field("source", &self.source.describe())
            .field("cache", &self.cache.describe())
            .finish()
    }
}
