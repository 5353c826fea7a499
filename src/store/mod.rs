//! The storage engine.
//!
//! A [`DataStore`] is an adapter between a table and one storage medium. The
//! public methods of the trait conform tables against the store's schema on
//! the way in (to the backend's storage target) and on the way out (to the
//! `Default` in-memory representation); backends only implement the `*_raw`
//! hooks, which see tables already in their physical shape.

pub mod appendable;
pub mod archive;
pub mod caching;
pub mod document;
pub mod flat_file;
pub mod memory;
pub mod object;
pub mod relational;
pub mod sidecar;
pub mod update;

use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use crate::chunks;
use crate::config::EngineConfig;
use crate::error::TabularError;
use crate::registry::TypeRegistry;
use crate::schema::Schema;
use crate::types::StorageTarget;

pub use appendable::AppendableArchiveStore;
pub use archive::ArchiveStore;
pub use caching::CachingStore;
pub use document::{DocumentSource, DocumentStore, InMemoryDocumentSource};
pub use flat_file::FlatFileStore;
pub use memory::MemoryStore;
pub use object::{InMemoryObjectStorage, ObjectArchiveStore, ObjectStorage};
pub use relational::{RelationalDriver, RelationalStore};
pub use update::UpdateStrategy;

/// A lazy, finite sequence of chunks. Consumed by value.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<RecordBatch, TabularError>> + 'a>;

/// Everything a store needs besides its medium: the schema it enforces, the
/// type registry used to conform, and the engine configuration.
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub schema: Schema,
    pub registry: Arc<TypeRegistry>,
    pub config: Arc<EngineConfig>,
}

impl StoreContext {
    pub fn new(schema: Schema, registry: Arc<TypeRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            schema,
            registry,
            config,
        }
    }

    /// The standard registry and a default configuration.
    pub fn with_defaults(schema: Schema) -> Self {
        Self::new(schema, TypeRegistry::standard(), Arc::new(EngineConfig::default()))
    }
}

/// The storage contract.
pub trait DataStore: Send + Sync {
    fn context(&self) -> &StoreContext;

    /// The target tables are conformed to before they reach [`store_raw`](Self::store_raw).
    fn storage_target(&self) -> StorageTarget;

    /// Human readable location, used in logs and errors.
    fn describe(&self) -> String;

    fn exists(&self) -> Result<bool, TabularError>;

    fn delete(&self) -> Result<(), TabularError>;

    /// Reads the whole persisted table, in its physical shape.
    fn load_raw(&self) -> Result<RecordBatch, TabularError>;

    /// Persists an already conformed table, replacing what was there.
    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError>;

    /// Reads the persisted table chunk by chunk.
    fn load_chunks_raw(&self) -> Result<ChunkIter<'_>, TabularError> {
        let table = self.load_raw()?;
        let chunks = chunks::split(&table, self.context().config.chunk_size_rows)?;
        Ok(Box::new(chunks.map(Ok)))
    }

    /// Persists already conformed chunks, replacing what was there.
    fn store_chunks_raw(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        let collected: Vec<RecordBatch> = chunks.collect::<Result<_, _>>()?;
        if collected.is_empty() {
            let empty = RecordBatch::new_empty(
                self.schema()
                    .arrow_schema(&self.storage_target(), self.registry())?,
            );
            return self.store_raw(&empty);
        }
        self.store_raw(&chunks::merge(&collected)?)
    }

    fn schema(&self) -> &Schema {
        &self.context().schema
    }

    fn registry(&self) -> &TypeRegistry {
        &self.context().registry
    }

    /// Loads the table, conformed to the in-memory representation.
    fn load(&self) -> Result<RecordBatch, TabularError> {
        let raw = self.load_raw()?;
        let table = self
            .schema()
            .conform(&raw, &StorageTarget::Default, self.registry())?;
        log::info!("Loaded {} rows from {}", table.num_rows(), self.describe());
        Ok(table)
    }

    /// Loads the table lazily, each chunk conformed on its way out.
    fn load_chunks(&self) -> Result<ChunkIter<'_>, TabularError> {
        let raw = self.load_chunks_raw()?;
        let schema = self.schema();
        let registry = self.registry();
        Ok(Box::new(raw.map(move |chunk| {
            chunk.and_then(|c| schema.conform(&c, &StorageTarget::Default, registry))
        })))
    }

    /// Replaces the persisted table with `table`.
    fn store(&self, table: &RecordBatch) -> Result<(), TabularError> {
        let conformed = self
            .schema()
            .conform(table, &self.storage_target(), self.registry())?;
        self.store_raw(&conformed)?;
        log::info!("Stored {} rows in {}", table.num_rows(), self.describe());
        Ok(())
    }

    /// Replaces the persisted table with the concatenation of `chunks`.
    fn store_chunks(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        let schema = self.schema();
        let registry = self.registry();
        let target = self.storage_target();
        let conformed = chunks.map(move |chunk| {
            chunk.and_then(|c| schema.conform(&c, &target, registry))
        });
        self.store_chunks_raw(Box::new(conformed))?;
        log::info!("Stored chunks in {}", self.describe());
        Ok(())
    }

    /// Upserts `table` by the schema's `index` column. New rows win.
    fn update(&self, table: &RecordBatch) -> Result<(), TabularError> {
        update::reload_merge_store(self, table, UpdateStrategy::Auto)
    }
}

/// Stores that can grow without rewriting what is persisted.
pub trait AppendableStore: DataStore {
    /// Persists an already conformed table after the existing rows.
    fn append_raw(&self, table: &RecordBatch) -> Result<(), TabularError>;

    /// Adds `table` after the persisted rows. Appending zero rows is a no-op;
    /// the first append into an empty store is a plain store.
    fn append(&self, table: &RecordBatch) -> Result<(), TabularError> {
        if table.num_rows() == 0 {
            return Ok(());
        }
        if !self.exists()? {
            return self.store(table);
        }
        let conformed = self
            .schema()
            .conform(table, &self.storage_target(), self.registry())?;
        self.append_raw(&conformed)?;
        log::info!("Appended {} rows to {}", table.num_rows(), self.describe());
        Ok(())
    }
}

/// A chunk iterator over batches already in memory.
pub fn chunk_iter(chunks: Vec<RecordBatch>) -> ChunkIter<'static> {
    Box::new(chunks.into_iter().map(Ok))
}

/// Relational and archive backends keep `.` out of column names.
pub(crate) fn physical_name(name: &str) -> String {
    name.replace('.', "__")
}

pub(crate) fn logical_name(name: &str) -> String {
    name.replace("__", ".")
}

#[cfg(test)]
mod store_tests;
