//! Columnar archives kept in a key/value object storage.
//!
//! The table is written to a local staging file in the configured temporary
//! directory, then uploaded as one object; loading goes the other way.

use std::fs;
use std::io::Write;
use std::sync::{Arc, RwLock};

use arrow::record_batch::RecordBatch;
use hashbrown::HashMap;

use super::archive::{read_ipc_file, write_ipc_file};
use super::{DataStore, StoreContext};
use crate::error::TabularError;
use crate::types::StorageTarget;

/// A flat key/value space of binary objects.
pub trait ObjectStorage: Send + Sync {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TabularError>;

    /// Fails with [`TabularError::NotFound`] when `key` is absent.
    fn get(&self, key: &str) -> Result<Vec<u8>, TabularError>;

    fn exists(&self, key: &str) -> Result<bool, TabularError>;

    /// Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), TabularError>;
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> TabularError {
        TabularError::Internal("object storage lock poisoned".into())
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TabularError> {
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), bytes);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, TabularError> {
        self.objects
            .read()
            .map_err(|_| Self::poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| TabularError::NotFound(format!("object '{}'", key)))
    }

    fn exists(&self, key: &str) -> Result<bool, TabularError> {
        Ok(self
            .objects
            .read()
            .map_err(|_| Self::poisoned())?
            .contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<(), TabularError> {
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(key);
        Ok(())
    }
}

pub struct ObjectArchiveStore {
    context: StoreContext,
    storage: Arc<dyn ObjectStorage>,
    key: String,
    encoded: bool,
}

impl ObjectArchiveStore {
    /// Stores under the schema name unless [`key`](Self::key) says otherwise.
    pub fn new(context: StoreContext, storage: Arc<dyn ObjectStorage>) -> Self {
        let key = context.schema.name().to_string();
        Self {
            context,
            storage,
            key,
            encoded: false,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn encoded(mut self, encoded: bool) -> Self {
        self.encoded = encoded;
        self
    }

    fn staging_file(&self) -> Result<tempfile::NamedTempFile, TabularError> {
        Ok(tempfile::NamedTempFile::new_in(self.context.config.temp_dir()?)?)
    }
}

impl DataStore for ObjectArchiveStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        if self.encoded {
            StorageTarget::ColumnarArchiveEncoded
        } else {
            StorageTarget::ColumnarArchive
        }
    }

    fn describe(&self) -> String {
        format!("object '{}'", self.key)
    }

    fn exists(&self) -> Result<bool, TabularError> {
        self.storage.exists(&self.key)
    }

    fn delete(&self) -> Result<(), TabularError> {
        self.storage.delete(&self.key)
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let bytes = self.storage.get(&self.key)?;
        let mut staging = self.staging_file()?;
        staging.write_all(&bytes)?;
        staging.flush()?;
        read_ipc_file(staging.path())
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        if table.num_rows() == 0 {
            return Err(TabularError::EmptyStore {
                store: self.describe(),
            });
        }
        let staging = self.staging_file()?;
        write_ipc_file(staging.path(), table)?;
        let bytes = fs::read(staging.path())?;
        log::debug!("Uploading {} bytes to {}", bytes.len(), self.describe());
        self.storage.put(&self.key, bytes)
    }
}

impl std::fmt::Debug for ObjectArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectArchiveStore")
            .field("key", &self.key)
            .field("encoded", &self.encoded)
            .finish()
    }
}
