use std::sync::RwLock;

use arrow::record_batch::RecordBatch;

use super::{ChunkIter, DataStore, StoreContext};
use crate::chunks;
use crate::error::TabularError;
use crate::types::StorageTarget;

/// Keeps conformed chunks in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    context: StoreContext,
    name: String,
    chunks: RwLock<Option<Vec<RecordBatch>>>,
}

impl MemoryStore {
    pub fn new(context: StoreContext) -> Self {
        let name = context.schema.name().to_string();
        Self {
            context,
            name,
            chunks: RwLock::new(None),
        }
    }

    fn snapshot(&self) -> Result<Vec<RecordBatch>, TabularError> {
        self.chunks
            .read()
            .map_err(|_| TabularError::Internal("memory store lock poisoned".into()))?
            .clone()
            .ok_or_else(|| TabularError::NotFound(self.describe()))
    }

    fn replace(&self, value: Option<Vec<RecordBatch>>) -> Result<(), TabularError> {
        *self
            .chunks
            .write()
            .map_err(|_| TabularError::Internal("memory store lock poisoned".into()))? = value;
        Ok(())
    }
}

impl DataStore for MemoryStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        StorageTarget::Default
    }

    fn describe(&self) -> String {
        format!("memory store '{}'", self.name)
    }

    fn exists(&self) -> Result<bool, TabularError> {
        Ok(self
            .chunks
            .read()
            .map_err(|_| TabularError::Internal("memory store lock poisoned".into()))?
            .is_some())
    }

    fn delete(&self) -> Result<(), TabularError> {
        self.replace(None)
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let chunks = self.snapshot()?;
        match chunks.as_slice() {
            [] => Ok(RecordBatch::new_empty(
                self.schema()
                    .arrow_schema(&StorageTarget::Default, self.registry())?,
            )),
            [only] => Ok(only.clone()),
            many => chunks::merge(many),
        }
    }

    fn load_chunks_raw(&self) -> Result<ChunkIter<'_>, TabularError> {
        Ok(Box::new(self.snapshot()?.into_iter().map(Ok)))
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        self.replace(Some(vec![table.clone()]))
    }

    fn store_chunks_raw(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        let collected: Vec<RecordBatch> = chunks.collect::<Result<_, _>>()?;
        self.replace(Some(collected))
    }
}
