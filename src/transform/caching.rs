use std::sync::Arc;

use super::{SchemaSpec, TableData, Transform, TransformExt};
use crate::error::TabularError;
use crate::registry::TypeRegistry;
use crate::store::DataStore;

/// Memoizes a single-table transform in a store.
///
/// While the cache store holds data, applying returns that data and the
/// wrapped transform is not run. Otherwise the result is written to the
/// cache, replacing it or, with [`update`](Self::update), upserted into it.
pub struct CachingTransform {
    inner: Arc<dyn Transform>,
    cache: Arc<dyn DataStore>,
    update: bool,
}

impl CachingTransform {
    pub fn new(inner: Arc<dyn Transform>, cache: Arc<dyn DataStore>) -> Self {
        Self {
            inner,
            cache,
            update: false,
        }
    }

    pub fn update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }
}

impl Transform for CachingTransform {
    fn input_schema(&self) -> SchemaSpec {
        self.inner.input_schema()
    }

    fn output_schema(&self) -> SchemaSpec {
        self.inner.output_schema()
    }

    fn load_unchecked(&self) -> Result<TableData, TabularError> {
        self.inner.load_unchecked()
    }

    fn apply_unchecked(&self, data: TableData) -> Result<TableData, TabularError> {
        if self.cache.exists()? {
            log::info!("Serving {} from {}", self.inner.name(), self.cache.describe());
            return Ok(TableData::Single(self.cache.load()?));
        }
        let result = self.inner.apply(data)?;
        let table = match &result {
            TableData::Single(table) => table,
            TableData::Multi(_) => {
                return Err(TabularError::Unsupported(
                    "caching multi-table transform results".into(),
                ))
            }
        };
        if self.update {
            self.cache.update(table)?;
        } else {
            self.cache.store(table)?;
        }
        Ok(result)
    }

    fn name(&self) -> String {
        format!("Caching[{}]", self.inner.name())
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        self.inner.registry()
    }
}

impl std::fmt::Debug for CachingTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingTransform")
            .field("inner", &self.inner.name())
            .field("cache", &self.cache.describe())
            .field("update", &self.update)
            .finish()
    }
}
