//! Read-only access to JSON document collections.
//!
//! Each document becomes one row. Nested objects are flattened into dotted
//! column names (`{"a": {"b": 1}}` gives column `a.b`). Arrays are kept as
//! JSON text, except that a column listed in the schema's
//! `single_foreign_keys` option has its one-element arrays unwrapped.

use std::sync::{Arc, RwLock};

use arrow::array::{new_null_array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use hashbrown::HashMap;
use serde_json::Value;

use super::{ChunkIter, DataStore, StoreContext};
use crate::error::TabularError;
use crate::schema::{Column, Schema, SchemaOptions};
use crate::types::StorageTarget;

pub type Documents<'a> = Box<dyn Iterator<Item = Result<Value, TabularError>> + 'a>;

/// A source of JSON documents grouped in named collections.
pub trait DocumentSource: Send + Sync {
    fn documents(&self, collection: &str) -> Result<Documents<'_>, TabularError>;

    fn has_collection(&self, collection: &str) -> Result<bool, TabularError> {
        Ok(self.documents(collection)?.next().is_some())
    }
}

/// Collections held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDocumentSource {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: &str, documents: Vec<Value>) -> Result<(), TabularError> {
        self.collections
            .write()
            .map_err(|_| TabularError::Internal("document source lock poisoned".into()))?
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
        Ok(())
    }
}

impl DocumentSource for InMemoryDocumentSource {
    fn documents(&self, collection: &str) -> Result<Documents<'_>, TabularError> {
        let documents = self
            .collections
            .read()
            .map_err(|_| TabularError::Internal("document source lock poisoned".into()))?
            .get(collection)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(documents.into_iter().map(Ok)))
    }
}

/// Flattens one document into `(column, value)` pairs.
fn flatten(prefix: &str, value: &Value, unwrap: &[String], out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&name, inner, unwrap, out);
            }
        }
        Value::Array(items) if unwrap.iter().any(|u| u == prefix) => match items.as_slice() {
            [] => out.push((prefix.to_string(), Value::Null)),
            [only] => out.push((prefix.to_string(), only.clone())),
            _ => out.push((prefix.to_string(), value.clone())),
        },
        other => out.push((prefix.to_string(), other.clone())),
    }
}

/// Builds one Arrow column from JSON values: booleans, integers and numbers
/// keep their type when the column is uniform, everything else is text.
fn build_column(values: &[Value]) -> ArrayRef {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if present.is_empty() {
        return new_null_array(&DataType::Utf8, values.len());
    }
    if present.iter().all(|v| v.is_boolean()) {
        return Arc::new(values.iter().map(Value::as_bool).collect::<BooleanArray>());
    }
    if present.iter().all(|v| v.is_i64()) {
        return Arc::new(values.iter().map(Value::as_i64).collect::<Int64Array>());
    }
    if present.iter().all(|v| v.is_number()) {
        return Arc::new(values.iter().map(Value::as_f64).collect::<Float64Array>());
    }
    Arc::new(
        values
            .iter()
            .map(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect::<StringArray>(),
    )
}

/// Turns documents into a table. Columns appear in first-seen order; a
/// document lacking a column gets a missing value there.
pub fn documents_to_table(
    documents: Documents<'_>,
    unwrap: &[String],
) -> Result<RecordBatch, TabularError> {
    let mut names: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut columns: Vec<Vec<Value>> = Vec::new();
    let mut rows = 0;

    for document in documents {
        let document = document?;
        let mut flat = Vec::new();
        flatten("", &document, unwrap, &mut flat);
        for (name, value) in flat {
            let at = *positions.entry(name.clone()).or_insert_with(|| {
                names.push(name);
                columns.push(vec![Value::Null; rows]);
                columns.len() - 1
            });
            columns[at].push(value);
        }
        rows += 1;
        for column in &mut columns {
            column.resize(rows, Value::Null);
        }
    }

    let arrays: Vec<ArrayRef> = columns.iter().map(|c| build_column(c)).collect();
    let fields: Vec<Field> = names
        .iter()
        .zip(&arrays)
        .map(|(n, a)| Field::new(n, a.data_type().clone(), true))
        .collect();
    Ok(RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        arrays,
        &RecordBatchOptions::new().with_row_count(Some(rows)),
    )?)
}

/// A schema with one Raw column per flattened attribute of `collection`.
pub fn infer_schema(source: &dyn DocumentSource, collection: &str) -> Result<Schema, TabularError> {
    let table = documents_to_table(source.documents(collection)?, &[])?;
    let columns = table
        .schema()
        .fields()
        .iter()
        .map(|f| Column::raw(f.name().clone()))
        .collect();
    Schema::new(collection, columns, SchemaOptions::default())
}

/// Reads the collection named after the schema.
pub struct DocumentStore {
    context: StoreContext,
    source: Arc<dyn DocumentSource>,
}

impl DocumentStore {
    pub fn new(context: StoreContext, source: Arc<dyn DocumentSource>) -> Self {
        Self { context, source }
    }

    fn read_only(&self) -> TabularError {
        TabularError::Unsupported(format!("{} is read-only", self.describe()))
    }
}

impl DataStore for DocumentStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        StorageTarget::Default
    }

    fn describe(&self) -> String {
        format!("document collection '{}'", self.schema().name())
    }

    fn exists(&self) -> Result<bool, TabularError> {
        self.source.has_collection(self.schema().name())
    }

    fn delete(&self) -> Result<(), TabularError> {
        Err(self.read_only())
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let documents = self.source.documents(self.schema().name())?;
        let table = documents_to_table(documents, &self.schema().options().single_foreign_keys)?;

        // Declared attributes no document carries come back as missing values.
        let mut fields: Vec<Field> = table.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut arrays = table.columns().to_vec();
        for column in self.schema().columns() {
            if table.column_by_name(&column.name).is_none() {
                fields.push(Field::new(&column.name, DataType::Utf8, true));
                arrays.push(new_null_array(&DataType::Utf8, table.num_rows()));
            }
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::new(ArrowSchema::new(fields)),
            arrays,
            &RecordBatchOptions::new().with_row_count(Some(table.num_rows())),
        )?)
    }

    fn store_raw(&self, _table: &RecordBatch) -> Result<(), TabularError> {
        Err(self.read_only())
    }

    fn store(&self, _table: &RecordBatch) -> Result<(), TabularError> {
        Err(self.read_only())
    }

    fn store_chunks(&self, _chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        Err(self.read_only())
    }

    fn update(&self, _table: &RecordBatch) -> Result<(), TabularError> {
        Err(self.read_only())
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Int64Type;
    use serde_json::json;

    use super::*;
    use crate::chunks::dictionary;

    fn source() -> Arc<InMemoryDocumentSource> {
        let source = InMemoryDocumentSource::new();
        source
            .insert(
                "notes",
                vec![
                    json!({"id": 1, "author": {"name": "ann", "ward": "icu"}, "patient": [7], "tags": ["a", "b"]}),
                    json!({"id": 2, "author": {"name": "bob"}, "patient": [8]}),
                ],
            )
            .unwrap();
        Arc::new(source)
    }

    #[test]
    fn flattens_and_unwraps_singletons() {
        let schema = Schema::partial(
            "notes",
            vec![Column::identifier("patient"), Column::raw("author.name")],
            SchemaOptions {
                single_foreign_keys: vec!["patient".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let store = DocumentStore::new(StoreContext::with_defaults(schema), source());
        let table = store.load().unwrap();

        let patients = dictionary::decode(table.column_by_name("patient").unwrap()).unwrap();
        let patients: Vec<_> = patients.as_primitive::<Int64Type>().iter().collect();
        assert_eq!(patients, vec![Some(7), Some(8)]);

        let wards = table.column_by_name("author.ward").unwrap();
        assert!(wards.is_null(1));
        let tags = table.column_by_name("tags").unwrap();
        assert_eq!(tags.as_string::<i32>().value(0), "[\"a\",\"b\"]");
    }

    #[test]
    fn infers_raw_schema_and_refuses_writes() {
        let schema = infer_schema(source().as_ref(), "notes").unwrap();
        assert!(schema.column_names().contains(&"author.ward"));

        let store = DocumentStore::new(StoreContext::with_defaults(schema), source());
        assert!(store.exists().unwrap());
        let table = store.load().unwrap();
        assert_eq!(table.num_rows(), 2);
        assert!(matches!(store.store(&table), Err(TabularError::Unsupported(_))));
        assert!(matches!(store.update(&table), Err(TabularError::Unsupported(_))));
    }
}
