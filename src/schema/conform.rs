use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::{Field, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::{RowConverter, SortField};
use hashbrown::HashSet;

use super::{Schema, SchemaKind};
use crate::error::TabularError;
use crate::registry::TypeRegistry;
use crate::types::StorageTarget;

/// Knobs for a single conform call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConformOptions {
    /// Leave row order alone even when the schema declares `order_by`.
    pub skip_sort: bool,
    /// Rename every output column to `<schema name>.<column>`.
    pub add_prefix: bool,
}

pub(super) fn conform(
    schema: &Schema,
    table: &RecordBatch,
    target: &StorageTarget,
    registry: &TypeRegistry,
    options: ConformOptions,
) -> Result<RecordBatch, TabularError> {
    check_column_set(schema, table)?;

    let input = table.schema();
    let order: Vec<&str> = match schema.kind {
        SchemaKind::Full => schema.column_names(),
        SchemaKind::Partial => input.fields().iter().map(|f| f.name().as_str()).collect(),
    };

    let mut fields = Vec::with_capacity(order.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(order.len());
    for name in order {
        let index = input.index_of(name)?;
        let array = table.column(index);
        let array = match schema.column(name) {
            Some(column) => registry.conform_array(column, array, target)?,
            None => array.clone(),
        };
        let out_name = if options.add_prefix {
            format!("{}.{}", schema.name, name)
        } else {
            name.to_string()
        };
        fields.push(Field::new(out_name, array.data_type().clone(), true));
        arrays.push(array);
    }

    let batch = RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        arrays,
        &RecordBatchOptions::new().with_row_count(Some(table.num_rows())),
    )?;

    match &schema.options.order_by {
        Some(keys) if !options.skip_sort => {
            let keys: Vec<String> = if options.add_prefix {
                keys.iter().map(|k| format!("{}.{}", schema.name, k)).collect()
            } else {
                keys.clone()
            };
            sort_by_columns(&batch, &keys)
        }
        _ => Ok(batch),
    }
}

fn check_column_set(schema: &Schema, table: &RecordBatch) -> Result<(), TabularError> {
    let table_schema = table.schema();
    let present: HashSet<&str> = table_schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect();
    let declared: HashSet<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();

    let missing: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| !present.contains(c.name.as_str()))
        .map(|c| c.name.clone())
        .collect();
    let unexpected: Vec<String> = match schema.kind {
        SchemaKind::Full => table_schema
            .fields()
            .iter()
            .filter(|f| !declared.contains(f.name().as_str()))
            .map(|f| f.name().clone())
            .collect(),
        SchemaKind::Partial => Vec::new(),
    };

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(TabularError::SchemaMismatch {
            schema: schema.name.clone(),
            missing,
            unexpected,
        })
    }
}

/// Stable sort of `batch` on the composite key `keys`. Rows with equal keys
/// keep their relative order. A batch that is already ordered is returned as is.
pub(crate) fn sort_by_columns(
    batch: &RecordBatch,
    keys: &[String],
) -> Result<RecordBatch, TabularError> {
    if batch.num_rows() < 2 {
        return Ok(batch.clone());
    }
    let mut columns = Vec::with_capacity(keys.len());
    let mut sort_fields = Vec::with_capacity(keys.len());
    for key in keys {
        let column = batch.column_by_name(key).ok_or_else(|| TabularError::SchemaMismatch {
            schema: "order_by".into(),
            missing: vec![key.clone()],
            unexpected: Vec::new(),
        })?;
        sort_fields.push(SortField::new(column.data_type().clone()));
        columns.push(column.clone());
    }
    let converter = RowConverter::new(sort_fields)?;
    let rows = converter.convert_columns(&columns)?;

    let sorted = (1..rows.num_rows()).all(|i| rows.row(i - 1) <= rows.row(i));
    if sorted {
        return Ok(batch.clone());
    }

    // The row position is the tie breaker: sort_by is stable.
    let mut positions: Vec<u32> = (0..batch.num_rows() as u32).collect();
    positions.sort_by(|a, b| rows.row(*a as usize).cmp(&rows.row(*b as usize)));
    let indices = UInt32Array::from(positions);
    Ok(take_record_batch(batch, &indices)?)
}
