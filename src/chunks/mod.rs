//! The chunk algebra: splitting tables into bounded pieces and putting them
//! back together without disturbing category codes or row order.
//!
//! Law: `merge(split(t, n))` reproduces `t` for every `n > 0`.

pub mod dictionary;
mod join;

use std::sync::Arc;

use arrow::array::{new_empty_array, Array, ArrayRef, UInt32Array};
use arrow::compute::{cast_with_options, concat, take_record_batch, CastOptions};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::{OwnedRow, RowConverter, SortField};
use hashbrown::{HashMap, HashSet};

use crate::error::TabularError;

pub use join::{dictionary_join, JoinKind};

//==================================================================================
// I. Splitting
//==================================================================================

/// Contiguous slices of at most `size` rows, in table order. An empty table
/// yields nothing.
pub fn split(table: &RecordBatch, size: usize) -> Result<SplitChunks, TabularError> {
    if size == 0 {
        return Err(TabularError::InvalidArgument(
            "chunk size must be greater than zero".into(),
        ));
    }
    Ok(SplitChunks {
        table: table.clone(),
        size,
        offset: 0,
    })
}

/// Iterator returned by [`split`]. Slices share the table's buffers.
#[derive(Debug)]
pub struct SplitChunks {
    table: RecordBatch,
    size: usize,
    offset: usize,
}

impl Iterator for SplitChunks {
    type Item = RecordBatch;

    fn next(&mut self) -> Option<RecordBatch> {
        let rows = self.table.num_rows();
        if self.offset >= rows {
            return None;
        }
        let len = self.size.min(rows - self.offset);
        let chunk = self.table.slice(self.offset, len);
        self.offset += len;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.table.num_rows().saturating_sub(self.offset);
        let n = remaining.div_ceil(self.size);
        (n, Some(n))
    }
}

/// Chunks in which every distinct value of `group_column` (missing included)
/// lies in exactly one chunk.
///
/// Groups are admitted in first-seen order, `max(1, size / avg_rows_per_group_hint)`
/// at a time, and a chunk is cut as soon as it holds at least `size` rows.
/// Within a chunk rows keep their table order.
pub fn split_by_group(
    table: &RecordBatch,
    group_column: &str,
    size: usize,
    avg_rows_per_group_hint: usize,
) -> Result<GroupChunks, TabularError> {
    if size == 0 || avg_rows_per_group_hint == 0 {
        return Err(TabularError::InvalidArgument(
            "chunk size and rows-per-group hint must be greater than zero".into(),
        ));
    }
    let groups = group_rows(table, group_column)?;
    log_metric!(
        "event" = "split_by_group",
        "rows" = table.num_rows(),
        "groups" = groups.len(),
        "size" = size
    );
    Ok(GroupChunks {
        table: table.clone(),
        groups,
        next_group: 0,
        groups_per_batch: (size / avg_rows_per_group_hint).max(1),
        size,
    })
}

/// Row indices of every distinct value of `column`, in first-seen order.
pub(crate) fn group_rows(table: &RecordBatch, column: &str) -> Result<Vec<Vec<u32>>, TabularError> {
    let array = table
        .column_by_name(column)
        .ok_or_else(|| TabularError::SchemaMismatch {
            schema: "group column".into(),
            missing: vec![column.to_string()],
            unexpected: Vec::new(),
        })?;
    let converter = RowConverter::new(vec![SortField::new(array.data_type().clone())])?;
    let rows = converter.convert_columns(&[array.clone()])?;

    let mut positions: HashMap<OwnedRow, usize> = HashMap::new();
    let mut groups: Vec<Vec<u32>> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let slot = *positions.entry(row.owned()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(i as u32);
    }
    Ok(groups)
}

/// Iterator returned by [`split_by_group`].
#[derive(Debug)]
pub struct GroupChunks {
    table: RecordBatch,
    groups: Vec<Vec<u32>>,
    next_group: usize,
    groups_per_batch: usize,
    size: usize,
}

impl GroupChunks {
    /// Number of distinct groups in the table.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Iterator for GroupChunks {
    type Item = Result<RecordBatch, TabularError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut admitted: Vec<u32> = Vec::new();
        while self.next_group < self.groups.len() && admitted.len() < self.size {
            let end = (self.next_group + self.groups_per_batch).min(self.groups.len());
            for group in &self.groups[self.next_group..end] {
                admitted.extend_from_slice(group);
            }
            self.next_group = end;
        }
        if admitted.is_empty() {
            return None;
        }
        admitted.sort_unstable();
        let indices = UInt32Array::from(admitted);
        Some(take_record_batch(&self.table, &indices).map_err(TabularError::from))
    }
}

//==================================================================================
// II. Merging
//==================================================================================

/// Vertical concatenation of `chunks`.
///
/// Columns are aligned by name in the first chunk's order. Dictionary columns
/// are re-encoded against the union of all chunk dictionaries (first-seen
/// order); numeric columns of differing types are widened to the widest type
/// present. Zero chunks is an error.
pub fn merge(chunks: &[RecordBatch]) -> Result<RecordBatch, TabularError> {
    let first = chunks.first().ok_or_else(|| {
        TabularError::InvalidArgument("cannot merge zero chunks".into())
    })?;
    let first_schema = first.schema();
    let names: Vec<&str> = first_schema.fields().iter().map(|f| f.name().as_str()).collect();
    let expected: HashSet<&str> = names.iter().copied().collect();

    for chunk in &chunks[1..] {
        let chunk_schema = chunk.schema();
        let present: HashSet<&str> = chunk_schema.fields().iter().map(|f| f.name().as_str()).collect();
        if present != expected {
            return Err(TabularError::SchemaMismatch {
                schema: "merge".into(),
                missing: names
                    .iter()
                    .filter(|n| !present.contains(*n))
                    .map(|n| n.to_string())
                    .collect(),
                unexpected: chunk_schema
                    .fields()
                    .iter()
                    .filter(|f| !expected.contains(f.name().as_str()))
                    .map(|f| f.name().clone())
                    .collect(),
            });
        }
    }

    let mut fields = Vec::with_capacity(names.len());
    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let arrays: Vec<ArrayRef> = chunks
            .iter()
            .map(|c| {
                c.column_by_name(name)
                    .cloned()
                    .ok_or_else(|| TabularError::Internal(format!("column '{}' vanished", name)))
            })
            .collect::<Result<_, _>>()?;
        let merged = merge_column(name, &arrays)?;
        fields.push(Field::new(*name, merged.data_type().clone(), true));
        columns.push(merged);
    }

    let rows = chunks.iter().map(|c| c.num_rows()).sum();
    Ok(RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        columns,
        &RecordBatchOptions::new().with_row_count(Some(rows)),
    )?)
}

fn merge_column(name: &str, arrays: &[ArrayRef]) -> Result<ArrayRef, TabularError> {
    let coded = arrays
        .iter()
        .find(|a| matches!(a.data_type(), DataType::Dictionary(_, _)));
    if let Some(coded) = coded {
        let DataType::Dictionary(_, value_type) = coded.data_type() else {
            return Err(TabularError::Internal("dictionary type".into()));
        };
        let refs: Vec<&ArrayRef> = arrays.iter().collect();
        let dict = dictionary::union(&refs)?;
        // Later chunks may carry values the first coded chunk's type cannot hold.
        let value_type = if dict.is_empty() {
            value_type.as_ref().clone()
        } else {
            dict.value_type()
        };
        return dictionary::concat_coded(arrays, &dict, &value_type);
    }

    let target = common_type(name, arrays)?;
    // Unsafe casts fail on overflow instead of nulling the value.
    let strict = CastOptions {
        safe: false,
        ..Default::default()
    };
    let aligned: Vec<ArrayRef> = arrays
        .iter()
        .map(|a| {
            if a.data_type() == &target {
                Ok(a.clone())
            } else {
                cast_with_options(a, &target, &strict).map_err(|e| {
                    TabularError::conversion(
                        name,
                        format!("cannot widen {} to {}: {}", a.data_type(), target, e),
                    )
                })
            }
        })
        .collect::<Result<_, _>>()?;
    if aligned.is_empty() {
        return Ok(new_empty_array(&target));
    }
    let refs: Vec<&dyn Array> = aligned.iter().map(|a| a.as_ref()).collect();
    Ok(concat(&refs)?)
}

/// The type every chunk of one column is brought to before concatenation.
fn common_type(name: &str, arrays: &[ArrayRef]) -> Result<DataType, TabularError> {
    let mut types: Vec<&DataType> = Vec::new();
    for array in arrays {
        let dt = array.data_type();
        if dt != &DataType::Null && !types.contains(&dt) {
            types.push(dt);
        }
    }
    match types.as_slice() {
        [] => Ok(DataType::Null),
        [only] => Ok((*only).clone()),
        many if many.iter().all(|t| t.is_numeric()) => {
            if many.iter().any(|t| t.is_floating()) {
                Ok(DataType::Float64)
            } else if many.iter().all(|t| t.is_unsigned_integer()) {
                Ok(DataType::UInt64)
            } else {
                Ok(DataType::Int64)
            }
        }
        many => Err(TabularError::conversion(
            name,
            format!("cannot merge chunks of types {:?}", many),
        )),
    }
}

/// Column-wise concatenation of equally long tables.
///
/// A column name present in several parts must hold the same values in each;
/// dictionary columns sharing a name are re-encoded against the union of
/// their dictionaries.
pub fn horizontal_merge(parts: &[RecordBatch]) -> Result<RecordBatch, TabularError> {
    let first = parts.first().ok_or_else(|| {
        TabularError::InvalidArgument("cannot merge zero parts".into())
    })?;
    let rows = first.num_rows();
    if let Some(bad) = parts.iter().find(|p| p.num_rows() != rows) {
        return Err(TabularError::InvalidArgument(format!(
            "horizontal merge of parts with {} and {} rows",
            rows,
            bad.num_rows()
        )));
    }

    let mut names: Vec<String> = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();
    for part in parts {
        let schema = part.schema();
        for (field, array) in schema.fields().iter().zip(part.columns()) {
            match names.iter().position(|n| n == field.name()) {
                None => {
                    names.push(field.name().clone());
                    columns.push(array.clone());
                }
                Some(at) => {
                    let kept = &columns[at];
                    let same = dictionary::decode(kept)?.as_ref() == dictionary::decode(array)?.as_ref();
                    if !same {
                        return Err(TabularError::InvalidArgument(format!(
                            "column '{}' differs between parts",
                            field.name()
                        )));
                    }
                    if let DataType::Dictionary(_, value_type) = kept.data_type() {
                        let dict = dictionary::union(&[kept, array])?;
                        columns[at] = dictionary::recode_as(kept, &dict, value_type)?;
                    }
                }
            }
        }
    }

    let fields: Vec<Field> = names
        .iter()
        .zip(&columns)
        .map(|(n, c)| Field::new(n, c.data_type().clone(), true))
        .collect();
    Ok(RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        columns,
        &RecordBatchOptions::new().with_row_count(Some(rows)),
    )?)
}

/// An empty batch with the schema of `like`.
pub(crate) fn empty_like(like: &RecordBatch) -> RecordBatch {
    RecordBatch::new_empty(like.schema())
}
