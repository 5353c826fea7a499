//! Equi-joins on dictionary-coded keys.
//!
//! Key columns of both sides are coded against one shared union dictionary, the
//! join runs on the integer codes, and the key columns come back out coded
//! against that union dictionary. Matching on codes selects exactly the row
//! pairs a join on the decoded values would.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use hashbrown::HashMap;

use super::dictionary;
use crate::error::TabularError;

/// Which left rows survive a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Only left rows with at least one match.
    Inner,
    /// Every left row; unmatched ones get missing right columns.
    Left,
}

/// Joins `left` and `right` on the columns named in `keys`.
///
/// The output holds the left columns followed by the right non-key columns; a
/// right column whose name is already taken gets a `_right` suffix. Missing
/// key values never match. Rows come out in left order, and matches of one
/// left row in right order.
pub fn dictionary_join(
    left: &RecordBatch,
    right: &RecordBatch,
    keys: &[&str],
    kind: JoinKind,
) -> Result<RecordBatch, TabularError> {
    if keys.is_empty() {
        return Err(TabularError::InvalidArgument("join needs at least one key".into()));
    }

    let mut left_codes: Vec<Int32Array> = Vec::with_capacity(keys.len());
    let mut right_codes: Vec<Int32Array> = Vec::with_capacity(keys.len());
    let mut unions = Vec::with_capacity(keys.len());
    for key in keys {
        let l = key_column(left, key, "left")?;
        let r = key_column(right, key, "right")?;
        let dict = dictionary::union(&[l, r])?;
        left_codes.push(dictionary::encode_keys(l, &dict)?);
        right_codes.push(dictionary::encode_keys(r, &dict)?);
        unions.push(dict);
    }

    let mut index: HashMap<Vec<i32>, Vec<u32>> = HashMap::new();
    for row in 0..right.num_rows() {
        if let Some(composite) = composite_key(&right_codes, row) {
            index.entry(composite).or_default().push(row as u32);
        }
    }

    let mut left_take: Vec<u32> = Vec::new();
    let mut right_take: Vec<Option<u32>> = Vec::new();
    for row in 0..left.num_rows() {
        let matches = composite_key(&left_codes, row).and_then(|k| index.get(&k));
        match (matches, kind) {
            (Some(rows), _) => {
                for r in rows {
                    left_take.push(row as u32);
                    right_take.push(Some(*r));
                }
            }
            (None, JoinKind::Left) => {
                left_take.push(row as u32);
                right_take.push(None);
            }
            (None, JoinKind::Inner) => {}
        }
    }
    log_metric!(
        "event" = "dictionary_join",
        "left_rows" = left.num_rows(),
        "right_rows" = right.num_rows(),
        "output_rows" = left_take.len()
    );

    let left_indices = UInt32Array::from(left_take);
    let right_indices = UInt32Array::from(right_take);

    let mut fields = Vec::new();
    let mut columns = Vec::new();
    let left_schema = left.schema();
    for (field, array) in left_schema.fields().iter().zip(left.columns()) {
        let mut taken = take(array.as_ref(), &left_indices, None)?;
        if let Some(k) = keys.iter().position(|k| *k == field.name().as_str()) {
            if let DataType::Dictionary(_, value_type) = array.data_type() {
                taken = dictionary::recode_as(&taken, &unions[k], value_type)?;
            }
        }
        fields.push(Field::new(field.name(), taken.data_type().clone(), true));
        columns.push(taken);
    }
    let right_schema = right.schema();
    for (field, array) in right_schema.fields().iter().zip(right.columns()) {
        if keys.contains(&field.name().as_str()) {
            continue;
        }
        let taken: ArrayRef = take(array.as_ref(), &right_indices, None)?;
        let mut name = field.name().clone();
        if fields.iter().any(|f: &Field| f.name() == &name) {
            name.push_str("_right");
        }
        fields.push(Field::new(name, taken.data_type().clone(), true));
        columns.push(taken);
    }

    Ok(RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        columns,
        &RecordBatchOptions::new().with_row_count(Some(left_indices.len())),
    )?)
}

fn key_column<'a>(
    table: &'a RecordBatch,
    key: &str,
    side: &str,
) -> Result<&'a ArrayRef, TabularError> {
    table
        .column_by_name(key)
        .ok_or_else(|| TabularError::SchemaMismatch {
            schema: format!("{} side of join", side),
            missing: vec![key.to_string()],
            unexpected: Vec::new(),
        })
}

fn composite_key(codes: &[Int32Array], row: usize) -> Option<Vec<i32>> {
    codes
        .iter()
        .map(|c| c.is_valid(row).then(|| c.value(row)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{AsArray, Float64Array, StringArray};
    use arrow::datatypes::Float64Type;

    fn coded(values: &[Option<&str>]) -> ArrayRef {
        let plain: ArrayRef = Arc::new(values.iter().copied().collect::<StringArray>());
        dictionary::encode(&plain).unwrap()
    }

    fn wards() -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            ("ward", coded(&[Some("icu"), Some("er"), None, Some("icu")])),
            ("beds", Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0, 4.0])) as ArrayRef),
        ])
        .unwrap()
    }

    fn staff() -> RecordBatch {
        // Different dictionary order than the left side.
        RecordBatch::try_from_iter(vec![
            ("ward", coded(&[Some("er"), Some("icu"), Some("or"), None])),
            ("beds", Arc::new(Float64Array::from(vec![10.0, 20.0, 30.0, 40.0])) as ArrayRef),
        ])
        .unwrap()
    }

    fn decoded(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
        let plain = dictionary::decode(batch.column_by_name(name).unwrap()).unwrap();
        plain.as_string::<i32>().iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn inner_join_matches_on_values_not_codes() {
        let out = dictionary_join(&wards(), &staff(), &["ward"], JoinKind::Inner).unwrap();
        assert_eq!(
            decoded(&out, "ward"),
            vec![Some("icu".into()), Some("er".into()), Some("icu".into())]
        );
        let right: Vec<_> = out
            .column_by_name("beds_right")
            .unwrap()
            .as_primitive::<Float64Type>()
            .iter()
            .collect();
        assert_eq!(right, vec![Some(20.0), Some(10.0), Some(20.0)]);
    }

    #[test]
    fn left_join_keeps_unmatched_and_null_keys() {
        let out = dictionary_join(&wards(), &staff(), &["ward"], JoinKind::Left).unwrap();
        assert_eq!(out.num_rows(), 4);
        let right = out.column_by_name("beds_right").unwrap();
        assert!(right.is_null(2));
        assert_eq!(decoded(&out, "ward")[2], None);
    }

    #[test]
    fn missing_key_column_is_reported() {
        let err = dictionary_join(&wards(), &staff(), &["bed"], JoinKind::Inner).unwrap_err();
        assert!(matches!(err, TabularError::SchemaMismatch { .. }));
    }
}
