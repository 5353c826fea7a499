//! Upsert by key: the default `update` of every file-backed store.

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, SortField};
use hashbrown::HashMap;

use super::DataStore;
use crate::chunks::{self, dictionary};
use crate::error::TabularError;
use crate::schema::Schema;
use crate::types::StorageTarget;

/// How [`merge_by_key`] assembles its output. Both branches give the same
/// rows; they differ in which table the result is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// `NewBase` when more incoming keys already exist than not, else `OldBase`.
    #[default]
    Auto,
    /// Incoming rows first, then the persisted rows no incoming row replaces.
    NewBase,
    /// Persisted rows in place, matched ones overwritten, then unseen incoming rows.
    OldBase,
}

/// Loads what `store` holds, merges `table` into it by key and stores the
/// result. Nothing persisted means a plain store; zero incoming rows means
/// nothing to do.
pub fn reload_merge_store<S: DataStore + ?Sized>(
    store: &S,
    table: &RecordBatch,
    strategy: UpdateStrategy,
) -> Result<(), TabularError> {
    if table.num_rows() == 0 {
        log::debug!("Skipping update of {} with zero rows", store.describe());
        return Ok(());
    }
    if !store.exists()? {
        return store.store(table);
    }
    let schema = store.schema();
    let old = store.load()?;
    let new = schema.conform(table, &StorageTarget::Default, store.registry())?;
    let combined = merge_by_key(schema, &old, &new, strategy)?;
    store.store(&combined)?;
    log::info!(
        "Updated {} with {} rows ({} rows persisted)",
        store.describe(),
        new.num_rows(),
        combined.num_rows()
    );
    Ok(())
}

/// Merges `new` into `old` by the schema's `index` column. Dictionary columns
/// come out coded against the union of both sides (old values first).
pub fn merge_by_key(
    schema: &Schema,
    old: &RecordBatch,
    new: &RecordBatch,
    strategy: UpdateStrategy,
) -> Result<RecordBatch, TabularError> {
    let index = schema.index_column()?;
    let combined = chunks::merge(&[old.clone(), new.clone()])?;
    let n_old = old.num_rows();
    let n_new = new.num_rows();

    let key_column = combined
        .column_by_name(index)
        .ok_or_else(|| TabularError::SchemaMismatch {
            schema: schema.name().to_string(),
            missing: vec![index.to_string()],
            unexpected: Vec::new(),
        })?;
    let converter = RowConverter::new(vec![SortField::new(key_column.data_type().clone())])?;
    let rows = converter.convert_columns(&[key_column.clone()])?;

    let old_keys = key_positions(index, key_column, rows.iter().take(n_old).map(|r| r.owned()), 0)?;
    let new_keys = key_positions(
        index,
        key_column,
        rows.iter().skip(n_old).map(|r| r.owned()),
        n_old,
    )?;

    let matches = new_keys.keys().filter(|k| old_keys.contains_key(*k)).count();
    let new_rows = n_new - matches;
    let strategy = match strategy {
        UpdateStrategy::Auto if matches > new_rows => UpdateStrategy::NewBase,
        UpdateStrategy::Auto => UpdateStrategy::OldBase,
        chosen => chosen,
    };
    log::debug!(
        "Merging {} incoming rows into {}: {} matches, {} new, {:?}",
        n_new,
        n_old,
        matches,
        new_rows,
        strategy
    );

    let mut take: Vec<u32> = Vec::with_capacity(n_old + new_rows);
    match strategy {
        UpdateStrategy::NewBase => {
            take.extend((n_old..n_old + n_new).map(|i| i as u32));
            for (i, row) in rows.iter().take(n_old).enumerate() {
                if !new_keys.contains_key(&row.owned()) {
                    take.push(i as u32);
                }
            }
        }
        _ => {
            for (i, row) in rows.iter().take(n_old).enumerate() {
                match new_keys.get(&row.owned()) {
                    Some(replacement) => take.push(*replacement as u32),
                    None => take.push(i as u32),
                }
            }
            for (j, row) in rows.iter().skip(n_old).enumerate() {
                if !old_keys.contains_key(&row.owned()) {
                    take.push((n_old + j) as u32);
                }
            }
        }
    }

    Ok(take_record_batch(&combined, &UInt32Array::from(take))?)
}

/// Position of every key in one side of the merge. A key seen twice is an error.
fn key_positions(
    column: &str,
    keys: &ArrayRef,
    rows: impl Iterator<Item = OwnedRow>,
    offset: usize,
) -> Result<HashMap<OwnedRow, usize>, TabularError> {
    let mut positions = HashMap::new();
    for (i, row) in rows.enumerate() {
        if positions.insert(row, offset + i).is_some() {
            let key = dictionary::value_at(keys, offset + i)?
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<missing>".to_string());
            return Err(TabularError::DuplicateKey {
                column: column.to_string(),
                key,
            });
        }
    }
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{AsArray, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{Float64Type, Int64Type};

    use super::*;
    use crate::registry::TypeRegistry;
    use crate::schema::{Column, SchemaOptions};

    fn schema() -> Schema {
        Schema::new(
            "stays",
            vec![
                Column::identifier("id"),
                Column::categorical("ward"),
                Column::numeric("score"),
            ],
            SchemaOptions {
                index: Some("id".into()),
                order_by: Some(vec!["id".into()]),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn table(ids: Vec<i64>, wards: Vec<&str>, scores: Vec<f64>) -> RecordBatch {
        let raw = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(ids)) as ArrayRef),
            ("ward", Arc::new(StringArray::from(wards))),
            ("score", Arc::new(Float64Array::from(scores))),
        ])
        .unwrap();
        schema()
            .conform(&raw, &StorageTarget::Default, &TypeRegistry::standard())
            .unwrap()
    }

    fn sorted(batch: &RecordBatch) -> RecordBatch {
        schema()
            .conform(batch, &StorageTarget::Default, &TypeRegistry::standard())
            .unwrap()
    }

    fn ids(batch: &RecordBatch) -> Vec<i64> {
        let plain = dictionary::decode(batch.column(0)).unwrap();
        plain.as_primitive::<Int64Type>().iter().flatten().collect()
    }

    #[test]
    fn both_branches_agree() {
        let old = table(vec![1, 2, 3], vec!["a", "b", "a"], vec![1.0, 2.0, 3.0]);
        let new = table(vec![3, 4], vec!["c", "b"], vec![30.0, 40.0]);

        let by_new = merge_by_key(&schema(), &old, &new, UpdateStrategy::NewBase).unwrap();
        let by_old = merge_by_key(&schema(), &old, &new, UpdateStrategy::OldBase).unwrap();
        assert_eq!(ids(&by_new), vec![3, 4, 1, 2]);
        assert_eq!(ids(&by_old), vec![1, 2, 3, 4]);
        assert_eq!(sorted(&by_new), sorted(&by_old));

        let out = sorted(&by_old);
        let scores: Vec<_> = out.column(2).as_primitive::<Float64Type>().iter().flatten().collect();
        assert_eq!(scores, vec![1.0, 2.0, 30.0, 40.0]);

        let wards = dictionary::as_int32_dictionary(out.column(1)).unwrap();
        let values: Vec<_> = wards.values().as_string::<i32>().iter().flatten().collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn auto_picks_new_base_when_most_keys_match() {
        let old = table(vec![1, 2, 3], vec!["a", "b", "a"], vec![1.0, 2.0, 3.0]);
        let mostly_matches = table(vec![2, 3, 9], vec!["a", "a", "a"], vec![0.0, 0.0, 0.0]);
        let out = merge_by_key(&schema(), &old, &mostly_matches, UpdateStrategy::Auto).unwrap();
        assert_eq!(ids(&out), vec![2, 3, 9, 1]);

        let mostly_new = table(vec![3, 8, 9], vec!["a", "a", "a"], vec![0.0, 0.0, 0.0]);
        let out = merge_by_key(&schema(), &old, &mostly_new, UpdateStrategy::Auto).unwrap();
        assert_eq!(ids(&out), vec![1, 2, 3, 8, 9]);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let old = table(vec![1, 1], vec!["a", "b"], vec![1.0, 2.0]);
        let new = table(vec![2], vec!["a"], vec![1.0]);
        let err = merge_by_key(&schema(), &old, &new, UpdateStrategy::Auto).unwrap_err();
        match err {
            TabularError::DuplicateKey { column, key } => {
                assert_eq!(column, "id");
                assert_eq!(key, "1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_index_option() {
        let plain = Schema::new("plain", schema().columns().to_vec(), SchemaOptions::default()).unwrap();
        let old = table(vec![1], vec!["a"], vec![1.0]);
        assert!(matches!(
            merge_by_key(&plain, &old, &old, UpdateStrategy::Auto),
            Err(TabularError::MissingOption { option: "index", .. })
        ));
    }
}
