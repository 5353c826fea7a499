use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use arrow::record_batch::RecordBatch;

use super::*;
use crate::chunks::dictionary;

fn table(columns: Vec<(&str, ArrayRef)>) -> RecordBatch {
    RecordBatch::try_from_iter(columns).unwrap()
}

fn visits() -> Schema {
    Schema::new(
        "visits",
        vec![
            Column::identifier("patient"),
            Column::categorical("ward"),
            Column::numeric("score"),
        ],
        SchemaOptions {
            order_by: Some(vec!["patient".into()]),
            index: Some("patient".into()),
            ..Default::default()
        },
    )
    .unwrap()
}

fn visits_table() -> RecordBatch {
    table(vec![
        ("score", Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0, 4.0])) as ArrayRef),
        ("ward", Arc::new(StringArray::from(vec!["b", "a", "b", "c"]))),
        ("patient", Arc::new(Int64Array::from(vec![3, 1, 2, 1]))),
    ])
}

#[test]
fn full_schema_conforms_orders_and_sorts() {
    let registry = TypeRegistry::standard();
    let out = visits()
        .conform(&visits_table(), &StorageTarget::Default, &registry)
        .unwrap();

    let names: Vec<_> = out.schema().fields().iter().map(|f| f.name().clone()).collect();
    assert_eq!(names, vec!["patient", "ward", "score"]);
    assert!(out.schema().fields().iter().all(|f| f.is_nullable()));

    let patients = dictionary::decode(out.column(0)).unwrap();
    let patients: Vec<_> = patients.as_primitive::<Int64Type>().iter().flatten().collect();
    assert_eq!(patients, vec![1, 1, 2, 3]);

    // Stable: the two patient-1 rows keep their input order (scores 2 then 4).
    let scores: Vec<_> = out.column(2).as_primitive::<Float64Type>().iter().flatten().collect();
    assert_eq!(scores, vec![2.0, 4.0, 3.0, 1.0]);
}

#[test]
fn caller_table_is_untouched() {
    let input = visits_table();
    let before = input.clone();
    let _ = visits()
        .conform(&input, &StorageTarget::Default, &TypeRegistry::standard())
        .unwrap();
    assert_eq!(input, before);
}

#[test]
fn mismatch_names_missing_and_unexpected() {
    let input = table(vec![
        ("patient", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
        ("bed", Arc::new(Int64Array::from(vec![1]))),
    ]);
    let err = visits()
        .conform(&input, &StorageTarget::Default, &TypeRegistry::standard())
        .unwrap_err();
    match err {
        TabularError::SchemaMismatch {
            missing,
            unexpected,
            ..
        } => {
            assert_eq!(missing, vec!["ward".to_string(), "score".to_string()]);
            assert_eq!(unexpected, vec!["bed".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn partial_schema_keeps_extra_columns_in_input_order() {
    let schema = Schema::partial("scores", vec![Column::numeric("score")], SchemaOptions::default()).unwrap();
    let input = table(vec![
        ("note", Arc::new(StringArray::from(vec!["x"])) as ArrayRef),
        ("score", Arc::new(Int64Array::from(vec![7]))),
    ]);
    let out = schema
        .conform(&input, &StorageTarget::Default, &TypeRegistry::standard())
        .unwrap();
    assert_eq!(out.schema().field(0).name(), "note");
    assert_eq!(out.column(0).data_type(), &DataType::Utf8);
    assert_eq!(out.column(1).data_type(), &DataType::Float64);

    let missing = table(vec![("note", Arc::new(StringArray::from(vec!["x"])) as ArrayRef)]);
    assert!(schema
        .conform(&missing, &StorageTarget::Default, &TypeRegistry::standard())
        .is_err());
}

#[test]
fn rejects_bad_definitions() {
    let duplicate = Schema::new(
        "dup",
        vec![Column::numeric("a"), Column::raw("a")],
        SchemaOptions::default(),
    );
    assert!(matches!(duplicate, Err(TabularError::SchemaDefinition(_))));

    let bad_fk = Schema::new(
        "fk",
        vec![Column::categorical("a")],
        SchemaOptions {
            single_foreign_keys: vec!["a".into()],
            ..Default::default()
        },
    );
    assert!(matches!(bad_fk, Err(TabularError::SchemaDefinition(_))));
}

#[test]
fn equality_ignores_options() {
    let a = visits();
    let b = Schema::new("visits", a.columns().to_vec(), SchemaOptions::default()).unwrap();
    assert_eq!(a, b);
    let partial = Schema::partial("visits", a.columns().to_vec(), SchemaOptions::default()).unwrap();
    assert_ne!(a, partial);
}

#[test]
fn union_with_prefix_drop_and_rename() {
    let left = Schema::new(
        "left",
        vec![Column::identifier("id"), Column::numeric("x")],
        SchemaOptions {
            prefix: Some("l".into()),
            ..Default::default()
        },
    )
    .unwrap();
    let right = Schema::new(
        "right",
        vec![Column::identifier("id"), Column::datetime("t")],
        SchemaOptions {
            prefix: Some("r".into()),
            ..Default::default()
        },
    )
    .unwrap();

    let united = Schema::union(
        &[&left, &right],
        UnionOptions {
            with_prefix: true,
            drop: vec!["r.id".into()],
            rename: vec![("l.id".into(), "id".into())],
            add: vec![Column::boolean("flag")],
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(united.name(), "union_left_right");
    assert_eq!(united.column_names(), vec!["id", "l.x", "r.t", "flag"]);

    let no_prefix = Schema::union(
        &[&visits(), &Schema::anonymous_partial()],
        UnionOptions {
            with_prefix: true,
            ..Default::default()
        },
    );
    assert!(matches!(no_prefix, Err(TabularError::MissingOption { .. })));
}

#[test]
fn renamed_carries_options() {
    let renamed = visits().renamed(Some("stays"), &[("patient", "person")], None).unwrap();
    assert_eq!(renamed.name(), "stays");
    assert_eq!(renamed.options().index.as_deref(), Some("person"));
    assert_eq!(renamed.column_names(), vec!["person", "ward", "score"]);
}

#[test]
fn multi_schema_requires_same_keys() {
    let mut schemas = BTreeMap::new();
    schemas.insert("visits".to_string(), visits());
    let multi = MultiSchema::new(schemas).unwrap();

    let mut data = BTreeMap::new();
    data.insert("visits".to_string(), visits_table());
    let out = multi
        .conform(&data, &StorageTarget::Default, &TypeRegistry::standard())
        .unwrap();
    assert_eq!(out["visits"].num_rows(), 4);

    data.insert("extra".to_string(), visits_table());
    assert!(matches!(
        multi.conform(&data, &StorageTarget::Default, &TypeRegistry::standard()),
        Err(TabularError::SchemaMismatch { .. })
    ));
    assert!(MultiSchema::new(BTreeMap::new()).is_err());
}

#[test]
fn add_prefix_and_skip_sort() {
    let out = visits()
        .conform_with(
            &visits_table(),
            &StorageTarget::Default,
            &TypeRegistry::standard(),
            ConformOptions {
                skip_sort: true,
                add_prefix: true,
            },
        )
        .unwrap();
    assert_eq!(out.schema().field(0).name(), "visits.patient");
    let patients = dictionary::decode(out.column(0)).unwrap();
    assert_eq!(patients.as_primitive::<Int64Type>().value(0), 3);
    assert_eq!(patients.len(), 4);
}
