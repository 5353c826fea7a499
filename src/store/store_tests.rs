use std::fs;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, AsArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use hashbrown::HashMap;

use super::*;
use crate::chunks::dictionary::CategoryValue;
use crate::schema::{Column, SchemaOptions};

//==================================================================================
// Fixtures
//==================================================================================

fn visits_schema() -> Schema {
    Schema::new(
        "visits",
        vec![
            Column::identifier("id"),
            Column::categorical("ward"),
            Column::numeric("score"),
        ],
        SchemaOptions {
            index: Some("id".into()),
            ..Default::default()
        },
    )
    .unwrap()
}

fn visits(ids: &[i64], wards: &[Option<&str>], scores: &[f64]) -> RecordBatch {
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef),
        ("ward", Arc::new(StringArray::from(wards.to_vec()))),
        ("score", Arc::new(Float64Array::from(scores.to_vec()))),
    ])
    .unwrap()
}

fn sample() -> RecordBatch {
    visits(
        &[1, 2, 3, 4, 5],
        &[Some("icu"), Some("er"), None, Some("icu"), Some("or")],
        &[1.5, 2.0, 3.25, 4.0, 5.5],
    )
}

fn context() -> StoreContext {
    StoreContext::with_defaults(visits_schema())
}

/// Column values rendered as text, independent of dictionary coding.
fn texts(table: &RecordBatch, name: &str) -> Vec<Option<String>> {
    let column = table
        .column_by_name(name)
        .unwrap_or_else(|| panic!("missing column {name}"));
    let text = cast(column, &DataType::Utf8).unwrap();
    text.as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect()
}

fn assert_same_values(actual: &RecordBatch, expected: &RecordBatch) {
    assert_eq!(actual.num_rows(), expected.num_rows());
    for name in ["id", "ward", "score"] {
        assert_eq!(texts(actual, name), texts(expected, name), "column {name}");
    }
}

fn assert_round_trip(store: &dyn DataStore) {
    assert!(!store.exists().unwrap());
    store.store(&sample()).unwrap();
    assert!(store.exists().unwrap());

    let loaded = store.load().unwrap();
    assert_same_values(&loaded, &sample());
    assert!(loaded
        .schema()
        .field_with_name("ward")
        .unwrap()
        .data_type()
        .equals_datatype(&DataType::Dictionary(
            Box::new(DataType::Int32),
            Box::new(DataType::Utf8)
        )));

    store.delete().unwrap();
    assert!(!store.exists().unwrap());
}

//==================================================================================
// Round trips
//==================================================================================

#[test]
fn memory_round_trip() {
    assert_round_trip(&MemoryStore::new(context()));
}

#[test]
fn flat_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    assert_round_trip(&FlatFileStore::new(context(), dir.path().join("visits.csv")));
}

#[test]
fn compressed_flat_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("visits.csv.zst");
    let store = FlatFileStore::new(context(), &path).compressed(true);
    store.store(&sample()).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert!(!bytes.starts_with(b"id,"));
    assert_same_values(&store.load().unwrap(), &sample());
}

#[test]
fn plain_flat_file_read_as_compressed_is_a_codec_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("visits.csv");
    FlatFileStore::new(context(), &path).store(&sample()).unwrap();

    let misread = FlatFileStore::new(context(), &path).compressed(true);
    assert!(matches!(misread.load(), Err(TabularError::Codec(_))));
}

#[test]
fn flat_file_keeps_header_when_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.csv");
    let store = FlatFileStore::new(context(), &path);
    store.store(&visits(&[], &[], &[])).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().next(), Some("id,ward,score"));
    assert_eq!(store.load().unwrap().num_rows(), 0);
}

#[test]
fn archive_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    assert_round_trip(&ArchiveStore::new(context(), dir.path().join("visits.arrow")));
    assert_round_trip(
        &ArchiveStore::new(context(), dir.path().join("visits.coded.arrow")).encoded(true),
    );
}

#[test]
fn chunked_archive_writes_one_file_per_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(context(), dir.path().join("visits.arrow")).encoded(true);
    let parts: Vec<RecordBatch> = chunks::split(&sample(), 2).unwrap().collect();
    store.store_chunks(chunk_iter(parts)).unwrap();

    assert_eq!(store.chunk_paths().len(), 3);
    assert!(store.exists().unwrap());
    let loaded: Vec<RecordBatch> = store
        .load_chunks()
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        loaded.iter().map(RecordBatch::num_rows).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
    assert_same_values(&chunks::merge(&loaded).unwrap(), &sample());
    assert_same_values(&store.load().unwrap(), &sample());

    // A plain store replaces the chunk files.
    store.store(&sample()).unwrap();
    assert!(store.chunk_paths().is_empty());
    assert_same_values(&store.load().unwrap(), &sample());
}

#[test]
fn object_archive_round_trip() {
    let storage = Arc::new(InMemoryObjectStorage::new());
    assert_round_trip(&ObjectArchiveStore::new(context(), storage.clone()));

    let store = ObjectArchiveStore::new(context(), storage.clone()).key("archive/visits");
    store.store(&sample()).unwrap();
    assert!(storage.exists("archive/visits").unwrap());
    assert!(!storage.exists("visits").unwrap());
}

#[test]
fn appendable_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    assert_round_trip(&AppendableArchiveStore::new(context(), dir.path().join("visits")));
}

#[test]
fn empty_tables_are_refused_by_archives() {
    let dir = tempfile::tempdir().unwrap();
    let empty = visits(&[], &[], &[]);
    let stores: Vec<Box<dyn DataStore>> = vec![
        Box::new(ArchiveStore::new(context(), dir.path().join("a.arrow"))),
        Box::new(AppendableArchiveStore::new(context(), dir.path().join("b"))),
        Box::new(ObjectArchiveStore::new(
            context(),
            Arc::new(InMemoryObjectStorage::new()),
        )),
    ];
    for store in &stores {
        assert!(
            matches!(store.store(&empty), Err(TabularError::EmptyStore { .. })),
            "{}",
            store.describe()
        );
        assert!(!store.exists().unwrap());
    }
}

#[test]
fn loading_a_missing_store_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let stores: Vec<Box<dyn DataStore>> = vec![
        Box::new(MemoryStore::new(context())),
        Box::new(FlatFileStore::new(context(), dir.path().join("none.csv"))),
        Box::new(ArchiveStore::new(context(), dir.path().join("none.arrow"))),
        Box::new(AppendableArchiveStore::new(context(), dir.path().join("none"))),
    ];
    for store in &stores {
        assert!(
            matches!(store.load(), Err(TabularError::NotFound(_))),
            "{}",
            store.describe()
        );
    }
}

//==================================================================================
// Appending
//==================================================================================

#[test]
fn appends_keep_codes_stable() {
    let dir = tempfile::tempdir().unwrap();
    let store = AppendableArchiveStore::new(context(), dir.path().join("visits"));

    store
        .append(&visits(&[1, 2], &[Some("icu"), Some("er")], &[1.0, 2.0]))
        .unwrap();
    store
        .append(&visits(&[3, 4], &[Some("or"), Some("icu")], &[3.0, 4.0]))
        .unwrap();
    store.append(&visits(&[], &[], &[])).unwrap();
    store.append(&visits(&[5], &[None], &[5.0])).unwrap();

    assert_eq!(store.row_count().unwrap(), 5);
    assert_eq!(store.manifest().unwrap().segments.len(), 3);
    let wards = store.dictionary("ward").unwrap();
    assert_eq!(
        wards.values(),
        &[
            CategoryValue::Str("icu".into()),
            CategoryValue::Str("er".into()),
            CategoryValue::Str("or".into()),
        ]
    );
    let sidecar = fs::read_to_string(store.sidecar("ward").path()).unwrap();
    assert_eq!(sidecar, "\"icu\"\n\"er\"\n\"or\"\n");

    let loaded = store.load().unwrap();
    assert!(loaded.column_by_name(appendable::ROW_INDEX_COLUMN).is_none());
    assert_eq!(
        texts(&loaded, "id"),
        (1..=5).map(|i| Some(i.to_string())).collect::<Vec<_>>()
    );
    assert_eq!(
        texts(&loaded, "ward"),
        vec![
            Some("icu".to_string()),
            Some("er".to_string()),
            Some("or".to_string()),
            Some("icu".to_string()),
            None
        ]
    );

    let segments: Vec<RecordBatch> = store
        .load_chunks()
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        segments.iter().map(RecordBatch::num_rows).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
}

#[test]
fn truncated_sidecar_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = AppendableArchiveStore::new(context(), dir.path().join("visits"));
    store.store(&sample()).unwrap();

    fs::write(store.sidecar("ward").path(), "\"icu\"\n").unwrap();
    assert!(matches!(
        store.load(),
        Err(TabularError::DictionarySidecarCorrupt { .. })
    ));

    fs::write(store.sidecar("ward").path(), "{oops\n").unwrap();
    assert!(matches!(
        store.load(),
        Err(TabularError::DictionarySidecarCorrupt { .. })
    ));
}

#[test]
fn missing_sidecar_under_persisted_codes_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = AppendableArchiveStore::new(context(), dir.path().join("visits"));
    store
        .append(&visits(&[1, 2], &[Some("icu"), Some("er")], &[1.0, 2.0]))
        .unwrap();
    assert_eq!(store.manifest().unwrap().category_count("ward"), 2);

    let ward = store.sidecar("ward");
    fs::remove_file(ward.path()).unwrap();

    // Handing out code 0 again would re-label the persisted "icu" rows.
    assert!(matches!(
        store.append(&visits(&[3], &[Some("or")], &[3.0])),
        Err(TabularError::DictionarySidecarCorrupt { .. })
    ));
    assert!(!ward.path().exists());
    assert_eq!(store.row_count().unwrap(), 2);
    assert!(matches!(
        store.load(),
        Err(TabularError::DictionarySidecarCorrupt { .. })
    ));
    assert!(matches!(
        store.dictionary("ward"),
        Err(TabularError::DictionarySidecarCorrupt { .. })
    ));
}

#[test]
fn storing_replaces_appended_segments() {
    let dir = tempfile::tempdir().unwrap();
    let store = AppendableArchiveStore::new(context(), dir.path().join("visits"));
    store.append(&sample()).unwrap();
    store.append(&sample()).unwrap();
    assert_eq!(store.row_count().unwrap(), 10);

    store.store(&visits(&[9], &[Some("lab")], &[9.0])).unwrap();
    assert_eq!(store.row_count().unwrap(), 1);
    assert_eq!(store.dictionary("ward").unwrap().len(), 1);
}

//==================================================================================
// Updating
//==================================================================================

#[test]
fn archive_update_upserts_by_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(context(), dir.path().join("visits.arrow"));
    store
        .store(&visits(&[1, 2, 3], &[Some("a"), Some("b"), Some("c")], &[1.0, 2.0, 3.0]))
        .unwrap();
    store
        .update(&visits(&[3, 4], &[Some("c"), Some("a")], &[30.0, 40.0]))
        .unwrap();

    let loaded = store.load().unwrap();
    let expected = visits(
        &[1, 2, 3, 4],
        &[Some("a"), Some("b"), Some("c"), Some("a")],
        &[1.0, 2.0, 30.0, 40.0],
    );
    assert_same_values(&loaded, &expected);
}

#[test]
fn update_of_a_missing_store_stores() {
    let store = MemoryStore::new(context());
    store.update(&sample()).unwrap();
    assert_same_values(&store.load().unwrap(), &sample());

    store.update(&visits(&[], &[], &[])).unwrap();
    assert_eq!(store.load().unwrap().num_rows(), 5);
}

//==================================================================================
// Caching
//==================================================================================

#[test]
fn caching_store_fills_and_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let source: Arc<dyn DataStore> = Arc::new(MemoryStore::new(context()));
    let cache: Arc<dyn DataStore> =
        Arc::new(ArchiveStore::new(context(), dir.path().join("cache.arrow")));
    source.store(&sample()).unwrap();

    let caching = CachingStore::new(source.clone(), cache.clone());
    assert!(!cache.exists().unwrap());
    assert_same_values(&caching.load().unwrap(), &sample());
    assert!(cache.exists().unwrap());

    // Served from the cache even when the source changes behind its back.
    source.store(&visits(&[7], &[None], &[7.0])).unwrap();
    assert_eq!(caching.load().unwrap().num_rows(), 5);

    caching.store(&visits(&[8], &[Some("er")], &[8.0])).unwrap();
    assert!(!cache.exists().unwrap());
    assert_eq!(caching.load().unwrap().num_rows(), 1);

    caching.delete().unwrap();
    assert!(!source.exists().unwrap());
    assert!(!cache.exists().unwrap());
}

#[test]
fn caching_store_tolerates_caches_refusing_empty_tables() {
    let dir = tempfile::tempdir().unwrap();
    let source: Arc<dyn DataStore> = Arc::new(MemoryStore::new(context()));
    let cache: Arc<dyn DataStore> =
        Arc::new(ArchiveStore::new(context(), dir.path().join("cache.arrow")));
    source.store(&visits(&[], &[], &[])).unwrap();

    let caching = CachingStore::new(source, cache.clone());
    assert_eq!(caching.load().unwrap().num_rows(), 0);
    assert!(!cache.exists().unwrap());
}

//==================================================================================
// Relational
//==================================================================================

/// Understands just enough SQL to back the statements the store issues:
/// relation creation and removal, category bookkeeping and `INSERT ...
/// SELECT *` copies. Everything it is asked to run is recorded.
#[derive(Default)]
struct RecordingDriver {
    statements: Mutex<Vec<String>>,
    relations: Mutex<HashMap<String, Vec<RecordBatch>>>,
    fail_on: Option<&'static str>,
}

impl RecordingDriver {
    fn failing_on(prefix: &'static str) -> Self {
        Self {
            fail_on: Some(prefix),
            ..Default::default()
        }
    }

    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// The quoted identifiers of `sql`, in order.
    fn identifiers(sql: &str) -> Vec<String> {
        sql.split('"')
            .skip(1)
            .step_by(2)
            .map(str::to_string)
            .collect()
    }
}

impl RelationalDriver for RecordingDriver {
    fn execute(&self, sql: &str) -> Result<u64, TabularError> {
        self.statements.lock().unwrap().push(sql.to_string());
        if matches!(self.fail_on, Some(prefix) if sql.starts_with(prefix)) {
            return Err(TabularError::Driver(format!("refused: {}", sql)));
        }
        let names = Self::identifiers(sql);
        let mut relations = self.relations.lock().unwrap();
        if sql.starts_with("CREATE TABLE") || sql.starts_with("CREATE TEMPORARY TABLE") {
            relations.insert(names[0].clone(), Vec::new());
        } else if sql.starts_with("DROP TABLE") {
            relations.remove(&names[0]);
        } else if sql.starts_with("DELETE FROM") {
            relations.insert(names[0].clone(), Vec::new());
        } else if sql.starts_with("INSERT INTO") && !sql.contains("NOT EXISTS") {
            let source = sql
                .split(" SELECT * FROM ")
                .nth(1)
                .map(Self::identifiers)
                .and_then(|ids| ids.first().cloned())
                .unwrap();
            let copied = relations.get(&source).cloned().unwrap_or_default();
            let rows = copied.iter().map(RecordBatch::num_rows).sum::<usize>();
            relations.insert(names[0].clone(), copied);
            return Ok(rows as u64);
        }
        Ok(0)
    }

    fn query(&self, sql: &str) -> Result<RecordBatch, TabularError> {
        self.statements.lock().unwrap().push(sql.to_string());
        let relations = self.relations.lock().unwrap();
        let rows = relations
            .get(relational::CATEGORIES_RELATION)
            .cloned()
            .unwrap_or_default();
        let categories: Vec<Option<String>> = rows
            .iter()
            .flat_map(|b| texts(b, "categories"))
            .collect();
        Ok(RecordBatch::try_from_iter(vec![(
            "categories",
            Arc::new(StringArray::from(categories)) as ArrayRef,
        )])?)
    }

    fn has_relation(&self, name: &str) -> Result<bool, TabularError> {
        Ok(self.relations.lock().unwrap().contains_key(name))
    }

    fn bulk_load(&self, relation: &str, batch: &RecordBatch) -> Result<(), TabularError> {
        self.relations
            .lock()
            .unwrap()
            .get_mut(relation)
            .ok_or_else(|| TabularError::Driver(format!("no relation {}", relation)))?
            .push(batch.clone());
        Ok(())
    }

    fn bulk_unload(&self, relation: &str) -> Result<RecordBatch, TabularError> {
        let relations = self.relations.lock().unwrap();
        let batches = relations
            .get(relation)
            .ok_or_else(|| TabularError::NotFound(relation.to_string()))?;
        chunks::merge(batches)
    }
}

#[test]
fn relational_round_trip() {
    let driver = Arc::new(RecordingDriver::default());
    assert_round_trip(&RelationalStore::new(context(), driver.clone()));
    assert_round_trip(&RelationalStore::new(context(), driver).encode_categoricals(false));
}

#[test]
fn relational_store_codes_categoricals() {
    let driver = Arc::new(RecordingDriver::default());
    let store = RelationalStore::new(context(), driver.clone());
    store.store(&sample()).unwrap();

    let stored = driver.bulk_unload("visits").unwrap();
    assert_eq!(stored.schema().field_with_name("ward").unwrap().data_type(), &DataType::Int64);
    assert_eq!(
        store.load_categories().unwrap().get("ward").cloned().unwrap(),
        vec![
            CategoryValue::Str("icu".into()),
            CategoryValue::Str("er".into()),
            CategoryValue::Str("or".into()),
        ]
    );

    let statements = driver.statements();
    assert!(statements
        .iter()
        .any(|s| s.starts_with("CREATE TABLE \"visits\" (\"id\"")));
    assert!(statements.contains(&"CREATE INDEX ON \"visits\" (\"id\")".to_string()));
}

#[test]
fn relational_load_where_goes_through_a_dropped_temp_table() {
    let driver = Arc::new(RecordingDriver::default());
    RelationalStore::new(context(), driver.clone())
        .store(&sample())
        .unwrap();

    let store = RelationalStore::new(context(), driver.clone())
        .load_where(vec!["\"score\" > 0".into()]);
    assert_same_values(&store.load().unwrap(), &sample());

    let statements = driver.statements();
    assert!(statements.iter().any(|s| s.starts_with(
        "INSERT INTO \"t_visits\" (\"id\", \"ward\", \"score\") SELECT * FROM \"visits\" WHERE \"score\" > 0"
    )));
    assert!(statements.contains(&"DROP TABLE \"t_visits\"".to_string()));
    assert!(!driver.has_relation("t_visits").unwrap());
}

#[test]
fn relational_update_upserts_through_temp_table() {
    let driver = Arc::new(RecordingDriver::default());
    let store = RelationalStore::new(context(), driver.clone());
    store
        .store(&visits(&[1, 2, 3], &[Some("a"), Some("b"), Some("c")], &[1.0, 2.0, 3.0]))
        .unwrap();
    store
        .update(&visits(&[3, 4], &[Some("d"), Some("a")], &[30.0, 40.0]))
        .unwrap();

    let statements = driver.statements();
    let update = statements
        .iter()
        .position(|s| {
            s == "UPDATE \"visits\" SET \"id\" = \"t_visits\".\"id\", \"ward\" = \"t_visits\".\"ward\", \
                  \"score\" = \"t_visits\".\"score\" FROM \"t_visits\" WHERE \"visits\".\"id\" = \"t_visits\".\"id\""
        })
        .expect("update statement");
    assert!(statements[update + 1].starts_with(
        "INSERT INTO \"visits\" SELECT * FROM \"t_visits\" WHERE NOT EXISTS"
    ));
    assert_eq!(statements.last().unwrap(), "DROP TABLE \"t_visits\"");

    // New categories are appended to the persisted dictionary.
    let wards = store.load_categories().unwrap().get("ward").cloned().unwrap();
    assert_eq!(wards.last(), Some(&CategoryValue::Str("d".into())));
    assert_eq!(wards.len(), 4);
}

#[test]
fn relational_update_drops_temp_table_on_failure() {
    let driver = Arc::new(RecordingDriver::failing_on("UPDATE"));
    let store = RelationalStore::new(context(), driver.clone());
    store.store(&sample()).unwrap();

    let result = store.update(&visits(&[3], &[Some("er")], &[9.0]));
    assert!(matches!(result, Err(TabularError::Driver(_))));
    assert!(!driver.has_relation("t_visits").unwrap());
    assert_eq!(driver.statements().last().unwrap(), "DROP TABLE \"t_visits\"");
}

#[test]
fn relational_update_requires_an_index() {
    let schema = Schema::new(
        "visits",
        vec![
            Column::identifier("id"),
            Column::categorical("ward"),
            Column::numeric("score"),
        ],
        SchemaOptions::default(),
    )
    .unwrap();
    let driver = Arc::new(RecordingDriver::default());
    let store = RelationalStore::new(StoreContext::with_defaults(schema), driver);
    store.store(&sample()).unwrap();
    assert!(matches!(
        store.update(&sample()),
        Err(TabularError::MissingOption { .. })
    ));
}

#[test]
fn names_with_dots_are_stored_flat() {
    assert_eq!(physical_name("author.name"), "author__name");
    assert_eq!(logical_name("author__name"), "author.name");
}
