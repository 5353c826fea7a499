//! An encoded archive that grows by appending segments.
//!
//! On-disk layout for a store at `<path>`:
//! - `<path>.manifest`: JSON list of segments and their row ranges, plus
//!   the dictionary length of each coded column;
//! - `<path>_segment_<i>`: one IPC file per store or append, dictionary
//!   columns as `Int64` codes plus a `__row_index` column;
//! - `<path>_<column>_categories`: one [`DictionarySidecar`] per Categorical
//!   or Identifier column.
//!
//! Codes are only ever handed out at the end of a sidecar, so rows written
//! by earlier appends keep decoding to the same values.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int32Array, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int64Type, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::archive::{read_ipc_file, remove_if_present, write_ipc_file};
use super::sidecar::DictionarySidecar;
use super::{logical_name, physical_name, AppendableStore, ChunkIter, DataStore, StoreContext};
use crate::chunks::{self, dictionary, dictionary::CategoryDictionary};
use crate::error::TabularError;
use crate::schema::Column;
use crate::types::{SemanticType, StorageTarget};

/// Name of the persisted physical row index.
pub const ROW_INDEX_COLUMN: &str = "__row_index";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentEntry {
    pub segment: usize,
    pub row_start: u64,
    pub num_rows: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub segments: Vec<SegmentEntry>,
    /// Dictionary length of every coded column as of the last segment.
    #[serde(default)]
    pub categories: BTreeMap<String, usize>,
}

impl Manifest {
    pub fn total_rows(&self) -> u64 {
        self.segments.iter().map(|s| s.num_rows).sum()
    }

    /// How many categories of `column` the persisted codes may refer to.
    pub fn category_count(&self, column: &str) -> usize {
        self.categories.get(column).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct AppendableArchiveStore {
    context: StoreContext,
    path: PathBuf,
}

impl AppendableArchiveStore {
    pub fn new(context: StoreContext, path: impl Into<PathBuf>) -> Self {
        Self {
            context,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn suffixed(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn manifest_path(&self) -> PathBuf {
        self.suffixed(".manifest")
    }

    fn segment_path(&self, segment: usize) -> PathBuf {
        self.suffixed(&format!("_segment_{}", segment))
    }

    pub fn sidecar(&self, column: &str) -> DictionarySidecar {
        DictionarySidecar::new(self.suffixed(&format!("_{}_categories", physical_name(column))))
    }

    pub fn manifest(&self) -> Result<Manifest, TabularError> {
        let text = fs::read_to_string(self.manifest_path()).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TabularError::NotFound(self.describe()),
            _ => TabularError::Io(e),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<(), TabularError> {
        // Replaced by rename, never rewritten in place.
        let staging = self.suffixed(".manifest.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(manifest)?)?;
        fs::rename(&staging, self.manifest_path())?;
        Ok(())
    }

    /// Number of rows persisted so far.
    pub fn row_count(&self) -> Result<u64, TabularError> {
        if !self.exists()? {
            return Ok(0);
        }
        Ok(self.manifest()?.total_rows())
    }

    /// The persisted dictionary of one coded column.
    pub fn dictionary(&self, column: &str) -> Result<CategoryDictionary, TabularError> {
        let persisted = if self.exists()? {
            self.manifest()?.category_count(column)
        } else {
            0
        };
        self.sidecar(column).read_expecting(persisted)
    }

    fn coded_columns(&self) -> impl Iterator<Item = &Column> {
        self.schema().dictionary_columns()
    }

    fn read_dictionaries(
        &self,
        manifest: &Manifest,
    ) -> Result<HashMap<String, CategoryDictionary>, TabularError> {
        self.coded_columns()
            .map(|c| -> Result<(String, CategoryDictionary), TabularError> {
                let dict = self
                    .sidecar(&c.name)
                    .read_expecting(manifest.category_count(&c.name))?;
                Ok((c.name.clone(), dict))
            })
            .collect()
    }

    /// Encodes `table` against the sidecars, extending them with unseen
    /// values, and writes it as the next segment.
    fn write_segment(
        &self,
        table: &RecordBatch,
        manifest: &mut Manifest,
        dictionaries: &mut HashMap<String, CategoryDictionary>,
    ) -> Result<(), TabularError> {
        let row_start = manifest.total_rows();
        let rows = table.num_rows();
        let input = table.schema();

        let mut fields = Vec::with_capacity(table.num_columns() + 1);
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(table.num_columns() + 1);
        for (field, array) in input.fields().iter().zip(table.columns()) {
            let coded = self
                .schema()
                .column(field.name())
                .filter(|c| c.semantic_type.is_dictionary_coded());
            let array = match coded {
                Some(column) => {
                    let dict = dictionaries.entry(column.name.clone()).or_default();
                    let added = dictionary::extend_from_rows(dict, array)?;
                    self.sidecar(&column.name).append(&added)?;
                    manifest.categories.insert(column.name.clone(), dict.len());
                    cast(&dictionary::encode_keys(array, dict)?, &DataType::Int64)?
                }
                None => array.clone(),
            };
            fields.push(Field::new(physical_name(field.name()), array.data_type().clone(), true));
            columns.push(array);
        }
        let row_index: Int64Array = (row_start..row_start + rows as u64)
            .map(|i| Some(i as i64))
            .collect();
        fields.push(Field::new(ROW_INDEX_COLUMN, DataType::Int64, false));
        columns.push(Arc::new(row_index));

        let segment = RecordBatch::try_new_with_options(
            Arc::new(ArrowSchema::new(fields)),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(rows)),
        )?;
        let index = manifest.segments.len();
        write_ipc_file(&self.segment_path(index), &segment)?;
        manifest.segments.push(SegmentEntry {
            segment: index,
            row_start,
            num_rows: rows as u64,
        });
        self.write_manifest(manifest)?;
        log_metric!(
            "event" = "append_segment",
            "store" = self.path.display(),
            "segment" = index,
            "rows" = rows
        );
        Ok(())
    }

    /// Reads one segment and decodes its code columns through `dictionaries`.
    fn read_segment(
        &self,
        entry: &SegmentEntry,
        dictionaries: &HashMap<String, CategoryDictionary>,
    ) -> Result<RecordBatch, TabularError> {
        let segment = read_ipc_file(&self.segment_path(entry.segment))?;
        let stored = segment.schema();

        let mut fields = Vec::with_capacity(segment.num_columns());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(segment.num_columns());
        for (field, array) in stored.fields().iter().zip(segment.columns()) {
            if field.name() == ROW_INDEX_COLUMN {
                continue;
            }
            let name = self
                .schema()
                .columns()
                .iter()
                .find(|c| physical_name(&c.name) == *field.name())
                .map(|c| c.name.clone())
                .unwrap_or_else(|| logical_name(field.name()));
            let column = self.schema().column(&name);
            let array = match (column, dictionaries.get(&name)) {
                (Some(column), Some(dict)) if column.semantic_type.is_dictionary_coded() => {
                    self.decode_codes(column, array, dict)?
                }
                _ => array.clone(),
            };
            fields.push(Field::new(name, array.data_type().clone(), true));
            columns.push(array);
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::new(ArrowSchema::new(fields)),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(segment.num_rows())),
        )?)
    }

    fn decode_codes(
        &self,
        column: &Column,
        codes: &ArrayRef,
        dict: &CategoryDictionary,
    ) -> Result<ArrayRef, TabularError> {
        let codes = cast(codes, &DataType::Int64)?;
        let sidecar = self.sidecar(&column.name);
        let keys = codes
            .as_primitive::<Int64Type>()
            .iter()
            .map(|code| match code {
                None => Ok(None),
                Some(c) if c >= 0 && (c as usize) < dict.len() => Ok(Some(c as i32)),
                Some(c) => Err(TabularError::DictionarySidecarCorrupt {
                    path: sidecar.path().display().to_string(),
                    reason: format!(
                        "code {} in column '{}' is past the {} persisted categories",
                        c,
                        column.name,
                        dict.len()
                    ),
                }),
            })
            .collect::<Result<Int32Array, TabularError>>()?;
        let value_type = match column.semantic_type {
            SemanticType::Identifier => dict.value_type(),
            _ => DataType::Utf8,
        };
        dictionary::build(keys, dict.to_array_of(&value_type))
    }

    fn clear(&self) -> Result<(), TabularError> {
        let segments = match self.manifest() {
            Ok(manifest) => manifest.segments.len(),
            Err(TabularError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        remove_if_present(&self.manifest_path())?;
        let mut i = 0;
        while i < segments || self.segment_path(i).is_file() {
            remove_if_present(&self.segment_path(i))?;
            i += 1;
        }
        for column in self.coded_columns() {
            self.sidecar(&column.name).delete()?;
        }
        Ok(())
    }
}

impl DataStore for AppendableArchiveStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        StorageTarget::ColumnarArchiveEncoded
    }

    fn describe(&self) -> String {
        format!("appendable archive {}", self.path.display())
    }

    fn exists(&self) -> Result<bool, TabularError> {
        Ok(self.manifest_path().is_file())
    }

    fn delete(&self) -> Result<(), TabularError> {
        self.clear()
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let chunks: Vec<RecordBatch> = self.load_chunks_raw()?.collect::<Result<_, _>>()?;
        match chunks.as_slice() {
            [] => Ok(RecordBatch::new_empty(
                self.schema()
                    .arrow_schema(&StorageTarget::ColumnarArchiveEncoded, self.registry())?,
            )),
            [only] => Ok(only.clone()),
            many => chunks::merge(many),
        }
    }

    /// One chunk per persisted segment.
    fn load_chunks_raw(&self) -> Result<ChunkIter<'_>, TabularError> {
        let manifest = self.manifest()?;
        let dictionaries = self.read_dictionaries(&manifest)?;
        Ok(Box::new(
            manifest
                .segments
                .into_iter()
                .map(move |entry| self.read_segment(&entry, &dictionaries)),
        ))
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        if table.num_rows() == 0 {
            return Err(TabularError::EmptyStore {
                store: self.describe(),
            });
        }
        self.clear()?;
        let mut manifest = Manifest::default();
        let mut dictionaries = HashMap::new();
        self.write_segment(table, &mut manifest, &mut dictionaries)
    }

    fn store_chunks_raw(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        self.clear()?;
        let mut manifest = Manifest::default();
        let mut dictionaries = HashMap::new();
        for chunk in chunks {
            let chunk = chunk?;
            if chunk.num_rows() > 0 {
                self.write_segment(&chunk, &mut manifest, &mut dictionaries)?;
            }
        }
        if manifest.segments.is_empty() {
            return Err(TabularError::EmptyStore {
                store: self.describe(),
            });
        }
        Ok(())
    }
}

impl AppendableStore for AppendableArchiveStore {
    fn append_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        if table.num_rows() == 0 {
            return Ok(());
        }
        let mut manifest = self.manifest()?;
        let mut dictionaries = self.read_dictionaries(&manifest)?;
        self.write_segment(table, &mut manifest, &mut dictionaries)
    }
}

