//! Columnar archives: Arrow IPC files on local disk.
//!
//! A stored table lives at `<path>`. Chunked stores write one file per chunk
//! at `<path>_chunk_<i>`, numbered from zero without gaps.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;

use super::{ChunkIter, DataStore, StoreContext};
use crate::chunks;
use crate::error::TabularError;
use crate::types::StorageTarget;

//==================================================================================
// 1. IPC helpers, shared with the appendable and object archives
//==================================================================================

/// Gives every dictionary field of `batch` its own dictionary id. The IPC
/// writer tracks dictionaries by id, so two coded columns sharing one would
/// read back with the same values.
pub(crate) fn with_unique_dictionary_ids(batch: &RecordBatch) -> Result<RecordBatch, TabularError> {
    let schema = batch.schema();
    let mut next_id = 0i64;
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| match f.data_type() {
            DataType::Dictionary(_, _) => {
                next_id += 1;
                Field::new_dict(f.name(), f.data_type().clone(), true, next_id, false)
            }
            _ => Field::new(f.name(), f.data_type().clone(), true),
        })
        .collect();
    Ok(RecordBatch::try_new(
        Arc::new(ArrowSchema::new(fields)),
        batch.columns().to_vec(),
    )?)
}

/// Writes `batch` as a single-batch IPC file into `writer`.
pub(crate) fn write_ipc<W: Write>(writer: W, batch: &RecordBatch) -> Result<(), TabularError> {
    let batch = with_unique_dictionary_ids(batch)?;
    let mut writer = FileWriter::try_new(writer, &batch.schema())?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(())
}

/// Reads every batch of an IPC file, merged into one table.
pub(crate) fn read_ipc<R: Read + Seek>(reader: R) -> Result<RecordBatch, TabularError> {
    let reader = FileReader::try_new(reader, None)?;
    let schema = reader.schema();
    let mut batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>()?;
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(schema)),
        1 => Ok(batches.remove(0)),
        _ => chunks::merge(&batches),
    }
}

pub(crate) fn write_ipc_file(path: &Path, batch: &RecordBatch) -> Result<(), TabularError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = BufWriter::new(File::create(path)?);
    write_ipc(&mut file, batch)?;
    file.flush()?;
    Ok(())
}

pub(crate) fn read_ipc_file(path: &Path) -> Result<RecordBatch, TabularError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TabularError::NotFound(path.display().to_string()),
        _ => TabularError::Io(e),
    })?;
    read_ipc(BufReader::new(file))
}

pub(crate) fn remove_if_present(path: &Path) -> Result<(), TabularError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

//==================================================================================
// 2. The store
//==================================================================================

#[derive(Debug)]
pub struct ArchiveStore {
    context: StoreContext,
    path: PathBuf,
    encoded: bool,
}

impl ArchiveStore {
    pub fn new(context: StoreContext, path: impl Into<PathBuf>) -> Self {
        Self {
            context,
            path: path.into(),
            encoded: false,
        }
    }

    /// Keep dictionary columns coded on disk (`ColumnarArchiveEncoded`).
    pub fn encoded(mut self, encoded: bool) -> Self {
        self.encoded = encoded;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_path(&self, i: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!("_chunk_{}", i));
        PathBuf::from(name)
    }

    /// Paths of the persisted chunk files, in order.
    pub fn chunk_paths(&self) -> Vec<PathBuf> {
        (0..)
            .map(|i| self.chunk_path(i))
            .take_while(|p| p.is_file())
            .collect()
    }

    /// One store per persisted chunk file, sharing this store's context.
    pub fn chunk_stores(&self) -> Vec<ArchiveStore> {
        self.chunk_paths()
            .into_iter()
            .map(|p| ArchiveStore::new(self.context.clone(), p).encoded(self.encoded))
            .collect()
    }

    /// Removes every chunk file.
    pub fn delete_chunks(&self) -> Result<(), TabularError> {
        for path in self.chunk_paths() {
            remove_if_present(&path)?;
        }
        Ok(())
    }
}

impl DataStore for ArchiveStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        if self.encoded {
            StorageTarget::ColumnarArchiveEncoded
        } else {
            StorageTarget::ColumnarArchive
        }
    }

    fn describe(&self) -> String {
        format!("archive {}", self.path.display())
    }

    fn exists(&self) -> Result<bool, TabularError> {
        Ok(self.path.is_file() || self.chunk_path(0).is_file())
    }

    fn delete(&self) -> Result<(), TabularError> {
        remove_if_present(&self.path)?;
        self.delete_chunks()
    }

    /// The main file, or the merged chunk files of a chunked store.
    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let paths = self.chunk_paths();
        if self.path.is_file() || paths.is_empty() {
            return read_ipc_file(&self.path);
        }
        let chunks = paths
            .iter()
            .map(|p| read_ipc_file(p))
            .collect::<Result<Vec<_>, _>>()?;
        chunks::merge(&chunks)
    }

    /// Reads the chunk files in order. A store written by a plain `store` has
    /// none; its table is split instead.
    fn load_chunks_raw(&self) -> Result<ChunkIter<'_>, TabularError> {
        let paths = self.chunk_paths();
        if paths.is_empty() && self.path.is_file() {
            let table = self.load_raw()?;
            let chunks = chunks::split(&table, self.context.config.chunk_size_rows)?;
            return Ok(Box::new(chunks.map(Ok)));
        }
        Ok(Box::new(paths.into_iter().map(|p| {
            log::debug!("Reading archive chunk {}", p.display());
            read_ipc_file(&p)
        })))
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        if table.num_rows() == 0 {
            return Err(TabularError::EmptyStore {
                store: self.describe(),
            });
        }
        self.delete_chunks()?;
        write_ipc_file(&self.path, table)
    }

    fn store_chunks_raw(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        remove_if_present(&self.path)?;
        self.delete_chunks()?;
        let mut written = 0;
        for chunk in chunks {
            let chunk = chunk?;
            if chunk.num_rows() == 0 {
                continue;
            }
            let path = self.chunk_path(written);
            write_ipc_file(&path, &chunk)?;
            log::debug!("Wrote {} rows to {}", chunk.num_rows(), path.display());
            written += 1;
        }
        if written == 0 {
            return Err(TabularError::EmptyStore {
                store: self.describe(),
            });
        }
        Ok(())
    }
}
