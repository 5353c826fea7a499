//! CSV files with a header row, optionally zstd-compressed.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use arrow::record_batch::RecordBatch;

use super::{ChunkIter, DataStore, StoreContext};
use crate::chunks;
use crate::codec;
use crate::error::TabularError;
use crate::registry::handlers::FLAT_FILE_DATETIME_FORMAT;
use crate::types::StorageTarget;

#[derive(Debug)]
pub struct FlatFileStore {
    context: StoreContext,
    path: PathBuf,
    compressed: bool,
}

impl FlatFileStore {
    pub fn new(context: StoreContext, path: impl Into<PathBuf>) -> Self {
        Self {
            context,
            path: path.into(),
            compressed: false,
        }
    }

    /// Compress the file with zstd at the configured level.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw file contents, decompressed.
    fn read_bytes(&self) -> Result<Vec<u8>, TabularError> {
        let bytes = fs::read(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TabularError::NotFound(self.describe()),
            _ => TabularError::Io(e),
        })?;
        if self.compressed {
            codec::decode(&bytes)
        } else {
            Ok(bytes)
        }
    }

    /// Column types to parse the file with: the flat-file type of declared
    /// columns, text for anything else.
    fn read_schema(&self, bytes: &[u8]) -> Result<SchemaRef, TabularError> {
        let (header, _) = Format::default()
            .with_header(true)
            .infer_schema(Cursor::new(bytes), Some(0))?;
        let fields: Vec<Field> = header
            .fields()
            .iter()
            .map(|f| -> Result<Field, TabularError> {
                let data_type = match self.schema().column(f.name()) {
                    Some(column) => {
                        let physical = self
                            .registry()
                            .metadata(column, &StorageTarget::FlatFile)?
                            .physical_type;
                        if physical == DataType::Null {
                            DataType::Utf8
                        } else {
                            physical
                        }
                    }
                    None => DataType::Utf8,
                };
                Ok(Field::new(f.name(), data_type, true))
            })
            .collect::<Result<_, _>>()?;
        Ok(Arc::new(ArrowSchema::new(fields)))
    }

    fn reader(
        &self,
    ) -> Result<(SchemaRef, arrow::csv::Reader<Cursor<Vec<u8>>>), TabularError> {
        let bytes = self.read_bytes()?;
        let schema = self.read_schema(&bytes)?;
        let reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_batch_size(self.context.config.chunk_size_rows.max(1))
            .build(Cursor::new(bytes))?;
        Ok((schema, reader))
    }

    /// Writes every chunk into one CSV payload, then to disk.
    fn write_all(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        let mut payload: Vec<u8> = Vec::new();
        let mut rows = 0;
        {
            let mut writer = WriterBuilder::new()
                .with_header(true)
                .with_timestamp_format(FLAT_FILE_DATETIME_FORMAT.to_string())
                .build(&mut payload);
            let mut wrote_any = false;
            for chunk in chunks {
                let chunk = chunk?;
                rows += chunk.num_rows();
                writer.write(&chunk)?;
                wrote_any = true;
            }
            if !wrote_any {
                let empty = RecordBatch::new_empty(
                    self.schema()
                        .arrow_schema(&StorageTarget::FlatFile, self.registry())?,
                );
                writer.write(&empty)?;
            }
        }

        let bytes = if self.compressed {
            codec::encode(&payload, self.context.config.flat_file_compression_level)?
        } else {
            payload
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = BufWriter::new(File::create(&self.path)?);
        file.write_all(&bytes)?;
        file.flush()?;
        log::debug!(
            "Wrote {} rows ({} bytes) to {}",
            rows,
            bytes.len(),
            self.describe()
        );
        Ok(())
    }
}

impl DataStore for FlatFileStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        StorageTarget::FlatFile
    }

    fn describe(&self) -> String {
        format!("flat file {}", self.path.display())
    }

    fn exists(&self) -> Result<bool, TabularError> {
        Ok(self.path.is_file())
    }

    fn delete(&self) -> Result<(), TabularError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let (schema, reader) = self.reader()?;
        let mut batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>()?;
        match batches.len() {
            0 => Ok(RecordBatch::new_empty(schema)),
            1 => Ok(batches.remove(0)),
            _ => chunks::merge(&batches),
        }
    }

    fn load_chunks_raw(&self) -> Result<ChunkIter<'_>, TabularError> {
        let (_, reader) = self.reader()?;
        Ok(Box::new(reader.map(|batch| batch.map_err(TabularError::from))))
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        self.write_all(Box::new(std::iter::once(Ok(table.clone()))))
    }

    fn store_chunks_raw(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        self.write_all(chunks)
    }
}
