//! Append-only dictionary files.
//!
//! A sidecar holds one category per line, JSON-encoded, in code order: line
//! `n` is the value of code `n`. It only ever grows at its end.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::chunks::dictionary::{CategoryDictionary, CategoryValue};
use crate::error::TabularError;

#[derive(Debug, Clone)]
pub struct DictionarySidecar {
    path: PathBuf,
}

impl DictionarySidecar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> TabularError {
        TabularError::DictionarySidecarCorrupt {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// The persisted dictionary. A missing file is an empty dictionary.
    pub fn read(&self) -> Result<CategoryDictionary, TabularError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CategoryDictionary::new())
            }
            Err(e) => return Err(self.corrupt(e.to_string())),
        };

        let mut values = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let value: CategoryValue = serde_json::from_str(line)
                .map_err(|e| self.corrupt(format!("line {}: {}", n + 1, e)))?;
            values.push(value);
        }
        CategoryDictionary::from_values(values).map_err(|e| self.corrupt(e.to_string()))
    }

    /// The persisted dictionary, which must hold at least the `persisted`
    /// categories that stored codes may point at. A missing file only counts
    /// as empty while nothing has been coded.
    pub fn read_expecting(&self, persisted: usize) -> Result<CategoryDictionary, TabularError> {
        if persisted > 0 && !self.path.is_file() {
            return Err(self.corrupt(format!(
                "missing, but {} categories are persisted",
                persisted
            )));
        }
        let dict = self.read()?;
        if dict.len() < persisted {
            return Err(self.corrupt(format!(
                "holds {} categories, but {} are persisted",
                dict.len(),
                persisted
            )));
        }
        Ok(dict)
    }

    /// Adds `values` at the end of the file.
    pub fn append(&self, values: &[CategoryValue]) -> Result<(), TabularError> {
        if values.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for value in values {
            serde_json::to_writer(&mut writer, value)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        log::debug!(
            "Appended {} categories to {}",
            values.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn delete(&self) -> Result<(), TabularError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
