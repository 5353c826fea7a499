// In: src/error.rs

//! This module defines the single, unified error type for the entire tabulon library.
//! It uses the `thiserror` crate to provide ergonomic, context-aware error handling.

use thiserror::Error;

use crate::types::{SemanticType, StorageTarget};

#[derive(Error, Debug)]
pub enum TabularError {
    // =========================================================================
    // === Schema & Type Conformance Errors
    // =========================================================================
    #[error("Table columns do not match schema '{schema}': missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        schema: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Invalid schema definition: {0}")]
    SchemaDefinition(String),

    #[error("Storage target '{target}' has no {handler} handler for column type {semantic_type}")]
    UnregisteredStorageTarget {
        semantic_type: SemanticType,
        target: StorageTarget,
        handler: &'static str,
    },

    #[error("Boolean column '{column}' has value {value} outside of {{0, 1, missing}}")]
    InvalidBooleanValue { column: String, value: String },

    #[error("Cannot convert column '{column}': {reason}")]
    Conversion { column: String, reason: String },

    // =========================================================================
    // === Storage Engine Errors
    // =========================================================================
    #[error("Cannot store an empty table in {store}; use update or append for zero-row writes")]
    EmptyStore { store: String },

    #[error("Nothing persisted at {0}")]
    NotFound(String),

    #[error("Compressed payload is malformed: {0}")]
    Codec(String),

    #[error("Dictionary sidecar {path} is corrupt: {reason}")]
    DictionarySidecarCorrupt { path: String, reason: String },

    #[error("Schema '{schema}' is missing the '{option}' option required for this operation")]
    MissingOption { schema: String, option: &'static str },

    #[error("Key column '{column}' holds duplicate key {key}")]
    DuplicateKey { column: String, key: String },

    // =========================================================================
    // === Transform Engine Errors
    // =========================================================================
    #[error("Invalid transform list: transform {upstream}'s output schema does not match transform {downstream}'s input schema.\n{upstream} output schema: {output_schema}\n{downstream} input schema: {input_schema}")]
    PipelineSchemaIncompatible {
        upstream: usize,
        downstream: usize,
        output_schema: String,
        input_schema: String,
    },

    #[error("Invalid transform list: empty")]
    EmptyPipeline,

    #[error("Stage #{stage} ({name}) of pipeline failed: {source}")]
    PipelineStageFailure {
        stage: usize,
        name: String,
        #[source]
        source: Box<TabularError>,
    },

    #[error("Parallel job for partition #{partition} failed: {source}")]
    ParallelJobFailure {
        partition: usize,
        #[source]
        source: Box<TabularError>,
    },

    // =========================================================================
    // === General Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// An error reported by an external driver (database, document store, object storage).
    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Internal logic error (this is a bug): {0}")]
    Internal(String),

    // =========================================================================
    // === External Error Wrappers (Using #[from] for automatic conversion)
    // =========================================================================
    /// An error originating from the Arrow library.
    #[error("Arrow operation failed: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// An error originating from the underlying I/O subsystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the Serde JSON library, typically manifests, sidecars and config.
    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl TabularError {
    /// Wraps this error as the failure of a pipeline stage.
    pub(crate) fn in_stage(self, stage: usize, name: &str) -> Self {
        TabularError::PipelineStageFailure {
            stage,
            name: name.to_string(),
            source: Box::new(self),
        }
    }

    /// Wraps this error as the failure of a parallel job.
    pub(crate) fn in_partition(self, partition: usize) -> Self {
        TabularError::ParallelJobFailure {
            partition,
            source: Box::new(self),
        }
    }

    pub(crate) fn conversion(column: &str, reason: impl Into<String>) -> Self {
        TabularError::Conversion {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}
