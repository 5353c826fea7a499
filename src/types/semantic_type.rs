//! This module defines the canonical, type-safe representation of semantic column
//! types and storage targets used throughout tabulon.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The logical kind of a column, independent of its physical encoding.
///
/// The physical Arrow representation of each kind depends on the
/// [`StorageTarget`] the column is conformed against; see the registry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    /// Low-cardinality text values, dictionary coded.
    Categorical,
    /// Entity identifiers (integers or text), dictionary coded.
    Identifier,
    /// Nanosecond-precision timestamps.
    Datetime,
    /// Nanosecond-precision durations.
    Duration,
    /// Timestamps whose range exceeds nanosecond precision; millisecond resolution.
    EpochDatetime,
    /// Floating point numbers.
    Numeric,
    /// Strict booleans: only 0, 1 or missing are accepted.
    Boolean,
    /// Anything; passed through untouched where the target allows it.
    Raw,
}

impl SemanticType {
    /// All semantic types, in declaration order.
    pub const ALL: [SemanticType; 8] = [
        SemanticType::Categorical,
        SemanticType::Identifier,
        SemanticType::Datetime,
        SemanticType::Duration,
        SemanticType::EpochDatetime,
        SemanticType::Numeric,
        SemanticType::Boolean,
        SemanticType::Raw,
    ];

    /// Returns `true` if columns of this type carry a category dictionary.
    pub fn is_dictionary_coded(&self) -> bool {
        matches!(self, Self::Categorical | Self::Identifier)
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A tag selecting which physical encoding rules apply when a table is read from
/// or written to a particular backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StorageTarget {
    /// The in-memory representation every `load` returns.
    Default,
    /// Delimited text files.
    FlatFile,
    /// Arrow IPC archive with categoricals stored as plain text.
    ColumnarArchive,
    /// Arrow IPC archive keeping categorical dictionaries.
    ColumnarArchiveEncoded,
    /// Relational tables with plain text categoricals.
    Relational,
    /// Relational tables with integer-coded categoricals.
    RelationalEncoded,
    /// A target introduced by registering handlers under a new name.
    Custom(String),
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::Default => write!(f, "default"),
            StorageTarget::FlatFile => write!(f, "flat-file"),
            StorageTarget::ColumnarArchive => write!(f, "columnar-archive"),
            StorageTarget::ColumnarArchiveEncoded => write!(f, "columnar-archive-encoded"),
            StorageTarget::Relational => write!(f, "relational"),
            StorageTarget::RelationalEncoded => write!(f, "relational-encoded"),
            StorageTarget::Custom(name) => write!(f, "{}", name),
        }
    }
}
