//! This module defines the core, strongly-typed vocabulary used throughout tabulon.
//!
//! It currently includes the `SemanticType` enum (the logical kind of a column) and
//! the `StorageTarget` tag that selects a physical encoding for a backend.

pub mod semantic_type;

// Re-export the main type(s) for easier access.
pub use semantic_type::{SemanticType, StorageTarget};
