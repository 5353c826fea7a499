//! This file is the root of the `tabulon` Rust crate.
//!
//! tabulon keeps tables typed: every table that enters or leaves a store or a
//! transform is conformed against a declared [`Schema`](schema::Schema)
//! through the [`TypeRegistry`](registry::TypeRegistry). Its responsibilities
//! are split across:
//! 1.  `registry`, `schema` and `types`: semantic column types and conformance.
//! 2.  `store`: the storage engine and its backends.
//! 3.  `chunks`: splitting, merging and joining tables.
//! 4.  `transform`: typed transforms, pipelines and parallel execution.

//==================================================================================
// 0. Constants
//==================================================================================
/// The crate version, automatically set from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//==================================================================================
// 1. Module Declarations
//==================================================================================
#[macro_use]
mod observability; // Make macros available throughout the crate

pub mod chunks;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod schema;
pub mod store;
pub mod transform;
pub mod types;

#[doc(hidden)]
pub use log as __log;

//==================================================================================
// 2. Re-exports
//==================================================================================
pub use config::EngineConfig;
pub use error::TabularError;
pub use observability::init_logging;
pub use registry::TypeRegistry;
pub use schema::{Column, MultiSchema, Schema, SchemaOptions};
pub use store::{AppendableStore, DataStore, StoreContext};
pub use transform::{FnTransform, Pipeline, TableData, Transform, TransformExt};
pub use types::{SemanticType, StorageTarget};
