//! The transform engine.
//!
//! A [`Transform`] is a typed function between tables. Implementors provide
//! the unchecked hooks; callers go through [`TransformExt`], which conforms
//! data against the declared schemas on the way in and out.

pub mod caching;
pub mod parallel;
pub mod pipeline;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use crate::error::TabularError;
use crate::registry::TypeRegistry;
use crate::schema::{MultiSchema, Schema};
use crate::types::StorageTarget;

pub use caching::CachingTransform;
pub use parallel::ParallelTransform;
pub use pipeline::Pipeline;

//==================================================================================
// I. Data & Schemas
//==================================================================================

/// The schema(s) a transform consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSpec {
    Single(Schema),
    Multi(MultiSchema),
}

impl SchemaSpec {
    pub fn conform(
        &self,
        data: &TableData,
        target: &StorageTarget,
        registry: &TypeRegistry,
    ) -> Result<TableData, TabularError> {
        match (self, data) {
            (SchemaSpec::Single(schema), TableData::Single(table)) => {
                Ok(TableData::Single(schema.conform(table, target, registry)?))
            }
            (SchemaSpec::Multi(schemas), TableData::Multi(tables)) => {
                Ok(TableData::Multi(schemas.conform(tables, target, registry)?))
            }
            (SchemaSpec::Single(schema), TableData::Multi(_)) => Err(TabularError::InvalidArgument(
                format!("schema '{}' expects one table, got several", schema.name()),
            )),
            (SchemaSpec::Multi(schemas), TableData::Single(_)) => Err(TabularError::InvalidArgument(
                format!("schema {} expects several tables, got one", schemas),
            )),
        }
    }
}

impl From<Schema> for SchemaSpec {
    fn from(schema: Schema) -> Self {
        SchemaSpec::Single(schema)
    }
}

impl From<MultiSchema> for SchemaSpec {
    fn from(schemas: MultiSchema) -> Self {
        SchemaSpec::Multi(schemas)
    }
}

impl fmt::Display for SchemaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaSpec::Single(schema) => write!(f, "{}", schema),
            SchemaSpec::Multi(schemas) => write!(f, "{}", schemas),
        }
    }
}

/// One table, or several keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub enum TableData {
    Single(RecordBatch),
    Multi(BTreeMap<String, RecordBatch>),
}

impl TableData {
    pub fn into_single(self) -> Result<RecordBatch, TabularError> {
        match self {
            TableData::Single(table) => Ok(table),
            TableData::Multi(tables) => Err(TabularError::InvalidArgument(format!(
                "expected one table, got {:?}",
                tables.keys().collect::<Vec<_>>()
            ))),
        }
    }

    pub fn into_multi(self) -> Result<BTreeMap<String, RecordBatch>, TabularError> {
        match self {
            TableData::Multi(tables) => Ok(tables),
            TableData::Single(_) => Err(TabularError::InvalidArgument(
                "expected several tables, got one".into(),
            )),
        }
    }

    /// Total rows across every table.
    pub fn num_rows(&self) -> usize {
        match self {
            TableData::Single(table) => table.num_rows(),
            TableData::Multi(tables) => tables.values().map(RecordBatch::num_rows).sum(),
        }
    }
}

impl From<RecordBatch> for TableData {
    fn from(table: RecordBatch) -> Self {
        TableData::Single(table)
    }
}

impl From<BTreeMap<String, RecordBatch>> for TableData {
    fn from(tables: BTreeMap<String, RecordBatch>) -> Self {
        TableData::Multi(tables)
    }
}

//==================================================================================
// II. The Transform Contract
//==================================================================================

/// A typed operation from input table(s) to output table(s).
pub trait Transform: Send + Sync {
    fn input_schema(&self) -> SchemaSpec;

    /// Defaults to a partial schema every table satisfies.
    fn output_schema(&self) -> SchemaSpec {
        SchemaSpec::Single(Schema::anonymous_partial())
    }

    /// Reads this transform's own input, when it has a source.
    fn load_unchecked(&self) -> Result<TableData, TabularError> {
        Err(TabularError::Unsupported(format!(
            "transform '{}' has no data source to load from",
            self.name()
        )))
    }

    /// The operation itself, on data already conformed to the input schema.
    fn apply_unchecked(&self, data: TableData) -> Result<TableData, TabularError>;

    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Registry used to conform data against this transform's schemas.
    fn registry(&self) -> Arc<TypeRegistry> {
        TypeRegistry::standard()
    }
}

/// The checked entry points of every [`Transform`].
pub trait TransformExt: Transform {
    /// Loads the input, conformed to the input schema.
    fn load(&self) -> Result<TableData, TabularError> {
        let data = self.load_unchecked()?;
        self.input_schema()
            .conform(&data, &StorageTarget::Default, &self.registry())
    }

    /// Conforms `data` to the input schema, applies the transform and
    /// conforms the result to the output schema.
    fn apply(&self, data: TableData) -> Result<TableData, TabularError> {
        let registry = self.registry();
        let input = self
            .input_schema()
            .conform(&data, &StorageTarget::Default, &registry)?;
        let rows_in = input.num_rows();
        let output = self.apply_unchecked(input)?;
        let output = self
            .output_schema()
            .conform(&output, &StorageTarget::Default, &registry)?;
        log::info!(
            "Transform {} turned {} rows into {}",
            self.name(),
            rows_in,
            output.num_rows()
        );
        Ok(output)
    }

    fn load_apply(&self) -> Result<TableData, TabularError> {
        self.apply(self.load()?)
    }
}

impl<T: Transform + ?Sized> TransformExt for T {}

//==================================================================================
// III. Closures as Transforms
//==================================================================================

type ApplyFn = Box<dyn Fn(TableData) -> Result<TableData, TabularError> + Send + Sync>;
type LoadFn = Box<dyn Fn() -> Result<TableData, TabularError> + Send + Sync>;

/// A transform assembled from closures.
///
/// ```ignore
/// let double = FnTransform::new("double", input, output, |data| {
///     // ...
///     Ok(data)
/// });
/// ```
pub struct FnTransform {
    name: String,
    input: SchemaSpec,
    output: SchemaSpec,
    apply: ApplyFn,
    load: Option<LoadFn>,
    registry: Arc<TypeRegistry>,
}

impl FnTransform {
    pub fn new<F>(
        name: impl Into<String>,
        input: impl Into<SchemaSpec>,
        output: impl Into<SchemaSpec>,
        apply: F,
    ) -> Self
    where
        F: Fn(TableData) -> Result<TableData, TabularError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            apply: Box::new(apply),
            load: None,
            registry: TypeRegistry::standard(),
        }
    }

    /// A single-table transform: `apply` sees and returns one table.
    pub fn single<F>(
        name: impl Into<String>,
        input: Schema,
        output: Schema,
        apply: F,
    ) -> Self
    where
        F: Fn(RecordBatch) -> Result<RecordBatch, TabularError> + Send + Sync + 'static,
    {
        Self::new(name, input, output, move |data: TableData| {
            Ok(TableData::Single(apply(data.into_single()?)?))
        })
    }

    pub fn with_load<F>(mut self, load: F) -> Self
    where
        F: Fn() -> Result<TableData, TabularError> + Send + Sync + 'static,
    {
        self.load = Some(Box::new(load));
        self
    }

    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

impl Transform for FnTransform {
    fn input_schema(&self) -> SchemaSpec {
        self.input.clone()
    }

    fn output_schema(&self) -> SchemaSpec {
        self.output.clone()
    }

    fn load_unchecked(&self) -> Result<TableData, TabularError> {
        match &self.load {
            Some(load) => load(),
            None => Err(TabularError::Unsupported(format!(
                "transform '{}' has no data source to load from",
                self.name
            ))),
        }
    }

    fn apply_unchecked(&self, data: TableData) -> Result<TableData, TabularError> {
        (self.apply)(data)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn registry(&self) -> Arc<TypeRegistry> {
        self.registry.clone()
    }
}

impl fmt::Debug for FnTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransform")
            .field("name", &self.name)
            .field("input", &self.input.to_string())
            .field("output", &self.output.to_string())
            .finish()
    }
}
