//! Declared column typings and their conformance rules.
//!
//! A [`Schema`] names a table's columns and their [`SemanticType`]s. Conforming a
//! `RecordBatch` against a schema for a [`StorageTarget`] checks the column set,
//! coerces every declared column into the target's physical representation via
//! the [`TypeRegistry`](crate::registry::TypeRegistry), and applies the declared
//! sort order. See `conform.rs` for the mechanics.

mod conform;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::{Field, Schema as ArrowSchema, SchemaRef};
use arrow::record_batch::RecordBatch;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::error::TabularError;
use crate::registry::{ColumnMetadata, TypeRegistry};
use crate::types::{SemanticType, StorageTarget};

pub use conform::ConformOptions;

/// Name used by [`Schema::anonymous_partial`].
pub const ANONYMOUS_PARTIAL_NAME: &str = "anon_partial_schema";

/// A named, typed column. Equality is (name, semantic type).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: String,
    pub semantic_type: SemanticType,
}

impl Column {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
        }
    }

    pub fn categorical(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Categorical)
    }

    pub fn identifier(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Identifier)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Datetime)
    }

    pub fn duration(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Duration)
    }

    pub fn epoch_datetime(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::EpochDatetime)
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Numeric)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Boolean)
    }

    pub fn raw(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Raw)
    }

    /// A copy of this column under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.semantic_type)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.semantic_type)
    }
}

/// Whether a table must hold exactly the declared columns or at least them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    Full,
    Partial,
}

/// Optional behaviour attached to a schema. Options do not take part in
/// schema equality.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SchemaOptions {
    /// Composite sort key every conformed table is ordered by.
    pub order_by: Option<Vec<String>>,
    /// Natural key used by `update` and relational indexes.
    pub index: Option<String>,
    /// Namespace tag used by `Schema::union` with prefixing.
    pub prefix: Option<String>,
    /// Relational schema (namespace) the table lives in.
    pub db_schema: Option<String>,
    /// Create relational tables as temporary.
    pub temporary: bool,
    /// Identifier columns holding one value rather than a collection.
    pub single_foreign_keys: Vec<String>,
}

/// A declared table typing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Schema {
    name: String,
    columns: Vec<Column>,
    options: SchemaOptions,
    kind: SchemaKind,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.columns == other.columns
    }
}

impl Eq for Schema {}

/// Settings for [`Schema::union`].
#[derive(Debug, Clone, Default)]
pub struct UnionOptions {
    /// Prefix every column with its schema's `prefix` option and a dot.
    pub with_prefix: bool,
    /// Column names (after prefixing) left out of the union.
    pub drop: Vec<String>,
    /// Columns appended after the united ones.
    pub add: Vec<Column>,
    /// (old, new) column renames applied after prefixing.
    pub rename: Vec<(String, String)>,
    /// Name of the new schema; defaults to `union_<a>_<b>...`.
    pub name: Option<String>,
    pub options: Option<SchemaOptions>,
}

impl Schema {
    /// A full schema: conforming tables must hold exactly these columns.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        options: SchemaOptions,
    ) -> Result<Self, TabularError> {
        Self::with_kind(SchemaKind::Full, name, columns, options)
    }

    /// A partial schema: conforming tables must hold at least these columns.
    pub fn partial(
        name: impl Into<String>,
        columns: Vec<Column>,
        options: SchemaOptions,
    ) -> Result<Self, TabularError> {
        Self::with_kind(SchemaKind::Partial, name, columns, options)
    }

    /// A partial schema with no columns; every table conforms to it.
    pub fn anonymous_partial() -> Self {
        Self {
            name: ANONYMOUS_PARTIAL_NAME.to_string(),
            columns: Vec::new(),
            options: SchemaOptions::default(),
            kind: SchemaKind::Partial,
        }
    }

    pub fn with_kind(
        kind: SchemaKind,
        name: impl Into<String>,
        columns: Vec<Column>,
        options: SchemaOptions,
    ) -> Result<Self, TabularError> {
        let schema = Self {
            name: name.into(),
            columns,
            options,
            kind,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<(), TabularError> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(TabularError::SchemaDefinition(format!(
                    "schema '{}' declares column '{}' twice",
                    self.name, column.name
                )));
            }
        }
        for key in &self.options.single_foreign_keys {
            match self.column(key) {
                Some(c) if c.semantic_type == SemanticType::Identifier => {}
                _ => {
                    return Err(TabularError::SchemaDefinition(format!(
                        "single foreign key '{}' of schema '{}' is not a declared identifier column",
                        key, self.name
                    )))
                }
            }
        }
        let referenced = self
            .options
            .order_by
            .iter()
            .flatten()
            .chain(self.options.index.iter());
        for name in referenced {
            if self.column(name).is_none() {
                return Err(TabularError::SchemaDefinition(format!(
                    "option of schema '{}' refers to undeclared column '{}'",
                    self.name, name
                )));
            }
        }
        if matches!(&self.options.order_by, Some(keys) if keys.is_empty()) {
            return Err(TabularError::SchemaDefinition(format!(
                "order_by of schema '{}' is empty",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns carrying a category dictionary.
    pub fn dictionary_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| c.semantic_type.is_dictionary_coded())
    }

    /// The `index` option, required by keyed operations.
    pub fn index_column(&self) -> Result<&str, TabularError> {
        self.options
            .index
            .as_deref()
            .ok_or_else(|| TabularError::MissingOption {
                schema: self.name.clone(),
                option: "index",
            })
    }

    /// Physical metadata of every declared column for `target`.
    pub fn metadata(
        &self,
        target: &StorageTarget,
        registry: &TypeRegistry,
    ) -> Result<Vec<ColumnMetadata>, TabularError> {
        self.columns
            .iter()
            .map(|c| registry.metadata(c, target))
            .collect()
    }

    /// The Arrow schema a table conformed for `target` carries (declared
    /// columns only, all nullable).
    pub fn arrow_schema(
        &self,
        target: &StorageTarget,
        registry: &TypeRegistry,
    ) -> Result<SchemaRef, TabularError> {
        let fields: Vec<Field> = self
            .metadata(target, registry)?
            .into_iter()
            .map(|m| Field::new(m.name, m.physical_type, true))
            .collect();
        Ok(Arc::new(ArrowSchema::new(fields)))
    }

    /// Conforms `table` to this schema for `target`.
    pub fn conform(
        &self,
        table: &RecordBatch,
        target: &StorageTarget,
        registry: &TypeRegistry,
    ) -> Result<RecordBatch, TabularError> {
        conform::conform(self, table, target, registry, ConformOptions::default())
    }

    /// [`Schema::conform`] with explicit options.
    pub fn conform_with(
        &self,
        table: &RecordBatch,
        target: &StorageTarget,
        registry: &TypeRegistry,
        options: ConformOptions,
    ) -> Result<RecordBatch, TabularError> {
        conform::conform(self, table, target, registry, options)
    }

    /// Builds one schema from the columns of several.
    pub fn union(schemas: &[&Schema], opts: UnionOptions) -> Result<Schema, TabularError> {
        let renames: HashMap<&str, &str> = opts
            .rename
            .iter()
            .map(|(from, to)| (from.as_str(), to.as_str()))
            .collect();
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        let mut kind = SchemaKind::Full;

        for schema in schemas {
            if schema.kind == SchemaKind::Partial {
                kind = SchemaKind::Partial;
            }
            for column in &schema.columns {
                let mut name = if opts.with_prefix {
                    let prefix = schema.options.prefix.as_deref().ok_or_else(|| {
                        TabularError::MissingOption {
                            schema: schema.name.clone(),
                            option: "prefix",
                        }
                    })?;
                    format!("{}.{}", prefix, column.name)
                } else {
                    column.name.clone()
                };
                if seen.contains(&name) || opts.drop.contains(&name) {
                    continue;
                }
                seen.insert(name.clone());
                if let Some(renamed) = renames.get(name.as_str()) {
                    name = renamed.to_string();
                }
                columns.push(column.renamed(name));
            }
        }
        columns.extend(opts.add.iter().cloned());

        let name = opts.name.unwrap_or_else(|| {
            let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
            format!("union_{}", names.join("_"))
        });
        Schema::with_kind(kind, name, columns, opts.options.unwrap_or_default())
    }

    /// A copy with a new name, some columns renamed, and `options` (when given)
    /// replacing the current options.
    pub fn renamed(
        &self,
        new_name: Option<&str>,
        rename_cols: &[(&str, &str)],
        options: Option<SchemaOptions>,
    ) -> Result<Schema, TabularError> {
        let renames: HashMap<&str, &str> = rename_cols.iter().copied().collect();
        let columns = self
            .columns
            .iter()
            .map(|c| match renames.get(c.name.as_str()) {
                Some(to) => c.renamed(*to),
                None => c.clone(),
            })
            .collect();
        let options = options.unwrap_or_else(|| {
            let rename = |n: &String| renames.get(n.as_str()).map(|s| s.to_string()).unwrap_or_else(|| n.clone());
            let mut carried = self.options.clone();
            carried.order_by = carried.order_by.map(|keys| keys.iter().map(rename).collect());
            carried.index = carried.index.as_ref().map(rename);
            carried.single_foreign_keys = carried.single_foreign_keys.iter().map(rename).collect();
            carried
        });
        Schema::with_kind(
            self.kind,
            new_name.unwrap_or(&self.name),
            columns,
            options,
        )
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SchemaKind::Full => "Schema",
            SchemaKind::Partial => "PartialSchema",
        };
        let columns: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        write!(f, "{}(\"{}\", [{}])", kind, self.name, columns.join(", "))
    }
}

/// A non-empty named set of schemas for transforms over several tables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MultiSchema {
    schemas: BTreeMap<String, Schema>,
}

impl MultiSchema {
    pub fn new(schemas: BTreeMap<String, Schema>) -> Result<Self, TabularError> {
        if schemas.is_empty() {
            return Err(TabularError::SchemaDefinition(
                "a multi-schema needs at least one sub-schema".into(),
            ));
        }
        Ok(Self { schemas })
    }

    pub fn get(&self, key: &str) -> Option<&Schema> {
        self.schemas.get(key)
    }

    pub fn schemas(&self) -> &BTreeMap<String, Schema> {
        &self.schemas
    }

    /// Conforms each table against its sub-schema. The key sets must match.
    pub fn conform(
        &self,
        data: &BTreeMap<String, RecordBatch>,
        target: &StorageTarget,
        registry: &TypeRegistry,
    ) -> Result<BTreeMap<String, RecordBatch>, TabularError> {
        let missing: Vec<String> = self
            .schemas
            .keys()
            .filter(|k| !data.contains_key(*k))
            .cloned()
            .collect();
        let unexpected: Vec<String> = data
            .keys()
            .filter(|k| !self.schemas.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(TabularError::SchemaMismatch {
                schema: self.to_string(),
                missing,
                unexpected,
            });
        }
        self.schemas
            .iter()
            .map(|(key, schema)| Ok((key.clone(), schema.conform(&data[key], target, registry)?)))
            .collect()
    }
}

impl fmt::Display for MultiSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .schemas
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        write!(f, "MultiSchema({{{}}})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests;
