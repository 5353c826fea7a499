//! Tables in a relational database, reached through a [`RelationalDriver`].
//!
//! Column and table names are stored with `.` replaced by `__`. With
//! categorical encoding on (the default) categorical columns are stored as
//! integer codes and their dictionaries as JSON in the `table_categories`
//! relation, one row per table.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int32Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int64Type, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use super::{logical_name, physical_name, ChunkIter, DataStore, StoreContext};
use crate::chunks::{self, dictionary, dictionary::CategoryDictionary, dictionary::CategoryValue};
use crate::error::TabularError;
use crate::types::{SemanticType, StorageTarget};

/// Relation holding the category dictionaries of encoded tables.
pub const CATEGORIES_RELATION: &str = "table_categories";

/// The database operations the store needs.
pub trait RelationalDriver: Send + Sync {
    /// Runs one statement and returns the number of rows it affected.
    fn execute(&self, sql: &str) -> Result<u64, TabularError>;

    fn query(&self, sql: &str) -> Result<RecordBatch, TabularError>;

    fn has_relation(&self, name: &str) -> Result<bool, TabularError>;

    /// Appends the rows of `batch` to `relation` (PostgreSQL: `COPY ... FROM`).
    fn bulk_load(&self, relation: &str, batch: &RecordBatch) -> Result<(), TabularError>;

    /// Reads every row of `relation` (PostgreSQL: `COPY ... TO`).
    fn bulk_unload(&self, relation: &str) -> Result<RecordBatch, TabularError>;
}

type Categories = BTreeMap<String, Vec<CategoryValue>>;

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub struct RelationalStore {
    context: StoreContext,
    driver: Arc<dyn RelationalDriver>,
    table: String,
    encode_categoricals: bool,
    load_where: Vec<String>,
}

impl RelationalStore {
    pub fn new(context: StoreContext, driver: Arc<dyn RelationalDriver>) -> Self {
        let table = physical_name(context.schema.name());
        Self {
            context,
            driver,
            table,
            encode_categoricals: true,
            load_where: Vec::new(),
        }
    }

    pub fn encode_categoricals(mut self, encode: bool) -> Self {
        self.encode_categoricals = encode;
        self
    }

    /// SQL conditions (joined with `AND`) restricting which rows `load` returns.
    pub fn load_where(mut self, conditions: Vec<String>) -> Self {
        self.load_where = conditions;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn temp_name(&self) -> String {
        format!("t_{}", self.table)
    }

    fn physical_columns(&self) -> Vec<String> {
        self.schema()
            .columns()
            .iter()
            .map(|c| physical_name(&c.name))
            .collect()
    }

    /// `"column" TYPE` clauses for every declared column.
    pub fn column_ddl(&self) -> Result<Vec<String>, TabularError> {
        let target = self.storage_target();
        self.schema()
            .columns()
            .iter()
            .map(|c| -> Result<String, TabularError> {
                let metadata = self.registry().metadata(c, &target)?;
                Ok(format!(
                    "{} {}",
                    quote(&physical_name(&c.name)),
                    metadata.ddl.as_deref().unwrap_or("TEXT")
                ))
            })
            .collect()
    }

    fn create_table(&self, name: &str, temporary: bool) -> Result<(), TabularError> {
        if self.driver.has_relation(name)? {
            self.drop_table(name)?;
        }
        let sql = format!(
            "CREATE {}TABLE {} ({})",
            if temporary { "TEMPORARY " } else { "" },
            quote(name),
            self.column_ddl()?.join(", ")
        );
        self.driver.execute(&sql)?;
        Ok(())
    }

    fn create_indexes(&self, name: &str) -> Result<(), TabularError> {
        let options = self.schema().options();
        if let Some(index) = &options.index {
            self.driver.execute(&format!(
                "CREATE INDEX ON {} ({})",
                quote(name),
                quote(&physical_name(index))
            ))?;
        }
        for column in options.order_by.iter().flatten() {
            self.driver.execute(&format!(
                "CREATE INDEX ON {} ({} DESC)",
                quote(name),
                quote(&physical_name(column))
            ))?;
        }
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<(), TabularError> {
        self.driver.execute(&format!("DROP TABLE {}", quote(name)))?;
        Ok(())
    }

    /// Declared columns only, under their stored names.
    fn to_physical(&self, table: &RecordBatch) -> Result<RecordBatch, TabularError> {
        let mut fields = Vec::new();
        let mut columns = Vec::new();
        for column in self.schema().columns() {
            let array = table
                .column_by_name(&column.name)
                .ok_or_else(|| TabularError::SchemaMismatch {
                    schema: self.schema().name().to_string(),
                    missing: vec![column.name.clone()],
                    unexpected: Vec::new(),
                })?;
            fields.push(Field::new(physical_name(&column.name), array.data_type().clone(), true));
            columns.push(array.clone());
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::new(ArrowSchema::new(fields)),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(table.num_rows())),
        )?)
    }

    fn to_logical(&self, table: &RecordBatch) -> Result<RecordBatch, TabularError> {
        let stored = table.schema();
        let fields: Vec<Field> = stored
            .fields()
            .iter()
            .map(|f| {
                let name = self
                    .schema()
                    .columns()
                    .iter()
                    .find(|c| physical_name(&c.name) == *f.name())
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| logical_name(f.name()));
                Field::new(name, f.data_type().clone(), true)
            })
            .collect();
        Ok(RecordBatch::try_new_with_options(
            Arc::new(ArrowSchema::new(fields)),
            table.columns().to_vec(),
            &RecordBatchOptions::new().with_row_count(Some(table.num_rows())),
        )?)
    }

    fn categorical_columns(&self) -> Vec<String> {
        self.schema()
            .columns()
            .iter()
            .filter(|c| c.semantic_type == SemanticType::Categorical)
            .map(|c| c.name.clone())
            .collect()
    }

    fn ensure_categories_relation(&self) -> Result<(), TabularError> {
        if !self.driver.has_relation(CATEGORIES_RELATION)? {
            self.driver.execute(&format!(
                "CREATE TABLE {} ({} VARCHAR(255), {} JSON)",
                quote(CATEGORIES_RELATION),
                quote("table_name"),
                quote("categories")
            ))?;
        }
        Ok(())
    }

    /// The persisted dictionaries of this table; empty when none were stored.
    pub fn load_categories(&self) -> Result<Categories, TabularError> {
        if !self.driver.has_relation(CATEGORIES_RELATION)? {
            return Ok(Categories::new());
        }
        let result = self.driver.query(&format!(
            "SELECT {} FROM {} WHERE {} = {}",
            quote("categories"),
            quote(CATEGORIES_RELATION),
            quote("table_name"),
            literal(&self.table)
        ))?;
        if result.num_rows() == 0 || result.num_columns() == 0 {
            return Ok(Categories::new());
        }
        let text = cast(result.column(0), &DataType::Utf8)?;
        let text = text.as_string::<i32>();
        let last = result.num_rows() - 1;
        if text.is_null(last) {
            return Ok(Categories::new());
        }
        Ok(serde_json::from_str(text.value(last))?)
    }

    fn store_categories(&self, categories: &Categories) -> Result<(), TabularError> {
        self.ensure_categories_relation()?;
        self.driver.execute(&format!(
            "DELETE FROM {} WHERE {} = {}",
            quote(CATEGORIES_RELATION),
            quote("table_name"),
            literal(&self.table)
        ))?;
        let row = RecordBatch::try_from_iter(vec![
            (
                "table_name",
                Arc::new(StringArray::from(vec![self.table.clone()])) as ArrayRef,
            ),
            (
                "categories",
                Arc::new(StringArray::from(vec![serde_json::to_string(categories)?])),
            ),
        ])?;
        self.driver.bulk_load(CATEGORIES_RELATION, &row)
    }

    /// Turns stored codes back into dictionary columns.
    fn hydrate(&self, table: &RecordBatch, categories: &Categories) -> Result<RecordBatch, TabularError> {
        let mut columns = table.columns().to_vec();
        let schema = table.schema();
        for name in self.categorical_columns() {
            let Ok(at) = schema.index_of(&name) else {
                continue;
            };
            let dict = CategoryDictionary::from_values(
                categories.get(&name).cloned().unwrap_or_default(),
            )?;
            let codes = cast(&columns[at], &DataType::Int64)?;
            let keys = codes
                .as_primitive::<Int64Type>()
                .iter()
                .map(|code| match code {
                    None => Ok(None),
                    Some(c) if c >= 0 && (c as usize) < dict.len() => Ok(Some(c as i32)),
                    Some(c) => Err(TabularError::conversion(
                        &name,
                        format!("code {} has no entry in {}", c, CATEGORIES_RELATION),
                    )),
                })
                .collect::<Result<Int32Array, TabularError>>()?;
            columns[at] = dictionary::build(keys, dict.to_array_of(&DataType::Utf8))?;
        }
        let fields: Vec<Field> = schema
            .fields()
            .iter()
            .zip(&columns)
            .map(|(f, c)| Field::new(f.name(), c.data_type().clone(), true))
            .collect();
        Ok(RecordBatch::try_new_with_options(
            Arc::new(ArrowSchema::new(fields)),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(table.num_rows())),
        )?)
    }

    /// Conforms `table` for storage, coding categorical columns against
    /// `categories` after extending them with unseen values.
    fn encode_against(
        &self,
        table: &RecordBatch,
        categories: &mut Categories,
    ) -> Result<RecordBatch, TabularError> {
        let in_memory = self
            .schema()
            .conform(table, &StorageTarget::Default, self.registry())?;
        let schema = in_memory.schema();
        let mut columns = in_memory.columns().to_vec();
        for name in self.categorical_columns() {
            let at = schema.index_of(&name)?;
            let mut dict = CategoryDictionary::from_values(
                categories.get(&name).cloned().unwrap_or_default(),
            )?;
            dictionary::extend_from_rows(&mut dict, &columns[at])?;
            columns[at] = dictionary::recode_as(&columns[at], &dict, &DataType::Utf8)?;
            categories.insert(name, dict.values().to_vec());
        }
        let recoded = RecordBatch::try_new_with_options(
            schema.clone(),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(in_memory.num_rows())),
        )?;
        self.schema()
            .conform(&recoded, &self.storage_target(), self.registry())
    }

    fn upsert_through_temp(&self, temp: &str, incoming: &RecordBatch) -> Result<(), TabularError> {
        let index = physical_name(self.schema().index_column()?);
        let table = quote(&self.table);
        let temp_q = quote(temp);

        self.create_table(temp, false)?;
        self.driver.bulk_load(temp, incoming)?;
        self.create_indexes(temp)?;

        let assignments: Vec<String> = self
            .physical_columns()
            .iter()
            .map(|c| format!("{} = {}.{}", quote(c), temp_q, quote(c)))
            .collect();
        let key_match = format!(
            "{}.{} = {}.{}",
            table,
            quote(&index),
            temp_q,
            quote(&index)
        );
        let updated = self.driver.execute(&format!(
            "UPDATE {} SET {} FROM {} WHERE {}",
            table,
            assignments.join(", "),
            temp_q,
            key_match
        ))?;
        let inserted = self.driver.execute(&format!(
            "INSERT INTO {} SELECT * FROM {} WHERE NOT EXISTS (SELECT * FROM {} WHERE {})",
            table, temp_q, table, key_match
        ))?;
        log::info!(
            "Updated {} existing and inserted {} new rows in {}",
            updated,
            inserted,
            self.describe()
        );
        Ok(())
    }
}

impl std::fmt::Debug for RelationalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalStore")
            .field("table", &self.table)
            .field("encode_categoricals", &self.encode_categoricals)
            .field("load_where", &self.load_where)
            .finish()
    }
}

impl DataStore for RelationalStore {
    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn storage_target(&self) -> StorageTarget {
        if self.encode_categoricals {
            StorageTarget::RelationalEncoded
        } else {
            StorageTarget::Relational
        }
    }

    fn describe(&self) -> String {
        format!("relation {}", quote(&self.table))
    }

    fn exists(&self) -> Result<bool, TabularError> {
        self.driver.has_relation(&self.table)
    }

    fn delete(&self) -> Result<(), TabularError> {
        if self.driver.has_relation(&self.table)? {
            self.drop_table(&self.table)?;
        }
        if self.encode_categoricals && self.driver.has_relation(CATEGORIES_RELATION)? {
            self.driver.execute(&format!(
                "DELETE FROM {} WHERE {} = {}",
                quote(CATEGORIES_RELATION),
                quote("table_name"),
                literal(&self.table)
            ))?;
        }
        Ok(())
    }

    fn load_raw(&self) -> Result<RecordBatch, TabularError> {
        let raw = if self.load_where.is_empty() {
            self.driver.bulk_unload(&self.table)?
        } else {
            let temp = self.temp_name();
            let selected = self.create_table(&temp, false).and_then(|_| {
                let columns: Vec<String> = self.physical_columns().iter().map(|c| quote(c)).collect();
                self.driver.execute(&format!(
                    "INSERT INTO {} ({}) SELECT * FROM {} WHERE {}",
                    quote(&temp),
                    columns.join(", "),
                    quote(&self.table),
                    self.load_where.join(" AND ")
                ))?;
                self.driver.bulk_unload(&temp)
            });
            let dropped = match self.driver.has_relation(&temp) {
                Ok(true) => self.drop_table(&temp),
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            let selected = selected?;
            dropped?;
            selected
        };

        let logical = self.to_logical(&raw)?;
        if self.encode_categoricals {
            self.hydrate(&logical, &self.load_categories()?)
        } else {
            Ok(logical)
        }
    }

    fn store_raw(&self, table: &RecordBatch) -> Result<(), TabularError> {
        let physical = self.to_physical(table)?;
        self.create_table(&self.table, self.schema().options().temporary)?;
        self.driver.bulk_load(&self.table, &physical)?;
        self.create_indexes(&self.table)?;
        Ok(())
    }

    /// Replaces the table. With encoding on, the dictionaries of `table` are
    /// persisted alongside its codes.
    fn store(&self, table: &RecordBatch) -> Result<(), TabularError> {
        let conformed = if self.encode_categoricals {
            let mut categories = Categories::new();
            let conformed = self.encode_against(table, &mut categories)?;
            self.store_categories(&categories)?;
            conformed
        } else {
            self.schema()
                .conform(table, &self.storage_target(), self.registry())?
        };
        self.store_raw(&conformed)?;
        log::info!("Stored {} rows in {}", table.num_rows(), self.describe());
        Ok(())
    }

    fn store_chunks(&self, chunks: ChunkIter<'_>) -> Result<(), TabularError> {
        let in_memory: Vec<RecordBatch> = chunks
            .map(|c| {
                c.and_then(|c| {
                    self.schema()
                        .conform(&c, &StorageTarget::Default, self.registry())
                })
            })
            .collect::<Result<_, _>>()?;
        if in_memory.is_empty() {
            let empty = RecordBatch::new_empty(
                self.schema()
                    .arrow_schema(&StorageTarget::Default, self.registry())?,
            );
            return self.store(&empty);
        }
        self.store(&chunks::merge(&in_memory)?)
    }

    /// Upserts through a temporary relation: matching rows are updated in
    /// place, the rest inserted. The temporary relation is always dropped.
    fn update(&self, table: &RecordBatch) -> Result<(), TabularError> {
        if table.num_rows() == 0 {
            return Ok(());
        }
        if !self.exists()? {
            return self.store(table);
        }
        self.schema().index_column()?;

        let conformed = if self.encode_categoricals {
            let mut categories = self.load_categories()?;
            let conformed = self.encode_against(table, &mut categories)?;
            self.store_categories(&categories)?;
            conformed
        } else {
            self.schema()
                .conform(table, &self.storage_target(), self.registry())?
        };
        let incoming = self.to_physical(&conformed)?;

        let temp = self.temp_name();
        let result = self.upsert_through_temp(&temp, &incoming);
        let dropped = match self.driver.has_relation(&temp) {
            Ok(true) => self.drop_table(&temp),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        result?;
        dropped
    }
}
