//! The column type registry.
//!
//! For every (semantic type, storage target) pair the registry holds a
//! [`Handlers`] triple: `check` says whether an array already has the target
//! representation, `transform` coerces it when it does not, and `metadata`
//! describes the physical column (Arrow type plus DDL for relational targets).
//!
//! A registry is immutable once built. The built-in one is shared process-wide
//! through [`TypeRegistry::standard`]; custom targets are added by building a
//! new registry on top of it with [`TypeRegistryBuilder`].

pub mod handlers;

use std::fmt;
use std::sync::{Arc, OnceLock};

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use hashbrown::HashMap;

use crate::error::TabularError;
use crate::schema::Column;
use crate::types::{SemanticType, StorageTarget};

pub type CheckFn = Arc<dyn Fn(&Column, &ArrayRef) -> Result<bool, TabularError> + Send + Sync>;
pub type TransformFn =
    Arc<dyn Fn(&Column, &ArrayRef) -> Result<ArrayRef, TabularError> + Send + Sync>;
pub type MetadataFn = Arc<dyn Fn(&Column) -> ColumnMetadata + Send + Sync>;

/// Physical description of one column under one storage target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub physical_type: DataType,
    /// Column type clause for relational DDL.
    pub ddl: Option<String>,
}

/// The handler triple registered for one (semantic type, target) pair.
#[derive(Clone)]
pub struct Handlers {
    pub check: CheckFn,
    pub transform: TransformFn,
    pub metadata: MetadataFn,
}

impl Handlers {
    pub fn new<C, T, M>(check: C, transform: T, metadata: M) -> Self
    where
        C: Fn(&Column, &ArrayRef) -> Result<bool, TabularError> + Send + Sync + 'static,
        T: Fn(&Column, &ArrayRef) -> Result<ArrayRef, TabularError> + Send + Sync + 'static,
        M: Fn(&Column) -> ColumnMetadata + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
            transform: Arc::new(transform),
            metadata: Arc::new(metadata),
        }
    }

    /// Handlers for a fixed physical type: `check` compares data types and
    /// `transform` is the given coercion.
    pub fn for_type<T>(physical_type: DataType, ddl: Option<&'static str>, transform: T) -> Self
    where
        T: Fn(&Column, &ArrayRef) -> Result<ArrayRef, TabularError> + Send + Sync + 'static,
    {
        let expected = physical_type.clone();
        Self::new(
            move |_, array| Ok(array.data_type() == &expected),
            transform,
            move |column| ColumnMetadata {
                name: column.name.clone(),
                physical_type: physical_type.clone(),
                ddl: ddl.map(str::to_string),
            },
        )
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

type Key = (SemanticType, StorageTarget);

/// Immutable (semantic type, target) → handlers table.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    handlers: HashMap<Key, Handlers>,
}

static STANDARD: OnceLock<Arc<TypeRegistry>> = OnceLock::new();

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// The built-in registry covering every built-in target, built on first use.
    pub fn standard() -> Arc<TypeRegistry> {
        STANDARD
            .get_or_init(|| Arc::new(handlers::register_builtin(TypeRegistry::builder()).build()))
            .clone()
    }

    pub fn handlers(
        &self,
        semantic_type: SemanticType,
        target: &StorageTarget,
        handler: &'static str,
    ) -> Result<&Handlers, TabularError> {
        self.handlers
            .get(&(semantic_type, target.clone()))
            .ok_or_else(|| TabularError::UnregisteredStorageTarget {
                semantic_type,
                target: target.clone(),
                handler,
            })
    }

    pub fn check(
        &self,
        column: &Column,
        array: &ArrayRef,
        target: &StorageTarget,
    ) -> Result<bool, TabularError> {
        (self.handlers(column.semantic_type, target, "check")?.check)(column, array)
    }

    pub fn transform(
        &self,
        column: &Column,
        array: &ArrayRef,
        target: &StorageTarget,
    ) -> Result<ArrayRef, TabularError> {
        (self.handlers(column.semantic_type, target, "transform")?.transform)(column, array)
    }

    pub fn metadata(
        &self,
        column: &Column,
        target: &StorageTarget,
    ) -> Result<ColumnMetadata, TabularError> {
        Ok((self.handlers(column.semantic_type, target, "metadata")?.metadata)(column))
    }

    /// `check`, then `transform` if the check failed.
    pub fn conform_array(
        &self,
        column: &Column,
        array: &ArrayRef,
        target: &StorageTarget,
    ) -> Result<ArrayRef, TabularError> {
        let handlers = self.handlers(column.semantic_type, target, "check")?;
        if (handlers.check)(column, array)? {
            Ok(array.clone())
        } else {
            log::debug!(
                "Coercing column '{}' ({}) from {} for target {}",
                column.name,
                column.semantic_type,
                array.data_type(),
                target
            );
            (handlers.transform)(column, array)
        }
    }

    /// Returns `true` if every semantic type has handlers for `target`.
    pub fn supports(&self, target: &StorageTarget) -> bool {
        SemanticType::ALL
            .iter()
            .all(|t| self.handlers.contains_key(&(*t, target.clone())))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .keys()
            .map(|(t, target)| format!("{}@{}", t, target))
            .collect();
        keys.sort();
        f.debug_struct("TypeRegistry").field("handlers", &keys).finish()
    }
}

/// Accumulates registrations for a new [`TypeRegistry`].
#[derive(Default)]
pub struct TypeRegistryBuilder {
    handlers: HashMap<Key, Handlers>,
}

impl TypeRegistryBuilder {
    /// Starts from every registration of `registry`.
    pub fn extending(registry: &TypeRegistry) -> Self {
        Self {
            handlers: registry.handlers.clone(),
        }
    }

    /// Registers (or replaces) the handlers of one pair.
    pub fn register(
        mut self,
        semantic_type: SemanticType,
        target: StorageTarget,
        handlers: Handlers,
    ) -> Self {
        self.handlers.insert((semantic_type, target), handlers);
        self
    }

    /// Copies every handler registered for `from` to `to`.
    pub fn alias_target(mut self, from: &StorageTarget, to: StorageTarget) -> Self {
        let copied: Vec<(SemanticType, Handlers)> = self
            .handlers
            .iter()
            .filter(|((_, target), _)| target == from)
            .map(|((t, _), h)| (*t, h.clone()))
            .collect();
        for (semantic_type, handlers) in copied {
            self.handlers.insert((semantic_type, to.clone()), handlers);
        }
        self
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            handlers: self.handlers,
        }
    }
}
