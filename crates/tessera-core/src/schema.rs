//! Schemas, index/foreign-key directives and the schema registry.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::query::SortDirection;
use crate::types::{Capabilities, LogicalType};

/// Name of the implicit primary key column.
pub const ID_FIELD: &str = "id";

/// One declared column.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Logical name; dotted names address nested values
    pub name: String,
    /// Physical column name for backends without nesting
    pub dbname: String,
    pub logical_type: LogicalType,
    pub required: bool,
    pub is_array: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        let name = name.into();
        Self {
            dbname: name.replace('.', "_"),
            name,
            logical_type,
            required: false,
            is_array: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }
}

/// A finalized table definition. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    table: String,
    key_type: LogicalType,
    columns: IndexMap<String, Property>,
    indexes: Vec<IndexDescriptor>,
    foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl Schema {
    pub fn builder(table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Logical type of the implicit `id` column.
    pub fn key_type(&self) -> LogicalType {
        self.key_type
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.columns.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.columns.values()
    }

    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyDescriptor] {
        &self.foreign_keys
    }

    /// Resolve a field referenced by a condition, order or projection.
    pub fn resolve(&self, field: &str) -> StoreResult<FieldRef<'_>> {
        if field == ID_FIELD {
            return Ok(FieldRef::Id);
        }
        self.columns
            .get(field)
            .map(FieldRef::Column)
            .ok_or_else(|| StoreError::UnknownColumn(field.to_string()))
    }
}

/// A resolved field reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef<'a> {
    Id,
    Column(&'a Property),
}

impl FieldRef<'_> {
    /// Logical type of the referenced value, given the schema's key type.
    pub fn logical_type(&self, key_type: LogicalType) -> LogicalType {
        match self {
            FieldRef::Id => key_type,
            FieldRef::Column(property) => property.logical_type,
        }
    }
}

/// Accumulates columns and directives, then validates them against a backend.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    table: String,
    columns: Vec<Property>,
    indexes: Vec<IndexDescriptor>,
    foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl SchemaBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(self, name: impl Into<String>, logical_type: LogicalType) -> Self {
        self.property(Property::new(name, logical_type))
    }

    pub fn property(mut self, property: Property) -> Self {
        self.columns.push(property);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn foreign_key(mut self, foreign_key: ForeignKeyDescriptor) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Finalize against the capabilities of the target backend.
    pub fn build(self, capabilities: &Capabilities) -> StoreResult<Schema> {
        if self.table.is_empty() {
            return Err(StoreError::invalid_schema("table name is empty"));
        }

        let mut columns = IndexMap::with_capacity(self.columns.len());
        for property in self.columns {
            if property.name == ID_FIELD {
                return Err(StoreError::invalid_schema(format!(
                    "'{ID_FIELD}' is implicit in {}",
                    self.table
                )));
            }
            if !capabilities.supports(property.logical_type, property.is_array) {
                return Err(StoreError::unsupported(format!(
                    "{}{} column '{}' on this backend",
                    property.logical_type,
                    if property.is_array { " array" } else { "" },
                    property.name
                )));
            }
            if columns.contains_key(&property.name) {
                return Err(StoreError::invalid_schema(format!(
                    "column '{}' declared twice",
                    property.name
                )));
            }
            columns.insert(property.name.clone(), property);
        }

        for index in &self.indexes {
            if let Some(column) = index
                .columns
                .keys()
                .find(|column| *column != ID_FIELD && !columns.contains_key(*column))
            {
                return Err(StoreError::UnknownColumn(column.clone()));
            }
        }
        for foreign_key in &self.foreign_keys {
            if !columns.contains_key(&foreign_key.column) {
                return Err(StoreError::UnknownColumn(foreign_key.column.clone()));
            }
        }

        debug!(table = %self.table, columns = columns.len(), "Schema finalized");
        Ok(Schema {
            table: self.table,
            key_type: capabilities.key_type,
            columns,
            indexes: self.indexes,
            foreign_keys: self.foreign_keys,
        })
    }
}

/// Index creation directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub columns: IndexMap<String, SortDirection>,
    pub name: String,
    pub unique: bool,
    pub required: bool,
}

impl IndexDescriptor {
    /// Ascending index over `columns`, named after them.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: IndexMap<String, SortDirection> = columns
            .into_iter()
            .map(|column| (column.into(), SortDirection::Asc))
            .collect();
        let name = columns.keys().cloned().collect::<Vec<_>>().join("_");
        Self {
            columns,
            name,
            unique: false,
            required: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn direction(mut self, column: &str, direction: SortDirection) -> Self {
        if let Some(slot) = self.columns.get_mut(column) {
            *slot = direction;
        }
        self
    }
}

/// Referential action applied when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDelete {
    Nullify,
    Restrict,
    Delete,
}

impl OnDelete {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Nullify => "SET NULL",
            Self::Restrict => "RESTRICT",
            Self::Delete => "CASCADE",
        }
    }
}

/// Foreign key creation directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub column: String,
    pub on_delete: OnDelete,
    /// Referenced table; the referenced column is always its `id`
    pub references: String,
}

impl ForeignKeyDescriptor {
    pub fn new(column: impl Into<String>, references: impl Into<String>, on_delete: OnDelete) -> Self {
        Self {
            column: column.into(),
            on_delete,
            references: references.into(),
        }
    }
}

/// One column as reported by introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    /// `None` when the physical type has no logical counterpart
    #[serde(rename = "type")]
    pub logical_type: Option<LogicalType>,
    pub required: bool,
}

/// Columns of one table as reported by introspection.
pub type TableDescriptor = IndexMap<String, ColumnDescriptor>;

/// Everything introspection knows about the connected database.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaDescriptor {
    pub tables: IndexMap<String, TableDescriptor>,
    /// table → index name → column → 1
    pub indexes: IndexMap<String, IndexMap<String, IndexMap<String, i32>>>,
    /// table → column → referenced table
    pub foreign_keys: IndexMap<String, IndexMap<String, String>>,
}

/// Explicit registry of finalized schemas, keyed by table name.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    capabilities: Capabilities,
    schemas: IndexMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            schemas: IndexMap::new(),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Finalize and register a schema; re-registering a table replaces it.
    pub fn register(&mut self, builder: SchemaBuilder) -> StoreResult<Arc<Schema>> {
        let schema = Arc::new(builder.build(&self.capabilities)?);
        self.schemas
            .insert(schema.table().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, table: &str) -> StoreResult<Arc<Schema>> {
        self.schemas
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Schema>> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
