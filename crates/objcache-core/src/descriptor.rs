//! Per-type metadata consumed by the cache and the command surfaces.
//!
//! A [`TypeDescriptor`] gives the key arity, the type of each key component,
//! where each component comes from (the application, the store, or a
//! referenced record), the data columns, and the reference fields.

use std::sync::Arc;

use crate::error::{ConfigError, Error, Result};
use crate::key::KeyKind;
use crate::types::{SqlType, TypeInfo};

/// Name of the physical store used when a descriptor does not name one.
pub const DEFAULT_STORE: &str = "default";

/// Where a primary key component's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Assigned by the application before commit.
    Supplied,
    /// Assigned by the store at insert time (auto-increment, server-side UUID).
    ServerGenerated,
    /// The single-column key of the record referenced through the named field.
    Reference(&'static str),
}

/// Metadata about one primary key column.
#[derive(Debug, Clone)]
pub struct KeyColumn {
    /// Database column name
    pub name: &'static str,
    /// SQL type for this column
    pub sql_type: SqlType,
    /// Where the value comes from
    pub source: KeySource,
}

impl KeyColumn {
    pub const fn new(name: &'static str, sql_type: SqlType, source: KeySource) -> Self {
        Self {
            name,
            sql_type,
            source,
        }
    }

    /// An application-supplied key column typed after `T`.
    pub fn supplied<T: TypeInfo>(name: &'static str) -> Self {
        Self::new(name, T::SQL_TYPE, KeySource::Supplied)
    }

    /// A store-generated key column typed after `T`.
    pub fn server_generated<T: TypeInfo>(name: &'static str) -> Self {
        Self::new(name, T::SQL_TYPE, KeySource::ServerGenerated)
    }

    /// A key column holding the key of the record behind `field`.
    pub fn reference<T: TypeInfo>(name: &'static str, field: &'static str) -> Self {
        Self::new(name, T::SQL_TYPE, KeySource::Reference(field))
    }

    pub const fn is_server_generated(&self) -> bool {
        matches!(self.source, KeySource::ServerGenerated)
    }
}

/// A field holding a reference to another record.
#[derive(Debug, Clone)]
pub struct ReferenceField {
    /// Field name on the record
    pub name: &'static str,
    /// Foreign key column written by the store
    pub column_name: &'static str,
    /// Referenced type name
    pub target: &'static str,
}

/// Metadata for one record type.
#[derive(Debug)]
pub struct TypeDescriptor {
    name: &'static str,
    table_name: &'static str,
    store: &'static str,
    key: Vec<KeyColumn>,
    key_kinds: Vec<KeyKind>,
    columns: Vec<&'static str>,
    references: Vec<ReferenceField>,
}

impl TypeDescriptor {
    /// Start describing a type. The table name defaults to the type name.
    pub fn builder(name: &'static str) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            name,
            table_name: name,
            store: DEFAULT_STORE,
            key: Vec::new(),
            columns: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table_name(&self) -> &'static str {
        self.table_name
    }

    /// The physical store records of this type live in.
    pub fn store(&self) -> &'static str {
        self.store
    }

    pub fn key_columns(&self) -> &[KeyColumn] {
        &self.key
    }

    /// Kind of each key component, in key order.
    pub fn key_kinds(&self) -> &[KeyKind] {
        &self.key_kinds
    }

    /// The kind used to route records of this type to a cache.
    pub fn key_kind(&self) -> KeyKind {
        self.key_kinds[0]
    }

    pub fn number_of_primary_keys(&self) -> usize {
        self.key.len()
    }

    pub fn number_of_server_generated_keys(&self) -> usize {
        self.key.iter().filter(|k| k.is_server_generated()).count()
    }

    pub fn is_composite(&self) -> bool {
        self.key.len() > 1
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn references(&self) -> &[ReferenceField] {
        &self.references
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceField> {
        self.references.iter().find(|r| r.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(&name)
    }
}

/// Builder for [`TypeDescriptor`].
#[derive(Debug)]
pub struct TypeDescriptorBuilder {
    name: &'static str,
    table_name: &'static str,
    store: &'static str,
    key: Vec<KeyColumn>,
    columns: Vec<&'static str>,
    references: Vec<ReferenceField>,
}

impl TypeDescriptorBuilder {
    pub fn table(mut self, table_name: &'static str) -> Self {
        self.table_name = table_name;
        self
    }

    pub fn store(mut self, store: &'static str) -> Self {
        self.store = store;
        self
    }

    pub fn key(mut self, column: KeyColumn) -> Self {
        self.key.push(column);
        self
    }

    pub fn column(mut self, name: &'static str) -> Self {
        self.columns.push(name);
        self
    }

    pub fn reference(
        mut self,
        name: &'static str,
        column_name: &'static str,
        target: &'static str,
    ) -> Self {
        self.references.push(ReferenceField {
            name,
            column_name,
            target,
        });
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<Arc<TypeDescriptor>> {
        if self.key.is_empty() {
            return Err(config_error(format!(
                "type {} declares no primary key columns",
                self.name
            )));
        }

        let key_kinds = self
            .key
            .iter()
            .map(|column| KeyKind::from_sql_type(&column.sql_type))
            .collect::<Result<Vec<_>>>()?;

        for column in &self.key {
            if let KeySource::Reference(field) = column.source {
                if !self.references.iter().any(|r| r.name == field) {
                    return Err(config_error(format!(
                        "key column {}.{} refers to unknown reference field {}",
                        self.name, column.name, field
                    )));
                }
            }
        }

        tracing::trace!(
            type_name = self.name,
            store = self.store,
            key_arity = self.key.len(),
            key_kind = key_kinds[0].name(),
            "Built type descriptor"
        );

        Ok(Arc::new(TypeDescriptor {
            name: self.name,
            table_name: self.table_name,
            store: self.store,
            key: self.key,
            key_kinds,
            columns: self.columns,
            references: self.references,
        }))
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError { message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let cats = TypeDescriptor::builder("cats")
            .key(KeyColumn::server_generated::<i64>("id"))
            .column("name")
            .build()
            .unwrap();

        assert_eq!(cats.table_name(), "cats");
        assert_eq!(cats.store(), DEFAULT_STORE);
        assert_eq!(cats.key_kind(), KeyKind::Int64);
        assert_eq!(cats.number_of_primary_keys(), 1);
        assert_eq!(cats.number_of_server_generated_keys(), 1);
        assert!(!cats.is_composite());
        assert!(cats.has_column("name"));
    }

    #[test]
    fn test_composite_key_kinds() {
        let shops = TypeDescriptor::builder("shops")
            .store("retail")
            .reference("mall", "mall_id", "malls")
            .key(KeyColumn::reference::<uuid::Uuid>("mall_id", "mall"))
            .key(KeyColumn::supplied::<String>("code"))
            .build()
            .unwrap();

        assert_eq!(shops.store(), "retail");
        assert!(shops.is_composite());
        assert_eq!(shops.key_kinds(), &[KeyKind::Uuid, KeyKind::Text]);
        assert_eq!(shops.key_kind(), KeyKind::Uuid);
        assert_eq!(shops.reference("mall").unwrap().target, "malls");
    }

    #[test]
    fn test_rejects_missing_key() {
        let err = TypeDescriptor::builder("logs").column("line").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_unsupported_key_type() {
        let err = TypeDescriptor::builder("points")
            .key(KeyColumn::supplied::<f64>("x"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported primary key type"));
    }

    #[test]
    fn test_rejects_unknown_reference_key() {
        let err = TypeDescriptor::builder("shops")
            .key(KeyColumn::reference::<i64>("mall_id", "mall"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown reference field"));
    }
}
