//! Core types for the objcache transactional object cache.
//!
//! This crate provides the foundations shared by the cache and the commit
//! pipeline:
//!
//! - `Value` and `SqlType` for column data and declared column types
//! - `KeyKind`, `KeyValue` and `CompositeKey` for primary keys
//! - `TypeDescriptor` for per-type metadata
//! - `Record` / `RecordRef` for tracked objects
//! - `Connection` for the statement-level store boundary
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod descriptor;
pub mod error;
pub mod key;
pub mod record;
pub mod row;
pub mod types;
pub mod value;

pub use connection::Connection;
pub use descriptor::{DEFAULT_STORE, KeyColumn, KeySource, ReferenceField, TypeDescriptor};
pub use error::{
    AcquisitionError, ConfigError, DependencyError, Error, MissingObjectError,
    MissingPrimaryKeyError, QueryError, QueryErrorKind, Result, StateError, TypeError,
};
pub use key::{CompositeKey, KeyKind, KeyValue};
pub use record::{ObjectState, Record, RecordRef};
pub use row::Row;
pub use types::{SqlType, TypeInfo};
pub use value::Value;
