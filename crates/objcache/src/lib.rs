//! objcache - a transactional object cache for object-relational persistence.
//!
//! objcache tracks the records a transaction touches and writes them back in
//! one commit:
//!
//! - One tracked instance per primary key, across four key representations
//!   (32-bit and 64-bit integers, UUIDs, text), single or composite
//! - New records whose keys come from the store, from the application, or
//!   from another record they reference
//! - Dependency-ordered inserts with foreign-key fix-ups
//! - Per-store acquisitions that are always released, errored on failure
//!
//! # Quick Start
//!
//! ```ignore
//! use objcache::prelude::*;
//!
//! let cats = TypeDescriptor::builder("cats")
//!     .key(KeyColumn::server_generated::<i64>("id"))
//!     .column("name")
//!     .build()?;
//!
//! let mut ctx = ObjectContext::default();
//! let tom = ctx.cache_object(Record::new(cats).with_value("name", "Tom").into_ref())?;
//!
//! match ctx.commit(&cx, &mut transaction).await {
//!     Outcome::Ok(summary) => println!("inserted {}", summary.inserted),
//!     Outcome::Err(e) => eprintln!("commit failed: {e}"),
//!     _ => {}
//! }
//! ```

// Re-export asupersync primitives
pub use asupersync::{Cx, Outcome};

// Core types
pub use objcache_core::{
    AcquisitionError, CompositeKey, ConfigError, Connection, DEFAULT_STORE, DependencyError,
    Error, KeyColumn, KeyKind, KeySource, KeyValue, MissingObjectError, MissingPrimaryKeyError,
    ObjectState, QueryError, QueryErrorKind, Record, RecordRef, ReferenceField, Result, Row,
    SqlType, StateError, TypeDescriptor, TypeError, TypeInfo, Value,
};

// Session types
pub use objcache_session::{
    Acquisition, AcquisitionSet, CacheKey, CacheStats, CommandSurface, CommitSummary,
    ContextConfig, InsertPlan, InsertResults, ObjectCache, ObjectContext, PlannedInsert,
    SqlCommands, Statement, TransactionContext, TypeBatch,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use objcache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Persistence boundary
        Acquisition,
        CommandSurface,
        CommitSummary,
        Connection,
        // Context
        ContextConfig,
        // asupersync
        Cx,
        Error,
        InsertPlan,
        InsertResults,
        KeyColumn,
        KeyKind,
        KeyValue,
        ObjectContext,
        ObjectState,
        Outcome,
        // Records
        Record,
        RecordRef,
        Result,
        Row,
        SqlCommands,
        TransactionContext,
        TypeDescriptor,
        Value,
    };
}
