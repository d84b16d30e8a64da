//! Transactional object cache and commit pipeline for objcache.
//!
//! `objcache-session` is the **unit-of-work layer**. Every transaction owns
//! an [`ObjectContext`] that tracks the records it touches and writes them
//! back in one commit.
//!
//! # Role In The Architecture
//!
//! - **Object cache**: one tracked instance per primary key, per key kind.
//! - **Commit pipeline**: dependency-ordered inserts, foreign-key fix-ups,
//!   updates and deletes, driven through per-store command surfaces.
//! - **Acquisitions**: each store is acquired once per commit and always
//!   released, with errors marked on every acquisition when a commit fails.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = ObjectContext::new(ContextConfig::default());
//!
//! // Track a new record; its key is assigned by the store on insert
//! let cat = ctx.cache_object(Record::new(cats).with_value("name", "Tom").into_ref())?;
//!
//! // Later lookups by key return the same instance
//! let same = ctx.get_object("cats", &[KeyValue::Int64(1)]);
//!
//! // Write everything through the surrounding transaction
//! let summary = ctx.commit(&cx, &mut transaction).await;
//! ```

pub mod acquisition;
pub mod commit;
pub mod context;
pub mod object_cache;
pub mod sql;
pub mod surface;

pub use acquisition::{Acquisition, AcquisitionSet, TransactionContext};
pub use commit::CommitSummary;
pub use context::{ContextConfig, ObjectContext};
pub use object_cache::{CacheKey, CacheStats, ObjectCache, TypeBatch};
pub use sql::{SqlCommands, Statement};
pub use surface::{CommandSurface, InsertPlan, InsertResults, PlannedInsert};
