//! The statement-level boundary to a physical store.
//!
//! [`Connection`] is the narrow slice of a database driver the SQL command
//! surface needs: run a statement and count affected rows, or run a
//! statement and read back at most one row (`INSERT ... RETURNING`). Drivers
//! and pooling live outside this workspace.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use std::future::Future;

use asupersync::{Cx, Outcome};

use crate::row::Row;
use crate::value::Value;

/// A connection bound to the transaction of the current commit.
pub trait Connection: Send + Sync {
    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;
}
