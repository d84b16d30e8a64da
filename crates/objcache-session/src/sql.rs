//! A [`CommandSurface`] that writes records through a [`Connection`].
//!
//! Statements use quoted identifiers and `$n` placeholders:
//!
//! ```text
//! INSERT INTO "cats" ("name", "owner_id") VALUES ($1, $2) RETURNING "id"
//! UPDATE "cats" SET "name" = $1 WHERE "id" = $2
//! DELETE FROM "cats" WHERE "id" IN ($1, $2, $3)
//! ```
//!
//! Types with a composite key are deleted one row at a time.

use std::collections::BTreeSet;

use objcache_core::{
    Connection, Cx, Error, KeySource, Outcome, QueryError, QueryErrorKind, RecordRef, Result,
    StateError, TypeDescriptor, Value,
};

use crate::surface::{CommandSurface, InsertPlan, InsertResults};

/// One statement ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Columns the store reports back (`RETURNING`).
    pub returning: Vec<&'static str>,
}

/// Command surface over a single connection.
#[derive(Debug)]
pub struct SqlCommands<C> {
    conn: C,
    deferrable_constraints: bool,
}

impl<C: Connection> SqlCommands<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            deferrable_constraints: false,
        }
    }

    /// Declare that the store defers foreign key checks to commit time.
    pub fn deferrable(mut self, enabled: bool) -> Self {
        self.deferrable_constraints = enabled;
        self
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, descriptor, records),
        fields(type_name = descriptor.name(), count = records.len())
    )]
    async fn insert_records(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> Outcome<InsertResults, Error> {
        let plan = match InsertPlan::classify(records, self.deferrable_constraints) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        tracing::debug!(
            insert = plan.to_insert().len(),
            retry = plan.to_retry().len(),
            skipped = plan.skipped(),
            "Classified insert batch"
        );

        for planned in plan.to_insert() {
            let statement = match insert_statement(descriptor, &planned.record) {
                Ok(statement) => statement,
                Err(e) => return Outcome::Err(e),
            };

            if statement.returning.is_empty() {
                match self.conn.execute(cx, &statement.sql, &statement.params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => {
                        return Outcome::Err(decorate(e, &statement, descriptor, &planned.record));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            } else {
                let row = match self
                    .conn
                    .query_one(cx, &statement.sql, &statement.params)
                    .await
                {
                    Outcome::Ok(Some(row)) => row,
                    Outcome::Ok(None) => {
                        let e = Error::Query(QueryError::new(
                            QueryErrorKind::NotFound,
                            "insert returned no generated values",
                        ));
                        return Outcome::Err(decorate(e, &statement, descriptor, &planned.record));
                    }
                    Outcome::Err(e) => {
                        return Outcome::Err(decorate(e, &statement, descriptor, &planned.record));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };

                for column in &statement.returning {
                    let Some(value) = row.get_by_name(column) else {
                        continue;
                    };
                    let applied = planned.record.write().apply_server_generated(column, value);
                    if let Err(e) = applied {
                        return Outcome::Err(e);
                    }
                }
            }

            planned.complete();
        }

        Outcome::Ok(plan.into_results())
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, descriptor, records),
        fields(type_name = descriptor.name(), count = records.len())
    )]
    async fn update_records(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> Outcome<Vec<u64>, Error> {
        let mut counts = Vec::with_capacity(records.len());

        for record in records {
            let (statement, probe) = match update_statement(descriptor, record) {
                Ok(Some(statement)) => (statement, false),
                Ok(None) => match exists_statement(descriptor, record) {
                    Ok(statement) => (statement, true),
                    Err(e) => return Outcome::Err(e),
                },
                Err(e) => return Outcome::Err(e),
            };

            let count = if probe {
                match self
                    .conn
                    .query_one(cx, &statement.sql, &statement.params)
                    .await
                {
                    Outcome::Ok(row) => u64::from(row.is_some()),
                    Outcome::Err(e) => {
                        return Outcome::Err(decorate(e, &statement, descriptor, record));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            } else {
                match self.conn.execute(cx, &statement.sql, &statement.params).await {
                    Outcome::Ok(count) => count,
                    Outcome::Err(e) => {
                        return Outcome::Err(decorate(e, &statement, descriptor, record));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            };
            counts.push(count);
        }

        Outcome::Ok(counts)
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, descriptor, records),
        fields(type_name = descriptor.name(), count = records.len())
    )]
    async fn delete_records(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> Outcome<u64, Error> {
        let statements = match delete_statements(descriptor, records) {
            Ok(statements) => statements,
            Err(e) => return Outcome::Err(e),
        };

        let mut deleted = 0;
        for statement in &statements {
            match self.conn.execute(cx, &statement.sql, &statement.params).await {
                Outcome::Ok(count) => deleted += count,
                Outcome::Err(e) => {
                    return Outcome::Err(e.decorate(
                        Some(statement.sql.as_str()),
                        descriptor.name(),
                        None,
                    ));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(deleted)
    }
}

impl<C: Connection> CommandSurface for SqlCommands<C> {
    fn deferrable_constraints(&self) -> bool {
        self.deferrable_constraints
    }

    async fn insert(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> Outcome<InsertResults, Error> {
        self.insert_records(cx, descriptor, records).await
    }

    async fn update(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> Outcome<Vec<u64>, Error> {
        self.update_records(cx, descriptor, records).await
    }

    async fn delete(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> Outcome<u64, Error> {
        self.delete_records(cx, descriptor, records).await
    }
}

fn decorate(
    e: Error,
    statement: &Statement,
    descriptor: &TypeDescriptor,
    record: &RecordRef,
) -> Error {
    e.decorate(
        Some(statement.sql.as_str()),
        descriptor.name(),
        Some(record.describe()),
    )
}

/// Copy of the parts of a record statements are built from.
struct Snapshot {
    key: Vec<Option<Value>>,
    values: Vec<(String, Value)>,
    references: Vec<(String, RecordRef)>,
    changed: BTreeSet<String>,
    is_new: bool,
}

fn snapshot(record: &RecordRef) -> Snapshot {
    let record = record.read();
    Snapshot {
        key: (0..record.descriptor().number_of_primary_keys())
            .map(|i| record.key_slot(i).cloned().map(Value::from))
            .collect(),
        values: record
            .values()
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect(),
        references: record
            .references()
            .map(|(field, target)| (field.to_string(), target.clone()))
            .collect(),
        changed: record.changed_fields().clone(),
        is_new: record.is_new(),
    }
}

/// The foreign key value written for a reference: the target's single key
/// component, or NULL while it is unknown.
fn reference_value(target: &RecordRef) -> Value {
    match target.primary_key() {
        Some(mut key) if key.len() == 1 => Value::from(key.remove(0)),
        _ => Value::Null,
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

fn where_key(descriptor: &TypeDescriptor, first_param: usize) -> String {
    descriptor
        .key_columns()
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", quote(column.name), first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn key_params(descriptor: &TypeDescriptor, record: &RecordRef) -> Result<Vec<Value>> {
    record
        .primary_key()
        .map(|key| key.into_iter().map(Value::from).collect())
        .ok_or_else(|| {
            Error::UnsupportedState(StateError {
                message: format!("{} record has an incomplete primary key", descriptor.name()),
                record: Some(record.describe()),
            })
        })
}

/// `INSERT` for one record, returning any server-generated key columns.
pub fn insert_statement(descriptor: &TypeDescriptor, record: &RecordRef) -> Result<Statement> {
    let snapshot = snapshot(record);
    let mut columns: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    let mut returning = Vec::new();

    for (column, slot) in descriptor.key_columns().iter().zip(snapshot.key) {
        match column.source {
            KeySource::ServerGenerated => returning.push(column.name),
            KeySource::Supplied => {
                let value = slot.ok_or_else(|| {
                    Error::UnsupportedState(StateError {
                        message: format!("key column {} has no value", column.name),
                        record: Some(record.describe()),
                    })
                })?;
                columns.push(column.name);
                params.push(value);
            }
            KeySource::Reference(field) => {
                let value = snapshot
                    .references
                    .iter()
                    .find(|(name, _)| name == field)
                    .map_or(Value::Null, |(_, target)| reference_value(target));
                columns.push(column.name);
                params.push(value);
            }
        }
    }

    for (column, value) in &snapshot.values {
        if !columns.contains(&column.as_str()) {
            columns.push(column);
            params.push(value.clone());
        }
    }

    for (field, target) in &snapshot.references {
        let Some(reference) = descriptor.reference(field) else {
            continue;
        };
        if !columns.contains(&reference.column_name) {
            columns.push(reference.column_name);
            params.push(reference_value(target));
        }
    }

    let mut sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote(descriptor.table_name()))
    } else {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(descriptor.table_name()),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        )
    };

    if !returning.is_empty() {
        sql.push_str(" RETURNING ");
        sql.push_str(
            &returning
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    Ok(Statement {
        sql,
        params,
        returning,
    })
}

/// `UPDATE` writing every changed field of `record`, or `None` when no
/// column needs writing.
pub fn update_statement(
    descriptor: &TypeDescriptor,
    record: &RecordRef,
) -> Result<Option<Statement>> {
    let snapshot = snapshot(record);
    let mut set_columns: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    let mut fields = snapshot.changed.clone();
    if snapshot.is_new {
        // Inserted ahead of its references: every foreign key is written now.
        fields.extend(snapshot.references.iter().map(|(field, _)| field.clone()));
    }

    for field in &fields {
        if descriptor.key_columns().iter().any(|k| k.name == field.as_str()) {
            continue;
        }
        if let Some(reference) = descriptor.reference(field) {
            let target = snapshot
                .references
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, target)| target);
            set_columns.push(reference.column_name);
            params.push(target.map_or(Value::Null, reference_value));
        } else if let Some((column, value)) = snapshot.values.iter().find(|(c, _)| c == field) {
            set_columns.push(column);
            params.push(value.clone());
        }
    }

    if set_columns.is_empty() {
        return Ok(None);
    }

    let set_clause = set_columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", quote(column), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let where_clause = where_key(descriptor, set_columns.len() + 1);
    params.extend(key_params(descriptor, record)?);

    Ok(Some(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            quote(descriptor.table_name()),
            set_clause,
            where_clause
        ),
        params,
        returning: Vec::new(),
    }))
}

/// Existence probe for a record with nothing to write.
pub fn exists_statement(descriptor: &TypeDescriptor, record: &RecordRef) -> Result<Statement> {
    Ok(Statement {
        sql: format!(
            "SELECT 1 FROM {} WHERE {}",
            quote(descriptor.table_name()),
            where_key(descriptor, 1)
        ),
        params: key_params(descriptor, record)?,
        returning: Vec::new(),
    })
}

/// `DELETE` statements for `records`: one `IN` list for single-column keys,
/// one statement per row otherwise.
pub fn delete_statements(
    descriptor: &TypeDescriptor,
    records: &[RecordRef],
) -> Result<Vec<Statement>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let table = quote(descriptor.table_name());

    if descriptor.is_composite() {
        return records
            .iter()
            .map(|record| {
                Ok(Statement {
                    sql: format!("DELETE FROM {} WHERE {}", table, where_key(descriptor, 1)),
                    params: key_params(descriptor, record)?,
                    returning: Vec::new(),
                })
            })
            .collect();
    }

    let mut params = Vec::with_capacity(records.len());
    for record in records {
        params.extend(key_params(descriptor, record)?);
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();

    Ok(vec![Statement {
        sql: format!(
            "DELETE FROM {} WHERE {} IN ({})",
            table,
            quote(descriptor.key_columns()[0].name),
            placeholders.join(", ")
        ),
        params,
        returning: Vec::new(),
    }])
}
