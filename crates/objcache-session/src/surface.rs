//! Per-store command surfaces.
//!
//! A [`CommandSurface`] writes batches of records of one type to one
//! physical store. The commit pipeline drives it; implementations only
//! translate records into statements.
//!
//! Inserting is the subtle part: a record can only be written once every
//! record its key depends on has been written, and (without deferrable
//! constraints) once every record it references at all has been written.
//! [`InsertPlan`] implements that classification so every surface agrees.

use std::future::Future;

use objcache_core::{
    Cx, Error, ObjectState, Outcome, RecordRef, Result, StateError, TypeDescriptor,
};

/// Records an insert call could not finish.
#[derive(Debug, Default, Clone)]
pub struct InsertResults {
    /// Written, but holding references whose keys were still unknown;
    /// they need a follow-up UPDATE.
    pub to_fix_up: Vec<RecordRef>,
    /// Not written; try again in the next round.
    pub to_retry: Vec<RecordRef>,
}

/// Statement-level access to one store inside the commit's transaction.
pub trait CommandSurface: Send + Sync {
    /// Whether the store checks foreign keys only at transaction commit.
    fn deferrable_constraints(&self) -> bool;

    /// Insert `records` of `descriptor`'s type.
    ///
    /// Implementations classify with [`InsertPlan::classify`], write the
    /// records it selects, and call [`PlannedInsert::complete`] after each
    /// successful write.
    fn insert(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> impl Future<Output = Outcome<InsertResults, Error>> + Send;

    /// Update `records`, returning the affected row count of each.
    fn update(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send;

    /// Delete `records` by key, returning the total affected rows.
    fn delete(
        &self,
        cx: &Cx,
        descriptor: &TypeDescriptor,
        records: &[RecordRef],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;
}

/// A record selected for insertion.
#[derive(Debug, Clone)]
pub struct PlannedInsert {
    pub record: RecordRef,
    /// The record references a new record, possibly itself, whose key is
    /// not known yet, so its foreign key must be written afterwards.
    pub needs_fix_up: bool,
}

impl PlannedInsert {
    /// Mark the record as written by the store.
    pub fn complete(&self) {
        let mut record = self.record.write();
        record.mark_inserted();
        if !self.needs_fix_up {
            record.reset_changes();
        }
    }
}

/// Classification of one insert batch.
///
/// Every decision is taken against the state at the start of the batch,
/// so records written earlier in the same batch do not unblock later ones.
#[derive(Debug, Default)]
pub struct InsertPlan {
    to_insert: Vec<PlannedInsert>,
    to_retry: Vec<RecordRef>,
    skipped: usize,
}

impl InsertPlan {
    pub fn classify(records: &[RecordRef], deferrable_constraints: bool) -> Result<Self> {
        let mut plan = InsertPlan::default();

        for record in records {
            match record.state() {
                ObjectState::Unchanged => {
                    plan.skipped += 1;
                    continue;
                }
                ObjectState::New => {}
                state @ (ObjectState::Changed | ObjectState::Deleted) => {
                    return Err(Error::UnsupportedState(StateError {
                        message: format!("cannot insert a record in state {:?}", state),
                        record: Some(record.describe()),
                    }));
                }
            }

            let key_complete =
                !record.primary_key_references_new_object_with_server_side_properties();
            let references_ready = deferrable_constraints || !record.references_new_object();

            if key_complete && references_ready {
                plan.to_insert.push(PlannedInsert {
                    record: record.clone(),
                    needs_fix_up: record.references_new_object_with_server_side_properties(),
                });
            } else {
                plan.to_retry.push(record.clone());
            }
        }

        Ok(plan)
    }

    pub fn to_insert(&self) -> &[PlannedInsert] {
        &self.to_insert
    }

    pub fn to_retry(&self) -> &[RecordRef] {
        &self.to_retry
    }

    /// Records skipped because they had nothing to write.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn into_results(self) -> InsertResults {
        InsertResults {
            to_fix_up: self
                .to_insert
                .into_iter()
                .filter(|p| p.needs_fix_up)
                .map(|p| p.record)
                .collect(),
            to_retry: self.to_retry,
        }
    }
}
