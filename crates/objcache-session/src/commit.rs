//! The commit pipeline.
//!
//! A commit writes every tracked change in a fixed order:
//!
//! 1. Check that every new record has its application-supplied key.
//! 2. Insert new records, in rounds, until nothing is left to retry.
//! 3. Write the foreign keys of records inserted before their references.
//! 4. Update changed records.
//! 5. Delete records scheduled for deletion.
//! 6. Settle the caches.
//!
//! Stores are acquired lazily, once each. When anything fails every
//! acquisition is marked errored; every acquisition is released either way.

use asupersync::{Cx, Outcome};
use objcache_core::{DependencyError, Error, MissingObjectError, RecordRef, TypeDescriptor};

use crate::acquisition::{AcquisitionSet, TransactionContext};
use crate::context::Caches;
use crate::object_cache::TypeBatch;
use crate::surface::CommandSurface;

/// What a commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// New records written by INSERT
    pub inserted: usize,
    /// Inserted records whose foreign keys were written afterwards
    pub fixed_up: usize,
    /// Tracked records written by UPDATE
    pub updated: usize,
    /// Rows removed by DELETE
    pub deleted: u64,
    /// Insert rounds needed to write every new record
    pub insert_rounds: usize,
}

/// Propagate anything but `Ok` out of the enclosing function.
macro_rules! try_outcome {
    ($outcome:expr) => {
        match $outcome {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Turn a `Result` into an early `Outcome::Err` return.
macro_rules! try_result {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => return Outcome::Err(e),
        }
    };
}

/// Return early when `cx` has been cancelled.
macro_rules! checkpoint {
    ($cx:expr) => {
        if let Some(reason) = $cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
    };
}

#[tracing::instrument(level = "info", skip_all)]
pub(crate) async fn commit<T: TransactionContext>(
    cx: &Cx,
    caches: &mut Caches,
    transaction: &mut T,
    purge_deleted: bool,
) -> Outcome<CommitSummary, Error> {
    try_result!(caches.assert_ready_for_commit());

    let start = std::time::Instant::now();
    let mut acquisitions = AcquisitionSet::new();
    let outcome = write_all(cx, caches, transaction, &mut acquisitions, purge_deleted).await;

    match outcome {
        Outcome::Ok(summary) => {
            try_result!(acquisitions.release_all());
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis(),
                inserted = summary.inserted,
                fixed_up = summary.fixed_up,
                updated = summary.updated,
                deleted = summary.deleted,
                insert_rounds = summary.insert_rounds,
                "Commit complete"
            );
            Outcome::Ok(summary)
        }
        Outcome::Err(e) => {
            tracing::error!(error = %e, "Commit failed");
            Outcome::Err(acquisitions.abort(e))
        }
        Outcome::Cancelled(reason) => {
            tracing::warn!("Commit cancelled");
            match acquisitions.abort(Error::Cancelled) {
                Error::Cancelled => Outcome::Cancelled(reason),
                e => Outcome::Err(e),
            }
        }
        Outcome::Panicked(payload) => {
            acquisitions.set_errored();
            match acquisitions.release_all() {
                Ok(()) => Outcome::Panicked(payload),
                Err(e) => Outcome::Err(e),
            }
        }
    }
}

async fn write_all<T: TransactionContext>(
    cx: &Cx,
    caches: &mut Caches,
    transaction: &mut T,
    acquisitions: &mut AcquisitionSet<T::Acquisition>,
    purge_deleted: bool,
) -> Outcome<CommitSummary, Error> {
    let mut summary = CommitSummary::default();

    let fix_ups = try_outcome!(insert_new(cx, caches, transaction, acquisitions, &mut summary).await);
    for batch in &fix_ups {
        summary.fixed_up += try_outcome!(update_batch(cx, transaction, acquisitions, batch).await);
    }

    for batch in caches.update_batches() {
        summary.updated += try_outcome!(update_batch(cx, transaction, acquisitions, &batch).await);
    }

    for batch in caches.delete_batches() {
        checkpoint!(cx);
        let commands = try_result!(acquisitions.commands(transaction, batch.descriptor.store()));
        tracing::debug!(
            type_name = batch.descriptor.name(),
            count = batch.records.len(),
            "Deleting batch"
        );
        summary.deleted += try_outcome!(commands.delete(cx, &batch.descriptor, &batch.records).await);
    }

    try_result!(caches.process_after_commit(purge_deleted));
    Outcome::Ok(summary)
}

/// Insert every new record, returning the batches that need a fix-up.
async fn insert_new<T: TransactionContext>(
    cx: &Cx,
    caches: &Caches,
    transaction: &mut T,
    acquisitions: &mut AcquisitionSet<T::Acquisition>,
    summary: &mut CommitSummary,
) -> Outcome<Vec<TypeBatch>, Error> {
    let mut pending = caches.insert_batches();
    let mut retry = Vec::new();
    let mut fix_ups = Vec::new();

    while !pending.is_empty() {
        summary.insert_rounds += 1;
        let round = summary.insert_rounds;
        let attempted: usize = pending.iter().map(|b| b.records.len()).sum();
        tracing::debug!(round, records = attempted, "Insert round");

        for batch in pending.drain(..) {
            checkpoint!(cx);
            let commands =
                try_result!(acquisitions.commands(transaction, batch.descriptor.store()));
            let results =
                try_outcome!(commands.insert(cx, &batch.descriptor, &batch.records).await);

            if !results.to_fix_up.is_empty() {
                fix_ups.push(TypeBatch {
                    descriptor: batch.descriptor.clone(),
                    records: results.to_fix_up,
                });
            }
            if !results.to_retry.is_empty() {
                retry.push(TypeBatch {
                    descriptor: batch.descriptor,
                    records: results.to_retry,
                });
            }
        }

        let retried: usize = retry.iter().map(|b| b.records.len()).sum();
        if retried == attempted {
            let records = retry
                .iter()
                .flat_map(|b| b.records.iter().map(RecordRef::describe))
                .collect();
            return Outcome::Err(Error::UnresolvedDependencies(DependencyError {
                round,
                records,
            }));
        }
        summary.inserted += attempted - retried;
        std::mem::swap(&mut pending, &mut retry);
    }

    Outcome::Ok(fix_ups)
}

/// Update one batch, failing on any record the store did not find.
async fn update_batch<T: TransactionContext>(
    cx: &Cx,
    transaction: &mut T,
    acquisitions: &mut AcquisitionSet<T::Acquisition>,
    batch: &TypeBatch,
) -> Outcome<usize, Error> {
    checkpoint!(cx);
    let commands = try_result!(acquisitions.commands(transaction, batch.descriptor.store()));
    tracing::debug!(
        type_name = batch.descriptor.name(),
        count = batch.records.len(),
        "Updating batch"
    );
    let affected = try_outcome!(commands.update(cx, &batch.descriptor, &batch.records).await);

    for (index, record) in batch.records.iter().enumerate() {
        if affected.get(index).copied().unwrap_or(0) == 0 {
            return Outcome::Err(missing_object(&batch.descriptor, record));
        }
        record.write().reset_changes();
    }
    Outcome::Ok(batch.records.len())
}

fn missing_object(descriptor: &TypeDescriptor, record: &RecordRef) -> Error {
    Error::MissingObject(MissingObjectError {
        type_name: descriptor.name().to_string(),
        record: record.describe(),
        sql: None,
    })
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use crate::acquisition::Acquisition;
    use crate::context::{ContextConfig, ObjectContext};
    use crate::surface::{InsertPlan, InsertResults};
    use asupersync::runtime::RuntimeBuilder;
    use objcache_core::{KeyColumn, ObjectState, Record, Result, Value};
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Store {
        next_id: i64,
        calls: Vec<String>,
        missing_updates: bool,
        fail_release: bool,
        errored: usize,
        released: usize,
    }

    #[derive(Clone)]
    struct Commands {
        store: Arc<Mutex<Store>>,
        deferrable: bool,
    }

    impl Commands {
        fn write_new(
            &self,
            descriptor: &TypeDescriptor,
            records: &[RecordRef],
        ) -> Result<InsertResults> {
            let plan = InsertPlan::classify(records, self.deferrable)?;
            let mut store = self.store.lock().unwrap();
            store.calls.push(format!(
                "insert {} x{}",
                descriptor.name(),
                plan.to_insert().len()
            ));
            for planned in plan.to_insert() {
                store.next_id += 1;
                planned
                    .record
                    .write()
                    .apply_server_generated("id", &Value::BigInt(store.next_id))?;
                planned.complete();
            }
            Ok(plan.into_results())
        }
    }

    impl CommandSurface for Commands {
        fn deferrable_constraints(&self) -> bool {
            self.deferrable
        }

        fn insert(
            &self,
            _cx: &Cx,
            descriptor: &TypeDescriptor,
            records: &[RecordRef],
        ) -> impl Future<Output = Outcome<InsertResults, Error>> + Send {
            let result = self.write_new(descriptor, records);
            async move {
                match result {
                    Ok(results) => Outcome::Ok(results),
                    Err(e) => Outcome::Err(e),
                }
            }
        }

        fn update(
            &self,
            _cx: &Cx,
            descriptor: &TypeDescriptor,
            records: &[RecordRef],
        ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
            let mut store = self.store.lock().unwrap();
            store.calls.push(format!("update {} x{}", descriptor.name(), records.len()));
            let rows = if store.missing_updates { 0 } else { 1 };
            let result = vec![rows; records.len()];
            async move { Outcome::Ok(result) }
        }

        fn delete(
            &self,
            _cx: &Cx,
            descriptor: &TypeDescriptor,
            records: &[RecordRef],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            let n = records.len() as u64;
            self.store
                .lock()
                .unwrap()
                .calls
                .push(format!("delete {} x{n}", descriptor.name()));
            async move { Outcome::Ok(n) }
        }
    }

    struct Held {
        commands: Commands,
    }

    impl Acquisition for Held {
        type Commands = Commands;

        fn commands(&self) -> &Commands {
            &self.commands
        }

        fn set_errored(&mut self) {
            self.commands.store.lock().unwrap().errored += 1;
        }

        fn release(self) -> Result<()> {
            let mut store = self.commands.store.lock().unwrap();
            store.released += 1;
            if store.fail_release {
                Err(Error::Custom("release failed".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Transaction {
        commands: Commands,
    }

    impl TransactionContext for Transaction {
        type Acquisition = Held;

        fn acquire(&mut self, _store: &str) -> Result<Held> {
            Ok(Held {
                commands: self.commands.clone(),
            })
        }
    }

    fn transaction(deferrable: bool) -> (Transaction, Arc<Mutex<Store>>) {
        let store = Arc::new(Mutex::new(Store::default()));
        let tx = Transaction {
            commands: Commands {
                store: Arc::clone(&store),
                deferrable,
            },
        };
        (tx, store)
    }

    fn nodes() -> Arc<TypeDescriptor> {
        TypeDescriptor::builder("nodes")
            .key(KeyColumn::server_generated::<i64>("id"))
            .column("label")
            .reference("parent", "parent_id", "nodes")
            .build()
            .unwrap()
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn chain(ctx: &mut ObjectContext) -> (RecordRef, RecordRef, RecordRef) {
        let a = Record::new(nodes()).into_ref();
        let b = Record::new(nodes()).with_reference("parent", a.clone()).unwrap().into_ref();
        let c = Record::new(nodes()).with_reference("parent", b.clone()).unwrap().into_ref();
        for record in [&c, &b, &a] {
            ctx.cache_object(record.clone()).unwrap();
        }
        (a, b, c)
    }

    #[test]
    fn test_retry_rounds_converge() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut ctx = ObjectContext::default();
        let (a, b, c) = chain(&mut ctx);
        let (mut tx, store) = transaction(false);

        let summary = unwrap_outcome(rt.block_on(ctx.commit(&cx, &mut tx)));

        assert_eq!(summary.insert_rounds, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.fixed_up, 0);
        for record in [&a, &b, &c] {
            assert_eq!(record.state(), ObjectState::Unchanged);
        }
        assert!(ctx.get_object("nodes", &c.primary_key().unwrap()).unwrap().ptr_eq(&c));
        let store = store.lock().unwrap();
        assert_eq!(store.calls, vec!["insert nodes x1"; 3]);
        assert_eq!((store.errored, store.released), (0, 1));
    }

    #[test]
    fn test_deferrable_inserts_once_then_fixes_up() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut ctx = ObjectContext::default();
        chain(&mut ctx);
        let (mut tx, store) = transaction(true);

        let summary = unwrap_outcome(rt.block_on(ctx.commit(&cx, &mut tx)));

        assert_eq!(summary.insert_rounds, 1);
        assert_eq!(summary.fixed_up, 2);
        assert_eq!(store.lock().unwrap().calls, vec!["insert nodes x3", "update nodes x2"]);
    }

    #[test]
    fn test_missing_update_aborts_and_releases() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut ctx = ObjectContext::default();
        let node = Record::persisted(nodes()).with_key("id", 9i64).unwrap().into_ref();
        let node = ctx.cache_object(node).unwrap();
        node.write().set_value("label", "renamed");
        let (mut tx, store) = transaction(false);
        store.lock().unwrap().missing_updates = true;

        let outcome = rt.block_on(ctx.commit(&cx, &mut tx));

        let Outcome::Err(err) = outcome else {
            panic!("expected error");
        };
        assert!(err.is_missing_object());
        assert!(err.to_string().contains("nodes(9)"));
        let store = store.lock().unwrap();
        assert_eq!((store.errored, store.released), (1, 1));
        assert_eq!(node.state(), ObjectState::Changed);
    }

    #[test]
    fn test_missing_key_fails_before_acquiring() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let tags = TypeDescriptor::builder("tags")
            .key(KeyColumn::supplied::<String>("code"))
            .build()
            .unwrap();
        let mut ctx = ObjectContext::default();
        ctx.cache_object(Record::new(tags).into_ref()).unwrap();
        let (mut tx, store) = transaction(false);

        let Outcome::Err(err) = rt.block_on(ctx.commit(&cx, &mut tx)) else {
            panic!("expected error");
        };
        assert!(err.is_missing_primary_key());
        let store = store.lock().unwrap();
        assert!(store.calls.is_empty());
        assert_eq!(store.released, 0);
    }

    #[test]
    fn test_release_failure_reported_after_success() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut ctx = ObjectContext::default();
        ctx.cache_object(Record::new(nodes()).into_ref()).unwrap();
        let (mut tx, store) = transaction(false);
        store.lock().unwrap().fail_release = true;

        let Outcome::Err(Error::Acquisition(err)) = rt.block_on(ctx.commit(&cx, &mut tx)) else {
            panic!("expected acquisition error");
        };
        assert_eq!(err.failures.len(), 1);
        assert!(err.cause.is_none());
    }

    #[test]
    fn test_disabled_commit_is_noop() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut ctx = ObjectContext::new(ContextConfig::new().disable_cache(true));
        ctx.cache_object(Record::new(nodes()).into_ref()).unwrap();
        let (mut tx, store) = transaction(false);

        let summary = unwrap_outcome(rt.block_on(ctx.commit(&cx, &mut tx)));
        assert_eq!(summary, CommitSummary::default());
        assert!(store.lock().unwrap().calls.is_empty());
    }
}
