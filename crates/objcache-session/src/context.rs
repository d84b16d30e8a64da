//! The transactional object context.
//!
//! An [`ObjectContext`] tracks every record touched inside one transaction.
//! It owns one [`ObjectCache`] per key representation, created on first
//! use, and routes each record to the cache matching its first key column.

use std::collections::HashSet;

use asupersync::{Cx, Outcome};
use objcache_core::{Error, KeyKind, KeyValue, RecordRef, Result};
use uuid::Uuid;

use crate::acquisition::TransactionContext;
use crate::commit::{self, CommitSummary};
use crate::object_cache::{CacheStats, ObjectCache, TypeBatch};

/// Configuration for an [`ObjectContext`].
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Bypass tracking entirely: nothing is cached and commit does nothing.
    pub disable_cache: bool,
    /// Forget deleted records once a commit succeeds.
    pub purge_deleted_after_commit: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            disable_cache: false,
            purge_deleted_after_commit: true,
        }
    }
}

impl ContextConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the cache is bypassed.
    #[must_use]
    pub fn disable_cache(mut self, disable: bool) -> Self {
        self.disable_cache = disable;
        self
    }

    /// Set whether deleted records are forgotten after commit.
    #[must_use]
    pub fn purge_deleted_after_commit(mut self, purge: bool) -> Self {
        self.purge_deleted_after_commit = purge;
        self
    }
}

/// Run `$body` with `$cache` bound to the cache for `$kind`, creating it.
macro_rules! with_cache_mut {
    ($caches:expr, $kind:expr, |$cache:ident| $body:expr) => {
        match $kind {
            KeyKind::Int32 => {
                let $cache = $caches.int32.get_or_insert_with(ObjectCache::new);
                $body
            }
            KeyKind::Int64 => {
                let $cache = $caches.int64.get_or_insert_with(ObjectCache::new);
                $body
            }
            KeyKind::Uuid => {
                let $cache = $caches.uuid.get_or_insert_with(ObjectCache::new);
                $body
            }
            KeyKind::Text => {
                let $cache = $caches.text.get_or_insert_with(ObjectCache::new);
                $body
            }
        }
    };
}

/// Run `$body` once per populated cache, in key-kind order. `$access` is
/// `as_ref` or `as_mut`.
macro_rules! for_each_cache {
    ($caches:expr, $access:ident, |$cache:ident| $body:expr) => {{
        if let Some($cache) = $caches.int32.$access() {
            $body;
        }
        if let Some($cache) = $caches.int64.$access() {
            $body;
        }
        if let Some($cache) = $caches.uuid.$access() {
            $body;
        }
        if let Some($cache) = $caches.text.$access() {
            $body;
        }
    }};
}

/// The four per-kind caches of a context.
#[derive(Debug, Default)]
pub(crate) struct Caches {
    int32: Option<ObjectCache<i32>>,
    int64: Option<ObjectCache<i64>>,
    uuid: Option<ObjectCache<Uuid>>,
    text: Option<ObjectCache<String>>,
}

impl Caches {
    fn cache(&mut self, record: RecordRef, for_import: bool) -> Result<RecordRef> {
        let kind = record.descriptor().key_kind();
        with_cache_mut!(self, kind, |cache| cache.cache(record, for_import))
    }

    fn get(&self, type_name: &str, key: &[KeyValue]) -> Option<RecordRef> {
        match key.first()?.kind() {
            KeyKind::Int32 => self.int32.as_ref()?.get(type_name, key),
            KeyKind::Int64 => self.int64.as_ref()?.get(type_name, key),
            KeyKind::Uuid => self.uuid.as_ref()?.get(type_name, key),
            KeyKind::Text => self.text.as_ref()?.get(type_name, key),
        }
    }

    fn deleted(&mut self, record: &RecordRef) -> Result<()> {
        let kind = record.descriptor().key_kind();
        with_cache_mut!(self, kind, |cache| cache.deleted(record))
    }

    pub(crate) fn assert_ready_for_commit(&mut self) -> Result<()> {
        for_each_cache!(self, as_mut, |cache| cache.assert_ready_for_commit()?);
        Ok(())
    }

    pub(crate) fn process_after_commit(&mut self, purge_deleted: bool) -> Result<()> {
        for_each_cache!(self, as_mut, |cache| cache.process_after_commit(purge_deleted)?);
        Ok(())
    }

    pub(crate) fn insert_batches(&self) -> Vec<TypeBatch> {
        let mut batches = Vec::new();
        for_each_cache!(self, as_ref, |cache| batches.extend(cache.insert_batches()));
        batches
    }

    pub(crate) fn update_batches(&self) -> Vec<TypeBatch> {
        let mut batches = Vec::new();
        for_each_cache!(self, as_ref, |cache| batches.extend(cache.update_batches()));
        batches
    }

    pub(crate) fn delete_batches(&self) -> Vec<TypeBatch> {
        let mut batches = Vec::new();
        for_each_cache!(self, as_ref, |cache| batches.extend(cache.delete_batches()));
        batches
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for_each_cache!(self, as_ref, |cache| stats += cache.stats());
        stats
    }
}

/// Tracks the records of one transaction and commits them.
#[derive(Debug, Default)]
pub struct ObjectContext {
    config: ContextConfig,
    caches: Caches,
}

impl ObjectContext {
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            caches: Caches::default(),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Track `record`, returning the instance that represents its row.
    pub fn cache_object(&mut self, record: RecordRef) -> Result<RecordRef> {
        if self.config.disable_cache {
            return Ok(record);
        }
        self.caches.cache(record, false)
    }

    /// The tracked record of `type_name` with key `key`, if any.
    pub fn get_object(&self, type_name: &str, key: &[KeyValue]) -> Option<RecordRef> {
        if self.config.disable_cache {
            return None;
        }
        self.caches.get(type_name, key)
    }

    /// Mark `record` deleted and schedule it for deletion.
    ///
    /// Deleting a record that is already deleted does nothing.
    pub fn deleted(&mut self, record: &RecordRef) -> Result<()> {
        if record.read().is_deleted() {
            return Ok(());
        }
        record.write().mark_deleted();

        if self.config.disable_cache {
            return Ok(());
        }
        self.caches.deleted(record)
    }

    /// Bring `record` and every record reachable from it under tracking.
    ///
    /// Each reachable record is cached once, as an import, so cyclic
    /// reference graphs terminate.
    pub fn import_object(&mut self, record: &RecordRef) -> Result<()> {
        if self.config.disable_cache {
            return Ok(());
        }
        record.write().set_transient(false);

        let mut visited: HashSet<RecordRef> = HashSet::new();
        let mut stack = vec![record.clone()];
        visited.insert(record.clone());

        while let Some(current) = stack.pop() {
            let targets: Vec<RecordRef> = current
                .read()
                .references()
                .map(|(_, target)| target.clone())
                .collect();
            self.caches.cache(current, true)?;

            for target in targets {
                if visited.insert(target.clone()) {
                    stack.push(target);
                }
            }
        }

        tracing::debug!(records = visited.len(), "Imported record graph");
        Ok(())
    }

    /// Write every tracked change through `transaction`.
    ///
    /// Fails with a missing-primary-key error, before any store is
    /// acquired, if a new record still lacks an application-supplied key.
    pub async fn commit<T: TransactionContext>(
        &mut self,
        cx: &Cx,
        transaction: &mut T,
    ) -> Outcome<CommitSummary, Error> {
        if self.config.disable_cache {
            return Outcome::Ok(CommitSummary::default());
        }
        commit::commit(
            cx,
            &mut self.caches,
            transaction,
            self.config.purge_deleted_after_commit,
        )
        .await
    }

    /// Record counts across every cache.
    pub fn stats(&self) -> CacheStats {
        self.caches.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objcache_core::{KeyColumn, ObjectState, Record, TypeDescriptor};
    use std::sync::Arc;

    fn accounts() -> Arc<TypeDescriptor> {
        TypeDescriptor::builder("accounts")
            .key(KeyColumn::supplied::<uuid::Uuid>("id"))
            .column("owner")
            .build()
            .unwrap()
    }

    fn users() -> Arc<TypeDescriptor> {
        TypeDescriptor::builder("users")
            .key(KeyColumn::supplied::<i32>("id"))
            .reference("manager", "manager_id", "users")
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_builder() {
        let config = ContextConfig::new()
            .disable_cache(true)
            .purge_deleted_after_commit(false);
        assert!(config.disable_cache);
        assert!(!config.purge_deleted_after_commit);
        assert!(ContextConfig::default().purge_deleted_after_commit);
    }

    #[test]
    fn test_routes_by_key_kind() {
        let mut ctx = ObjectContext::default();
        let id = Uuid::new_v4();
        let account = Record::persisted(accounts())
            .with_key("id", id)
            .unwrap()
            .into_ref();
        let user = Record::persisted(users()).with_key("id", 1i32).unwrap().into_ref();

        ctx.cache_object(account.clone()).unwrap();
        ctx.cache_object(user.clone()).unwrap();

        assert!(ctx.get_object("accounts", &[KeyValue::Uuid(id)]).unwrap().ptr_eq(&account));
        assert!(ctx.get_object("users", &[KeyValue::Int32(1)]).unwrap().ptr_eq(&user));
        assert!(ctx.get_object("users", &[KeyValue::Int64(1)]).is_none());
        assert!(ctx.get_object("users", &[]).is_none());
        assert_eq!(ctx.stats().types, 2);
        assert_eq!(ctx.stats().live, 2);
    }

    #[test]
    fn test_deleted_twice_is_noop() {
        let mut ctx = ObjectContext::default();
        let user = ctx
            .cache_object(Record::persisted(users()).with_key("id", 2i32).unwrap().into_ref())
            .unwrap();

        ctx.deleted(&user).unwrap();
        ctx.deleted(&user).unwrap();

        assert_eq!(user.state(), ObjectState::Deleted);
        assert_eq!(ctx.stats().deleted, 1);
        assert!(ctx.get_object("users", &[KeyValue::Int32(2)]).is_none());
    }

    #[test]
    fn test_disabled_cache_passes_through() {
        let mut ctx = ObjectContext::new(ContextConfig::new().disable_cache(true));
        let user = Record::persisted(users()).with_key("id", 3i32).unwrap().into_ref();

        assert!(ctx.cache_object(user.clone()).unwrap().ptr_eq(&user));
        assert!(ctx.get_object("users", &[KeyValue::Int32(3)]).is_none());
        ctx.import_object(&user).unwrap();
        ctx.deleted(&user).unwrap();

        assert!(user.read().is_deleted());
        assert_eq!(ctx.stats(), CacheStats::default());
    }

    #[test]
    fn test_import_cyclic_graph() {
        let mut ctx = ObjectContext::default();
        let a = Record::persisted(users()).with_key("id", 10i32).unwrap().into_ref();
        let b = Record::persisted(users())
            .with_key("id", 11i32)
            .unwrap()
            .with_reference("manager", a.clone())
            .unwrap()
            .into_ref();
        a.write().set_reference("manager", b.clone()).unwrap();
        a.write().reset_changes();
        a.write().set_transient(true);

        ctx.import_object(&a).unwrap();

        assert!(!a.read().is_transient());
        assert_eq!(ctx.stats().live, 2);
        assert!(ctx.get_object("users", &[KeyValue::Int32(11)]).unwrap().ptr_eq(&b));
    }
}
