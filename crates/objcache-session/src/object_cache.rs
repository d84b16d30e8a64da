//! Per-key-type object cache.
//!
//! Every transactional context owns one [`ObjectCache`] per supported key
//! representation. Each cache keeps, per record type:
//!
//! - **new**: new records whose key is commit-ready (insertion order kept),
//!   indexed by key once the key is fully known
//! - **pending key**: new records still missing an application-supplied key
//! - **live**: persisted records by key (single or composite)
//! - **deleted**: persisted records scheduled for deletion, by key
//!
//! Lookups always hand back the tracked instance, so the same logical row
//! resolves to the same [`RecordRef`] for the lifetime of the context.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use objcache_core::{
    CompositeKey, Error, KeyKind, KeyValue, MissingPrimaryKeyError, RecordRef, Result,
    StateError, TypeDescriptor, TypeError,
};
use uuid::Uuid;

/// A key representation records can be cached by.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The key kind routed to caches of this representation.
    const KIND: KeyKind;

    /// Extract this representation from a key component of the same kind.
    fn from_key_value(key: &KeyValue) -> Option<Self>;
}

impl CacheKey for i32 {
    const KIND: KeyKind = KeyKind::Int32;

    fn from_key_value(key: &KeyValue) -> Option<Self> {
        match key {
            KeyValue::Int32(v) => Some(*v),
            _ => None,
        }
    }
}

impl CacheKey for i64 {
    const KIND: KeyKind = KeyKind::Int64;

    fn from_key_value(key: &KeyValue) -> Option<Self> {
        match key {
            KeyValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl CacheKey for Uuid {
    const KIND: KeyKind = KeyKind::Uuid;

    fn from_key_value(key: &KeyValue) -> Option<Self> {
        match key {
            KeyValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }
}

impl CacheKey for String {
    const KIND: KeyKind = KeyKind::Text;

    fn from_key_value(key: &KeyValue) -> Option<Self> {
        match key {
            KeyValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// A resolved key as stored in the keyed buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CachedKey<K> {
    Single(K),
    Composite(CompositeKey),
}

impl<K: CacheKey> CachedKey<K> {
    fn from_components(components: &[KeyValue]) -> Option<Self> {
        match components {
            [single] => K::from_key_value(single).map(CachedKey::Single),
            _ => Some(CachedKey::Composite(CompositeKey::from(components))),
        }
    }

    fn resolve(record: &RecordRef) -> Result<Self> {
        Self::try_resolve(record)?.ok_or_else(|| {
            Error::UnsupportedState(StateError {
                message: "persisted record has an incomplete primary key".to_string(),
                record: Some(record.describe()),
            })
        })
    }

    /// The record's key, or `None` while some component is unknown.
    fn try_resolve(record: &RecordRef) -> Result<Option<Self>> {
        let Some(components) = record.primary_key() else {
            return Ok(None);
        };
        Self::from_components(&components).map(Some).ok_or_else(|| {
            Error::Type(TypeError {
                expected: K::KIND.name(),
                actual: components
                    .first()
                    .map_or("nothing", |c| c.kind().name())
                    .to_string(),
                column: None,
            })
        })
    }
}

/// Records keyed by their primary key, split by key arity.
#[derive(Debug)]
struct KeyedRecords<K> {
    single: HashMap<K, RecordRef>,
    composite: HashMap<CompositeKey, RecordRef>,
}

impl<K: CacheKey> Default for KeyedRecords<K> {
    fn default() -> Self {
        Self {
            single: HashMap::new(),
            composite: HashMap::new(),
        }
    }
}

impl<K: CacheKey> KeyedRecords<K> {
    fn get(&self, key: &CachedKey<K>) -> Option<&RecordRef> {
        match key {
            CachedKey::Single(k) => self.single.get(k),
            CachedKey::Composite(k) => self.composite.get(k),
        }
    }

    fn insert(&mut self, key: CachedKey<K>, record: RecordRef) -> Option<RecordRef> {
        match key {
            CachedKey::Single(k) => self.single.insert(k, record),
            CachedKey::Composite(k) => self.composite.insert(k, record),
        }
    }

    fn remove(&mut self, key: &CachedKey<K>) -> Option<RecordRef> {
        match key {
            CachedKey::Single(k) => self.single.remove(k),
            CachedKey::Composite(k) => self.composite.remove(k),
        }
    }

    fn records(&self) -> impl Iterator<Item = &RecordRef> {
        self.single.values().chain(self.composite.values())
    }

    fn len(&self) -> usize {
        self.single.len() + self.composite.len()
    }

    fn clear(&mut self) {
        self.single.clear();
        self.composite.clear();
    }
}

/// Insertion-ordered set of records compared by identity.
///
/// Removal leaves a hole in `order`; holes are skipped when iterating.
#[derive(Debug, Default)]
struct IdentitySet {
    order: Vec<Option<RecordRef>>,
    positions: HashMap<RecordRef, usize>,
}

impl IdentitySet {
    fn insert(&mut self, record: RecordRef) -> bool {
        if self.positions.contains_key(&record) {
            return false;
        }
        self.positions.insert(record.clone(), self.order.len());
        self.order.push(Some(record));
        true
    }

    fn remove(&mut self, record: &RecordRef) -> bool {
        let Some(position) = self.positions.remove(record) else {
            return false;
        };
        if self.positions.is_empty() {
            self.order.clear();
        } else if let Some(slot) = self.order.get_mut(position) {
            *slot = None;
        }
        true
    }

    fn iter(&self) -> impl Iterator<Item = &RecordRef> {
        self.order.iter().flatten()
    }

    fn len(&self) -> usize {
        self.positions.len()
    }

    fn clear(&mut self) {
        self.positions.clear();
        self.order.clear();
    }
}

/// All buckets for one record type.
#[derive(Debug)]
struct TypeBuckets<K> {
    descriptor: Arc<TypeDescriptor>,
    new: IdentitySet,
    /// Members of `new` whose key was fully known when they were cached.
    new_keyed: KeyedRecords<K>,
    pending_key: IdentitySet,
    live: KeyedRecords<K>,
    deleted: KeyedRecords<K>,
}

impl<K: CacheKey> TypeBuckets<K> {
    fn new(descriptor: Arc<TypeDescriptor>) -> Self {
        Self {
            descriptor,
            new: IdentitySet::default(),
            new_keyed: KeyedRecords::default(),
            pending_key: IdentitySet::default(),
            live: KeyedRecords::default(),
            deleted: KeyedRecords::default(),
        }
    }
}

/// Per-type record counts, as reported by [`ObjectCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Record types with at least one bucket
    pub types: usize,
    /// New, commit-ready records
    pub new: usize,
    /// New records still missing a key component
    pub pending_key: usize,
    /// Persisted records tracked by key
    pub live: usize,
    /// Records scheduled for deletion
    pub deleted: usize,
}

impl CacheStats {
    pub fn total(&self) -> usize {
        self.new + self.pending_key + self.live + self.deleted
    }
}

impl std::ops::AddAssign for CacheStats {
    fn add_assign(&mut self, other: Self) {
        self.types += other.types;
        self.new += other.new;
        self.pending_key += other.pending_key;
        self.live += other.live;
        self.deleted += other.deleted;
    }
}

/// One batch of records of a single type.
#[derive(Debug, Clone)]
pub struct TypeBatch {
    pub descriptor: Arc<TypeDescriptor>,
    pub records: Vec<RecordRef>,
}

/// Cache of records whose first key column has representation `K`.
#[derive(Debug)]
pub struct ObjectCache<K: CacheKey> {
    types: BTreeMap<&'static str, TypeBuckets<K>>,
}

impl<K: CacheKey> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey> ObjectCache<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    fn buckets_mut(&mut self, descriptor: &Arc<TypeDescriptor>) -> &mut TypeBuckets<K> {
        self.types
            .entry(descriptor.name())
            .or_insert_with(|| TypeBuckets::new(Arc::clone(descriptor)))
    }

    /// Track `record` and return the canonical instance for it.
    ///
    /// The returned handle may differ from `record` when another instance
    /// already represents the same row; `record`'s data is then folded into
    /// that instance.
    pub fn cache(&mut self, record: RecordRef, for_import: bool) -> Result<RecordRef> {
        let descriptor = record.descriptor();
        let (is_new, is_deleted) = {
            let r = record.read();
            (r.is_new(), r.is_deleted())
        };
        let buckets = self.buckets_mut(&descriptor);

        if is_new {
            if !record.primary_key_commit_ready() {
                buckets.pending_key.insert(record.clone());
                return Ok(record);
            }

            buckets.pending_key.remove(&record);
            buckets.new.insert(record.clone());

            if descriptor.number_of_server_generated_keys() > 0 {
                return Ok(record);
            }

            // Reference key whose target is still waiting on the store.
            let Some(key) = CachedKey::try_resolve(&record)? else {
                return Ok(record);
            };

            if let Some(existing) = buckets.new_keyed.get(&key).cloned() {
                if !existing.ptr_eq(&record) {
                    tracing::debug!(
                        record = %existing.describe(),
                        "New record duplicates another new record; merging"
                    );
                    absorb_into(&existing, &record);
                    buckets.new.remove(&record);
                    return Ok(existing);
                }
            }

            if let Some(existing) = buckets.live.get(&key).cloned() {
                if !existing.ptr_eq(&record) {
                    tracing::debug!(
                        record = %existing.describe(),
                        "New record duplicates a tracked record; merging"
                    );
                    absorb_into(&existing, &record);
                    buckets.new.remove(&record);
                    return Ok(existing);
                }
            }

            if let Some(existing) = buckets.deleted.remove(&key) {
                tracing::debug!(
                    record = %existing.describe(),
                    "Recreating a deleted record; reviving the tracked instance"
                );
                existing.write().undelete();
                absorb_into(&existing, &record);
                buckets.new.remove(&record);
                buckets.live.insert(key, existing.clone());
                return Ok(existing);
            }

            buckets.new_keyed.insert(key, record.clone());
            return Ok(record);
        }

        let key = CachedKey::resolve(&record)?;

        if !for_import {
            if let Some(existing) = buckets.live.get(&key).cloned() {
                if existing.ptr_eq(&record) {
                    return Ok(record);
                }
                let was_deleted = existing.read().is_deleted();
                merge_into(&existing, &record);
                if was_deleted || is_deleted {
                    existing.write().mark_deleted();
                }
                return Ok(existing);
            }
        }

        if let Some(existing) = buckets.deleted.get(&key).cloned() {
            if !for_import {
                if !existing.ptr_eq(&record) {
                    merge_into(&existing, &record);
                }
                existing.write().mark_deleted();
                return Ok(existing);
            }

            if is_deleted {
                buckets.deleted.insert(key, record.clone());
            } else {
                buckets.deleted.remove(&key);
                buckets.live.insert(key, record.clone());
            }
            return Ok(record);
        }

        buckets.live.insert(key, record.clone());
        Ok(record)
    }

    /// Look up a tracked record of `type_name` by its full key.
    pub fn get(&self, type_name: &str, key: &[KeyValue]) -> Option<RecordRef> {
        let buckets = self.types.get(type_name)?;
        let cached = CachedKey::<K>::from_components(key)?;
        buckets
            .live
            .get(&cached)
            .or_else(|| buckets.new_keyed.get(&cached))
            .cloned()
    }

    /// Stop tracking `record` as live; persisted records are scheduled for
    /// deletion, new ones are simply forgotten.
    pub fn deleted(&mut self, record: &RecordRef) -> Result<()> {
        let descriptor = record.descriptor();
        let is_new = record.read().is_new();
        let buckets = self.buckets_mut(&descriptor);

        if is_new {
            buckets.new.remove(record);
            buckets.pending_key.remove(record);
            if let Some(key) = CachedKey::try_resolve(record)? {
                if buckets.new_keyed.get(&key).is_some_and(|r| r.ptr_eq(record)) {
                    buckets.new_keyed.remove(&key);
                }
            }
            return Ok(());
        }

        let key = CachedKey::resolve(record)?;
        buckets.live.remove(&key);
        buckets.deleted.insert(key, record.clone());
        Ok(())
    }

    /// Promote pending records that have become commit-ready.
    ///
    /// Fails with a missing-primary-key error naming one record that is
    /// still not ready.
    pub fn assert_ready_for_commit(&mut self) -> Result<()> {
        let pending: Vec<RecordRef> = self
            .types
            .values()
            .flat_map(|b| b.pending_key.iter().cloned())
            .collect();

        let mut offender = None;
        for record in pending {
            if record.primary_key_commit_ready() {
                self.cache(record, false)?;
            } else if offender.is_none() {
                offender = Some(record);
            }
        }

        match offender {
            Some(record) => Err(Error::MissingPrimaryKey(MissingPrimaryKeyError {
                type_name: record.type_name().to_string(),
                record: record.describe(),
            })),
            None => Ok(()),
        }
    }

    /// Settle every tracked record after the store accepted the commit.
    ///
    /// Every new record's key is resolved before anything moves, so a
    /// record whose key is still unknown leaves the cache untouched.
    pub fn process_after_commit(&mut self, purge_deleted: bool) -> Result<()> {
        let resolved = self
            .types
            .values()
            .map(|buckets| {
                buckets
                    .new
                    .iter()
                    .map(|record| -> Result<(CachedKey<K>, RecordRef)> {
                        Ok((CachedKey::resolve(record)?, record.clone()))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        for (buckets, settled) in self.types.values_mut().zip(resolved) {
            buckets.new.clear();
            buckets.new_keyed.clear();
            for (key, record) in settled {
                record.write().mark_committed();
                buckets.live.insert(key, record);
            }

            for record in buckets.live.records() {
                record.write().reset_changes();
            }

            if purge_deleted {
                buckets.deleted.clear();
            }
        }
        Ok(())
    }

    /// New records, one batch per type with anything to insert.
    pub fn insert_batches(&self) -> Vec<TypeBatch> {
        self.batches(|b| b.new.iter().cloned().collect())
    }

    /// Tracked records with changes or store-hydrated values, per type.
    pub fn update_batches(&self) -> Vec<TypeBatch> {
        self.batches(|b| {
            b.live
                .records()
                .filter(|r| {
                    let record = r.read();
                    record.has_changes() || record.server_side_properties_hydrated()
                })
                .cloned()
                .collect()
        })
    }

    /// Records scheduled for deletion, per type.
    pub fn delete_batches(&self) -> Vec<TypeBatch> {
        self.batches(|b| b.deleted.records().cloned().collect())
    }

    fn batches(&self, select: impl Fn(&TypeBuckets<K>) -> Vec<RecordRef>) -> Vec<TypeBatch> {
        self.types
            .values()
            .filter_map(|buckets| {
                let records = select(buckets);
                (!records.is_empty()).then(|| TypeBatch {
                    descriptor: Arc::clone(&buckets.descriptor),
                    records,
                })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stats().total() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            types: self.types.len(),
            ..CacheStats::default()
        };
        for buckets in self.types.values() {
            stats.new += buckets.new.len();
            stats.pending_key += buckets.pending_key.len();
            stats.live += buckets.live.len();
            stats.deleted += buckets.deleted.len();
        }
        stats
    }
}

fn absorb_into(existing: &RecordRef, incoming: &RecordRef) {
    let incoming = incoming.read();
    existing.write().absorb(&incoming);
}

fn merge_into(existing: &RecordRef, incoming: &RecordRef) {
    let incoming = incoming.read();
    existing.write().merge_fetched(&incoming);
}

#[cfg(test)]
mod tests {
    use super::*;
    use objcache_core::{KeyColumn, ObjectState, Record, Value};

    fn cats() -> Arc<TypeDescriptor> {
        TypeDescriptor::builder("cats")
            .key(KeyColumn::server_generated::<i64>("id"))
            .column("name")
            .build()
            .unwrap()
    }

    fn tags() -> Arc<TypeDescriptor> {
        TypeDescriptor::builder("tags")
            .key(KeyColumn::supplied::<i64>("id"))
            .column("label")
            .build()
            .unwrap()
    }

    fn memberships() -> Arc<TypeDescriptor> {
        TypeDescriptor::builder("memberships")
            .key(KeyColumn::supplied::<i64>("group_id"))
            .key(KeyColumn::supplied::<String>("user"))
            .column("role")
            .build()
            .unwrap()
    }

    fn persisted_tag(id: i64, label: &str) -> RecordRef {
        Record::persisted(tags())
            .with_key("id", id)
            .unwrap()
            .with_value("label", label)
            .into_ref()
    }

    #[test]
    fn test_fetched_twice_yields_same_instance() {
        let mut cache = ObjectCache::<i64>::new();
        let first = cache.cache(persisted_tag(1, "a"), false).unwrap();
        let second = cache.cache(persisted_tag(1, "b"), false).unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(first.read().value("label"), Some(&Value::from("b")));
        assert!(
            cache
                .get("tags", &[KeyValue::Int64(1)])
                .unwrap()
                .ptr_eq(&first)
        );
    }

    #[test]
    fn test_refetch_keeps_unsaved_changes() {
        let mut cache = ObjectCache::<i64>::new();
        let tracked = cache.cache(persisted_tag(1, "a"), false).unwrap();
        tracked.write().set_value("label", "local");

        cache.cache(persisted_tag(1, "remote"), false).unwrap();
        assert_eq!(tracked.read().value("label"), Some(&Value::from("local")));
    }

    #[test]
    fn test_new_with_server_key_stays_new() {
        let mut cache = ObjectCache::<i64>::new();
        let cat = Record::new(cats()).with_value("name", "Tom").into_ref();
        let cached = cache.cache(cat.clone(), false).unwrap();

        assert!(cached.ptr_eq(&cat));
        assert_eq!(cache.stats().new, 1);
        assert_eq!(cache.insert_batches()[0].records.len(), 1);
    }

    #[test]
    fn test_pending_key_until_supplied() {
        let mut cache = ObjectCache::<i64>::new();
        let tag = Record::new(tags()).into_ref();
        cache.cache(tag.clone(), false).unwrap();
        assert_eq!(cache.stats().pending_key, 1);

        let err = cache.assert_ready_for_commit().unwrap_err();
        assert!(err.is_missing_primary_key());
        assert!(err.to_string().contains("tags(?)"));

        tag.write().set_key("id", 5i64).unwrap();
        cache.assert_ready_for_commit().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.pending_key, 0);
        assert_eq!(stats.new, 1);
    }

    #[test]
    fn test_new_duplicate_merges_into_first() {
        let mut cache = ObjectCache::<i64>::new();
        let first = Record::new(tags()).with_key("id", 3i64).unwrap().into_ref();
        let second = Record::new(tags())
            .with_key("id", 3i64)
            .unwrap()
            .with_value("label", "x")
            .into_ref();

        cache.cache(first.clone(), false).unwrap();
        let cached = cache.cache(second, false).unwrap();

        assert!(cached.ptr_eq(&first));
        assert_eq!(cache.stats().new, 1);
        assert_eq!(first.read().value("label"), Some(&Value::from("x")));
        assert!(
            cache
                .get("tags", &[KeyValue::Int64(3)])
                .unwrap()
                .ptr_eq(&first)
        );
    }

    #[test]
    fn test_delete_then_recreate_revives_instance() {
        let mut cache = ObjectCache::<i64>::new();
        let tracked = cache.cache(persisted_tag(7, "old"), false).unwrap();
        tracked.write().mark_deleted();
        cache.deleted(&tracked).unwrap();
        assert_eq!(cache.stats().deleted, 1);

        let recreated = Record::new(tags())
            .with_key("id", 7i64)
            .unwrap()
            .with_value("label", "new")
            .into_ref();
        let cached = cache.cache(recreated, false).unwrap();

        assert!(cached.ptr_eq(&tracked));
        assert_eq!(tracked.state(), ObjectState::Changed);
        let stats = cache.stats();
        assert_eq!((stats.new, stats.live, stats.deleted), (0, 1, 0));
        assert_eq!(cache.update_batches()[0].records.len(), 1);
        assert!(cache.delete_batches().is_empty());
    }

    #[test]
    fn test_import_routes_by_deleted_flag() {
        let mut cache = ObjectCache::<i64>::new();
        let tracked = cache.cache(persisted_tag(2, "a"), false).unwrap();
        tracked.write().mark_deleted();
        cache.deleted(&tracked).unwrap();

        let imported = persisted_tag(2, "b");
        let cached = cache.cache(imported.clone(), true).unwrap();
        assert!(cached.ptr_eq(&imported));
        let stats = cache.stats();
        assert_eq!((stats.live, stats.deleted), (1, 0));
    }

    #[test]
    fn test_fetch_of_deleted_stays_deleted() {
        let mut cache = ObjectCache::<i64>::new();
        let tracked = cache.cache(persisted_tag(4, "a"), false).unwrap();
        tracked.write().mark_deleted();
        cache.deleted(&tracked).unwrap();

        let cached = cache.cache(persisted_tag(4, "b"), false).unwrap();
        assert!(cached.ptr_eq(&tracked));
        assert!(cached.read().is_deleted());
        assert_eq!(cache.stats().deleted, 1);
    }

    #[test]
    fn test_deleting_new_record_forgets_it() {
        let mut cache = ObjectCache::<i64>::new();
        let cat = Record::new(cats()).into_ref();
        cache.cache(cat.clone(), false).unwrap();
        cache.deleted(&cat).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().types, 1);
    }

    #[test]
    fn test_composite_lookup() {
        let mut cache = ObjectCache::<i64>::new();
        let member = Record::persisted(memberships())
            .with_key("group_id", 1i64)
            .unwrap()
            .with_key("user", "ann")
            .unwrap()
            .into_ref();
        cache.cache(member.clone(), false).unwrap();

        let found = cache
            .get("memberships", &[KeyValue::Int64(1), KeyValue::from("ann")])
            .unwrap();
        assert!(found.ptr_eq(&member));
        assert!(
            cache
                .get("memberships", &[KeyValue::Int64(1), KeyValue::from("bob")])
                .is_none()
        );
        assert!(cache.get("memberships", &[KeyValue::Int64(1)]).is_none());
    }

    #[test]
    fn test_process_after_commit_is_idempotent() {
        let mut cache = ObjectCache::<i64>::new();
        let cat = Record::new(cats()).with_value("name", "Tom").into_ref();
        cache.cache(cat.clone(), false).unwrap();
        cat.write()
            .apply_server_generated("id", &Value::BigInt(11))
            .unwrap();

        cache.process_after_commit(true).unwrap();
        let once = cache.stats();
        assert_eq!((once.new, once.live), (0, 1));
        assert_eq!(cat.state(), ObjectState::Unchanged);

        cache.process_after_commit(true).unwrap();
        assert_eq!(cache.stats(), once);
        assert!(
            cache
                .get("cats", &[KeyValue::Int64(11)])
                .unwrap()
                .ptr_eq(&cat)
        );
    }

    #[test]
    fn test_process_after_commit_rejects_unknown_key() {
        let mut cache = ObjectCache::<i64>::new();
        let written = Record::new(cats()).into_ref();
        cache.cache(written.clone(), false).unwrap();
        written
            .write()
            .apply_server_generated("id", &Value::BigInt(1))
            .unwrap();
        cache.cache(Record::new(cats()).into_ref(), false).unwrap();

        let err = cache.process_after_commit(true).unwrap_err();
        assert!(matches!(err, Error::UnsupportedState(_)));

        // Nothing was settled or dropped.
        let stats = cache.stats();
        assert_eq!((stats.new, stats.live), (2, 0));
        assert!(written.read().is_new());
        assert_eq!(cache.insert_batches()[0].records.len(), 2);
    }

    #[test]
    fn test_new_records_indexed_by_key() {
        let mut cache = ObjectCache::<i64>::new();
        let records: Vec<RecordRef> = (0..10_000i64)
            .map(|id| Record::new(tags()).with_key("id", id).unwrap().into_ref())
            .collect();
        for tag in &records {
            assert!(cache.cache(tag.clone(), false).unwrap().ptr_eq(tag));
        }
        assert_eq!(cache.stats().new, 10_000);

        for (id, tag) in (0..10_000i64).zip(&records) {
            assert!(cache.get("tags", &[KeyValue::Int64(id)]).unwrap().ptr_eq(tag));
        }

        // Removing from the middle keeps insertion order.
        cache.deleted(&records[5_000]).unwrap();
        let batches = cache.insert_batches();
        let batch = &batches[0].records;
        assert_eq!(batch.len(), 9_999);
        assert!(batch[4_999].ptr_eq(&records[4_999]));
        assert!(batch[5_000].ptr_eq(&records[5_001]));
    }

    #[test]
    fn test_deleted_new_record_leaves_key_index() {
        let mut cache = ObjectCache::<i64>::new();
        let first = Record::new(tags()).with_key("id", 8i64).unwrap().into_ref();
        cache.cache(first.clone(), false).unwrap();
        cache.deleted(&first).unwrap();
        assert!(cache.get("tags", &[KeyValue::Int64(8)]).is_none());

        let second = Record::new(tags()).with_key("id", 8i64).unwrap().into_ref();
        let cached = cache.cache(second.clone(), false).unwrap();
        assert!(cached.ptr_eq(&second));
        assert_eq!(cache.stats().new, 1);
        assert!(cache.get("tags", &[KeyValue::Int64(8)]).unwrap().ptr_eq(&second));
    }

    #[test]
    fn test_text_cache() {
        let people = TypeDescriptor::builder("people")
            .key(KeyColumn::supplied::<String>("email"))
            .build()
            .unwrap();
        let mut cache = ObjectCache::<String>::new();
        let ann = Record::persisted(people)
            .with_key("email", "ann@example.com")
            .unwrap()
            .into_ref();
        cache.cache(ann.clone(), false).unwrap();
        assert!(
            cache
                .get("people", &[KeyValue::from("ann@example.com")])
                .unwrap()
                .ptr_eq(&ann)
        );
        assert!(cache.get("people", &[KeyValue::Int64(1)]).is_none());
    }
}
