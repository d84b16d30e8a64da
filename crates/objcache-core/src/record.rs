//! Tracked records and their shared handles.
//!
//! A [`Record`] is one in-memory object participating in a unit of work. It
//! is always shared through a [`RecordRef`], so that every lookup of the
//! same logical row yields the same instance. Flags that depend on other
//! records (commit readiness, references to uninserted records) are computed
//! on the handle, taking one lock at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::descriptor::{KeySource, TypeDescriptor};
use crate::error::{ConfigError, Error, Result, TypeError};
use crate::key::{KeyKind, KeyValue};
use crate::value::Value;

/// Reference key chains deeper than this are treated as unresolved.
const MAX_REFERENCE_KEY_DEPTH: usize = 16;

/// Lifecycle state of a record as seen by the commit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Never written to the store.
    New,
    /// Persisted, with unsaved modifications.
    Changed,
    /// Persisted and unmodified.
    Unchanged,
    /// Marked for deletion.
    Deleted,
}

/// One tracked object.
#[derive(Debug)]
pub struct Record {
    descriptor: Arc<TypeDescriptor>,
    key: Vec<Option<KeyValue>>,
    values: BTreeMap<String, Value>,
    references: BTreeMap<String, RecordRef>,
    is_new: bool,
    is_deleted: bool,
    changed: BTreeSet<String>,
    server_side_properties_hydrated: bool,
    inserted: bool,
    transient: bool,
}

impl Record {
    /// A record the application is about to create.
    pub fn new(descriptor: Arc<TypeDescriptor>) -> Self {
        let arity = descriptor.number_of_primary_keys();
        Self {
            descriptor,
            key: vec![None; arity],
            values: BTreeMap::new(),
            references: BTreeMap::new(),
            is_new: true,
            is_deleted: false,
            changed: BTreeSet::new(),
            server_side_properties_hydrated: false,
            inserted: false,
            transient: false,
        }
    }

    /// A new record built outside any context, waiting to be imported.
    pub fn transient(descriptor: Arc<TypeDescriptor>) -> Self {
        Self {
            transient: true,
            ..Self::new(descriptor)
        }
    }

    /// A record materialized from a row the store already holds.
    pub fn persisted(descriptor: Arc<TypeDescriptor>) -> Self {
        Self {
            is_new: false,
            ..Self::new(descriptor)
        }
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn type_name(&self) -> &'static str {
        self.descriptor.name()
    }

    // ------------------------------------------------------------------
    // Builders (no change tracking)
    // ------------------------------------------------------------------

    pub fn with_key(mut self, column: &str, key: impl Into<KeyValue>) -> Result<Self> {
        self.assign_key(column, key.into())?;
        Ok(self)
    }

    #[must_use]
    pub fn with_value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    pub fn with_reference(mut self, field: &str, target: RecordRef) -> Result<Self> {
        self.check_reference_field(field)?;
        self.references.insert(field.to_string(), target);
        Ok(self)
    }

    #[must_use]
    pub fn into_ref(self) -> RecordRef {
        RecordRef::new(self)
    }

    // ------------------------------------------------------------------
    // Mutators (tracked)
    // ------------------------------------------------------------------

    /// Assign a data column and mark it changed.
    pub fn set_value(&mut self, column: &str, value: impl Into<Value>) {
        self.values.insert(column.to_string(), value.into());
        self.changed.insert(column.to_string());
    }

    /// Assign an application-supplied or server-generated key component.
    pub fn set_key(&mut self, column: &str, key: impl Into<KeyValue>) -> Result<()> {
        self.assign_key(column, key.into())?;
        self.changed.insert(column.to_string());
        Ok(())
    }

    /// Point a reference field at another record and mark it changed.
    pub fn set_reference(&mut self, field: &str, target: RecordRef) -> Result<()> {
        self.check_reference_field(field)?;
        self.references.insert(field.to_string(), target);
        self.changed.insert(field.to_string());
        Ok(())
    }

    pub fn mark_deleted(&mut self) {
        self.is_deleted = true;
    }

    pub fn set_transient(&mut self, transient: bool) {
        self.transient = transient;
    }

    /// Record that the store has written this record in the current commit.
    pub fn mark_inserted(&mut self) {
        self.inserted = true;
    }

    /// Apply a column value produced by the store at insert time.
    pub fn apply_server_generated(&mut self, column: &str, value: &Value) -> Result<()> {
        let key_column = self
            .descriptor
            .key_columns()
            .iter()
            .position(|k| k.name == column && k.is_server_generated());

        match key_column {
            Some(index) => {
                let kind = self.descriptor.key_kinds()[index];
                let key = KeyValue::from_value(kind, value)
                    .ok_or_else(|| key_type_error(kind, value, column))?;
                self.key[index] = Some(key);
            }
            None => {
                self.values.insert(column.to_string(), value.clone());
            }
        }
        self.server_side_properties_hydrated = true;
        Ok(())
    }

    /// Forget pending modifications after they were written.
    pub fn reset_changes(&mut self) {
        self.changed.clear();
        self.server_side_properties_hydrated = false;
    }

    /// Settle the record after a successful commit.
    pub fn mark_committed(&mut self) {
        self.is_new = false;
        self.inserted = false;
        self.reset_changes();
    }

    /// Take values from a re-fetched copy of this row.
    ///
    /// Fields with unsaved local changes keep their local value.
    pub fn merge_fetched(&mut self, incoming: &Record) {
        for (column, value) in &incoming.values {
            if !self.changed.contains(column) {
                self.values.insert(column.clone(), value.clone());
            }
        }
        for (field, target) in &incoming.references {
            if !self.changed.contains(field) {
                self.references.insert(field.clone(), target.clone());
            }
        }
        for (slot, key) in self.key.iter_mut().zip(&incoming.key) {
            if slot.is_none() {
                slot.clone_from(key);
            }
        }
    }

    /// Take every value of `incoming`, marking each one changed.
    pub fn absorb(&mut self, incoming: &Record) {
        for (column, value) in &incoming.values {
            self.values.insert(column.clone(), value.clone());
            self.changed.insert(column.clone());
        }
        for (field, target) in &incoming.references {
            self.references.insert(field.clone(), target.clone());
            self.changed.insert(field.clone());
        }
        for (slot, key) in self.key.iter_mut().zip(&incoming.key) {
            if slot.is_none() {
                slot.clone_from(key);
            }
        }
    }

    /// Turn a deleted, persisted record back into a live one.
    pub fn undelete(&mut self) {
        self.is_deleted = false;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn reference(&self, field: &str) -> Option<&RecordRef> {
        self.references.get(field)
    }

    pub fn references(&self) -> impl Iterator<Item = (&str, &RecordRef)> {
        self.references.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The stored key slot at `index`. Reference-sourced slots are resolved
    /// through [`RecordRef::primary_key`].
    pub fn key_slot(&self, index: usize) -> Option<&KeyValue> {
        self.key.get(index).and_then(Option::as_ref)
    }

    pub fn changed_fields(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn is_inserted(&self) -> bool {
        self.inserted
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn server_side_properties_hydrated(&self) -> bool {
        self.server_side_properties_hydrated
    }

    pub fn state(&self) -> ObjectState {
        if self.is_deleted {
            ObjectState::Deleted
        } else if self.is_new {
            ObjectState::New
        } else if self.has_changes() {
            ObjectState::Changed
        } else {
            ObjectState::Unchanged
        }
    }

    /// True while a server-generated key component is still unknown.
    pub fn lacks_server_generated_key(&self) -> bool {
        self.descriptor
            .key_columns()
            .iter()
            .zip(&self.key)
            .any(|(column, slot)| column.is_server_generated() && slot.is_none())
    }

    fn assign_key(&mut self, column: &str, key: KeyValue) -> Result<()> {
        let index = self
            .descriptor
            .key_columns()
            .iter()
            .position(|k| k.name == column)
            .ok_or_else(|| {
                Error::Config(ConfigError {
                    message: format!("{} has no key column {}", self.type_name(), column),
                })
            })?;

        if let KeySource::Reference(field) = self.descriptor.key_columns()[index].source {
            return Err(Error::Config(ConfigError {
                message: format!(
                    "key column {}.{} is taken from reference {}; assign the reference instead",
                    self.type_name(),
                    column,
                    field
                ),
            }));
        }

        let expected = self.descriptor.key_kinds()[index];
        if key.kind() != expected {
            return Err(Error::Type(TypeError {
                expected: expected.name(),
                actual: key.kind().name().to_string(),
                column: Some(column.to_string()),
            }));
        }

        self.key[index] = Some(key);
        Ok(())
    }

    fn check_reference_field(&self, field: &str) -> Result<()> {
        if self.descriptor.reference(field).is_none() {
            return Err(Error::Config(ConfigError {
                message: format!("{} has no reference field {}", self.type_name(), field),
            }));
        }
        Ok(())
    }
}

fn key_type_error(kind: KeyKind, value: &Value, column: &str) -> Error {
    Error::Type(TypeError {
        expected: kind.name(),
        actual: value.type_name().to_string(),
        column: Some(column.to_string()),
    })
}

/// Shared handle to a tracked [`Record`].
///
/// Equality and hashing are by identity: two handles are equal exactly when
/// they point at the same instance.
#[derive(Clone)]
pub struct RecordRef(Arc<RwLock<Record>>);

impl RecordRef {
    pub fn new(record: Record) -> Self {
        Self(Arc::new(RwLock::new(record)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn descriptor(&self) -> Arc<TypeDescriptor> {
        Arc::clone(self.read().descriptor())
    }

    pub fn type_name(&self) -> &'static str {
        self.read().type_name()
    }

    pub fn state(&self) -> ObjectState {
        self.read().state()
    }

    pub fn number_of_primary_keys(&self) -> usize {
        self.read().descriptor().number_of_primary_keys()
    }

    pub fn number_of_server_generated_key_components(&self) -> usize {
        self.read().descriptor().number_of_server_generated_keys()
    }

    /// Every key component, when all of them are known.
    pub fn primary_key(&self) -> Option<Vec<KeyValue>> {
        self.resolve_key(0)
    }

    /// Every supplied component is present and every reference key field
    /// is assigned. Server-generated components may still be unknown.
    pub fn primary_key_commit_ready(&self) -> bool {
        let record = self.read();
        record
            .descriptor
            .key_columns()
            .iter()
            .zip(&record.key)
            .all(|(column, slot)| match column.source {
                KeySource::Supplied => slot.is_some(),
                KeySource::ServerGenerated => true,
                KeySource::Reference(field) => record.references.contains_key(field),
            })
    }

    /// Some other referenced record is new and has not been written yet.
    ///
    /// A reference to the record itself never blocks its insert.
    pub fn references_new_object(&self) -> bool {
        let (targets, _) = self.targets(false);
        targets.iter().any(target_is_pending)
    }

    /// Some referenced record is new, unwritten, and its key is still
    /// unknown because it waits on a value the store generates. This
    /// includes the record itself when it references itself.
    pub fn references_new_object_with_server_side_properties(&self) -> bool {
        let (targets, refers_to_self) = self.targets(false);
        (refers_to_self && target_awaits_server_key(self))
            || targets.iter().any(target_awaits_server_key)
    }

    /// As [`Self::references_new_object_with_server_side_properties`],
    /// restricted to reference fields that feed the primary key.
    pub fn primary_key_references_new_object_with_server_side_properties(&self) -> bool {
        let (targets, _) = self.targets(true);
        targets.iter().any(target_awaits_server_key)
    }

    /// Short human-readable identification, e.g. `cats(42)` or `cats(?)`.
    pub fn describe(&self) -> String {
        let type_name = self.type_name();
        match self.primary_key() {
            Some(key) => {
                let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
                format!("{}({})", type_name, parts.join(", "))
            }
            None => format!("{}(?)", type_name),
        }
    }

    /// Referenced records other than `self`, and whether `self` is among
    /// the references.
    fn targets(&self, key_fields_only: bool) -> (Vec<RecordRef>, bool) {
        let record = self.read();
        let all: Vec<&RecordRef> = if key_fields_only {
            record
                .descriptor
                .key_columns()
                .iter()
                .filter_map(|column| match column.source {
                    KeySource::Reference(field) => record.references.get(field),
                    _ => None,
                })
                .collect()
        } else {
            record.references.values().collect()
        };

        let refers_to_self = all.iter().any(|target| target.ptr_eq(self));
        let others = all
            .into_iter()
            .filter(|target| !target.ptr_eq(self))
            .cloned()
            .collect();
        (others, refers_to_self)
    }

    fn resolve_key(&self, depth: usize) -> Option<Vec<KeyValue>> {
        if depth > MAX_REFERENCE_KEY_DEPTH {
            return None;
        }

        let mut resolved = Vec::new();
        let mut pending = Vec::new();
        {
            let record = self.read();
            for (index, (column, slot)) in record
                .descriptor
                .key_columns()
                .iter()
                .zip(&record.key)
                .enumerate()
            {
                match column.source {
                    KeySource::Reference(field) => {
                        let target = record.references.get(field)?.clone();
                        pending.push((index, record.descriptor.key_kinds()[index], target));
                        resolved.push(None);
                    }
                    _ => resolved.push(Some(slot.clone()?)),
                }
            }
        }

        for (index, kind, target) in pending {
            if target.ptr_eq(self) {
                return None;
            }
            let mut key = target.resolve_key(depth + 1)?;
            if key.len() != 1 {
                return None;
            }
            let component = key.remove(0);
            let component = if component.kind() == kind {
                component
            } else {
                KeyValue::from_value(kind, &Value::from(component))?
            };
            resolved[index] = Some(component);
        }

        resolved.into_iter().collect()
    }
}

fn target_is_pending(target: &RecordRef) -> bool {
    let record = target.read();
    record.is_new && !record.inserted
}

/// New, unwritten, and its full key (including components taken through
/// references) is not known yet.
fn target_awaits_server_key(target: &RecordRef) -> bool {
    let pending = {
        let record = target.read();
        record.is_new && !record.inserted
    };
    pending && target.primary_key().is_none()
}

impl PartialEq for RecordRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for RecordRef {}

impl Hash for RecordRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(record) => f
                .debug_struct("RecordRef")
                .field("type", &record.type_name())
                .field("key", &record.key)
                .field("state", &record.state())
                .finish(),
            Err(_) => f.write_str("RecordRef(<locked>)"),
        }
    }
}
