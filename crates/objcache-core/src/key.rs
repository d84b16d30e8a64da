//! Primary key model.
//!
//! Records are cached by the kind of their first key column. Exactly four
//! kinds are supported: 32-bit integers, 64-bit integers, UUIDs and text.
//! Multi-column keys are wrapped in a [`CompositeKey`], whose equality is
//! structural and whose hash mixes at most the first eight components.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use crate::error::{ConfigError, Error, Result};
use crate::types::SqlType;
use crate::value::Value;

/// Maximum number of components mixed into a composite key hash.
const COMPOSITE_HASH_COMPONENTS: usize = 8;

/// The runtime representation of a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    Int32,
    Int64,
    Uuid,
    Text,
}

impl KeyKind {
    /// Map a declared column type onto a key kind.
    ///
    /// Any type other than the four supported representations is a
    /// configuration error.
    pub fn from_sql_type(sql_type: &SqlType) -> Result<Self> {
        match sql_type {
            SqlType::Integer => Ok(KeyKind::Int32),
            SqlType::BigInt => Ok(KeyKind::Int64),
            SqlType::Uuid => Ok(KeyKind::Uuid),
            t if t.is_text() => Ok(KeyKind::Text),
            other => Err(Error::Config(ConfigError {
                message: format!(
                    "unsupported primary key type {}; keys must be INTEGER, BIGINT, UUID or text",
                    other.sql_name()
                ),
            })),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            KeyKind::Int32 => "int32",
            KeyKind::Int64 => "int64",
            KeyKind::Uuid => "uuid",
            KeyKind::Text => "text",
        }
    }
}

/// A single primary key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int32(i32),
    Int64(i64),
    Uuid(Uuid),
    Text(String),
}

impl KeyValue {
    pub const fn kind(&self) -> KeyKind {
        match self {
            KeyValue::Int32(_) => KeyKind::Int32,
            KeyValue::Int64(_) => KeyKind::Int64,
            KeyValue::Uuid(_) => KeyKind::Uuid,
            KeyValue::Text(_) => KeyKind::Text,
        }
    }

    /// Convert a column value produced by the store into a key component.
    ///
    /// Integer widths are coerced to `kind` when the value fits.
    pub fn from_value(kind: KeyKind, value: &Value) -> Option<Self> {
        match kind {
            KeyKind::Int32 => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(KeyValue::Int32),
            KeyKind::Int64 => value.as_i64().map(KeyValue::Int64),
            KeyKind::Uuid => value.as_uuid().map(KeyValue::Uuid),
            KeyKind::Text => value.as_str().map(|s| KeyValue::Text(s.to_string())),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int32(v) => write!(f, "{}", v),
            KeyValue::Int64(v) => write!(f, "{}", v),
            KeyValue::Uuid(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<KeyValue> for Value {
    fn from(key: KeyValue) -> Self {
        match key {
            KeyValue::Int32(v) => Value::Int(v),
            KeyValue::Int64(v) => Value::BigInt(v),
            KeyValue::Uuid(v) => Value::from(v),
            KeyValue::Text(v) => Value::Text(v),
        }
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int32(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int64(v)
    }
}

impl From<Uuid> for KeyValue {
    fn from(v: Uuid) -> Self {
        KeyValue::Uuid(v)
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

/// An ordered multi-column primary key.
#[derive(Debug, Clone)]
pub struct CompositeKey {
    components: Vec<KeyValue>,
}

impl CompositeKey {
    pub fn new(components: Vec<KeyValue>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[KeyValue] {
        &self.components
    }

    pub fn arity(&self) -> usize {
        self.components.len()
    }
}

impl From<&[KeyValue]> for CompositeKey {
    fn from(components: &[KeyValue]) -> Self {
        Self::new(components.to_vec())
    }
}

impl PartialEq for CompositeKey {
    fn eq(&self, other: &Self) -> bool {
        self.components.len() == other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }
}

impl Eq for CompositeKey {}

impl Hash for CompositeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut mixed = self.components.len() as u64;
        for component in self.components.iter().take(COMPOSITE_HASH_COMPONENTS) {
            let mut hasher = DefaultHasher::new();
            component.hash(&mut hasher);
            mixed = mixed.wrapping_mul(31).wrapping_add(hasher.finish());
        }
        state.write_u64(mixed);
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", component)?;
        }
        write!(f, ")")
    }
}
