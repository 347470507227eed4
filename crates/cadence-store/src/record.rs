//! Typed records, their type-erased form, and the decoder registry.
//!
//! A record is a pure-data value with a serialization form and an
//! optional self-check. Domain code implements [`Record`] for its own
//! structs; the store holds them as [`DynRecord`] trait objects and hands
//! them back typed through downcasting.
//!
//! Restoring a snapshot or loading a scenario turns `{type, data}` pairs
//! back into records. That needs an explicit [`RecordRegistry`] populated
//! at startup: there is no ambient global table of record types.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use cadence_types::Validation;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::StoreError;

/// Type key under which a record is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKind(&'static str);

impl RecordKind {
    /// Create a kind from its stable name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The stable name used in snapshots and scenario files.
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Serialize for RecordKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

/// A typed, pure-data value attached to an entity.
///
/// Implementors choose a stable [`KIND`](Record::KIND) name. Renaming it
/// breaks every snapshot that contains the record.
pub trait Record: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type key.
    const KIND: RecordKind;

    /// Self-check. Never raises; the default accepts everything.
    fn validate(&self) -> Validation {
        Validation::pass()
    }
}

/// Object-safe view of a [`Record`], as held by the store.
pub trait DynRecord: fmt::Debug + Send + Sync + 'static {
    /// Type key of the underlying record.
    fn kind(&self) -> RecordKind;

    /// Serialization form of the record.
    fn to_value(&self) -> Result<Value, StoreError>;

    /// Run the record's self-check.
    fn check(&self) -> Validation;

    /// Borrow as [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutably borrow as [`Any`] for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Convert into a boxed [`Any`] for owned downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Record> DynRecord for T {
    fn kind(&self) -> RecordKind {
        T::KIND
    }

    fn to_value(&self) -> Result<Value, StoreError> {
        serde_json::to_value(self).map_err(|source| StoreError::Encode {
            kind: T::KIND.as_str().to_owned(),
            source,
        })
    }

    fn check(&self) -> Validation {
        Record::validate(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn DynRecord {
    /// Borrow the record as `T` if it is one.
    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the record as `T` if it is one.
    pub fn downcast_mut<T: Record>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Decoder turning serialized data back into a boxed record.
type Decoder = fn(Value) -> Result<Box<dyn DynRecord>, serde_json::Error>;

fn decode_as<T: Record>(data: Value) -> Result<Box<dyn DynRecord>, serde_json::Error> {
    let record: T = serde_json::from_value(data)?;
    Ok(Box::new(record))
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: RecordKind,
    decode: Decoder,
}

/// Explicit table of known record kinds, keyed by stable name.
#[derive(Debug, Clone, Default)]
pub struct RecordRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl RecordRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`. Registering the same kind twice keeps the last decoder.
    pub fn register<T: Record>(&mut self) -> &mut Self {
        self.entries.insert(
            T::KIND.as_str(),
            Entry {
                kind: T::KIND,
                decode: decode_as::<T>,
            },
        );
        self
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with<T: Record>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Resolve a kind name to its registered [`RecordKind`].
    pub fn kind(&self, name: &str) -> Option<RecordKind> {
        self.entries.get(name).map(|entry| entry.kind)
    }

    /// Resolve a kind name, failing on unknown names.
    pub fn require_kind(&self, name: &str) -> Result<RecordKind, StoreError> {
        self.kind(name).ok_or_else(|| StoreError::UnknownRecordKind {
            kind: name.to_owned(),
        })
    }

    /// Decode serialized data of the named kind into a boxed record.
    pub fn decode(&self, name: &str, data: Value) -> Result<Box<dyn DynRecord>, StoreError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| StoreError::UnknownRecordKind {
                kind: name.to_owned(),
            })?;
        (entry.decode)(data).map_err(|source| StoreError::Decode {
            kind: name.to_owned(),
            source,
        })
    }

    /// All registered kinds in name order.
    pub fn kinds(&self) -> impl Iterator<Item = RecordKind> + '_ {
        self.entries.values().map(|entry| entry.kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Health {
        value: u32,
    }

    impl Record for Health {
        const KIND: RecordKind = RecordKind::new("health");

        fn validate(&self) -> Validation {
            Validation::check(self.value <= 100, "health above 100")
        }
    }

    #[test]
    fn decodes_registered_kind() {
        let registry = RecordRegistry::new().with::<Health>();
        let record = registry.decode("health", json!({"value": 40})).unwrap();
        assert_eq!(record.kind(), Health::KIND);
        assert_eq!(record.downcast_ref::<Health>(), Some(&Health { value: 40 }));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let registry = RecordRegistry::new();
        let err = registry.decode("mana", json!({})).unwrap_err();
        assert!(matches!(err, StoreError::UnknownRecordKind { kind } if kind == "mana"));
    }

    #[test]
    fn malformed_data_is_a_decode_error() {
        let registry = RecordRegistry::new().with::<Health>();
        let err = registry.decode("health", json!({"value": "lots"})).unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[test]
    fn erased_check_runs_record_validation() {
        let record: Box<dyn DynRecord> = Box::new(Health { value: 120 });
        let result = record.check();
        assert!(!result.ok);
        assert_eq!(record.to_value().unwrap(), json!({"value": 120}));
    }
}
