//! The entity/record state store.
//!
//! All mutation methods are synchronous and take effect immediately. The
//! store is never locked: the scheduler already serializes access by
//! handing exactly one unit (or handler) a mutable borrow at a time.

use std::collections::{BTreeMap, BTreeSet};

use cadence_types::{EntityId, Validation};
use tracing::debug;

use crate::error::StoreError;
use crate::query::Query;
use crate::record::{DynRecord, Record, RecordKind};

/// Records attached to one entity, keyed by kind.
pub(crate) type Records = BTreeMap<RecordKind, Box<dyn DynRecord>>;

/// First identifier issued by a fresh store.
const FIRST_ENTITY_ID: EntityId = EntityId::new(1);

/// Exclusive owner of all entities and their records.
#[derive(Debug)]
pub struct StateStore {
    /// Live entities and their records.
    entities: BTreeMap<EntityId, Records>,
    /// Kind -> entities holding a record of that kind.
    index: BTreeMap<RecordKind, BTreeSet<EntityId>>,
    /// Next identifier to issue. Every id below it counts as issued.
    next_id: EntityId,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an empty store.
    pub const fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id: FIRST_ENTITY_ID,
        }
    }

    /// Rebuild a store from restored entities.
    ///
    /// `next_id` must lie above every restored identifier so that ids
    /// destroyed before the snapshot are never issued again.
    pub fn from_parts(
        entities: Vec<(EntityId, Vec<Box<dyn DynRecord>>)>,
        next_id: EntityId,
    ) -> Result<Self, StoreError> {
        let mut store = Self {
            entities: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id,
        };
        for (id, records) in entities {
            if id >= next_id || store.entities.contains_key(&id) {
                return Err(StoreError::EntityIdReused(id));
            }
            store.entities.insert(id, Records::new());
            for record in records {
                store.attach_dyn(id, record)?;
            }
        }
        Ok(store)
    }

    /// Create a new entity with a fresh identifier.
    pub fn create_entity(&mut self) -> Result<EntityId, StoreError> {
        let id = self.next_id;
        self.next_id = id.next().ok_or(StoreError::IdSpaceExhausted)?;
        self.entities.insert(id, Records::new());
        debug!(entity_id = %id, "entity created");
        Ok(id)
    }

    /// Create an entity under an explicit identifier.
    ///
    /// Fails with [`StoreError::EntityIdReused`] if the identifier was
    /// already issued by this store, live or destroyed.
    pub fn create_entity_with_id(&mut self, id: EntityId) -> Result<(), StoreError> {
        if id < self.next_id {
            return Err(StoreError::EntityIdReused(id));
        }
        self.next_id = id.next().ok_or(StoreError::IdSpaceExhausted)?;
        self.entities.insert(id, Records::new());
        debug!(entity_id = %id, "entity created with explicit id");
        Ok(())
    }

    /// Destroy an entity and every record attached to it.
    ///
    /// The identifier becomes permanently invalid.
    pub fn destroy_entity(&mut self, id: EntityId) -> Result<(), StoreError> {
        let records = self
            .entities
            .remove(&id)
            .ok_or(StoreError::UnknownEntity(id))?;
        for kind in records.keys() {
            self.unindex(*kind, id);
        }
        debug!(entity_id = %id, records = records.len(), "entity destroyed");
        Ok(())
    }

    /// Attach a record, replacing any existing record of the same kind.
    pub fn attach<T: Record>(&mut self, id: EntityId, record: T) -> Result<(), StoreError> {
        self.attach_dyn(id, Box::new(record))
    }

    /// Attach an already boxed record.
    pub fn attach_dyn(&mut self, id: EntityId, record: Box<dyn DynRecord>) -> Result<(), StoreError> {
        let records = self
            .entities
            .get_mut(&id)
            .ok_or(StoreError::UnknownEntity(id))?;
        let kind = record.kind();
        records.insert(kind, record);
        self.index.entry(kind).or_default().insert(id);
        Ok(())
    }

    /// Detach and return the record of type `T`, if present.
    pub fn detach<T: Record>(&mut self, id: EntityId) -> Result<Option<T>, StoreError> {
        let removed = self.detach_kind(id, T::KIND)?;
        Ok(removed
            .and_then(|record| record.into_any().downcast::<T>().ok())
            .map(|boxed| *boxed))
    }

    /// Detach and return the record of `kind`, if present.
    pub fn detach_kind(
        &mut self,
        id: EntityId,
        kind: RecordKind,
    ) -> Result<Option<Box<dyn DynRecord>>, StoreError> {
        let records = self
            .entities
            .get_mut(&id)
            .ok_or(StoreError::UnknownEntity(id))?;
        let removed = records.remove(&kind);
        if removed.is_some() {
            self.unindex(kind, id);
        }
        Ok(removed)
    }

    /// The record of type `T` on `id`, or `None` if either is absent.
    pub fn get<T: Record>(&self, id: EntityId) -> Option<&T> {
        self.get_dyn(id, T::KIND)
            .and_then(|record| record.downcast_ref::<T>())
    }

    /// Mutable access to the record of type `T` on `id`.
    pub fn get_mut<T: Record>(&mut self, id: EntityId) -> Option<&mut T> {
        self.entities
            .get_mut(&id)?
            .get_mut(&T::KIND)
            .and_then(|record| record.downcast_mut::<T>())
    }

    /// The record of `kind` on `id`, type-erased.
    pub fn get_dyn(&self, id: EntityId, kind: RecordKind) -> Option<&dyn DynRecord> {
        self.entities.get(&id)?.get(&kind).map(|record| &**record)
    }

    /// Whether `id` holds a record of `kind`.
    pub fn contains(&self, id: EntityId, kind: RecordKind) -> bool {
        self.index.get(&kind).is_some_and(|set| set.contains(&id))
    }

    /// Whether `id` is a live entity.
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of entities holding a record of `kind`.
    pub fn count_with(&self, kind: RecordKind) -> usize {
        self.index.get(&kind).map_or(0, BTreeSet::len)
    }

    /// Live entity identifiers in ascending order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Records attached to `id`, in kind order. Empty for unknown ids.
    pub fn records_of(&self, id: EntityId) -> impl Iterator<Item = &dyn DynRecord> + '_ {
        self.entities
            .get(&id)
            .into_iter()
            .flat_map(|records| records.values().map(|record| &**record))
    }

    /// The identifier the next [`create_entity`](Self::create_entity)
    /// call will issue.
    pub const fn next_entity_id(&self) -> EntityId {
        self.next_id
    }

    /// All entities holding at least every kind in `kinds`.
    ///
    /// The result is a point-in-time list: entities that gain a matching
    /// record afterwards are not added to it. An empty `kinds` slice
    /// matches every live entity.
    pub fn query(&self, kinds: &[RecordKind]) -> Query {
        if kinds.is_empty() {
            return Query::new(Vec::new(), self.entities.keys().copied().collect());
        }

        let mut postings = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.index.get(kind) {
                Some(set) => postings.push(set),
                None => return Query::new(kinds.to_vec(), Vec::new()),
            }
        }
        // The smallest posting list drives the scan.
        postings.sort_by_key(|set| set.len());

        let matches = match postings.split_first() {
            Some((first, rest)) => first
                .iter()
                .filter(|id| rest.iter().all(|set| set.contains(id)))
                .copied()
                .collect(),
            None => Vec::new(),
        };
        Query::new(kinds.to_vec(), matches)
    }

    /// Run every record's self-check and return the failures.
    pub fn validate_all(&self) -> Vec<(EntityId, RecordKind, Validation)> {
        self.entities
            .iter()
            .flat_map(|(id, records)| {
                records
                    .iter()
                    .map(move |(kind, record)| (*id, *kind, record.check()))
            })
            .filter(|(_, _, validation)| !validation.ok)
            .collect()
    }

    /// Borrow the record map of one entity.
    pub(crate) fn records(&self, id: EntityId) -> Option<&Records> {
        self.entities.get(&id)
    }

    fn unindex(&mut self, kind: RecordKind, id: EntityId) {
        if let Some(set) = self.index.get_mut(&kind) {
            set.remove(&id);
            if set.is_empty() {
                self.index.remove(&kind);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

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

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
    }

    impl Record for Position {
        const KIND: RecordKind = RecordKind::new("position");
    }

    #[test]
    fn attach_query_destroy_scenario() {
        let mut store = StateStore::new();
        let a1 = store.create_entity().unwrap();
        assert_eq!(store.records_of(a1).count(), 0);

        store.attach(a1, Health { value: 100 }).unwrap();
        let query = store.query(&[Health::KIND]);
        let rows: Vec<_> = query.iter(&store).collect();
        assert_eq!(rows.len(), 1);
        let (id, view) = rows.first().unwrap();
        assert_eq!(*id, a1);
        assert_eq!(view.get::<Health>(), Some(&Health { value: 100 }));

        store.destroy_entity(a1).unwrap();
        assert!(store.get::<Health>(a1).is_none());
        let err = store.attach(a1, Health { value: 1 }).unwrap_err();
        assert!(matches!(err, StoreError::UnknownEntity(id) if id == a1));
    }

    #[test]
    fn destroying_unknown_entity_fails() {
        let mut store = StateStore::new();
        let err = store.destroy_entity(EntityId::new(77)).unwrap_err();
        assert!(matches!(err, StoreError::UnknownEntity(_)));
    }

    #[test]
    fn identifiers_are_never_reused() {
        let mut store = StateStore::new();
        let first = store.create_entity().unwrap();
        store.destroy_entity(first).unwrap();
        let second = store.create_entity().unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            store.create_entity_with_id(first),
            Err(StoreError::EntityIdReused(_))
        ));
    }

    #[test]
    fn explicit_ids_advance_the_counter() {
        let mut store = StateStore::new();
        store.create_entity_with_id(EntityId::new(10)).unwrap();
        let next = store.create_entity().unwrap();
        assert_eq!(next, EntityId::new(11));
    }

    #[test]
    fn attaching_same_kind_replaces() {
        let mut store = StateStore::new();
        let id = store.create_entity().unwrap();
        store.attach(id, Health { value: 10 }).unwrap();
        store.attach(id, Health { value: 20 }).unwrap();
        assert_eq!(store.get::<Health>(id), Some(&Health { value: 20 }));
        assert_eq!(store.records_of(id).count(), 1);
        assert_eq!(store.count_with(Health::KIND), 1);
    }

    #[test]
    fn detach_returns_typed_record_and_updates_index() {
        let mut store = StateStore::new();
        let id = store.create_entity().unwrap();
        store.attach(id, Position { x: 1, y: 2 }).unwrap();
        let removed = store.detach::<Position>(id).unwrap();
        assert_eq!(removed, Some(Position { x: 1, y: 2 }));
        assert!(!store.contains(id, Position::KIND));
        assert!(store.query(&[Position::KIND]).is_empty());
        assert_eq!(store.detach::<Position>(id).unwrap(), None);
    }

    #[test]
    fn get_mut_changes_in_place() {
        let mut store = StateStore::new();
        let id = store.create_entity().unwrap();
        store.attach(id, Health { value: 50 }).unwrap();
        if let Some(health) = store.get_mut::<Health>(id) {
            health.value = 49;
        }
        assert_eq!(store.get::<Health>(id).map(|h| h.value), Some(49));
    }

    #[test]
    fn query_requires_every_kind() {
        let mut store = StateStore::new();
        let both = store.create_entity().unwrap();
        let only_health = store.create_entity().unwrap();
        store.attach(both, Health { value: 1 }).unwrap();
        store.attach(both, Position { x: 0, y: 0 }).unwrap();
        store.attach(only_health, Health { value: 2 }).unwrap();

        let query = store.query(&[Health::KIND, Position::KIND]);
        assert_eq!(query.ids(), &[both]);
        assert_eq!(store.query(&[Health::KIND]).len(), 2);
        assert_eq!(store.query(&[]).len(), 2);
    }

    #[test]
    fn attach_during_iteration_does_not_join_the_pass() {
        let mut store = StateStore::new();
        let e1 = store.create_entity().unwrap();
        let e2 = store.create_entity().unwrap();
        let late = store.create_entity().unwrap();
        store.attach(e1, Health { value: 1 }).unwrap();
        store.attach(e2, Health { value: 2 }).unwrap();

        let query = store.query(&[Health::KIND]);
        let mut seen = Vec::new();
        for &id in query.ids() {
            seen.push(id);
            store.attach(late, Health { value: 3 }).unwrap();
        }
        assert_eq!(seen, vec![e1, e2]);
        assert!(!query.contains(late));
        assert!(store.query(&[Health::KIND]).contains(late));
    }

    #[test]
    fn query_iteration_is_restartable_and_skips_destroyed() {
        let mut store = StateStore::new();
        let a = store.create_entity().unwrap();
        let b = store.create_entity().unwrap();
        store.attach(a, Health { value: 1 }).unwrap();
        store.attach(b, Health { value: 2 }).unwrap();

        let query = store.query(&[Health::KIND]);
        assert_eq!(query.iter(&store).count(), 2);
        assert_eq!(query.iter(&store).count(), 2);

        store.destroy_entity(a).unwrap();
        let ids: Vec<_> = query.iter(&store).map(|(id, _)| id).collect();
        assert_eq!(ids, vec![b]);
    }

    #[test]
    fn validate_all_reports_failing_records() {
        let mut store = StateStore::new();
        let ok = store.create_entity().unwrap();
        let bad = store.create_entity().unwrap();
        store.attach(ok, Health { value: 90 }).unwrap();
        store.attach(bad, Health { value: 140 }).unwrap();
        let failures = store.validate_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.first().map(|(id, _, _)| *id), Some(bad));
    }

    #[test]
    fn from_parts_rejects_ids_at_or_above_counter() {
        let records: Vec<Box<dyn DynRecord>> = vec![Box::new(Health { value: 5 })];
        let err = StateStore::from_parts(vec![(EntityId::new(3), records)], EntityId::new(3))
            .unwrap_err();
        assert!(matches!(err, StoreError::EntityIdReused(_)));

        let records: Vec<Box<dyn DynRecord>> = vec![Box::new(Health { value: 5 })];
        let store =
            StateStore::from_parts(vec![(EntityId::new(3), records)], EntityId::new(9)).unwrap();
        assert_eq!(store.next_entity_id(), EntityId::new(9));
        assert_eq!(store.get::<Health>(EntityId::new(3)), Some(&Health { value: 5 }));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create,
        Destroy(usize),
        AttachHealth(usize),
        AttachPosition(usize),
        DetachHealth(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Create),
            (0..8_usize).prop_map(Op::Destroy),
            (0..8_usize).prop_map(Op::AttachHealth),
            (0..8_usize).prop_map(Op::AttachPosition),
            (0..8_usize).prop_map(Op::DetachHealth),
        ]
    }

    proptest! {
        #[test]
        fn index_matches_brute_force(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let mut store = StateStore::new();
            let mut issued: Vec<EntityId> = Vec::new();
            for op in ops {
                match op {
                    Op::Create => issued.push(store.create_entity().unwrap()),
                    Op::Destroy(i) => {
                        if let Some(id) = issued.get(i) {
                            let _ = store.destroy_entity(*id);
                        }
                    }
                    Op::AttachHealth(i) => {
                        if let Some(id) = issued.get(i) {
                            let _ = store.attach(*id, Health { value: 1 });
                        }
                    }
                    Op::AttachPosition(i) => {
                        if let Some(id) = issued.get(i) {
                            let _ = store.attach(*id, Position { x: 0, y: 0 });
                        }
                    }
                    Op::DetachHealth(i) => {
                        if let Some(id) = issued.get(i) {
                            let _ = store.detach::<Health>(*id);
                        }
                    }
                }
            }
            let expected: Vec<EntityId> = store
                .entities()
                .filter(|id| store.get::<Health>(*id).is_some() && store.get::<Position>(*id).is_some())
                .collect();
            let query = store.query(&[Position::KIND, Health::KIND]);
            prop_assert_eq!(query.ids(), expected.as_slice());
        }
    }
}
