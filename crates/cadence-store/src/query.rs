//! Point-in-time query results.
//!
//! A [`Query`] is the list of entities that held every requested kind at
//! the moment it was taken. It owns its ids, so callers may mutate the
//! store while walking it; [`Query::iter`] re-checks each entity against
//! the store it is given and skips the ones that no longer qualify.

use cadence_types::EntityId;

use crate::record::{DynRecord, Record, RecordKind};
use crate::store::{Records, StateStore};

/// Entities matching a set of record kinds, in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    kinds: Vec<RecordKind>,
    matches: Vec<EntityId>,
}

impl Query {
    pub(crate) const fn new(kinds: Vec<RecordKind>, matches: Vec<EntityId>) -> Self {
        Self { kinds, matches }
    }

    /// The kinds this query required.
    pub fn kinds(&self) -> &[RecordKind] {
        &self.kinds
    }

    /// Matching entity ids.
    pub fn ids(&self) -> &[EntityId] {
        &self.matches
    }

    /// Number of matches.
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Whether nothing matched.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Whether `id` was among the matches.
    pub fn contains(&self, id: EntityId) -> bool {
        self.matches.binary_search(&id).is_ok()
    }

    /// Walk the matches with a view of each entity's records.
    ///
    /// The walk may be restarted any number of times.
    pub fn iter<'q>(&'q self, store: &'q StateStore) -> QueryIter<'q> {
        QueryIter {
            store,
            kinds: &self.kinds,
            ids: self.matches.iter(),
        }
    }
}

/// Iterator returned by [`Query::iter`].
#[derive(Debug)]
pub struct QueryIter<'q> {
    store: &'q StateStore,
    kinds: &'q [RecordKind],
    ids: std::slice::Iter<'q, EntityId>,
}

impl<'q> Iterator for QueryIter<'q> {
    type Item = (EntityId, RecordView<'q>);

    fn next(&mut self) -> Option<Self::Item> {
        for &id in self.ids.by_ref() {
            let Some(records) = self.store.records(id) else {
                continue;
            };
            if self.kinds.iter().all(|kind| records.contains_key(kind)) {
                return Some((id, RecordView { id, records }));
            }
        }
        None
    }
}

/// Read-only view of one entity's records.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'q> {
    id: EntityId,
    records: &'q Records,
}

impl<'q> RecordView<'q> {
    /// The entity this view belongs to.
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// The record of type `T`, if attached.
    pub fn get<T: Record>(&self) -> Option<&'q T> {
        self.records
            .get(&T::KIND)
            .and_then(|record| record.downcast_ref::<T>())
    }

    /// The record of `kind`, type-erased.
    pub fn get_dyn(&self, kind: RecordKind) -> Option<&'q dyn DynRecord> {
        self.records.get(&kind).map(|record| &**record)
    }

    /// Kinds attached to the entity.
    pub fn kinds(&self) -> impl Iterator<Item = RecordKind> + 'q {
        self.records.keys().copied()
    }
}
