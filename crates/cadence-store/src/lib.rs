//! Entity/record state store for the Cadence simulation core.
//!
//! The [`StateStore`] is the exclusive owner of every entity and every
//! record attached to one. Records are typed, pure-data values stored
//! under a [`RecordKind`]; at most one record of a kind exists per entity.
//! A kind-to-entity index keeps selective queries proportional to the
//! size of the match set rather than to the entity count.
//!
//! # Modules
//!
//! - [`error`] -- [`StoreError`], the fatal store error type
//! - [`record`] -- [`Record`] trait, type erasure and [`RecordRegistry`]
//! - [`store`] -- [`StateStore`] itself
//! - [`query`] -- Point-in-time [`Query`] results and their iterators

pub mod error;
pub mod query;
pub mod record;
pub mod store;

pub use error::StoreError;
pub use query::{Query, QueryIter, RecordView};
pub use record::{DynRecord, Record, RecordKind, RecordRegistry};
pub use store::StateStore;
