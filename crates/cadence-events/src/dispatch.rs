//! The per-turn context handed to units and event handlers.

use cadence_store::{Query, RecordKind, StateStore, StoreError};
use cadence_types::{EventData, Fault, SimRng};

use crate::bus::EventBus;

/// Everything a unit or handler may touch during its turn.
///
/// A `Dispatch` borrows the store and the random stream mutably for the
/// duration of one turn, so nothing obtained through it can be kept
/// across ticks. Publishing goes through [`Dispatch::publish`], which
/// tracks the nesting depth of reentrant deliveries.
#[derive(Debug)]
pub struct Dispatch<'a> {
    tick: u64,
    store: &'a mut StateStore,
    bus: &'a EventBus,
    rng: &'a mut SimRng,
    depth: usize,
    fatal: Option<StoreError>,
    unit: Option<&'a str>,
    scope: &'a [RecordKind],
}

impl<'a> Dispatch<'a> {
    /// Open a context for `tick`.
    pub fn new(
        tick: u64,
        store: &'a mut StateStore,
        bus: &'a EventBus,
        rng: &'a mut SimRng,
    ) -> Self {
        Self {
            tick,
            store,
            bus,
            rng,
            depth: 0,
            fatal: None,
            unit: None,
            scope: &[],
        }
    }

    /// Attribute the context to a unit and its declared record kinds.
    #[must_use]
    pub fn scoped(mut self, unit: &'a str, scope: &'a [RecordKind]) -> Self {
        self.unit = Some(unit);
        self.scope = scope;
        self
    }

    /// The tick being executed.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// The unit this context was opened for, if any.
    pub const fn unit(&self) -> Option<&'a str> {
        self.unit
    }

    /// Record kinds the unit declared it requires.
    pub const fn scope(&self) -> &'a [RecordKind] {
        self.scope
    }

    /// Current nesting depth of publish calls.
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Read access to the state store.
    pub fn store(&self) -> &StateStore {
        &*self.store
    }

    /// Write access to the state store.
    pub fn store_mut(&mut self) -> &mut StateStore {
        &mut *self.store
    }

    /// The run's seeded random stream.
    pub fn rng(&mut self) -> &mut SimRng {
        &mut *self.rng
    }

    /// The bus this context publishes to.
    pub const fn bus(&self) -> &'a EventBus {
        self.bus
    }

    /// Entities holding every record kind in the unit's scope.
    pub fn matching(&self) -> Query {
        self.store.query(self.scope)
    }

    /// Publish an event and deliver it synchronously.
    ///
    /// Returns the number of handlers the event was delivered to.
    pub fn publish(&mut self, name: &str, data: EventData) -> usize {
        let bus = self.bus;
        bus.publish(self, name, data)
    }

    /// Report a caught, non-fatal condition.
    pub fn report(&self, fault: Fault) {
        self.bus.report(fault);
    }

    /// Record a fatal store error. The first one recorded wins.
    pub fn fail(&mut self, error: StoreError) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    /// Whether a fatal store error has been recorded.
    pub const fn has_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Take the recorded fatal store error, if any.
    pub fn take_fatal(&mut self) -> Option<StoreError> {
        self.fatal.take()
    }

    pub(crate) fn enter(&mut self) {
        self.depth = self.depth.saturating_add(1);
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}
