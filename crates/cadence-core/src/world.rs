//! The mutable world a tick operates on.

use cadence_events::{Dispatch, EventBus};
use cadence_store::StateStore;
use cadence_types::SimRng;

/// State store, event bus and random stream of one run.
#[derive(Debug)]
pub struct World {
    /// Every entity and record.
    pub store: StateStore,
    /// The run's event bus.
    pub bus: EventBus,
    /// The run's seeded random stream.
    pub rng: SimRng,
}

impl World {
    /// Assemble a world from its parts.
    pub const fn new(store: StateStore, bus: EventBus, rng: SimRng) -> Self {
        Self { store, bus, rng }
    }

    /// Open a dispatch context for `tick`.
    pub fn dispatch(&mut self, tick: u64) -> Dispatch<'_> {
        Dispatch::new(tick, &mut self.store, &self.bus, &mut self.rng)
    }
}
