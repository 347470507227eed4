//! The orchestrator owning one run.
//!
//! A [`Simulation`] holds the world (store, bus, random stream), the unit
//! scheduler, the action protocol and the checkpoint manager. Each call to
//! [`Simulation::step`] executes exactly one tick:
//!
//! 1. the protocol opens the tick,
//! 2. the scheduler runs every enabled unit,
//! 3. the protocol fails whatever is still unresolved,
//! 4. a checkpoint is written if one is due.
//!
//! Store errors and checkpoint errors are fatal and returned to the
//! caller. Everything else is reported as a [`Fault`] and collected into
//! the [`TickSummary`].

use std::path::PathBuf;
use std::sync::Arc;

use cadence_events::{EventBus, Telemetry};
use cadence_store::{RecordRegistry, StateStore, StoreError};
use cadence_types::{Fault, RunId, SimRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointError, CheckpointManager, Snapshot};
use crate::config::CadenceConfig;
use crate::control::RunControl;
use crate::protocol::{ActionProtocol, ActionTable, FailureReason, SignalModifier};
use crate::scheduler::{Scheduler, SchedulerError, TickError};
use crate::unit::{Strategy, Unit};
use crate::world::World;

/// Errors that halt a run.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// A tick aborted on a fatal error.
    #[error("tick error: {source}")]
    Tick {
        /// The underlying tick error.
        #[from]
        source: TickError,
    },

    /// Capturing, writing or restoring a checkpoint failed.
    #[error("checkpoint error: {source}")]
    Checkpoint {
        /// The underlying checkpoint error.
        #[from]
        source: CheckpointError,
    },

    /// Unit registration or management failed.
    #[error("scheduler error: {source}")]
    Scheduler {
        /// The underlying scheduler error.
        #[from]
        source: SchedulerError,
    },

    /// A store operation outside any tick failed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    /// Tick that ran.
    pub tick: u64,
    /// Units that took at least one turn.
    pub units_run: usize,
    /// Units that failed this tick.
    pub unit_failures: usize,
    /// Unit calls abandoned on timeout.
    pub timeouts: usize,
    /// Units disabled at the end of this tick.
    pub disabled: Vec<String>,
    /// Background calls still outstanding.
    pub background_pending: usize,
    /// Actions proposed this tick.
    pub proposed: u64,
    /// Actions resolved this tick.
    pub resolved: u64,
    /// Actions failed at the end of this tick.
    pub failed_actions: usize,
    /// Live entities after the tick.
    pub entities: usize,
    /// Every fault reported during the tick.
    pub faults: Vec<Fault>,
    /// Checkpoint written after the tick, if one was due.
    pub checkpoint: Option<PathBuf>,
}

/// Assembles a [`Simulation`] from configuration and domain tables.
pub struct SimulationBuilder {
    config: CadenceConfig,
    store: StateStore,
    registry: RecordRegistry,
    actions: ActionTable,
    modifiers: Vec<Box<dyn SignalModifier>>,
    telemetry: Telemetry,
    run_id: Option<RunId>,
}

impl SimulationBuilder {
    /// Initial entities.
    #[must_use]
    pub fn store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    /// Record decoders, used when restoring snapshots.
    #[must_use]
    pub fn registry(mut self, registry: RecordRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Available actions.
    #[must_use]
    pub fn actions(mut self, actions: ActionTable) -> Self {
        self.actions = actions;
        self
    }

    /// Append a signal modifier.
    #[must_use]
    pub fn modifier(mut self, modifier: Box<dyn SignalModifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Telemetry destination. Defaults to discarding.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Use a fixed run id instead of a fresh one.
    #[must_use]
    pub const fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Build the simulation, starting at tick 0.
    pub fn build(self) -> Simulation {
        let bus = EventBus::new(self.telemetry.clone())
            .with_max_depth(self.config.events.max_depth)
            .with_debug_logging(self.config.events.debug_logging);
        let protocol = ActionProtocol::new(Arc::new(self.actions), self.modifiers);
        protocol.install(&bus);

        let checkpoints = (self.config.checkpoint.interval > 0)
            .then(|| CheckpointManager::new(self.config.checkpoint.clone()));
        let run_id = self.run_id.unwrap_or_default();

        info!(
            run_id = %run_id,
            name = %self.config.simulation.name,
            seed = self.config.simulation.seed,
            entities = self.store.entity_count(),
            actions = protocol.actions().len(),
            "Simulation created"
        );

        Simulation {
            world: World::new(self.store, bus, SimRng::seeded(self.config.simulation.seed)),
            scheduler: Scheduler::new(self.config.scheduler),
            protocol,
            registry: self.registry,
            run_id,
            tick: 0,
            checkpoints,
            telemetry: self.telemetry,
        }
    }
}

/// One simulation run.
#[derive(Debug)]
pub struct Simulation {
    world: World,
    scheduler: Scheduler,
    protocol: ActionProtocol,
    registry: RecordRegistry,
    run_id: RunId,
    tick: u64,
    checkpoints: Option<CheckpointManager>,
    telemetry: Telemetry,
}

impl Simulation {
    /// Start building a simulation from `config`.
    pub fn builder(config: &CadenceConfig) -> SimulationBuilder {
        SimulationBuilder {
            config: config.clone(),
            store: StateStore::new(),
            registry: RecordRegistry::new(),
            actions: ActionTable::new(),
            modifiers: Vec::new(),
            telemetry: Telemetry::null(),
            run_id: None,
        }
    }

    /// Register a unit and let it subscribe its handlers.
    pub fn register(&mut self, mut unit: Box<dyn Unit>, strategy: Strategy) -> Result<(), SimulationError> {
        if self.scheduler.contains(unit.name()) {
            return Err(SchedulerError::DuplicateUnit {
                name: unit.name().to_owned(),
            }
            .into());
        }
        unit.subscribe(&self.world.bus);
        self.scheduler.register(unit, strategy)?;
        Ok(())
    }

    /// Next tick to execute.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Identifier of this run.
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The state store.
    pub const fn store(&self) -> &StateStore {
        &self.world.store
    }

    /// Mutable state store, for seeding between ticks.
    pub const fn store_mut(&mut self) -> &mut StateStore {
        &mut self.world.store
    }

    /// The event bus.
    pub const fn bus(&self) -> &EventBus {
        &self.world.bus
    }

    /// The whole world.
    pub const fn world(&self) -> &World {
        &self.world
    }

    /// The unit scheduler.
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Mutable unit scheduler, e.g. to re-enable a unit.
    pub const fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// The action protocol.
    pub const fn protocol(&self) -> &ActionProtocol {
        &self.protocol
    }

    /// Record decoders used for restore.
    pub const fn registry(&self) -> &RecordRegistry {
        &self.registry
    }

    /// The telemetry handle.
    pub const fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Execute one tick.
    pub async fn step(&mut self, control: &RunControl) -> Result<TickSummary, SimulationError> {
        let tick = self.tick;
        debug!(tick, run_id = %self.run_id, "Tick starting");
        let before = self.protocol.stats();

        let stale = self.protocol.begin_tick(&self.world.bus, tick);
        let report = self.scheduler.run_tick(&mut self.world, tick, control).await?;

        let reason = if control.is_stop_requested() {
            FailureReason::Shutdown
        } else {
            FailureReason::DispatchTimeout
        };
        let failed_actions = self.sweep(tick, reason)?.saturating_add(stale);

        self.tick = tick.saturating_add(1);
        let after = self.protocol.stats();
        let faults = self.world.bus.take_faults();

        let checkpoint = match &self.checkpoints {
            Some(manager) if manager.due(self.tick) => Some(manager.write(&self.snapshot()?)?),
            _ => None,
        };

        let summary = TickSummary {
            tick,
            units_run: report.units_run,
            unit_failures: report.failures,
            timeouts: report.timeouts,
            disabled: report.disabled,
            background_pending: report.background_pending,
            proposed: after.proposed.saturating_sub(before.proposed),
            resolved: after.resolved.saturating_sub(before.resolved),
            failed_actions,
            entities: self.world.store.entity_count(),
            faults,
            checkpoint,
        };
        debug!(
            tick,
            units_run = summary.units_run,
            resolved = summary.resolved,
            faults = summary.faults.len(),
            "Tick finished"
        );
        Ok(summary)
    }

    /// Capture the run at the current tick boundary.
    pub fn snapshot(&self) -> Result<Snapshot, CheckpointError> {
        Ok(
            Snapshot::capture(&self.world.store, self.tick, self.world.rng.state(), self.run_id)?
                .with_scheduler(self.scheduler.state())
                .with_next_action_key(self.protocol.next_key()),
        )
    }

    /// Replace the run's state with `snapshot`.
    ///
    /// Register units first: their failure counters are restored by name.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), SimulationError> {
        let restored = snapshot.restore(&self.registry)?;
        self.world.store = restored.store;
        self.world.rng = SimRng::from_state(&restored.rng_state);
        self.tick = restored.tick;
        self.run_id = restored.run_id;
        self.scheduler.restore_state(&restored.scheduler);
        self.protocol.set_next_key(restored.next_action_key);
        info!(
            run_id = %self.run_id,
            tick = self.tick,
            entities = self.world.store.entity_count(),
            "Simulation restored"
        );
        Ok(())
    }

    /// Finish background work and fail whatever actions it leaves open.
    ///
    /// With `drain`, outstanding background calls are awaited up to the
    /// drain budget first; anything left is cancelled. Returns the
    /// number of actions failed.
    pub async fn shutdown(&mut self, drain: bool) -> Result<usize, SimulationError> {
        let tick = self.tick;
        let stale = self.protocol.begin_tick(&self.world.bus, tick);
        if drain {
            let drained = self.scheduler.drain(&mut self.world, tick).await?;
            debug!(tick, drained, "Background calls drained");
        } else {
            let cancelled = self.scheduler.cancel_background(&mut self.world, tick)?;
            debug!(tick, cancelled, "Background calls cancelled");
        }
        let failed = self.sweep(tick, FailureReason::Shutdown)?.saturating_add(stale);
        if let Err(e) = self.telemetry.flush() {
            tracing::warn!(error = %e, "Failed to flush telemetry");
        }
        info!(tick, failed_actions = failed, "Simulation shut down");
        Ok(failed)
    }

    fn sweep(&mut self, tick: u64, reason: FailureReason) -> Result<usize, TickError> {
        let mut ctx = self.world.dispatch(tick);
        let failed = self.protocol.finish_tick(&mut ctx, reason);
        match ctx.take_fatal() {
            Some(source) => Err(TickError::Store {
                tick,
                unit: None,
                source,
            }),
            None => Ok(failed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use cadence_events::{Dispatch, MemoryTelemetry};
    use cadence_store::{Record, RecordKind};
    use rand::RngCore;
    use serde::Deserialize;

    use super::*;
    use crate::config::CheckpointConfig;
    use crate::protocol::{
        ACTION_CHOSEN, ACTION_FAILED, ACTION_OUTCOME_READY, ACTION_RESOLVED, ActionDispatch,
        ActionProposal, ActionSpec, EventPayload, execute_event_name,
    };
    use crate::unit::{Turn, UnitError};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Energy {
        level: u32,
    }

    impl Record for Energy {
        const KIND: RecordKind = RecordKind::new("energy");
    }

    /// Proposes `rest` for every entity with energy.
    struct Decider;

    impl Unit for Decider {
        fn name(&self) -> &str {
            "decider"
        }

        fn required_records(&self) -> Vec<RecordKind> {
            vec![Energy::KIND]
        }

        fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
            for id in ctx.matching().ids().to_vec() {
                let amount = ctx.rng().next_u32().checked_rem(3).unwrap_or(0);
                let proposal = ActionProposal::new(id, "rest").with_params(serde_json::json!({ "amount": amount }));
                ctx.publish(ACTION_CHOSEN, proposal.to_data().map_err(|e| UnitError::failed(e.to_string()))?);
            }
            Ok(Turn::Done)
        }
    }

    /// Applies `rest` by adding `amount` energy.
    struct Rester;

    impl Unit for Rester {
        fn name(&self) -> &str {
            "rester"
        }

        fn subscribe(&mut self, bus: &EventBus) {
            bus.subscribe(execute_event_name("rest"), "rester", |ctx, event| {
                let dispatch = ActionDispatch::from_event(event)?;
                let amount = dispatch.params.get("amount").and_then(serde_json::Value::as_u64).unwrap_or(0);
                if let Some(energy) = ctx.store_mut().get_mut::<Energy>(dispatch.entity_id) {
                    energy.level = energy.level.saturating_add(u32::try_from(amount).unwrap_or(0));
                }
                ctx.publish(ACTION_OUTCOME_READY, dispatch.outcome(true, 1.0).to_data()?);
                Ok(())
            });
        }

        fn update(&mut self, _ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
            Ok(Turn::Done)
        }
    }

    fn config() -> CadenceConfig {
        CadenceConfig::default()
    }

    fn build(config: &CadenceConfig, sink: Option<Arc<MemoryTelemetry>>) -> Simulation {
        let mut store = StateStore::new();
        for level in [1, 5, 9] {
            let id = store.create_entity().unwrap();
            store.attach(id, Energy { level }).unwrap();
        }
        let telemetry = sink.map_or_else(Telemetry::null, |sink| Telemetry::new(sink));
        let mut sim = Simulation::builder(config)
            .store(store)
            .registry(RecordRegistry::new().with::<Energy>())
            .actions(ActionTable::new().with(ActionSpec::new("rest")))
            .telemetry(telemetry)
            .build();
        sim.register(Box::new(Decider), Strategy::Serial).unwrap();
        sim.register(Box::new(Rester), Strategy::Serial).unwrap();
        sim
    }

    fn levels(sim: &Simulation) -> Vec<u32> {
        sim.store()
            .entities()
            .filter_map(|id| sim.store().get::<Energy>(id).map(|e| e.level))
            .collect()
    }

    #[tokio::test]
    async fn step_runs_units_and_resolves_actions() {
        let sink = Arc::new(MemoryTelemetry::new());
        let mut sim = build(&config(), Some(Arc::clone(&sink)));
        let control = RunControl::default();
        let summary = sim.step(&control).await.unwrap();

        assert_eq!(summary.tick, 0);
        assert_eq!(sim.tick(), 1);
        assert_eq!(summary.units_run, 2);
        assert_eq!(summary.proposed, 3);
        assert_eq!(summary.resolved, 3);
        assert_eq!(summary.failed_actions, 0);
        assert!(summary.faults.is_empty());
        assert_eq!(sink.events_named(ACTION_RESOLVED).len(), 3);
    }

    #[tokio::test]
    async fn duplicate_unit_name_is_rejected_before_subscribing() {
        let mut sim = build(&config(), None);
        let before = sim.bus().subscriber_count(&execute_event_name("rest"));
        let err = sim.register(Box::new(Rester), Strategy::Serial).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Scheduler {
                source: SchedulerError::DuplicateUnit { .. }
            }
        ));
        assert_eq!(sim.bus().subscriber_count(&execute_event_name("rest")), before);
    }

    #[tokio::test]
    async fn restored_run_matches_uninterrupted_run() {
        let control = RunControl::default();
        let mut direct = build(&config(), None);
        for _ in 0..3 {
            direct.step(&control).await.unwrap();
        }
        let snapshot = direct.snapshot().unwrap();
        for _ in 0..4 {
            direct.step(&control).await.unwrap();
        }

        let mut resumed = build(&config(), None);
        resumed.restore(snapshot).unwrap();
        assert_eq!(resumed.tick(), 3);
        for _ in 0..4 {
            resumed.step(&control).await.unwrap();
        }

        assert_eq!(levels(&resumed), levels(&direct));
        assert_eq!(resumed.tick(), direct.tick());
        assert_eq!(resumed.run_id(), direct.run_id());
        assert_eq!(resumed.world().rng.state(), direct.world().rng.state());
    }

    #[tokio::test]
    async fn checkpoint_written_when_due() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.checkpoint = CheckpointConfig {
            interval: 2,
            directory: dir.path().to_path_buf(),
            compress: false,
            keep_last: 5,
        };
        let mut sim = build(&config, None);
        let control = RunControl::default();
        let first = sim.step(&control).await.unwrap();
        let second = sim.step(&control).await.unwrap();
        assert!(first.checkpoint.is_none());
        let path = second.checkpoint.unwrap();
        assert_eq!(Snapshot::load(&path).unwrap().tick, 2);
    }

    #[tokio::test]
    async fn unclaimed_actions_fail_at_end_of_tick() {
        let mut sim = Simulation::builder(&config())
            .actions(ActionTable::new().with(ActionSpec::new("rest")))
            .build();
        let id = sim.store_mut().create_entity().unwrap();
        sim.store_mut().attach(id, Energy { level: 1 }).unwrap();
        sim.register(Box::new(Decider), Strategy::Serial).unwrap();

        let summary = sim.step(&RunControl::default()).await.unwrap();
        assert_eq!(summary.failed_actions, 1);
        assert_eq!(summary.resolved, 0);
        assert!(summary
            .faults
            .iter()
            .any(|f| matches!(f, Fault::ActionDispatchTimeout { subscribers: 0, .. })));
    }

    #[tokio::test]
    async fn proposals_from_failure_handlers_do_not_outlive_the_tick() {
        let sink = Arc::new(MemoryTelemetry::new());
        let mut sim = Simulation::builder(&config())
            .actions(ActionTable::new().with(ActionSpec::new("rest")))
            .telemetry(Telemetry::new(sink.clone()))
            .build();
        let first = sim.store_mut().create_entity().unwrap();
        sim.store_mut().attach(first, Energy { level: 1 }).unwrap();
        let second = sim.store_mut().create_entity().unwrap();
        sim.register(Box::new(Decider), Strategy::Serial).unwrap();

        let retried = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let once = Arc::clone(&retried);
        sim.world().bus.subscribe(ACTION_FAILED, "retry_elsewhere", move |ctx, _| {
            if !once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                ctx.publish(ACTION_CHOSEN, ActionProposal::new(second, "rest").to_data()?);
            }
            Ok(())
        });

        let summary = sim.step(&RunControl::default()).await.unwrap();
        assert_eq!(summary.failed_actions, 2);
        assert_eq!(summary.proposed, 2);
        assert_eq!(sim.protocol().in_flight(), 0);
        assert_eq!(sink.events_named(ACTION_FAILED).len(), 2);
        assert_eq!(sim.protocol().stats().timed_out, 2);
    }

    #[tokio::test]
    async fn stop_request_cancels_instead_of_timing_out() {
        let mut sim = Simulation::builder(&config())
            .actions(ActionTable::new().with(ActionSpec::new("rest")))
            .build();
        let id = sim.store_mut().create_entity().unwrap();
        sim.store_mut().attach(id, Energy { level: 1 }).unwrap();
        sim.register(Box::new(Decider), Strategy::Serial).unwrap();

        let control = RunControl::default();
        control.request_stop();
        let summary = sim.step(&control).await.unwrap();
        assert_eq!(summary.failed_actions, 1);
        assert!(summary.faults.iter().any(|f| matches!(f, Fault::ActionCancelled { tick: 0, .. })));
        assert!(!summary
            .faults
            .iter()
            .any(|f| matches!(f, Fault::ActionDispatchTimeout { .. })));
        let stats = sim.protocol().stats();
        assert_eq!((stats.cancelled, stats.timed_out), (1, 0));
    }

    #[tokio::test]
    async fn shutdown_with_nothing_outstanding_is_quiet() {
        let mut sim = build(&config(), None);
        sim.step(&RunControl::default()).await.unwrap();
        assert_eq!(sim.shutdown(true).await.unwrap(), 0);
    }
}
