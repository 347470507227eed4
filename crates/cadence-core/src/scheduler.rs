//! Per-tick unit scheduler.
//!
//! Units run once per tick in registration order. Adjacent
//! [`Strategy::Concurrent`] registrations form one batch: every member
//! takes its synchronous turn, then the external calls they declared are
//! awaited together and each member is resumed as its call completes.
//! [`Strategy::Background`] units hand their call to a task set and are
//! resumed on whichever later tick finds it finished.
//!
//! # Failure isolation
//!
//! A unit whose turn errors, panics or times out is reported and skipped
//! for the rest of the tick; nothing else is affected. After
//! `failure_threshold` consecutive failing ticks the unit is disabled and
//! a `unit_disabled` event is published. A [`UnitError::Store`] is the one
//! exception: it means the world model is inconsistent and aborts the tick
//! with [`TickError::Store`].

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use cadence_events::{Dispatch, EventBus, panic_message};
use cadence_store::{RecordKind, StoreError};
use cadence_types::{EventData, Fault};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::control::RunControl;
use crate::unit::{AbandonReason, CallError, CallFuture, CallOutcome, Strategy, Turn, Unit, UnitError};
use crate::world::World;

/// Event published when a unit is disabled.
pub const UNIT_DISABLED_EVENT: &str = "unit_disabled";

/// Fatal error that aborts a tick.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    /// A state store operation failed inside a unit or handler.
    #[error("fatal store error at tick {tick}: {source}")]
    Store {
        /// Tick being executed.
        tick: u64,
        /// Unit whose turn raised the error, if it came from a unit.
        unit: Option<String>,
        /// The underlying store error.
        source: StoreError,
    },
}

/// Registration and management errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A unit with the same name is already registered.
    #[error("unit {name} is already registered")]
    DuplicateUnit {
        /// The conflicting name.
        name: String,
    },

    /// No unit with this name is registered.
    #[error("no unit named {name}")]
    UnknownUnit {
        /// The name looked up.
        name: String,
    },
}

/// Per-unit counters carried in snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCounters {
    /// Consecutive failing ticks so far.
    pub consecutive_failures: u32,
    /// Whether the unit has been disabled.
    pub disabled: bool,
}

/// Failure counters of every unit, keyed by unit name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulerState(pub BTreeMap<String, UnitCounters>);

/// Point-in-time status of one registered unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    /// Unit name.
    pub name: String,
    /// Registered strategy.
    pub strategy: Strategy,
    /// Consecutive failing ticks so far.
    pub consecutive_failures: u32,
    /// Whether the unit has been disabled.
    pub disabled: bool,
    /// Whether a background call of this unit is outstanding.
    pub awaiting: bool,
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tick that ran.
    pub tick: u64,
    /// Units that took at least one turn.
    pub units_run: usize,
    /// Units that failed this tick (timeouts included).
    pub failures: usize,
    /// Calls abandoned on timeout.
    pub timeouts: usize,
    /// Units disabled at the end of this tick.
    pub disabled: Vec<String>,
    /// Background calls still outstanding.
    pub background_pending: usize,
}

struct Outstanding {
    label: String,
    since_tick: u64,
}

struct Slot {
    name: String,
    unit: Box<dyn Unit>,
    required: Vec<RecordKind>,
    strategy: Strategy,
    consecutive_failures: u32,
    disabled: bool,
    outstanding: Option<Outstanding>,
}

#[derive(Default)]
struct TickLedger {
    ran: BTreeSet<usize>,
    failed: BTreeSet<usize>,
    timeouts: usize,
}

enum Awaited {
    Completed(Result<Value, CallError>),
    TimedOut,
    Cancelled,
}

/// Output of a background task: the slot it belongs to and the call result.
type BackgroundResult = (usize, Result<Value, CallError>);

/// Runs registered units once per tick.
pub struct Scheduler {
    slots: Vec<Slot>,
    background: JoinSet<BackgroundResult>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("units", &self.slots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("background", &self.background.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            slots: Vec::new(),
            background: JoinSet::new(),
            config,
        }
    }

    /// Register a unit under the record kinds it declares.
    pub fn register(&mut self, unit: Box<dyn Unit>, strategy: Strategy) -> Result<(), SchedulerError> {
        let required = unit.required_records();
        self.register_scoped(unit, required, strategy)
    }

    /// Register a unit with an explicit list of required record kinds.
    pub fn register_scoped(
        &mut self,
        unit: Box<dyn Unit>,
        required: Vec<RecordKind>,
        strategy: Strategy,
    ) -> Result<(), SchedulerError> {
        let name = unit.name().to_owned();
        if self.contains(&name) {
            return Err(SchedulerError::DuplicateUnit { name });
        }
        info!(unit = %name, %strategy, required = required.len(), "Unit registered");
        self.slots.push(Slot {
            name,
            unit,
            required,
            strategy,
            consecutive_failures: 0,
            disabled: false,
            outstanding: None,
        });
        Ok(())
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no unit is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether a unit named `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot.name == name)
    }

    /// Number of background calls still outstanding.
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.outstanding.is_some()).count()
    }

    /// Status of every unit, in registration order.
    pub fn status(&self) -> Vec<UnitStatus> {
        self.slots
            .iter()
            .map(|slot| UnitStatus {
                name: slot.name.clone(),
                strategy: slot.strategy,
                consecutive_failures: slot.consecutive_failures,
                disabled: slot.disabled,
                awaiting: slot.outstanding.is_some(),
            })
            .collect()
    }

    /// Re-enable a disabled unit and clear its failure counter.
    pub fn enable(&mut self, name: &str) -> Result<(), SchedulerError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| SchedulerError::UnknownUnit {
                name: name.to_owned(),
            })?;
        slot.disabled = false;
        slot.consecutive_failures = 0;
        info!(unit = %name, "Unit re-enabled");
        Ok(())
    }

    /// Failure counters of every unit.
    pub fn state(&self) -> SchedulerState {
        SchedulerState(
            self.slots
                .iter()
                .map(|slot| {
                    (
                        slot.name.clone(),
                        UnitCounters {
                            consecutive_failures: slot.consecutive_failures,
                            disabled: slot.disabled,
                        },
                    )
                })
                .collect(),
        )
    }

    /// Apply counters captured by [`state`](Self::state).
    pub fn restore_state(&mut self, state: &SchedulerState) {
        for (name, counters) in &state.0 {
            match self.slots.iter_mut().find(|slot| &slot.name == name) {
                Some(slot) => {
                    slot.consecutive_failures = counters.consecutive_failures;
                    slot.disabled = counters.disabled;
                }
                None => warn!(unit = %name, "Snapshot names a unit that is not registered"),
            }
        }
    }

    /// Run every enabled unit once for `tick`.
    pub async fn run_tick(
        &mut self,
        world: &mut World,
        tick: u64,
        control: &RunControl,
    ) -> Result<TickReport, TickError> {
        let mut ledger = TickLedger::default();
        debug!(tick, units = self.slots.len(), "Scheduler tick starting");

        while let Some(joined) = self.background.try_join_next() {
            self.settle_background(world, tick, joined, &mut ledger)?;
        }

        let mut idx = 0;
        while let Some(strategy) = self.slots.get(idx).map(|slot| slot.strategy) {
            match strategy {
                Strategy::Serial => {
                    self.run_serial(world, tick, idx, control, &mut ledger).await?;
                    idx = idx.saturating_add(1);
                }
                Strategy::Background => {
                    self.run_background(world, tick, idx, &mut ledger)?;
                    idx = idx.saturating_add(1);
                }
                Strategy::Concurrent => {
                    let end = self
                        .slots
                        .iter()
                        .skip(idx)
                        .position(|slot| slot.strategy != Strategy::Concurrent)
                        .map_or(self.slots.len(), |offset| idx.saturating_add(offset));
                    self.run_batch(world, tick, idx..end, control, &mut ledger).await?;
                    idx = end;
                }
            }
        }

        let disabled = self.settle_failures(world, tick, &ledger)?;
        let report = TickReport {
            tick,
            units_run: ledger.ran.len(),
            failures: ledger.failed.len(),
            timeouts: ledger.timeouts,
            disabled,
            background_pending: self.outstanding(),
        };
        debug!(
            tick,
            units_run = report.units_run,
            failures = report.failures,
            background_pending = report.background_pending,
            "Scheduler tick finished"
        );
        Ok(report)
    }

    /// Await outstanding background calls, up to the drain budget, and
    /// resume their units. Calls still running afterwards are cancelled.
    ///
    /// Returns the number of calls that completed.
    pub async fn drain(&mut self, world: &mut World, tick: u64) -> Result<usize, TickError> {
        if self.background.is_empty() {
            return Ok(0);
        }
        info!(tick, outstanding = self.outstanding(), "Draining background calls");
        let deadline = tokio::time::Instant::now().checked_add(self.config.drain_timeout());
        let mut ledger = TickLedger::default();
        let mut drained: usize = 0;
        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.background.join_next()).await {
                        Ok(next) => next,
                        Err(elapsed) => {
                            warn!(tick, %elapsed, "Drain budget exhausted");
                            break;
                        }
                    }
                }
                None => self.background.join_next().await,
            };
            let Some(joined) = next else {
                break;
            };
            self.settle_background(world, tick, joined, &mut ledger)?;
            drained = drained.saturating_add(1);
        }
        self.cancel_background(world, tick)?;
        Ok(drained)
    }

    /// Abort every outstanding background call and tell each owning unit
    /// through [`Unit::on_abandon`].
    ///
    /// Returns the number of calls cancelled.
    pub fn cancel_background(&mut self, world: &mut World, tick: u64) -> Result<usize, TickError> {
        self.background.abort_all();
        self.background.detach_all();
        let mut cancelled: usize = 0;
        for slot in &mut self.slots {
            let Some(outstanding) = slot.outstanding.take() else {
                continue;
            };
            cancelled = cancelled.saturating_add(1);
            info!(
                tick,
                unit = %slot.name,
                call = %outstanding.label,
                since_tick = outstanding.since_tick,
                "Background call cancelled"
            );
            let abandoned = take_turn(world, tick, slot, |unit, ctx| {
                unit.on_abandon(ctx, AbandonReason::Shutdown);
                Ok(())
            })?;
            if let Err(e) = abandoned {
                report_failure(&world.bus, tick, &slot.name, &e);
            }
        }
        Ok(cancelled)
    }

    async fn run_serial(
        &mut self,
        world: &mut World,
        tick: u64,
        idx: usize,
        control: &RunControl,
        ledger: &mut TickLedger,
    ) -> Result<(), TickError> {
        let timeout = self.config.unit_timeout();
        let Some(slot) = self.slots.get_mut(idx) else {
            return Ok(());
        };
        if slot.disabled {
            return Ok(());
        }
        ledger.ran.insert(idx);
        let call = match take_turn(world, tick, slot, |unit, ctx| unit.update(ctx))? {
            Ok(Turn::Done) => return Ok(()),
            Ok(Turn::Await(call)) => call,
            Err(e) => {
                report_failure(&world.bus, tick, &slot.name, &e);
                ledger.failed.insert(idx);
                return Ok(());
            }
        };
        let (label, future) = call.into_parts();
        debug!(tick, unit = %slot.name, call = %label, "Awaiting external call");
        let awaited = await_call(&label, future, timeout, control).await;
        self.finish_call(world, tick, idx, awaited, ledger)
    }

    async fn run_batch(
        &mut self,
        world: &mut World,
        tick: u64,
        members: Range<usize>,
        control: &RunControl,
        ledger: &mut TickLedger,
    ) -> Result<(), TickError> {
        let timeout = self.config.unit_timeout();
        let mut calls = Vec::new();
        for idx in members {
            let Some(slot) = self.slots.get_mut(idx) else {
                continue;
            };
            if slot.disabled {
                continue;
            }
            ledger.ran.insert(idx);
            match take_turn(world, tick, slot, |unit, ctx| unit.update(ctx))? {
                Ok(Turn::Done) => {}
                Ok(Turn::Await(call)) => calls.push((idx, call)),
                Err(e) => {
                    report_failure(&world.bus, tick, &slot.name, &e);
                    ledger.failed.insert(idx);
                }
            }
        }
        if calls.is_empty() {
            return Ok(());
        }

        debug!(tick, calls = calls.len(), "Awaiting concurrent batch");
        let mut pending: FuturesUnordered<_> = calls
            .into_iter()
            .map(|(idx, call)| {
                let (label, future) = call.into_parts();
                async move { (idx, await_call(&label, future, timeout, control).await) }
            })
            .collect();
        while let Some((idx, awaited)) = pending.next().await {
            self.finish_call(world, tick, idx, awaited, ledger)?;
        }
        Ok(())
    }

    fn run_background(
        &mut self,
        world: &mut World,
        tick: u64,
        idx: usize,
        ledger: &mut TickLedger,
    ) -> Result<(), TickError> {
        let Some(slot) = self.slots.get_mut(idx) else {
            return Ok(());
        };
        if slot.disabled || slot.outstanding.is_some() {
            return Ok(());
        }
        ledger.ran.insert(idx);
        match take_turn(world, tick, slot, |unit, ctx| unit.update(ctx))? {
            Ok(Turn::Done) => {}
            Ok(Turn::Await(call)) => {
                let (label, future) = call.into_parts();
                debug!(tick, unit = %slot.name, call = %label, "Background call started");
                self.background.spawn(guard_call(idx, label.clone(), future));
                slot.outstanding = Some(Outstanding {
                    label,
                    since_tick: tick,
                });
            }
            Err(e) => {
                report_failure(&world.bus, tick, &slot.name, &e);
                ledger.failed.insert(idx);
            }
        }
        Ok(())
    }

    fn finish_call(
        &mut self,
        world: &mut World,
        tick: u64,
        idx: usize,
        awaited: Awaited,
        ledger: &mut TickLedger,
    ) -> Result<(), TickError> {
        let timeout_ms = self.config.unit_timeout_ms;
        let Some(slot) = self.slots.get_mut(idx) else {
            return Ok(());
        };
        match awaited {
            Awaited::Completed(result) => {
                let resumed = take_turn(world, tick, slot, |unit, ctx| {
                    unit.resume(ctx, CallOutcome::from(result))
                })?;
                if let Err(e) = resumed {
                    report_failure(&world.bus, tick, &slot.name, &e);
                    ledger.failed.insert(idx);
                }
            }
            Awaited::TimedOut => {
                let abandoned = take_turn(world, tick, slot, |unit, ctx| {
                    unit.on_abandon(ctx, AbandonReason::Timeout);
                    Ok(())
                })?;
                if let Err(e) = abandoned {
                    report_failure(&world.bus, tick, &slot.name, &e);
                }
                world.bus.report(Fault::UnitTimeout {
                    unit: slot.name.clone(),
                    tick,
                    timeout_ms,
                });
                ledger.failed.insert(idx);
                ledger.timeouts = ledger.timeouts.saturating_add(1);
            }
            Awaited::Cancelled => {
                info!(tick, unit = %slot.name, "External call cancelled by shutdown");
                let abandoned = take_turn(world, tick, slot, |unit, ctx| {
                    unit.on_abandon(ctx, AbandonReason::Shutdown);
                    Ok(())
                })?;
                if let Err(e) = abandoned {
                    report_failure(&world.bus, tick, &slot.name, &e);
                }
            }
        }
        Ok(())
    }

    fn settle_background(
        &mut self,
        world: &mut World,
        tick: u64,
        joined: Result<BackgroundResult, JoinError>,
        ledger: &mut TickLedger,
    ) -> Result<(), TickError> {
        let (idx, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(tick, error = %e, "Background task ended without a result");
                return Ok(());
            }
        };
        let Some(slot) = self.slots.get_mut(idx) else {
            return Ok(());
        };
        if let Some(outstanding) = slot.outstanding.take() {
            debug!(
                tick,
                unit = %slot.name,
                call = %outstanding.label,
                since_tick = outstanding.since_tick,
                "Background call completed"
            );
        }
        ledger.ran.insert(idx);
        let resumed = take_turn(world, tick, slot, |unit, ctx| {
            unit.resume(ctx, CallOutcome::from(result))
        })?;
        if let Err(e) = resumed {
            report_failure(&world.bus, tick, &slot.name, &e);
            ledger.failed.insert(idx);
        }
        Ok(())
    }

    fn settle_failures(
        &mut self,
        world: &mut World,
        tick: u64,
        ledger: &TickLedger,
    ) -> Result<Vec<String>, TickError> {
        let threshold = self.config.failure_threshold;
        let mut demoted = Vec::new();
        for idx in &ledger.ran {
            let Some(slot) = self.slots.get_mut(*idx) else {
                continue;
            };
            if !ledger.failed.contains(idx) {
                slot.consecutive_failures = 0;
                continue;
            }
            slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
            if !slot.disabled && slot.consecutive_failures >= threshold {
                slot.disabled = true;
                demoted.push((slot.name.clone(), slot.consecutive_failures));
            }
        }

        let mut disabled = Vec::with_capacity(demoted.len());
        for (name, consecutive_failures) in demoted {
            world.bus.report(Fault::UnitDisabled {
                unit: name.clone(),
                tick,
                consecutive_failures,
            });
            let mut data = EventData::new();
            data.insert("unit".to_owned(), Value::from(name.as_str()));
            data.insert("tick".to_owned(), Value::from(tick));
            data.insert(
                "consecutive_failures".to_owned(),
                Value::from(consecutive_failures),
            );
            let mut ctx = world.dispatch(tick);
            ctx.publish(UNIT_DISABLED_EVENT, data);
            if let Some(source) = ctx.take_fatal() {
                return Err(TickError::Store {
                    tick,
                    unit: None,
                    source,
                });
            }
            disabled.push(name);
        }
        Ok(disabled)
    }
}

/// Run one synchronous turn of a unit, catching panics.
///
/// The outer `Result` carries fatal store errors, the inner one the
/// unit's own (reportable) outcome.
fn take_turn<T>(
    world: &mut World,
    tick: u64,
    slot: &mut Slot,
    turn: impl FnOnce(&mut (dyn Unit + 'static), &mut Dispatch<'_>) -> Result<T, UnitError>,
) -> Result<Result<T, UnitError>, TickError> {
    let Slot {
        name, unit, required, ..
    } = slot;
    let mut ctx = world.dispatch(tick).scoped(name.as_str(), required.as_slice());
    let result = panic::catch_unwind(AssertUnwindSafe(|| turn(unit.as_mut(), &mut ctx)))
        .unwrap_or_else(|payload| Err(UnitError::Panicked(panic_message(payload.as_ref()))));
    if let Some(source) = ctx.take_fatal() {
        return Err(TickError::Store {
            tick,
            unit: Some(name.clone()),
            source,
        });
    }
    match result {
        Err(UnitError::Store { source }) => Err(TickError::Store {
            tick,
            unit: Some(name.clone()),
            source,
        }),
        other => Ok(other),
    }
}

fn report_failure(bus: &EventBus, tick: u64, unit: &str, error: &UnitError) {
    bus.report(Fault::UnitFailure {
        unit: unit.to_owned(),
        tick,
        cause: error.to_string(),
    });
}

async fn guard_call(idx: usize, label: String, future: CallFuture) -> BackgroundResult {
    let result = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(CallError::Panicked {
            label,
            reason: panic_message(payload.as_ref()),
        }),
    };
    (idx, result)
}

async fn await_call(label: &str, future: CallFuture, timeout: Duration, control: &RunControl) -> Awaited {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    tokio::select! {
        biased;
        () = control.stopped() => Awaited::Cancelled,
        result = tokio::time::timeout(timeout, guarded) => match result {
            Ok(Ok(outcome)) => Awaited::Completed(outcome),
            Ok(Err(payload)) => Awaited::Completed(Err(CallError::Panicked {
                label: label.to_owned(),
                reason: panic_message(payload.as_ref()),
            })),
            Err(_) => Awaited::TimedOut,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use cadence_events::Telemetry;
    use cadence_store::StateStore;
    use cadence_types::{EntityId, SimRng};
    use serde_json::json;

    use super::*;
    use crate::unit::PendingCall;

    type Log = Arc<Mutex<Vec<String>>>;

    fn world() -> World {
        World::new(StateStore::new(), EventBus::new(Telemetry::null()), SimRng::seeded(1))
    }

    fn config(failure_threshold: u32) -> SchedulerConfig {
        SchedulerConfig {
            unit_timeout_ms: 100,
            failure_threshold,
            drain_timeout_ms: 1_000,
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Appends its name to the log on every turn.
    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl Unit for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}@{}", self.name, ctx.tick()));
            Ok(Turn::Done)
        }
    }

    /// Fails every turn.
    struct Faulty;

    impl Unit for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn update(&mut self, _ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
            Err(UnitError::failed("always broken"))
        }
    }

    /// Awaits a sleep of `delay_ms`, then logs the outcome.
    struct Sleeper {
        name: &'static str,
        delay_ms: u64,
        log: Log,
    }

    impl Unit for Sleeper {
        fn name(&self) -> &str {
            self.name
        }

        fn update(&mut self, _ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
            let delay = Duration::from_millis(self.delay_ms);
            let name = self.name;
            Ok(Turn::Await(PendingCall::new("sleep", async move {
                tokio::time::sleep(delay).await;
                Ok(json!(name))
            })))
        }

        fn resume(&mut self, ctx: &mut Dispatch<'_>, outcome: CallOutcome) -> Result<(), UnitError> {
            let line = match outcome {
                CallOutcome::Completed(value) => format!("{}:resumed:{value}@{}", self.name, ctx.tick()),
                CallOutcome::Failed(e) => format!("{}:failed:{e}", self.name),
            };
            self.log.lock().unwrap().push(line);
            Ok(())
        }

        fn on_abandon(&mut self, _ctx: &mut Dispatch<'_>, reason: AbandonReason) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:abandoned:{reason}", self.name));
        }
    }

    #[tokio::test]
    async fn serial_units_run_in_registration_order() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        for name in ["first", "second", "third"] {
            scheduler
                .register(Box::new(Recorder { name, log: Arc::clone(&log) }), Strategy::Serial)
                .unwrap();
        }
        let mut world = world();
        let control = RunControl::default();
        let report = scheduler.run_tick(&mut world, 1, &control).await.unwrap();

        assert_eq!(entries(&log), vec!["first@1", "second@1", "third@1"]);
        assert_eq!(report.units_run, 3);
        assert_eq!(report.failures, 0);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(Box::new(Recorder { name: "a", log: Arc::clone(&log) }), Strategy::Serial)
            .unwrap();
        let err = scheduler
            .register(Box::new(Recorder { name: "a", log }), Strategy::Concurrent)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateUnit { name } if name == "a"));
    }

    #[tokio::test]
    async fn failing_unit_is_isolated_then_disabled() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler.register(Box::new(Faulty), Strategy::Serial).unwrap();
        scheduler
            .register(Box::new(Recorder { name: "steady", log: Arc::clone(&log) }), Strategy::Serial)
            .unwrap();

        let mut world = world();
        let disabled_events = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&disabled_events);
        world.bus.subscribe(UNIT_DISABLED_EVENT, "watch", move |_, event| {
            assert_eq!(event.get("unit"), Some(&json!("faulty")));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let control = RunControl::default();

        for tick in 1..=5 {
            let report = scheduler.run_tick(&mut world, tick, &control).await.unwrap();
            if tick == 3 {
                assert_eq!(report.disabled, vec!["faulty".to_owned()]);
            }
        }

        assert_eq!(entries(&log).len(), 5);
        assert_eq!(disabled_events.load(Ordering::SeqCst), 1);
        let faults = world.bus.take_faults();
        let failures = faults.iter().filter(|f| f.kind() == "unit_failure").count();
        assert_eq!(failures, 3);
        assert!(faults.iter().any(|f| matches!(
            f,
            Fault::UnitDisabled { tick: 3, consecutive_failures: 3, .. }
        )));
        let status = scheduler.status();
        assert!(status.first().unwrap().disabled);
        assert!(!status.get(1).unwrap().disabled);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        struct Flaky {
            turns: u32,
        }
        impl Unit for Flaky {
            fn name(&self) -> &str {
                "flaky"
            }
            fn update(&mut self, _ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
                self.turns = self.turns.saturating_add(1);
                if self.turns.checked_rem(2) == Some(0) {
                    Ok(Turn::Done)
                } else {
                    Err(UnitError::failed("odd turn"))
                }
            }
        }

        let mut scheduler = Scheduler::new(config(2));
        scheduler.register(Box::new(Flaky { turns: 0 }), Strategy::Serial).unwrap();
        let mut world = world();
        let control = RunControl::default();
        for tick in 1..=6 {
            scheduler.run_tick(&mut world, tick, &control).await.unwrap();
        }
        assert!(!scheduler.status().first().unwrap().disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_batch_resumes_in_completion_order() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(
                Box::new(Sleeper { name: "slow", delay_ms: 60, log: Arc::clone(&log) }),
                Strategy::Concurrent,
            )
            .unwrap();
        scheduler
            .register(
                Box::new(Sleeper { name: "fast", delay_ms: 20, log: Arc::clone(&log) }),
                Strategy::Concurrent,
            )
            .unwrap();
        let mut world = world();
        let control = RunControl::default();
        let started = tokio::time::Instant::now();
        scheduler.run_tick(&mut world, 4, &control).await.unwrap();

        assert_eq!(
            entries(&log),
            vec!["fast:resumed:\"fast\"@4", "slow:resumed:\"slow\"@4"]
        );
        assert!(started.elapsed() < Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_batch_member_times_out_without_stalling_siblings() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(
                Box::new(Sleeper { name: "stuck", delay_ms: 60_000, log: Arc::clone(&log) }),
                Strategy::Concurrent,
            )
            .unwrap();
        scheduler
            .register(
                Box::new(Sleeper { name: "quick", delay_ms: 10, log: Arc::clone(&log) }),
                Strategy::Concurrent,
            )
            .unwrap();
        let mut world = world();
        let control = RunControl::default();
        let report = scheduler.run_tick(&mut world, 2, &control).await.unwrap();

        assert_eq!(report.timeouts, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(
            entries(&log),
            vec!["quick:resumed:\"quick\"@2", "stuck:abandoned:timeout"]
        );
        let faults = world.bus.take_faults();
        assert!(matches!(
            faults.first(),
            Some(Fault::UnitTimeout { tick: 2, timeout_ms: 100, .. })
        ));
        assert_eq!(scheduler.status().first().unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_cancels_awaited_calls() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(
                Box::new(Sleeper { name: "waiting", delay_ms: 50, log: Arc::clone(&log) }),
                Strategy::Serial,
            )
            .unwrap();
        let mut world = world();
        let control = RunControl::default();
        control.request_stop();
        let report = scheduler.run_tick(&mut world, 1, &control).await.unwrap();

        assert_eq!(entries(&log), vec!["waiting:abandoned:shutdown"]);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_call_is_resumed_on_a_later_tick() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(
                Box::new(Sleeper { name: "oracle", delay_ms: 50, log: Arc::clone(&log) }),
                Strategy::Background,
            )
            .unwrap();
        let mut world = world();
        let control = RunControl::default();

        let first = scheduler.run_tick(&mut world, 1, &control).await.unwrap();
        assert_eq!(first.background_pending, 1);
        let second = scheduler.run_tick(&mut world, 2, &control).await.unwrap();
        assert_eq!(second.units_run, 0);
        assert!(entries(&log).is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let third = scheduler.run_tick(&mut world, 3, &control).await.unwrap();

        assert_eq!(entries(&log).first().map(String::as_str), Some("oracle:resumed:\"oracle\"@3"));
        assert_eq!(third.background_pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_resumes_outstanding_background_calls() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(
                Box::new(Sleeper { name: "oracle", delay_ms: 200, log: Arc::clone(&log) }),
                Strategy::Background,
            )
            .unwrap();
        let mut world = world();
        let control = RunControl::default();
        scheduler.run_tick(&mut world, 1, &control).await.unwrap();

        let drained = scheduler.drain(&mut world, 1).await.unwrap();
        assert_eq!(drained, 1);
        assert_eq!(scheduler.outstanding(), 0);
        assert_eq!(entries(&log), vec!["oracle:resumed:\"oracle\"@1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_background_notifies_owning_unit() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(config(3));
        scheduler
            .register(
                Box::new(Sleeper { name: "oracle", delay_ms: 10_000, log: Arc::clone(&log) }),
                Strategy::Background,
            )
            .unwrap();
        let mut world = world();
        let control = RunControl::default();
        scheduler.run_tick(&mut world, 1, &control).await.unwrap();

        assert_eq!(scheduler.cancel_background(&mut world, 1).unwrap(), 1);
        assert_eq!(scheduler.outstanding(), 0);
        assert_eq!(entries(&log), vec!["oracle:abandoned:shutdown"]);
    }

    #[tokio::test]
    async fn store_error_in_a_unit_is_fatal() {
        struct Stale;
        impl Unit for Stale {
            fn name(&self) -> &str {
                "stale"
            }
            fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
                ctx.store_mut().destroy_entity(EntityId::new(99))?;
                Ok(Turn::Done)
            }
        }

        let mut scheduler = Scheduler::new(config(3));
        scheduler.register(Box::new(Stale), Strategy::Serial).unwrap();
        let mut world = world();
        let control = RunControl::default();
        let err = scheduler.run_tick(&mut world, 8, &control).await.unwrap_err();
        assert!(matches!(
            err,
            TickError::Store { tick: 8, unit: Some(ref unit), source: StoreError::UnknownEntity(_) } if unit == "stale"
        ));
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn panicking_unit_is_reported_as_a_failure() {
        struct Explodes;
        impl Unit for Explodes {
            fn name(&self) -> &str {
                "explodes"
            }
            fn update(&mut self, _ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
                panic!("kaboom")
            }
        }

        let mut scheduler = Scheduler::new(config(3));
        scheduler.register(Box::new(Explodes), Strategy::Serial).unwrap();
        let mut world = world();
        let control = RunControl::default();
        let report = scheduler.run_tick(&mut world, 1, &control).await.unwrap();
        assert_eq!(report.failures, 1);
        let faults = world.bus.take_faults();
        assert!(matches!(
            faults.first(),
            Some(Fault::UnitFailure { cause, .. }) if cause.contains("kaboom")
        ));
    }

    #[tokio::test]
    async fn counters_survive_state_round_trip_and_enable_clears_them() {
        let mut scheduler = Scheduler::new(config(1));
        scheduler.register(Box::new(Faulty), Strategy::Serial).unwrap();
        let mut world = world();
        let control = RunControl::default();
        scheduler.run_tick(&mut world, 1, &control).await.unwrap();
        let state = scheduler.state();
        assert_eq!(
            state.0.get("faulty"),
            Some(&UnitCounters { consecutive_failures: 1, disabled: true })
        );

        let mut restored = Scheduler::new(config(1));
        restored.register(Box::new(Faulty), Strategy::Serial).unwrap();
        restored.restore_state(&state);
        assert_eq!(restored.state(), state);

        restored.enable("faulty").unwrap();
        assert!(!restored.status().first().unwrap().disabled);
        assert!(restored.enable("missing").is_err());
    }
}
