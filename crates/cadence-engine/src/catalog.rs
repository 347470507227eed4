//! Built-in records, units and signal modifiers.
//!
//! These are small, world-agnostic building blocks that scenario files
//! refer to by name. They exist to exercise the core end to end: a random
//! decision unit, an executor that acknowledges every dispatched action,
//! a background unit making a simulated external call, and an aging rule.

use std::time::Duration;

use cadence_core::protocol::{
    ACTION_CHOSEN, ACTION_OUTCOME_READY, ActionDispatch, ActionProposal, ActionTable, EventPayload,
    ModifierInput, SignalModifier, execute_event_name,
};
use cadence_core::{AbandonReason, CallOutcome, PendingCall, Turn, Unit, UnitError};
use cadence_events::{Dispatch, EventBus};
use cadence_store::{Record, RecordKind, RecordRegistry, StateStore};
use cadence_types::{Validation, data_from};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use validator::Validate;

use crate::error::ScenarioError;
use crate::scenario::{ModifierSpec, UnitSpec};

/// Event published by [`DelayedOracle`] when a reading arrives.
pub const ORACLE_READING_EVENT: &str = "oracle_reading";

/// Event published by [`Aging`] when an entity reaches its lifespan.
pub const ENTITY_EXPIRED_EVENT: &str = "entity_expired";

/// Names accepted in a scenario's `units` list.
pub const BUILTIN_UNITS: [&str; 4] = ["random_decider", "noop_executor", "delayed_oracle", "aging"];

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Human-readable name of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// The name.
    pub name: String,
}

impl Record for Label {
    const KIND: RecordKind = RecordKind::new("label");

    fn validate(&self) -> Validation {
        Validation::check(!self.name.trim().is_empty(), "label name is empty")
    }
}

/// Ticks an entity has lived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Age {
    /// Completed ticks.
    pub ticks: u64,
}

impl Record for Age {
    const KIND: RecordKind = RecordKind::new("age");
}

/// Energy level in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct Energy {
    /// Current level.
    #[validate(range(min = 0.0, max = 100.0))]
    pub level: f64,
}

impl Record for Energy {
    const KIND: RecordKind = RecordKind::new("energy");

    fn validate(&self) -> Validation {
        Validation::from_validator(Validate::validate(self))
    }
}

/// Registry holding every built-in record kind.
pub fn registry() -> RecordRegistry {
    RecordRegistry::new()
        .with::<Label>()
        .with::<Age>()
        .with::<Energy>()
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Build the unit named by `spec`.
pub fn build_unit(
    spec: &UnitSpec,
    actions: &ActionTable,
    registry: &RecordRegistry,
) -> Result<Box<dyn Unit>, ScenarioError> {
    let name = spec.instance_name().to_owned();
    let unit: Box<dyn Unit> = match spec.unit.as_str() {
        "random_decider" => {
            let params: DeciderParams = params(spec)?;
            let required = registry
                .kind(&params.requires)
                .ok_or_else(|| ScenarioError::UnknownRecordKind {
                    entity: None,
                    kind: params.requires.clone(),
                })?;
            let choices = checked_actions(&name, params.actions, actions)?;
            Box::new(RandomDecider {
                name,
                required,
                actions: choices,
            })
        }
        "noop_executor" => {
            let params: ExecutorParams = params(spec)?;
            let handled = checked_actions(&name, params.actions, actions)?;
            Box::new(NoopExecutor {
                name,
                actions: handled,
                success: params.success,
                signal: params.signal,
            })
        }
        "delayed_oracle" => {
            let params: OracleParams = params(spec)?;
            Box::new(DelayedOracle {
                name,
                delay: Duration::from_millis(params.delay_ms),
            })
        }
        "aging" => {
            let params: AgingParams = params(spec)?;
            Box::new(Aging {
                name,
                lifespan: params.lifespan,
            })
        }
        other => {
            return Err(ScenarioError::UnknownUnit {
                unit: other.to_owned(),
            });
        }
    };
    Ok(unit)
}

fn params<T: DeserializeOwned + Default>(spec: &UnitSpec) -> Result<T, ScenarioError> {
    if spec.params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(spec.params.clone()).map_err(|source| ScenarioError::UnitParams {
        unit: spec.unit.clone(),
        source,
    })
}

/// An empty list means every registered action.
fn checked_actions(
    unit: &str,
    requested: Vec<String>,
    actions: &ActionTable,
) -> Result<Vec<String>, ScenarioError> {
    if requested.is_empty() {
        return Ok(actions.ids().map(str::to_owned).collect());
    }
    if let Some(missing) = requested.iter().find(|id| !actions.contains(id)) {
        return Err(ScenarioError::UnknownAction {
            unit: unit.to_owned(),
            action: missing.clone(),
        });
    }
    Ok(requested)
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DeciderParams {
    requires: String,
    actions: Vec<String>,
}

impl Default for DeciderParams {
    fn default() -> Self {
        Self {
            requires: Energy::KIND.as_str().to_owned(),
            actions: Vec::new(),
        }
    }
}

/// Proposes a uniformly chosen action for every entity holding the
/// required record kind.
pub struct RandomDecider {
    name: String,
    required: RecordKind,
    actions: Vec<String>,
}

impl Unit for RandomDecider {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_records(&self) -> Vec<RecordKind> {
        vec![self.required]
    }

    fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
        if self.actions.is_empty() {
            return Ok(Turn::Done);
        }
        for id in ctx.matching().ids().to_vec() {
            let pick = ctx.rng().random_range(0..self.actions.len());
            let Some(action) = self.actions.get(pick) else {
                continue;
            };
            let data = ActionProposal::new(id, action.clone())
                .to_data()
                .map_err(|e| UnitError::failed(e.to_string()))?;
            ctx.publish(ACTION_CHOSEN, data);
        }
        Ok(Turn::Done)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ExecutorParams {
    actions: Vec<String>,
    success: bool,
    signal: f64,
}

impl Default for ExecutorParams {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            success: true,
            signal: 1.0,
        }
    }
}

/// Claims `execute_<id>_action` for each of its actions and reports a
/// fixed outcome without touching the store.
pub struct NoopExecutor {
    name: String,
    actions: Vec<String>,
    success: bool,
    signal: f64,
}

impl Unit for NoopExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, bus: &EventBus) {
        for action in &self.actions {
            let (success, signal) = (self.success, self.signal);
            bus.subscribe(
                execute_event_name(action),
                format!("{}.{action}", self.name),
                move |ctx, event| {
                    let dispatch = ActionDispatch::from_event(event)?;
                    ctx.publish(
                        ACTION_OUTCOME_READY,
                        dispatch.outcome(success, signal).to_data()?,
                    );
                    Ok(())
                },
            );
        }
    }

    fn update(&mut self, _ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
        Ok(Turn::Done)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OracleParams {
    delay_ms: u64,
}

impl Default for OracleParams {
    fn default() -> Self {
        Self { delay_ms: 50 }
    }
}

/// Asks a simulated external service for a reading and publishes it as
/// `oracle_reading` when it arrives.
pub struct DelayedOracle {
    name: String,
    delay: Duration,
}

impl Unit for DelayedOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
        let reading: f64 = ctx.rng().random_range(0.0..1.0);
        let requested_at = ctx.tick();
        let delay = self.delay;
        Ok(Turn::Await(PendingCall::new("oracle", async move {
            tokio::time::sleep(delay).await;
            Ok(json!({ "value": reading, "requested_at": requested_at }))
        })))
    }

    fn resume(&mut self, ctx: &mut Dispatch<'_>, outcome: CallOutcome) -> Result<(), UnitError> {
        match outcome {
            CallOutcome::Completed(Value::Object(mut data)) => {
                data.insert("tick".to_owned(), json!(ctx.tick()));
                ctx.publish(ORACLE_READING_EVENT, data);
                Ok(())
            }
            CallOutcome::Completed(other) => Err(UnitError::failed(format!(
                "oracle returned a non-object reading: {other}"
            ))),
            CallOutcome::Failed(e) => Err(e.into()),
        }
    }

    fn on_abandon(&mut self, ctx: &mut Dispatch<'_>, reason: AbandonReason) {
        debug!(unit = %self.name, tick = ctx.tick(), %reason, "Oracle call abandoned");
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AgingParams {
    lifespan: Option<u64>,
}

/// Increments every [`Age`] record; destroys entities reaching
/// `lifespan` and publishes `entity_expired` for each.
pub struct Aging {
    name: String,
    lifespan: Option<u64>,
}

impl Unit for Aging {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_records(&self) -> Vec<RecordKind> {
        vec![Age::KIND]
    }

    fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError> {
        for id in ctx.matching().ids().to_vec() {
            let Some(age) = ctx.store_mut().get_mut::<Age>(id) else {
                continue;
            };
            age.ticks = age.ticks.saturating_add(1);
            let ticks = age.ticks;
            if self.lifespan.is_some_and(|lifespan| ticks >= lifespan) {
                ctx.store_mut().destroy_entity(id)?;
                ctx.publish(
                    ENTITY_EXPIRED_EVENT,
                    data_from(json!({ "entity_id": id, "age": ticks })),
                );
            }
        }
        Ok(Turn::Done)
    }
}

// ---------------------------------------------------------------------------
// Signal modifiers
// ---------------------------------------------------------------------------

/// Build the modifier named by `spec`.
pub fn build_modifier(spec: &ModifierSpec) -> Result<Box<dyn SignalModifier>, ScenarioError> {
    match spec.modifier.as_str() {
        "fatigue" => Ok(Box::new(Fatigue {
            weight: spec.weight.unwrap_or(1.0),
        })),
        other => Err(ScenarioError::UnknownModifier {
            modifier: other.to_owned(),
        }),
    }
}

/// Lowers the signal of tired entities: `-weight * (1 - energy / 100)`.
/// Entities without [`Energy`] are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct Fatigue {
    /// Scale of the penalty.
    pub weight: f64,
}

impl SignalModifier for Fatigue {
    fn name(&self) -> &str {
        "fatigue"
    }

    fn modify(&self, store: &StateStore, input: &ModifierInput<'_>) -> f64 {
        store
            .get::<Energy>(input.entity_id)
            .map_or(0.0, |energy| -self.weight * (1.0 - energy.level / 100.0))
    }
}
