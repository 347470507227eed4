//! Action resolution protocol.
//!
//! Choosing, executing and scoring an action are done by different units
//! that only talk through the bus. The protocol sits between them and
//! guarantees each proposal is resolved exactly once, within the tick it
//! was proposed in:
//!
//! 1. A decision unit publishes `action_chosen` ([`ActionProposal`]). A
//!    second proposal for the same entity in the same tick is rejected
//!    with a `DuplicateProposal` fault.
//! 2. The protocol republishes it as `execute_<action>_action`
//!    ([`ActionDispatch`]) for the world-rule unit that claims it.
//! 3. That unit publishes `action_outcome_ready` ([`OutcomeReport`]). Only
//!    the first outcome per action is accepted; later ones are reported as
//!    `DuplicateResolution`.
//! 4. The protocol applies every [`SignalModifier`] and publishes the
//!    terminal `action_resolved` ([`ResolvedAction`]).
//!
//! Whatever is still unresolved when the tick ends is failed by
//! [`ActionProtocol::finish_tick`], which reports `ActionDispatchTimeout`
//! (or `ActionCancelled` at shutdown) and publishes `action_failed`
//! ([`FailedAction`]). Proposals made while that sweep runs, typically by
//! `action_failed` subscribers, are failed on the spot and never
//! dispatched, so nothing is carried into the next tick.

pub mod payload;
pub mod table;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_events::{BusError, Dispatch, EventBus};
use cadence_store::StateStore;
use cadence_types::{ActionKey, EntityId, Event, Fault, SubscriptionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub use payload::{
    ActionDispatch, ActionProposal, EventPayload, FailedAction, FailureReason, OutcomeReport,
    ResolvedAction,
};
pub use table::{ActionSpec, ActionTable};

/// Published by decision units.
pub const ACTION_CHOSEN: &str = "action_chosen";
/// Published by world-rule units once an action has been carried out.
pub const ACTION_OUTCOME_READY: &str = "action_outcome_ready";
/// Terminal success event.
pub const ACTION_RESOLVED: &str = "action_resolved";
/// Terminal failure event.
pub const ACTION_FAILED: &str = "action_failed";

/// Name of the event dispatched for `action`.
pub fn execute_event_name(action: &str) -> String {
    format!("execute_{action}_action")
}

/// Lifecycle of an action within its tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Accepted from `action_chosen`, not yet republished.
    Proposed,
    /// Republished to the world-rule unit.
    Dispatched,
    /// Outcome received; final signal being computed.
    OutcomeReady,
    /// `action_resolved` published.
    Resolved,
}

/// Running counters of the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStats {
    /// Proposals accepted.
    pub proposed: u64,
    /// Proposals dispatched to a world-rule event.
    pub dispatched: u64,
    /// Actions resolved.
    pub resolved: u64,
    /// Actions failed at end of tick because no outcome arrived.
    pub timed_out: u64,
    /// Actions failed by the shutdown sweep.
    #[serde(default)]
    pub cancelled: u64,
    /// Proposals rejected as duplicates.
    pub duplicate_proposals: u64,
    /// Outcomes rejected as duplicates.
    pub duplicate_resolutions: u64,
    /// Outcomes matching no action of the current tick.
    pub unmatched_outcomes: u64,
}

/// What a [`SignalModifier`] gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ModifierInput<'a> {
    /// Acting entity.
    pub entity_id: EntityId,
    /// Action identifier.
    pub action: &'a str,
    /// Proposal parameters.
    pub params: &'a Value,
    /// Outcome reported by the world-rule unit.
    pub outcome: &'a OutcomeReport,
}

/// Domain-provided adjustment of an action's signal.
///
/// Modifiers are handed to [`ActionProtocol::new`]; each returns an
/// additive contribution that is also recorded in the resolved event's
/// breakdown under [`name`](SignalModifier::name).
pub trait SignalModifier: Send + Sync {
    /// Breakdown key.
    fn name(&self) -> &str;

    /// Contribution to add to the signal.
    fn modify(&self, store: &StateStore, input: &ModifierInput<'_>) -> f64;
}

/// Breakdown key of the unmodified signal.
pub const BASE_SIGNAL_KEY: &str = "base";

struct InFlight {
    entity_id: EntityId,
    action: String,
    params: Value,
    tick: u64,
    state: ActionState,
}

#[derive(Default)]
struct Ledger {
    tick: u64,
    next_key: u64,
    in_flight: BTreeMap<ActionKey, InFlight>,
    proposed_by: BTreeMap<EntityId, ActionKey>,
    settled: BTreeSet<ActionKey>,
    sweeping: Option<FailureReason>,
    swept: usize,
    stats: ProtocolStats,
}

impl Ledger {
    fn roll_to(&mut self, tick: u64) {
        if self.tick != tick {
            self.tick = tick;
            self.proposed_by.clear();
            self.settled.clear();
        }
    }

    fn issue_key(&mut self) -> ActionKey {
        let key = ActionKey::new(self.next_key);
        self.next_key = self.next_key.saturating_add(1);
        key
    }

    fn count_failed(&mut self, reason: FailureReason, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        let counter = match reason {
            FailureReason::DispatchTimeout => &mut self.stats.timed_out,
            FailureReason::Shutdown => &mut self.stats.cancelled,
        };
        *counter = counter.saturating_add(count);
    }
}

enum Admission {
    Dispatch(ActionKey),
    FailNow(ActionKey, FailureReason),
    Duplicate,
}

enum Claim {
    Accepted {
        key: ActionKey,
        action: String,
        params: Value,
    },
    Duplicate(ActionKey),
    Unmatched,
}

/// Exactly-once resolution of proposed actions.
///
/// Cloning is cheap; clones share the same ledger.
#[derive(Clone)]
pub struct ActionProtocol {
    ledger: Arc<Mutex<Ledger>>,
    actions: Arc<ActionTable>,
    modifiers: Arc<[Box<dyn SignalModifier>]>,
}

impl std::fmt::Debug for ActionProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionProtocol")
            .field("actions", &self.actions.len())
            .field("modifiers", &self.modifiers.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ActionProtocol {
    /// Create a protocol over `actions`, scoring with `modifiers` in order.
    pub fn new(actions: Arc<ActionTable>, modifiers: Vec<Box<dyn SignalModifier>>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            actions,
            modifiers: modifiers.into(),
        }
    }

    /// Subscribe the protocol's handlers on `bus`.
    pub fn install(&self, bus: &EventBus) -> [SubscriptionId; 2] {
        let proposer = self.clone();
        let chosen = bus.subscribe(ACTION_CHOSEN, "action_protocol.dispatch", move |ctx, event| {
            proposer.on_proposed(ctx, event)
        });
        let resolver = self.clone();
        let outcome = bus.subscribe(
            ACTION_OUTCOME_READY,
            "action_protocol.resolve",
            move |ctx, event| resolver.on_outcome(ctx, event),
        );
        [chosen, outcome]
    }

    /// The action table proposals are checked against.
    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    /// Counters so far.
    pub fn stats(&self) -> ProtocolStats {
        self.lock().stats
    }

    /// Number of actions currently unresolved.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// The next action key that will be issued.
    pub fn next_key(&self) -> u64 {
        self.lock().next_key
    }

    /// Continue key numbering from a restored run.
    pub fn set_next_key(&self, next_key: u64) {
        self.lock().next_key = next_key;
    }

    /// Start accepting proposals for `tick`.
    ///
    /// Actions a previous tick left unresolved (its sweep never ran) are
    /// failed here as dispatch timeouts, reported on `bus`, and counted in
    /// the return value.
    pub fn begin_tick(&self, bus: &EventBus, tick: u64) -> usize {
        let stale = {
            let mut ledger = self.lock();
            let stale = std::mem::take(&mut ledger.in_flight);
            ledger.count_failed(FailureReason::DispatchTimeout, stale.len());
            ledger.tick = tick;
            ledger.proposed_by.clear();
            ledger.settled.clear();
            ledger.sweeping = None;
            ledger.swept = 0;
            stale
        };

        for (key, action) in &stale {
            warn!(
                tick,
                key = %key,
                entity_id = %action.entity_id,
                action = %action.action,
                proposed_at = action.tick,
                "Failing action left unresolved by a previous tick"
            );
            bus.report(Fault::ActionDispatchTimeout {
                entity_id: action.entity_id,
                tick: action.tick,
                action: action.action.clone(),
                key: *key,
                subscribers: bus.subscriber_count(&execute_event_name(&action.action)),
            });
        }
        stale.len()
    }

    /// Fail every action still unresolved, reporting each and publishing
    /// `action_failed`. Returns how many were failed, including proposals
    /// made by `action_failed` subscribers while the sweep ran.
    ///
    /// `in_flight` is empty afterwards.
    pub fn finish_tick(&self, ctx: &mut Dispatch<'_>, reason: FailureReason) -> usize {
        let expired: Vec<(ActionKey, InFlight)> = {
            let mut ledger = self.lock();
            ledger.sweeping = Some(reason);
            ledger.swept = 0;
            let expired: Vec<_> = std::mem::take(&mut ledger.in_flight).into_iter().collect();
            for (key, _) in &expired {
                ledger.settled.insert(*key);
            }
            ledger.count_failed(reason, expired.len());
            expired
        };

        let count = expired.len();
        for (key, action) in expired {
            self.fail(ctx, key, action, reason);
        }

        let mut ledger = self.lock();
        ledger.sweeping = None;
        count.saturating_add(std::mem::take(&mut ledger.swept))
    }

    fn fail(&self, ctx: &mut Dispatch<'_>, key: ActionKey, action: InFlight, reason: FailureReason) {
        let tick = ctx.tick();
        let fault = match reason {
            FailureReason::DispatchTimeout => Fault::ActionDispatchTimeout {
                entity_id: action.entity_id,
                tick,
                action: action.action.clone(),
                key,
                subscribers: ctx.bus().subscriber_count(&execute_event_name(&action.action)),
            },
            FailureReason::Shutdown => Fault::ActionCancelled {
                entity_id: action.entity_id,
                tick,
                action: action.action.clone(),
                key,
            },
        };
        ctx.report(fault);
        let failed = FailedAction {
            entity_id: action.entity_id,
            key,
            action: action.action,
            reason,
            tick: action.tick,
        };
        match failed.to_data() {
            Ok(data) => {
                ctx.publish(ACTION_FAILED, data);
            }
            Err(e) => warn!(tick, key = %key, error = %e, "Could not encode action_failed"),
        }
    }

    fn on_proposed(&self, ctx: &mut Dispatch<'_>, event: &Event) -> Result<(), BusError> {
        let proposal = ActionProposal::from_event(event)?;
        let tick = ctx.tick();

        let admission = {
            let mut ledger = self.lock();
            ledger.roll_to(tick);
            if ledger.proposed_by.contains_key(&proposal.entity_id) {
                ledger.stats.duplicate_proposals = ledger.stats.duplicate_proposals.saturating_add(1);
                Admission::Duplicate
            } else {
                let key = ledger.issue_key();
                ledger.proposed_by.insert(proposal.entity_id, key);
                ledger.stats.proposed = ledger.stats.proposed.saturating_add(1);
                if let Some(reason) = ledger.sweeping {
                    ledger.settled.insert(key);
                    ledger.count_failed(reason, 1);
                    ledger.swept = ledger.swept.saturating_add(1);
                    Admission::FailNow(key, reason)
                } else {
                    ledger.in_flight.insert(
                        key,
                        InFlight {
                            entity_id: proposal.entity_id,
                            action: proposal.action.clone(),
                            params: proposal.params.clone(),
                            tick,
                            state: ActionState::Proposed,
                        },
                    );
                    Admission::Dispatch(key)
                }
            }
        };

        let key = match admission {
            Admission::Dispatch(key) => key,
            Admission::FailNow(key, reason) => {
                debug!(
                    tick,
                    key = %key,
                    entity_id = %proposal.entity_id,
                    "Proposal arrived during the end-of-tick sweep"
                );
                let action = InFlight {
                    entity_id: proposal.entity_id,
                    action: proposal.action,
                    params: proposal.params,
                    tick,
                    state: ActionState::Proposed,
                };
                self.fail(ctx, key, action, reason);
                return Ok(());
            }
            Admission::Duplicate => {
                ctx.report(Fault::DuplicateProposal {
                    entity_id: proposal.entity_id,
                    tick,
                    action: proposal.action,
                });
                return Ok(());
            }
        };

        if !self.actions.contains(&proposal.action) {
            warn!(
                tick,
                entity_id = %proposal.entity_id,
                action = %proposal.action,
                "Proposal names an unregistered action"
            );
        }

        {
            let mut ledger = self.lock();
            if let Some(action) = ledger.in_flight.get_mut(&key) {
                action.state = ActionState::Dispatched;
            }
            ledger.stats.dispatched = ledger.stats.dispatched.saturating_add(1);
        }

        let dispatch = ActionDispatch {
            entity_id: proposal.entity_id,
            key,
            action: proposal.action,
            params: proposal.params,
            tick,
        };
        let name = execute_event_name(&dispatch.action);
        let delivered = ctx.publish(&name, dispatch.to_data()?);
        if delivered == 0 {
            debug!(tick, key = %key, event = %name, "No world-rule unit claimed the dispatch");
        }
        Ok(())
    }

    fn on_outcome(&self, ctx: &mut Dispatch<'_>, event: &Event) -> Result<(), BusError> {
        let report = OutcomeReport::from_event(event)?;
        let tick = ctx.tick();

        let claim = {
            let mut ledger = self.lock();
            ledger.roll_to(tick);
            let key = report
                .key
                .or_else(|| ledger.proposed_by.get(&report.entity_id).copied());
            let was_settled = key.is_some_and(|key| ledger.settled.contains(&key));
            let claim = match key {
                None => Claim::Unmatched,
                Some(key) => match ledger.in_flight.get_mut(&key) {
                    Some(action) if action.entity_id != report.entity_id => Claim::Unmatched,
                    Some(action) if action.state == ActionState::Dispatched => {
                        action.state = ActionState::OutcomeReady;
                        Claim::Accepted {
                            key,
                            action: action.action.clone(),
                            params: action.params.clone(),
                        }
                    }
                    Some(_) => Claim::Duplicate(key),
                    None if was_settled => Claim::Duplicate(key),
                    None => Claim::Unmatched,
                },
            };
            match claim {
                Claim::Duplicate(_) => {
                    ledger.stats.duplicate_resolutions =
                        ledger.stats.duplicate_resolutions.saturating_add(1);
                }
                Claim::Unmatched => {
                    ledger.stats.unmatched_outcomes = ledger.stats.unmatched_outcomes.saturating_add(1);
                }
                Claim::Accepted { .. } => {}
            }
            claim
        };

        let (key, action, params) = match claim {
            Claim::Accepted {
                key,
                action,
                params,
            } => (key, action, params),
            Claim::Duplicate(key) => {
                ctx.report(Fault::DuplicateResolution {
                    entity_id: report.entity_id,
                    tick,
                    key,
                });
                return Ok(());
            }
            Claim::Unmatched => {
                ctx.report(Fault::UnmatchedOutcome {
                    entity_id: report.entity_id,
                    tick,
                });
                return Ok(());
            }
        };

        let (signal, breakdown) = self.score(ctx.store(), &report, &action, &params);

        {
            let mut ledger = self.lock();
            ledger.in_flight.remove(&key);
            ledger.settled.insert(key);
            ledger.stats.resolved = ledger.stats.resolved.saturating_add(1);
        }

        let resolved = ResolvedAction {
            entity_id: report.entity_id,
            key,
            action,
            params,
            success: report.success,
            base_signal: report.signal,
            signal,
            breakdown,
            details: report.details,
            tick,
        };
        ctx.publish(ACTION_RESOLVED, resolved.to_data()?);
        Ok(())
    }

    fn score(
        &self,
        store: &StateStore,
        report: &OutcomeReport,
        action: &str,
        params: &Value,
    ) -> (f64, BTreeMap<String, f64>) {
        let input = ModifierInput {
            entity_id: report.entity_id,
            action,
            params,
            outcome: report,
        };
        let mut breakdown = BTreeMap::new();
        breakdown.insert(BASE_SIGNAL_KEY.to_owned(), report.signal);
        let mut signal = report.signal;
        for modifier in self.modifiers.iter() {
            let contribution = modifier.modify(store, &input);
            if contribution.is_finite() {
                signal += contribution;
                breakdown.insert(modifier.name().to_owned(), contribution);
            } else {
                warn!(
                    modifier = modifier.name(),
                    entity_id = %report.entity_id,
                    "Signal modifier returned a non-finite value; ignored"
                );
            }
        }
        (signal, breakdown)
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
