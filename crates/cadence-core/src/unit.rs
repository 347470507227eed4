//! The processing unit contract and its explicit suspension point.
//!
//! A unit's turn is a synchronous call to [`Unit::update`]. A unit that
//! needs an external service (an LLM, a database, a remote simulator)
//! does not await it itself: it returns [`Turn::Await`] carrying a
//! [`PendingCall`], and the scheduler awaits the call and hands the result
//! back through [`Unit::resume`] in a later, equally synchronous turn.
//! Units therefore never hold a borrow of the state store across a
//! suspension point.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use cadence_events::{Dispatch, EventBus};
use cadence_store::{RecordKind, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boxed future of an external call.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'static>>;

/// An external call a unit has declared and wants awaited.
pub struct PendingCall {
    label: String,
    future: CallFuture,
}

impl PendingCall {
    /// Wrap a future under a descriptive label.
    pub fn new<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Self {
            label: label.into(),
            future: Box::pin(future),
        }
    }

    /// A call that completes immediately with `value`.
    pub fn ready(label: impl Into<String>, value: Value) -> Self {
        Self::new(label, std::future::ready(Ok(value)))
    }

    /// The label the call was declared under.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn into_parts(self) -> (String, CallFuture) {
        (self.label, self.future)
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// What a unit's turn produced.
#[derive(Debug)]
pub enum Turn {
    /// The turn ran to completion.
    Done,
    /// The unit suspends on an external call.
    Await(PendingCall),
}

/// Result of an awaited external call, handed to [`Unit::resume`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The call returned a value.
    Completed(Value),
    /// The call failed.
    Failed(CallError),
}

impl From<Result<Value, CallError>> for CallOutcome {
    fn from(result: Result<Value, CallError>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(e) => Self::Failed(e),
        }
    }
}

/// Why a unit's pending call was abandoned without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// The soft timeout elapsed.
    Timeout,
    /// The run is shutting down.
    Shutdown,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Error produced by an external call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The remote side reported a failure.
    #[error("external call {label} failed: {reason}")]
    Failed {
        /// Label of the call.
        label: String,
        /// Failure description.
        reason: String,
    },

    /// The call's future panicked.
    #[error("external call {label} panicked: {reason}")]
    Panicked {
        /// Label of the call.
        label: String,
        /// Panic message.
        reason: String,
    },
}

/// Error returned from a unit's turn.
///
/// [`UnitError::Store`] is fatal for the run. Every other variant is
/// caught by the scheduler and reported as a unit failure.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// A state store operation failed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },

    /// An external call the unit depended on failed.
    #[error("{source}")]
    Call {
        /// The underlying call error.
        #[from]
        source: CallError,
    },

    /// The unit panicked during its turn.
    #[error("unit panicked: {0}")]
    Panicked(String),

    /// Any other unit failure.
    #[error("{0}")]
    Failed(String),
}

impl UnitError {
    /// Shorthand for [`UnitError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Execution strategy chosen for a unit at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Runs alone, in registration order.
    Serial,
    /// Runs with adjacent concurrent units, their calls interleaved.
    Concurrent,
    /// Fire-and-forget; its call completes on a later tick.
    Background,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Concurrent => f.write_str("concurrent"),
            Self::Background => f.write_str("background"),
        }
    }
}

/// A registered processing step.
pub trait Unit: Send {
    /// Stable name, unique within a run. Snapshots key failure counters
    /// by it.
    fn name(&self) -> &str;

    /// Record kinds the unit operates on. [`Dispatch::matching`] returns
    /// the entities holding all of them.
    fn required_records(&self) -> Vec<RecordKind> {
        Vec::new()
    }

    /// Subscribe event handlers. Called once, at registration.
    fn subscribe(&mut self, _bus: &EventBus) {}

    /// Run one turn for the current tick.
    fn update(&mut self, ctx: &mut Dispatch<'_>) -> Result<Turn, UnitError>;

    /// Receive the result of the call returned by the last [`Turn::Await`].
    fn resume(&mut self, _ctx: &mut Dispatch<'_>, _outcome: CallOutcome) -> Result<(), UnitError> {
        Ok(())
    }

    /// The call returned by the last [`Turn::Await`] will never complete.
    fn on_abandon(&mut self, _ctx: &mut Dispatch<'_>, _reason: AbandonReason) {}
}
