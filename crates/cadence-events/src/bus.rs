//! Subscription table and synchronous, depth-first delivery.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cadence_types::{Event, EventData, Fault, SubscriptionId};
use tracing::{debug, error, warn};

use crate::dispatch::Dispatch;
use crate::error::BusError;
use crate::telemetry::Telemetry;

/// Default ceiling on nested publish calls.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Smallest ceiling the bus accepts.
pub const MIN_MAX_DEPTH: usize = 64;

/// A subscribed event handler.
pub type Handler = Arc<dyn Fn(&mut Dispatch<'_>, &Event) -> Result<(), BusError> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    name: Arc<str>,
    handler: Handler,
}

/// Publish/subscribe hub shared by every unit of a run.
///
/// Subscriptions are keyed by exact event name. Delivery order is
/// subscription order. Faults raised by handlers are caught, reported
/// and survived; delivery to the remaining subscribers continues.
pub struct EventBus {
    subscribers: RwLock<BTreeMap<String, Vec<Subscriber>>>,
    next_subscription: AtomicU64,
    telemetry: Telemetry,
    faults: Mutex<Vec<Fault>>,
    max_depth: usize,
    debug_logging: bool,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.read();
        f.debug_struct("EventBus")
            .field("events", &subscribers.len())
            .field(
                "subscriptions",
                &subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .field("max_depth", &self.max_depth)
            .field("debug_logging", &self.debug_logging)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Telemetry::null())
    }
}

impl EventBus {
    /// Create a bus writing to `telemetry`.
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
            telemetry,
            faults: Mutex::new(Vec::new()),
            max_depth: DEFAULT_MAX_DEPTH,
            debug_logging: false,
        }
    }

    /// Set the nesting ceiling. Values below [`MIN_MAX_DEPTH`] are raised
    /// to it.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(MIN_MAX_DEPTH);
        self
    }

    /// Emit a `debug!` line per publish and per handler invocation.
    #[must_use]
    pub const fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    /// The configured nesting ceiling.
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The telemetry handle events are recorded to.
    pub const fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Subscribe `handler` to `event` under a descriptive `name`.
    pub fn subscribe<F>(
        &self,
        event: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&mut Dispatch<'_>, &Event) -> Result<(), BusError> + Send + Sync + 'static,
    {
        let id = SubscriptionId::new(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let event = event.into();
        let name: Arc<str> = Arc::from(name.into());
        debug!(event = %event, handler = %name, subscription = %id, "Subscribed");
        self.write().entry(event).or_default().push(Subscriber {
            id,
            name,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    ///
    /// A publish already in progress still delivers to the removed
    /// handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.write();
        let mut removed = false;
        subscribers.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed = removed || list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Number of handlers currently subscribed to `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.read().get(event).map_or(0, Vec::len)
    }

    /// Report a caught condition: log it, append it to telemetry and keep
    /// it for [`take_faults`](Self::take_faults).
    pub fn report(&self, fault: Fault) {
        warn!(kind = fault.kind(), tick = fault.tick(), "{fault}");
        self.telemetry.fault(&fault);
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fault);
    }

    /// Drain the faults reported since the last call.
    pub fn take_faults(&self) -> Vec<Fault> {
        std::mem::take(&mut *self.faults.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Deliver an event to every current subscriber, depth-first.
    ///
    /// A publish made from inside `max_depth` nested deliveries is still
    /// delivered; one level deeper is refused.
    pub(crate) fn publish(&self, ctx: &mut Dispatch<'_>, name: &str, data: EventData) -> usize {
        let tick = ctx.tick();
        let depth = ctx.depth();
        if depth > self.max_depth {
            self.report(Fault::ReentrancyLimit {
                event: name.to_owned(),
                tick,
                depth,
                limit: self.max_depth,
            });
            return 0;
        }
        if ctx.has_fatal() {
            debug!(tick, event = name, "Publish skipped after fatal store error");
            return 0;
        }

        let event = Event::new(name, data);
        self.telemetry.event(tick, &event);

        let snapshot: Vec<Subscriber> = self.read().get(name).cloned().unwrap_or_default();
        if self.debug_logging {
            debug!(tick, event = name, depth, subscribers = snapshot.len(), "Publish");
        }

        ctx.enter();
        let mut delivered: usize = 0;
        for subscriber in &snapshot {
            if ctx.has_fatal() {
                break;
            }
            if self.debug_logging {
                debug!(tick, event = name, handler = %subscriber.name, depth, "Delivering");
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(ctx, &event)));
            delivered = delivered.saturating_add(1);
            let cause = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(BusError::Store { source })) => {
                    error!(tick, event = name, handler = %subscriber.name, error = %source, "Fatal store error in handler");
                    ctx.fail(source);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            self.report(Fault::HandlerFailure {
                event: name.to_owned(),
                handler: subscriber.name.to_string(),
                tick,
                cause,
            });
        }
        ctx.leave();
        delivered
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<Subscriber>>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<Subscriber>>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Render a caught panic payload as a message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        String::from("panicked")
    }
}
