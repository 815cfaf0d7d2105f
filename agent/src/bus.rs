//! Process-wide signal hub and duty-cycle scheduler.
//!
//! The [`EventBus`] is the leaf every tracker depends on. It does three
//! things:
//!
//! 1. **Listener dedup**: trackers register handlers per [`SignalKind`]; the
//!    bus asks the host's [`SignalSource`] to subscribe *once* per kind and
//!    fans each delivered signal out to all handlers.
//! 2. **Deterministic order**: a handler added at the head runs before every
//!    handler registered earlier; one added at the tail runs after them.
//! 3. **Duty cycle**: operations registered with
//!    [`add_to_duty_cycle`](EventBus::add_to_duty_cycle) run in registration
//!    order on every tick. [`start`](EventBus::start) drives ticks from a
//!    tokio interval; hosts with their own timer call
//!    [`run_duty_cycle`](EventBus::run_duty_cycle) directly.
//!
//! # Concurrency
//!
//! The bus is single-threaded (`Rc`, `RefCell`) and cooperative: handlers run
//! to completion one after another. The ticker is a `spawn_local` task and
//! therefore needs a [`tokio::task::LocalSet`].
//!
//! # Failure isolation
//!
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers for the same signal (or tick) still run.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{AgentError, Result};
use crate::host::SignalSource;
use crate::types::{Signal, SignalKind};

/// Label used in logs and errors for duty-cycle operations.
const DUTY_CYCLE_LABEL: &str = "duty-cycle";

/// Shortest accepted duty-cycle period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

type Handler = Rc<dyn Fn(&Signal) -> Result<()>>;
type Operation = Rc<dyn Fn() -> Result<()>>;

/// Outcome of fanning one signal (or tick) out to its handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Signal fan-out hub plus periodic scheduler.
pub struct EventBus {
    source: Rc<dyn SignalSource>,
    listeners: RefCell<BTreeMap<SignalKind, VecDeque<Handler>>>,
    duty_cycle: RefCell<Vec<Operation>>,
    period: Duration,
    ticker: RefCell<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("kinds", &self.listeners.borrow().keys().collect::<Vec<_>>())
            .field("duty_cycle", &self.duty_cycle.borrow().len())
            .field("period", &self.period)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus that subscribes through `source` and ticks every
    /// `period` once started.
    pub fn new(source: Rc<dyn SignalSource>, period: Duration) -> Self {
        Self {
            source,
            listeners: RefCell::new(BTreeMap::new()),
            duty_cycle: RefCell::new(Vec::new()),
            period: period.max(MIN_PERIOD),
            ticker: RefCell::new(None),
        }
    }

    /// Duty-cycle period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Registers `handler` for `kind`.
    ///
    /// With `at_tail == false` the handler runs before every handler already
    /// registered for `kind`; with `at_tail == true` it runs after them. The
    /// first registration for a kind subscribes the host's signal source.
    pub fn add_event_listener<F>(&self, kind: SignalKind, handler: F, at_tail: bool)
    where
        F: Fn(&Signal) -> Result<()> + 'static,
    {
        let handler: Handler = Rc::new(handler);
        let first = {
            let mut listeners = self.listeners.borrow_mut();
            let first = !listeners.contains_key(&kind);
            let handlers = listeners.entry(kind).or_default();
            if at_tail {
                handlers.push_back(handler);
            } else {
                handlers.push_front(handler);
            }
            first
        };

        if first {
            debug!(signal = %kind, "Subscribing to signal source");
            self.source.subscribe(kind);
        }
    }

    /// Registers `operation` to run on every duty-cycle tick.
    pub fn add_to_duty_cycle<F>(&self, operation: F)
    where
        F: Fn() -> Result<()> + 'static,
    {
        self.duty_cycle.borrow_mut().push(Rc::new(operation));
    }

    /// Registers `operation` at the tail of every user-activity signal.
    pub fn add_on_user_action<F>(&self, operation: F)
    where
        F: Fn(&Signal) -> Result<()> + 'static,
    {
        let operation: Handler = Rc::new(operation);
        for kind in SignalKind::USER_ACTIVITY {
            let operation = Rc::clone(&operation);
            self.add_event_listener(kind, move |signal| operation(signal), true);
        }
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: SignalKind) -> usize {
        self.listeners.borrow().get(&kind).map_or(0, VecDeque::len)
    }

    /// Delivers `signal` to every handler registered for its kind.
    ///
    /// Handlers may register further listeners while running; those take
    /// effect from the next dispatch.
    pub fn dispatch(&self, signal: &Signal) -> Delivery {
        let handlers: Vec<Handler> = self
            .listeners
            .borrow()
            .get(&signal.kind)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();

        trace!(signal = %signal.kind, handlers = handlers.len(), "Dispatching signal");

        let mut delivery = Delivery::default();
        for handler in handlers {
            delivery.invoked += 1;
            if !contain(signal.kind.as_str(), || handler(signal)) {
                delivery.failed += 1;
            }
        }
        delivery
    }

    /// Runs every duty-cycle operation once, in registration order.
    pub fn run_duty_cycle(&self) -> Delivery {
        let operations: Vec<Operation> = self.duty_cycle.borrow().clone();

        trace!(operations = operations.len(), "Running duty cycle");

        let mut delivery = Delivery::default();
        for operation in operations {
            delivery.invoked += 1;
            if !contain(DUTY_CYCLE_LABEL, || operation()) {
                delivery.failed += 1;
            }
        }
        delivery
    }

    /// Starts the periodic ticker. Calling it again while running is a no-op.
    ///
    /// The first tick happens one full period after the call.
    ///
    /// # Panics
    ///
    /// Panics if called outside a [`tokio::task::LocalSet`].
    pub fn start(self: &Rc<Self>) {
        if self.is_running() {
            return;
        }

        let bus = Rc::downgrade(self);
        let period = self.period;
        let handle = tokio::task::spawn_local(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                bus.run_duty_cycle();
            }
            debug!("Duty-cycle ticker exited");
        });

        debug!(period_ms = period.as_millis(), "Started duty-cycle ticker");
        *self.ticker.borrow_mut() = Some(handle);
    }

    /// Cancels the periodic ticker. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.borrow_mut().take() {
            handle.abort();
            debug!("Stopped duty-cycle ticker");
        }
    }

    /// Whether the ticker is currently scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ticker
            .borrow()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
        for kind in self.listeners.get_mut().keys() {
            self.source.unsubscribe(*kind);
        }
    }
}

/// Runs `f`, logging and swallowing any error or panic. Returns `true` on
/// success.
fn contain<F>(label: &str, f: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match guard(label, f) {
        Ok(()) => true,
        Err(e) => {
            warn!(signal = label, error = %e, "Handler failed");
            false
        }
    }
}

/// Runs `f`, turning both a returned error and a panic into
/// [`AgentError::HandlerFailure`] for `label`.
fn guard<F>(label: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let message = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(AgentError::HandlerFailure { message, .. })) => message,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    Err(AgentError::HandlerFailure {
        signal: label.to_string(),
        message,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
