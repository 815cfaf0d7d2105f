//! Deterministic replay of a recorded signal script.
//!
//! A script is JSON lines, one timestamped signal per line:
//!
//! ```text
//! {"at": 0, "signal": "load", "loaded": true}
//! {"at": 1200, "signal": "click", "target": "#buy"}
//! {"at": 4000, "signal": "visibility-change", "visible": false}
//! {"at": 9000, "signal": "error", "error": {"kind": "message", "message": "boom"}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Time comes from a
//! [`ManualClock`]; every duty-cycle boundary crossed between two steps runs
//! the duty cycle at that boundary, so a script reproduces exactly the
//! pings and expiries a live agent would have produced.

use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::{Agent, Capabilities};
use crate::bus::Delivery;
use crate::clock::{to_millis, Clock, ManualClock};
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::host::{ExactMatcher, RecordingSource, StaticPage};
use crate::storage::Storage;
use crate::types::{ElementId, ErrorValue, Millis, Properties, Signal, SignalKind, SignalPayload};
use crate::wrapper::{Evaluator, TrackedEvent, CONTROL_TREATMENT};

/// One line of a replay script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStep {
    /// Milliseconds since epoch at which the signal fires.
    pub at: Millis,
    pub signal: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
    /// Page visibility to apply before dispatching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    /// Page load state to apply before dispatching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<bool>,
}

impl ScriptStep {
    #[must_use]
    pub fn to_signal(&self) -> Signal {
        let payload = match (&self.target, &self.error) {
            (Some(target), _) => SignalPayload::Click(target.clone()),
            (None, Some(error)) => SignalPayload::Error(error.clone()),
            (None, None) => SignalPayload::None,
        };
        Signal {
            kind: self.signal,
            payload,
        }
    }
}

/// Parses a replay script.
///
/// # Errors
///
/// Returns [`AgentError::Io`] if reading fails and
/// [`AgentError::MalformedRecord`] naming the line for unparsable steps.
pub fn parse_script<R: BufRead>(reader: R) -> Result<Vec<ScriptStep>> {
    let mut steps = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let step = serde_json::from_str(trimmed).map_err(|source| AgentError::MalformedRecord {
            key: format!("line {}", index + 1),
            source,
        })?;
        steps.push(step);
    }
    Ok(steps)
}

/// Writes every event crossing the evaluator boundary as one JSON line.
///
/// Knows no flags, so every treatment is `"control"`.
#[derive(Debug)]
pub struct JsonLinesEvaluator<W: Write> {
    out: RefCell<W>,
}

impl<W: Write> JsonLinesEvaluator<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: RefCell::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write> Evaluator for JsonLinesEvaluator<W> {
    fn track(&self, key: &str, traffic_type: &str, event_type: &str, properties: &Properties) {
        let event = TrackedEvent {
            key: key.to_string(),
            traffic_type: traffic_type.to_string(),
            event_type: event_type.to_string(),
            properties: properties.clone(),
        };
        let mut out = self.out.borrow_mut();
        let written = serde_json::to_writer(&mut *out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(e) = written {
            warn!(event = event_type, error = %e, "Failed to write event");
        }
    }

    fn treatment(&self, _key: &str, _flag: &str, _attributes: &Properties) -> String {
        CONTROL_TREATMENT.to_string()
    }

    fn traffic_type(&self, _flag: &str) -> Option<String> {
        None
    }
}

/// An [`Agent`] driven by script time.
pub struct Replay {
    agent: Agent,
    clock: Rc<ManualClock>,
    page: Rc<StaticPage>,
    period: Millis,
    next_tick: Millis,
    ticks: usize,
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay")
            .field("now", &self.clock.now())
            .field("next_tick", &self.next_tick)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

impl Replay {
    /// Builds an agent whose clock starts at `start`. The page starts
    /// visible and not yet loaded.
    pub fn new(
        config: &Config,
        storage: Rc<dyn Storage>,
        evaluator: Rc<dyn Evaluator>,
        start: Millis,
    ) -> Self {
        let clock = Rc::new(ManualClock::new(start));
        let page = Rc::new(StaticPage::new());
        let agent = Agent::new(
            config,
            Capabilities {
                source: Rc::new(RecordingSource::new()),
                page: page.clone(),
                matcher: Rc::new(ExactMatcher),
                storage,
                clock: clock.clone(),
                evaluator,
            },
        );
        let period = to_millis(agent.bus().period());

        Self {
            agent,
            clock,
            page,
            period,
            next_tick: start.saturating_add(period),
            ticks: 0,
        }
    }

    #[must_use]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Duty-cycle ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Moves the clock to `at`, running the duty cycle at every period
    /// boundary on the way (a boundary equal to `at` included).
    pub fn advance_to(&mut self, at: Millis) {
        while self.next_tick <= at {
            self.clock.set(self.next_tick);
            let delivery = self.agent.run_duty_cycle();
            debug!(at = self.next_tick, failed = delivery.failed, "Duty cycle");
            self.ticks += 1;
            self.next_tick = self.next_tick.saturating_add(self.period);
        }
        self.clock.set(at);
    }

    /// Applies one step: advance time, update the page, dispatch.
    pub fn step(&mut self, step: &ScriptStep) -> Delivery {
        let now = self.clock.now();
        if step.at < now {
            warn!(at = step.at, now, "Step is in the past; replaying it at the current time");
        }
        self.advance_to(step.at);

        if let Some(visible) = step.visible {
            self.page.set_visible(visible);
        }
        if let Some(loaded) = step.loaded {
            self.page.set_loaded(loaded);
        }
        self.agent.dispatch(&step.to_signal())
    }

    /// Runs every step in order, returning the number of failed handlers.
    pub fn run(&mut self, steps: &[ScriptStep]) -> usize {
        steps.iter().map(|step| self.step(step).failed).sum()
    }

    /// Dispatches `before-unload` at the current time.
    pub fn unload(&mut self) -> Delivery {
        self.agent.dispatch(&Signal::new(SignalKind::BeforeUnload))
    }
}
