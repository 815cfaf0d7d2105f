//! Click reporting and rage-click detection.
//!
//! Only one burst is retained: a click on a different target, or one that
//! arrives a full cooldown after the previous click, starts a new burst.
//! Rage is edge-triggered, so a ten-click burst reports once, on the click
//! that reaches [`Config::rage_min_clicks`](crate::config::Config).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::EventBus;
use crate::clock::{to_millis, Clock};
use crate::host::SelectorMatcher;
use crate::sink::ReportSink;
use crate::types::{ElementId, EventType, Millis, Properties, SignalKind};

/// The retained burst of consecutive clicks on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickBurst {
    pub target: ElementId,
    pub count: u32,
    pub time: Millis,
    pub triggered: bool,
}

impl ClickBurst {
    fn new(target: ElementId, time: Millis) -> Self {
        Self {
            target,
            count: 1,
            time,
            triggered: false,
        }
    }
}

pub struct ClickTracker {
    sink: Rc<dyn ReportSink>,
    matcher: Rc<dyn SelectorMatcher>,
    tracked: Vec<String>,
    rage_min_clicks: u32,
    rage_cooldown: Millis,
    last_click: Option<ClickBurst>,
}

impl std::fmt::Debug for ClickTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickTracker")
            .field("tracked", &self.tracked)
            .field("rage_min_clicks", &self.rage_min_clicks)
            .field("rage_cooldown", &self.rage_cooldown)
            .field("last_click", &self.last_click)
            .finish_non_exhaustive()
    }
}

impl ClickTracker {
    pub fn new(
        sink: Rc<dyn ReportSink>,
        matcher: Rc<dyn SelectorMatcher>,
        tracked: Vec<String>,
        rage_min_clicks: u32,
        rage_cooldown: Duration,
    ) -> Self {
        Self {
            sink,
            matcher,
            tracked,
            rage_min_clicks,
            rage_cooldown: to_millis(rage_cooldown),
            last_click: None,
        }
    }

    pub fn register(tracker: &Rc<RefCell<Self>>, bus: &EventBus, clock: &Rc<dyn Clock>) {
        let (t, c) = (Rc::clone(tracker), Rc::clone(clock));
        bus.add_event_listener(
            SignalKind::Click,
            move |signal| {
                if let Some(target) = signal.target() {
                    t.borrow_mut().track_click(target, c.now());
                }
                Ok(())
            },
            true,
        );
    }

    /// The burst as of the last click.
    #[must_use]
    pub fn last_click(&self) -> Option<&ClickBurst> {
        self.last_click.as_ref()
    }

    /// Folds a click into the retained burst. Returns `true` only for the
    /// click that first brings the burst to the rage threshold.
    pub fn is_rage_click(&mut self, target: &ElementId, now: Millis) -> bool {
        let extends = self.last_click.as_ref().is_some_and(|burst| {
            burst.target == *target && now.saturating_sub(burst.time) < self.rage_cooldown
        });

        let burst = match self.last_click.take() {
            Some(mut burst) if extends => {
                burst.count = burst.count.saturating_add(1);
                burst.time = now;
                self.last_click.insert(burst)
            }
            _ => self.last_click.insert(ClickBurst::new(target.clone(), now)),
        };

        if burst.triggered || burst.count < self.rage_min_clicks {
            return false;
        }
        burst.triggered = true;
        debug!(target = %target, clicks = burst.count, "Rage click detected");
        true
    }

    /// Whether `target` matches any watched selector.
    #[must_use]
    pub fn is_tracked_element(&self, target: &ElementId) -> bool {
        self.tracked
            .iter()
            .any(|selector| self.matcher.matches(target, selector))
    }

    /// Reports the click if it is a rage click or hits the watch-list.
    pub fn track_click(&mut self, target: &ElementId, now: Millis) {
        let rage = self.is_rage_click(target, now);
        if !rage && !self.is_tracked_element(target) {
            return;
        }

        let mut properties = Properties::new();
        properties.insert("click.target".to_string(), target.as_str().into());
        properties.insert("click.rage".to_string(), rage.into());
        self.sink.track(EventType::Click.as_str(), properties);
    }
}
