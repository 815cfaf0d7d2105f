//! Engagement time accounting.
//!
//! Splits the lifetime of one agent instance into elapsed, unfocused (page
//! hidden) and idle (no user action for at least the idle threshold) time.
//!
//! Intervals are added to the accumulators exactly once, when they close.
//! [`EngagementTracker::state`] adds the still-open intervals on the fly so
//! reports taken between signals see live numbers without mutating anything.
//!
//! Two reports are produced:
//!
//! - `session.ping` on every duty-cycle tick, carrying the change since the
//!   previous ping as well as running totals;
//! - `engagement` once on `before-unload`, carrying totals only.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bus::EventBus;
use crate::clock::{to_millis, Clock};
use crate::host::Page;
use crate::sink::ReportSink;
use crate::types::{EventType, Millis, Properties, SignalKind};

/// Absolute time buckets as of one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementState {
    pub elapsed_total: Millis,
    pub unfocused_total: Millis,
    pub idle_total: Millis,
}

impl EngagementState {
    /// Elapsed time the page was visible.
    #[must_use]
    pub fn visible_total(&self) -> Millis {
        self.elapsed_total.saturating_sub(self.unfocused_total)
    }

    /// Elapsed time the user was not idle.
    #[must_use]
    pub fn active_total(&self) -> Millis {
        self.elapsed_total.saturating_sub(self.idle_total)
    }

    /// Per-bucket change from `prior` to `self`.
    #[must_use]
    pub fn since(&self, prior: &EngagementState) -> EngagementState {
        EngagementState {
            elapsed_total: self.elapsed_total.saturating_sub(prior.elapsed_total),
            unfocused_total: self.unfocused_total.saturating_sub(prior.unfocused_total),
            idle_total: self.idle_total.saturating_sub(prior.idle_total),
        }
    }

    fn write_totals(&self, properties: &mut Properties) {
        properties.insert("time.elapsed.total".to_string(), self.elapsed_total.into());
        properties.insert("time.unfocused.total".to_string(), self.unfocused_total.into());
        properties.insert("time.idle.total".to_string(), self.idle_total.into());
        properties.insert("time.visible.total".to_string(), self.visible_total().into());
        properties.insert("time.active.total".to_string(), self.active_total().into());
    }
}

/// Per-instance engagement accumulators. Never persisted.
pub struct EngagementTracker {
    sink: Rc<dyn ReportSink>,
    page: Rc<dyn Page>,
    idle_threshold: Millis,

    site_instance_start_time: Millis,
    total_unfocused_time: Millis,
    total_idle_time: Millis,
    unfocus_time: Option<Millis>,
    last_active_time: Option<Millis>,

    /// State at the previous ping.
    reported: Option<EngagementState>,
}

impl std::fmt::Debug for EngagementTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngagementTracker")
            .field("idle_threshold", &self.idle_threshold)
            .field("site_instance_start_time", &self.site_instance_start_time)
            .field("total_unfocused_time", &self.total_unfocused_time)
            .field("total_idle_time", &self.total_idle_time)
            .field("unfocus_time", &self.unfocus_time)
            .field("last_active_time", &self.last_active_time)
            .finish_non_exhaustive()
    }
}

impl EngagementTracker {
    /// Creates a tracker anchored at `now`.
    pub fn new(
        sink: Rc<dyn ReportSink>,
        page: Rc<dyn Page>,
        idle_threshold: Duration,
        now: Millis,
    ) -> Self {
        let mut tracker = Self {
            sink,
            page,
            idle_threshold: to_millis(idle_threshold),
            site_instance_start_time: now,
            total_unfocused_time: 0,
            total_idle_time: 0,
            unfocus_time: None,
            last_active_time: None,
            reported: None,
        };
        tracker.reset(now);
        tracker
    }

    /// Wires the tracker to the bus: ping on every tick, idle accounting on
    /// user actions, unfocus accounting on visibility changes and the
    /// terminal report on `before-unload`.
    pub fn register(tracker: &Rc<RefCell<Self>>, bus: &EventBus, clock: &Rc<dyn Clock>) {
        let (t, c) = (Rc::clone(tracker), Rc::clone(clock));
        bus.add_to_duty_cycle(move || {
            t.borrow_mut().track_engagement_ping(c.now());
            Ok(())
        });

        let (t, c) = (Rc::clone(tracker), Rc::clone(clock));
        bus.add_on_user_action(move |_| {
            t.borrow_mut().user_active(c.now());
            Ok(())
        });

        let (t, c) = (Rc::clone(tracker), Rc::clone(clock));
        bus.add_event_listener(
            SignalKind::VisibilityChange,
            move |_| {
                t.borrow_mut().change_visibility(c.now());
                Ok(())
            },
            true,
        );

        let (t, c) = (Rc::clone(tracker), Rc::clone(clock));
        bus.add_event_listener(
            SignalKind::BeforeUnload,
            move |_| {
                t.borrow().track_engagement(c.now());
                Ok(())
            },
            true,
        );
    }

    /// Zeroes every accumulator and re-anchors the instance at `now`.
    pub fn reset(&mut self, now: Millis) {
        self.site_instance_start_time = now;

        self.unfocus_time = (!self.page.is_visible()).then_some(now);
        self.total_unfocused_time = 0;

        self.last_active_time = Some(now);
        self.total_idle_time = 0;

        self.reported = None;
    }

    // =========================================================================
    // Visibility
    // =========================================================================

    /// Opens or closes an unfocus interval according to the page's current
    /// visibility. Repeated notifications for the same state are ignored.
    pub fn change_visibility(&mut self, now: Millis) {
        if self.page.is_visible() {
            if let Some(since) = self.unfocus_time.take() {
                self.total_unfocused_time += now.saturating_sub(since);
                trace!(unfocused_ms = now.saturating_sub(since), "Page visible again");
            }
        } else if self.unfocus_time.is_none() {
            self.unfocus_time = Some(now);
            trace!("Page hidden");
        }
    }

    // =========================================================================
    // Idle
    // =========================================================================

    /// Records a user action. A gap of at least the idle threshold since the
    /// previous action counts entirely as idle time.
    pub fn user_active(&mut self, now: Millis) {
        let gap = self.idle_gap(now);
        if gap >= self.idle_threshold {
            self.total_idle_time += gap;
        }
        self.last_active_time = Some(self.last_active_time.map_or(now, |last| last.max(now)));
    }

    fn idle_gap(&self, now: Millis) -> Millis {
        self.last_active_time
            .map_or(0, |last| now.saturating_sub(last))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Totals as of `now`, including intervals that are still open.
    #[must_use]
    pub fn state(&self, now: Millis) -> EngagementState {
        let open_unfocus = self
            .unfocus_time
            .map_or(0, |since| now.saturating_sub(since));

        let gap = self.idle_gap(now);
        let open_idle = if gap >= self.idle_threshold { gap } else { 0 };

        EngagementState {
            elapsed_total: now.saturating_sub(self.site_instance_start_time),
            unfocused_total: self.total_unfocused_time + open_unfocus,
            idle_total: self.total_idle_time + open_idle,
        }
    }

    // =========================================================================
    // Trackers
    // =========================================================================

    /// Emits `session.ping` with the change since the last ping and the
    /// running totals, then makes `now` the new baseline.
    pub fn track_engagement_ping(&mut self, now: Millis) {
        let current = self.state(now);
        let delta = current.since(&self.reported.unwrap_or_default());
        self.reported = Some(current);

        let mut properties = Properties::new();
        properties.insert("time.elapsed".to_string(), delta.elapsed_total.into());
        properties.insert("time.unfocused".to_string(), delta.unfocused_total.into());
        properties.insert("time.idle".to_string(), delta.idle_total.into());
        properties.insert("time.visible".to_string(), delta.visible_total().into());
        properties.insert("time.active".to_string(), delta.active_total().into());
        current.write_totals(&mut properties);

        self.sink.track(EventType::SessionPing.as_str(), properties);
    }

    /// Emits the terminal `engagement` report with totals only.
    pub fn track_engagement(&self, now: Millis) {
        let mut properties = Properties::new();
        self.state(now).write_totals(&mut properties);
        self.sink.track(EventType::Engagement.as_str(), properties);
    }
}
