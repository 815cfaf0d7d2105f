//! The agent facade: one object a host constructs and feeds signals into.
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use sitepulse_agent::agent::{Agent, Capabilities};
//! use sitepulse_agent::clock::SystemClock;
//! use sitepulse_agent::config::Config;
//! use sitepulse_agent::host::{ExactMatcher, RecordingSource, StaticPage};
//! use sitepulse_agent::storage::MemoryStorage;
//! use sitepulse_agent::types::{ElementId, Signal};
//! use sitepulse_agent::wrapper::RecordingEvaluator;
//!
//! let agent = Agent::new(
//!     &Config::default(),
//!     Capabilities {
//!         source: Rc::new(RecordingSource::new()),
//!         page: Rc::new(StaticPage::new()),
//!         matcher: Rc::new(ExactMatcher),
//!         storage: Rc::new(MemoryStorage::new()),
//!         clock: Rc::new(SystemClock),
//!         evaluator: Rc::new(RecordingEvaluator::new()),
//!     },
//! );
//!
//! agent.dispatch(&Signal::click(ElementId::new("#buy")));
//! println!("session: {}", agent.session_key());
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::bus::{Delivery, EventBus};
use crate::clock::Clock;
use crate::config::Config;
use crate::device::device_key;
use crate::host::{Page, SelectorMatcher, SignalSource};
use crate::storage::Storage;
use crate::trackers::{
    ClickTracker, EngagementState, EngagementTracker, ErrorTracker, PageViewTracker,
    SessionManager,
};
use crate::types::{Properties, PropertyValue, Signal};
use crate::wrapper::{Evaluator, EvaluatorWrapper, Identities};

/// Traffic type of the session identity.
pub const SESSION_TRAFFIC_TYPE: &str = "session";

/// Traffic type of the device identity.
pub const DEVICE_TRAFFIC_TYPE: &str = "device";

/// Everything the host provides.
pub struct Capabilities {
    pub source: Rc<dyn SignalSource>,
    pub page: Rc<dyn Page>,
    pub matcher: Rc<dyn SelectorMatcher>,
    pub storage: Rc<dyn Storage>,
    pub clock: Rc<dyn Clock>,
    pub evaluator: Rc<dyn Evaluator>,
}

/// Behavioral telemetry agent.
///
/// Owns the event bus and every tracker. Nothing here returns an error: all
/// failures are logged and the agent carries on.
pub struct Agent {
    clock: Rc<dyn Clock>,
    bus: Rc<EventBus>,
    wrapper: Rc<EvaluatorWrapper>,
    session: Rc<RefCell<SessionManager>>,
    engagement: Rc<RefCell<EngagementTracker>>,
    clicks: Rc<RefCell<ClickTracker>>,
    page_view: Rc<PageViewTracker>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("bus", &self.bus)
            .field("wrapper", &self.wrapper)
            .field("session", &self.session.borrow())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Builds the bus, registers every tracker and sets the `device` and
    /// `session` identities.
    ///
    /// Starting the session emits `session.start`, so the device identity is
    /// set first to give that report somewhere to go. A page that has
    /// already loaded gets its `page_view` report here too.
    pub fn new(config: &Config, host: Capabilities) -> Self {
        let Capabilities {
            source,
            page,
            matcher,
            storage,
            clock,
            evaluator,
        } = host;

        let now = clock.now();
        let bus = Rc::new(EventBus::new(source, config.duty_cycle));
        let wrapper = Rc::new(EvaluatorWrapper::new(evaluator));

        let mut defaults = page.context_properties();
        defaults.insert("currentTime".to_string(), PropertyValue::from(now));
        wrapper.set_default_properties(defaults);
        wrapper.add_identity(DEVICE_TRAFFIC_TYPE, &device_key(storage.as_ref()));

        let session = Rc::new(RefCell::new(SessionManager::new(
            Rc::clone(&storage),
            wrapper.clone(),
            config.session_length,
        )));
        let session_key = session.borrow_mut().session_key(now);
        wrapper.add_identity(SESSION_TRAFFIC_TYPE, &session_key);
        SessionManager::register(&session, &bus, &clock);

        let page_view = Rc::new(PageViewTracker::new(
            wrapper.clone(),
            Rc::clone(&page),
            Rc::clone(&session),
        ));
        PageViewTracker::register(&page_view, &bus, &clock);

        let errors = Rc::new(ErrorTracker::new(wrapper.clone()));
        ErrorTracker::register(&errors, &bus);

        let engagement = Rc::new(RefCell::new(EngagementTracker::new(
            wrapper.clone(),
            page,
            config.idle_threshold,
            now,
        )));
        EngagementTracker::register(&engagement, &bus, &clock);

        let clicks = Rc::new(RefCell::new(ClickTracker::new(
            wrapper.clone(),
            matcher,
            config.tracked_selectors.clone(),
            config.rage_min_clicks,
            config.rage_cooldown,
        )));
        ClickTracker::register(&clicks, &bus, &clock);

        // Runs after the session check so a renewed session is picked up on
        // the same tick.
        let (s, w) = (Rc::clone(&session), Rc::clone(&wrapper));
        bus.add_to_duty_cycle(move || {
            sync_session_identity(&s, &w);
            Ok(())
        });

        info!(session = %session_key, "Agent started");

        Self {
            clock,
            bus,
            wrapper,
            session,
            engagement,
            clicks,
            page_view,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the duty-cycle ticker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a [`tokio::task::LocalSet`].
    pub fn start(&self) {
        self.bus.start();
    }

    /// Stops the duty-cycle ticker. Idempotent.
    pub fn stop(&self) {
        self.bus.stop();
    }

    /// Delivers a host signal to every tracker.
    pub fn dispatch(&self, signal: &Signal) -> Delivery {
        let delivery = self.bus.dispatch(signal);
        sync_session_identity(&self.session, &self.wrapper);
        delivery
    }

    /// Runs one duty-cycle tick by hand.
    pub fn run_duty_cycle(&self) -> Delivery {
        self.bus.run_duty_cycle()
    }

    #[must_use]
    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Key of the live session, starting a new session if needed.
    pub fn session_key(&self) -> String {
        let key = self.session.borrow_mut().session_key(self.clock.now());
        self.wrapper.add_identity(SESSION_TRAFFIC_TYPE, &key);
        key
    }

    /// Ends the current session now.
    pub fn end_session(&self) {
        if let Err(e) = self.session.borrow_mut().end_session() {
            warn!(error = %e, "Session ended but its record could not be removed");
        }
    }

    #[must_use]
    pub fn engagement_state(&self) -> EngagementState {
        self.engagement.borrow().state(self.clock.now())
    }

    #[must_use]
    pub fn page_view_tracked(&self) -> bool {
        self.page_view.is_tracked()
    }

    #[must_use]
    pub fn rage_clicks(&self) -> Option<u32> {
        self.clicks.borrow().last_click().map(|burst| burst.count)
    }

    // =========================================================================
    // Evaluator
    // =========================================================================

    /// Sends a custom report to every identity.
    pub fn track(&self, event_type: &str, properties: Properties) {
        self.wrapper.track(event_type, properties);
    }

    /// Evaluates `flag`, or returns `"control"` when it cannot be.
    pub fn treatment(&self, flag: &str, attributes: Properties) -> String {
        self.wrapper.treatment(flag, attributes)
    }

    #[must_use]
    pub fn identities(&self) -> Identities {
        self.wrapper.identities()
    }

    pub fn add_identities(&self, identities: Identities) {
        self.wrapper.add_identities(identities);
    }

    pub fn add_identity(&self, traffic_type: &str, key: &str) {
        self.wrapper.add_identity(traffic_type, key);
    }

    pub fn remove_identity(&self, traffic_type: &str) -> Option<String> {
        self.wrapper.remove_identity(traffic_type)
    }

    /// Attaches `value` under `key` to every future report.
    pub fn add_property(&self, key: &str, value: impl Into<PropertyValue>) {
        self.wrapper.add_property(key, value.into());
    }

    /// Replaces every property attached with [`add_property`](Self::add_property).
    pub fn set_properties(&self, properties: Properties) {
        self.wrapper.set_properties(properties);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.bus.stop();
    }
}

/// Points the `session` identity at the cached session, if there is one.
fn sync_session_identity(session: &RefCell<SessionManager>, wrapper: &EvaluatorWrapper) {
    let key = session.borrow().cached().map(|s| s.key.clone());
    if let Some(key) = key {
        wrapper.add_identity(SESSION_TRAFFIC_TYPE, &key);
    } else {
        debug!("No cached session to sync");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::{ExactMatcher, RecordingSource, StaticPage};
    use crate::storage::MemoryStorage;
    use crate::types::{ElementId, SignalKind};
    use crate::wrapper::RecordingEvaluator;

    struct Fixture {
        agent: Agent,
        clock: Rc<ManualClock>,
        evaluator: RecordingEvaluator,
        source: Rc<RecordingSource>,
    }

    fn fixture(page: StaticPage) -> Fixture {
        let clock = Rc::new(ManualClock::new(1_700_000_000_000));
        let evaluator = RecordingEvaluator::new();
        let source = Rc::new(RecordingSource::new());
        let agent = Agent::new(
            &Config::default(),
            Capabilities {
                source: source.clone(),
                page: Rc::new(page),
                matcher: Rc::new(ExactMatcher),
                storage: Rc::new(MemoryStorage::new()),
                clock: clock.clone(),
                evaluator: Rc::new(evaluator.clone()),
            },
        );
        Fixture {
            agent,
            clock,
            evaluator,
            source,
        }
    }

    #[test]
    fn construction_sets_identities_and_subscribes() {
        let f = fixture(StaticPage::new());

        let identities = f.agent.identities();
        assert!(identities[DEVICE_TRAFFIC_TYPE].starts_with("device-"));
        assert!(identities[SESSION_TRAFFIC_TYPE].starts_with("session-"));
        assert_eq!(identities[SESSION_TRAFFIC_TYPE], f.agent.session_key());

        let kinds = f.source.kinds();
        for kind in [
            SignalKind::Click,
            SignalKind::Load,
            SignalKind::Unload,
            SignalKind::BeforeUnload,
            SignalKind::VisibilityChange,
            SignalKind::Error,
            SignalKind::UnhandledRejection,
            SignalKind::Scroll,
        ] {
            assert!(kinds.contains(&kind), "{kind} not subscribed");
        }
        // One low-level subscription per kind.
        assert_eq!(f.source.subscriptions().len(), kinds.len());
    }

    #[test]
    fn session_start_reaches_device_identity() {
        let f = fixture(StaticPage::new());

        let starts = f.evaluator.events_for(DEVICE_TRAFFIC_TYPE, "session.start");
        assert_eq!(starts.len(), 1);
        assert_eq!(
            starts[0].properties["currentTime"].as_i64(),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn loaded_page_reports_page_view_to_both_identities() {
        let page = StaticPage::new();
        page.set_loaded(true);
        let f = fixture(page);

        assert!(f.agent.page_view_tracked());
        assert_eq!(f.evaluator.events_for(SESSION_TRAFFIC_TYPE, "page_view").len(), 1);
        assert_eq!(f.evaluator.events_for(DEVICE_TRAFFIC_TYPE, "page_view").len(), 1);
    }

    #[test]
    fn context_properties_are_defaults() {
        let page = StaticPage::new();
        let mut context = Properties::new();
        context.insert("url".to_string(), "https://shop.example/cart".into());
        context.insert("currentTime".to_string(), 0_i64.into());
        page.set_context_properties(context);
        let f = fixture(page);

        f.agent.track("checkout", Properties::new());

        let sent = &f.evaluator.events_for(DEVICE_TRAFFIC_TYPE, "checkout")[0];
        assert_eq!(sent.properties["url"].as_str(), Some("https://shop.example/cart"));
        assert_eq!(sent.properties["currentTime"].as_i64(), Some(1_700_000_000_000));
    }

    #[test]
    fn custom_track_carries_private_properties() {
        let f = fixture(StaticPage::new());
        f.agent.add_property("plan", "pro");

        let mut props = Properties::new();
        props.insert("value".to_string(), 3_i64.into());
        f.agent.track("checkout", props);

        let sent = f.evaluator.events_for(SESSION_TRAFFIC_TYPE, "checkout");
        assert_eq!(sent[0].properties["plan"].as_str(), Some("pro"));
        assert_eq!(sent[0].properties["value"].as_i64(), Some(3));
    }

    #[test]
    fn renewed_session_updates_identity() {
        let f = fixture(StaticPage::new());
        let first = f.agent.session_key();

        f.clock.advance(31 * 60 * 1000);
        f.agent.run_duty_cycle();
        f.agent.dispatch(&Signal::click(ElementId::new("#next")));

        let second = f.agent.identities()[SESSION_TRAFFIC_TYPE].clone();
        assert_ne!(first, second);
        assert_eq!(f.evaluator.events_for(DEVICE_TRAFFIC_TYPE, "session.end").len(), 1);
    }

    #[test]
    fn end_session_emits_end_report() {
        let f = fixture(StaticPage::new());
        f.clock.advance(5_000);
        f.agent.dispatch(&Signal::new(SignalKind::KeyDown));

        f.agent.end_session();

        let ends = f.evaluator.events_for(DEVICE_TRAFFIC_TYPE, "session.end");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].properties["session.duration"].as_i64(), Some(5_000));
    }

    #[test]
    fn treatment_falls_back_to_control() {
        let f = fixture(StaticPage::new());
        f.evaluator.define_flag("checkout_v2", "user", "on");

        assert_eq!(f.agent.treatment("checkout_v2", Properties::new()), "control");

        f.agent.add_identity("user", "user-1");
        assert_eq!(f.agent.treatment("checkout_v2", Properties::new()), "on");
        assert_eq!(f.agent.remove_identity("user"), Some("user-1".to_string()));
    }
}
