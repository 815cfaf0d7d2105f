//! One `page_view` report per agent instance.
//!
//! If the page has already loaded at registration time the report is sent
//! right away. Otherwise it waits for `load`, running after every other
//! `load` handler, and falls back to `unload` for pages closed mid-load.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::Result;
use crate::host::Page;
use crate::sink::ReportSink;
use crate::trackers::session::SessionManager;
use crate::types::{EventType, Millis, SignalKind};

pub struct PageViewTracker {
    sink: Rc<dyn ReportSink>,
    page: Rc<dyn Page>,
    session: Rc<RefCell<SessionManager>>,
    tracked: Cell<bool>,
}

impl std::fmt::Debug for PageViewTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageViewTracker")
            .field("tracked", &self.tracked.get())
            .finish_non_exhaustive()
    }
}

impl PageViewTracker {
    pub fn new(
        sink: Rc<dyn ReportSink>,
        page: Rc<dyn Page>,
        session: Rc<RefCell<SessionManager>>,
    ) -> Self {
        Self {
            sink,
            page,
            session,
            tracked: Cell::new(false),
        }
    }

    pub fn register(tracker: &Rc<Self>, bus: &EventBus, clock: &Rc<dyn Clock>) {
        if tracker.page.is_loaded() {
            if let Err(e) = tracker.track_page_view(clock.now()) {
                warn!(error = %e, "Page view not counted against session");
            }
            return;
        }

        for kind in [SignalKind::Load, SignalKind::Unload] {
            let (t, c) = (Rc::clone(tracker), Rc::clone(clock));
            bus.add_event_listener(kind, move |_| t.track_page_view(c.now()).map(|_| ()), true);
        }
    }

    /// Whether the page view has been reported.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.tracked.get()
    }

    /// Reports the page view unless it already was. Returns `true` if this
    /// call sent the report.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PersistenceUnavailable`](crate::error::AgentError)
    /// if the session's page count could not be persisted. The report is
    /// sent regardless.
    pub fn track_page_view(&self, now: Millis) -> Result<bool> {
        if self.tracked.replace(true) {
            debug!("Page view already tracked");
            return Ok(false);
        }

        let counted = self.session.borrow_mut().record_page_view(now);
        self.sink
            .track(EventType::PageView.as_str(), self.page.navigation_timing());
        counted.map(|_| true)
    }
}
