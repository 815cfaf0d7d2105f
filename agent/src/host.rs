//! Capabilities the host application provides.
//!
//! The agent never touches a DOM, a window system or a terminal directly.
//! Instead the host implements these traits and delivers signals through
//! [`EventBus::dispatch`](crate::bus::EventBus::dispatch).

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;

use crate::types::{ElementId, Properties, SignalKind};

/// Registers low-level listeners on the host's signal source.
///
/// The [`EventBus`](crate::bus::EventBus) calls [`subscribe`](Self::subscribe)
/// at most once per [`SignalKind`]; the host is then expected to forward
/// every occurrence of that signal to `EventBus::dispatch`. When the bus is
/// dropped it calls [`unsubscribe`](Self::unsubscribe) for each kind it
/// subscribed.
pub trait SignalSource {
    fn subscribe(&self, kind: SignalKind);

    fn unsubscribe(&self, kind: SignalKind);
}

/// Read-only view of the page (or window) the agent observes.
pub trait Page {
    /// Whether the page is currently visible to the user.
    fn is_visible(&self) -> bool;

    /// Whether the page has finished loading.
    fn is_loaded(&self) -> bool;

    /// Flat page-load timing metrics (e.g. `nav.timing.page_load`).
    fn navigation_timing(&self) -> Properties {
        Properties::new()
    }

    /// Flat device/context properties (user agent, connection type, URL).
    fn context_properties(&self) -> Properties {
        Properties::new()
    }
}

/// Matches click targets against selectors.
pub trait SelectorMatcher {
    fn matches(&self, target: &ElementId, selector: &str) -> bool;
}

/// Matches when the element identifier equals the selector text.
///
/// Suitable for hosts whose element identifiers already are selectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatcher;

impl SelectorMatcher for ExactMatcher {
    fn matches(&self, target: &ElementId, selector: &str) -> bool {
        target.as_str() == selector
    }
}

/// A [`SignalSource`] that just remembers what was subscribed.
///
/// Hosts that forward every signal unconditionally (like the replay binary)
/// can use it as-is.
#[derive(Debug, Default)]
pub struct RecordingSource {
    subscribed: RefCell<Vec<SignalKind>>,
    unsubscribed: RefCell<Vec<SignalKind>>,
}

impl RecordingSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subscription in call order, duplicates included.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SignalKind> {
        self.subscribed.borrow().clone()
    }

    /// Kinds currently subscribed.
    #[must_use]
    pub fn kinds(&self) -> BTreeSet<SignalKind> {
        let unsubscribed = self.unsubscribed.borrow();
        self.subscribed
            .borrow()
            .iter()
            .filter(|kind| !unsubscribed.contains(kind))
            .copied()
            .collect()
    }

    /// Every unsubscription in call order.
    #[must_use]
    pub fn unsubscriptions(&self) -> Vec<SignalKind> {
        self.unsubscribed.borrow().clone()
    }
}

impl SignalSource for RecordingSource {
    fn subscribe(&self, kind: SignalKind) {
        self.subscribed.borrow_mut().push(kind);
    }

    fn unsubscribe(&self, kind: SignalKind) {
        self.unsubscribed.borrow_mut().push(kind);
    }
}

/// A [`Page`] whose state is set explicitly.
#[derive(Debug)]
pub struct StaticPage {
    visible: Cell<bool>,
    loaded: Cell<bool>,
    timing: RefCell<Properties>,
    context: RefCell<Properties>,
}

impl Default for StaticPage {
    fn default() -> Self {
        Self {
            visible: Cell::new(true),
            loaded: Cell::new(false),
            timing: RefCell::new(Properties::new()),
            context: RefCell::new(Properties::new()),
        }
    }
}

impl StaticPage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.set(visible);
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.set(loaded);
    }

    pub fn set_navigation_timing(&self, timing: Properties) {
        *self.timing.borrow_mut() = timing;
    }

    pub fn set_context_properties(&self, context: Properties) {
        *self.context.borrow_mut() = context;
    }
}

impl Page for StaticPage {
    fn is_visible(&self) -> bool {
        self.visible.get()
    }

    fn is_loaded(&self) -> bool {
        self.loaded.get()
    }

    fn navigation_timing(&self) -> Properties {
        self.timing.borrow().clone()
    }

    fn context_properties(&self) -> Properties {
        self.context.borrow().clone()
    }
}
