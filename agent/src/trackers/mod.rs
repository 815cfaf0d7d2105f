//! Trackers that turn host signals into reports.
//!
//! - [`session`]: session lifecycle and cross-instance reconciliation
//! - [`engagement`]: elapsed, unfocused and idle time
//! - [`click`]: watched clicks and rage-click detection
//! - [`page_view`]: one page view per instance, with navigation timing
//! - [`error`]: uncaught errors and unhandled rejections
//!
//! Each tracker exposes a `register` function that wires it to an
//! [`EventBus`](crate::bus::EventBus). Trackers never return errors to the
//! host; handler failures are contained by the bus.

pub mod click;
pub mod engagement;
pub mod error;
pub mod page_view;
pub mod session;

pub use click::{ClickBurst, ClickTracker};
pub use engagement::{EngagementState, EngagementTracker};
pub use error::ErrorTracker;
pub use page_view::PageViewTracker;
pub use session::{PersistOutcome, Session, SessionManager, SessionState};
