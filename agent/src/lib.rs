//! Sitepulse Agent - behavioral telemetry for interactive sessions.
//!
//! The agent turns raw host signals (clicks, key presses, visibility changes,
//! page lifecycle, runtime errors) into a small set of reports that it sends
//! through a feature-flag evaluator.
//!
//! # Overview
//!
//! A single [`EventBus`](bus::EventBus) subscribes to each signal kind once
//! and fans it out to the trackers. The bus also runs a periodic duty cycle
//! for the time-based trackers.
//!
//! Sessions are shared by every agent instance that uses the same
//! [`Storage`](storage::Storage) scope. Instances reconcile through
//! read-reconcile-write instead of locking.
//!
//! # Reports
//!
//! | Event | Emitted when |
//! |-------|--------------|
//! | `session.start` | a new session begins |
//! | `session.end` | a session expires or is ended |
//! | `session.ping` | every duty-cycle tick |
//! | `engagement` | `before-unload` |
//! | `page_view` | once per instance, when the page has loaded |
//! | `error` | an uncaught error or unhandled rejection |
//! | `click` | a rage click, or a click on a watched element |
//!
//! # Modules
//!
//! - [`agent`]: The facade hosts construct
//! - [`bus`]: Signal fan-out and duty-cycle scheduler
//! - [`trackers`]: Session, engagement, click, page view and error trackers
//! - [`wrapper`]: Identities and property layers in front of the evaluator
//! - [`host`], [`storage`], [`sink`], [`clock`]: Capabilities the host provides
//! - [`device`]: Persistent device key
//! - [`replay`]: Deterministic script replay
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for agent operations
//! - [`types`]: Signals, properties and report names

pub mod agent;
pub mod bus;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod replay;
pub mod sink;
pub mod storage;
pub mod trackers;
pub mod types;
pub mod wrapper;

pub use agent::{Agent, Capabilities};
pub use bus::{Delivery, EventBus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{AgentError, Result};
pub use host::{Page, SelectorMatcher, SignalSource};
pub use sink::{MemorySink, Report, ReportSink};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use types::{
    ElementId, ErrorValue, EventType, Millis, Properties, PropertyValue, Signal, SignalKind,
    SignalPayload,
};
pub use wrapper::{Evaluator, EvaluatorWrapper, RecordingEvaluator};
