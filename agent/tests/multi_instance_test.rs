//! Integration tests for agents sharing one storage scope.
//!
//! Each agent plays one browser tab. They share nothing but storage, and
//! each has its own clock, which the tests keep roughly in step.

use std::cell::RefCell;
use std::rc::Rc;

use tempfile::TempDir;

use sitepulse_agent::agent::{Agent, Capabilities, SESSION_TRAFFIC_TYPE};
use sitepulse_agent::clock::ManualClock;
use sitepulse_agent::config::Config;
use sitepulse_agent::host::{ExactMatcher, RecordingSource, StaticPage};
use sitepulse_agent::storage::{FileStorage, MemoryStorage, Storage, StorageError};
use sitepulse_agent::trackers::session::{Session, SESSION_STORAGE_KEY};
use sitepulse_agent::types::{ElementId, Properties, Signal, SignalKind};
use sitepulse_agent::wrapper::{Evaluator, RecordingEvaluator};

// ============================================================================
// Helpers
// ============================================================================

const T0: u64 = 1_700_000_000_000;
const MINUTE: u64 = 60 * 1000;

struct Tab {
    agent: Agent,
    clock: Rc<ManualClock>,
    evaluator: RecordingEvaluator,
}

impl Tab {
    fn open(storage: Rc<dyn Storage>, at: u64) -> Self {
        let clock = Rc::new(ManualClock::new(at));
        let evaluator = RecordingEvaluator::new();
        let agent = Agent::new(
            &Config::default(),
            Capabilities {
                source: Rc::new(RecordingSource::new()),
                page: Rc::new(StaticPage::new()),
                matcher: Rc::new(ExactMatcher),
                storage,
                clock: clock.clone(),
                evaluator: Rc::new(evaluator.clone()),
            },
        );
        Self {
            agent,
            clock,
            evaluator,
        }
    }

    fn at(&self, at: u64) -> &Self {
        self.clock.set(at);
        self
    }

    fn key_press(&self) {
        self.agent.dispatch(&Signal::new(SignalKind::KeyDown));
    }

    fn tick(&self) {
        self.agent.run_duty_cycle();
    }

    fn session_ends(&self) -> usize {
        self.evaluator.events_for("device", "session.end").len()
    }
}

/// Shared, ordered log of storage writes and evaluator traffic.
type Journal = Rc<RefCell<Vec<String>>>;

struct JournaledStorage {
    inner: MemoryStorage,
    journal: Journal,
}

impl Storage for JournaledStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.journal.borrow_mut().push(format!("set {key}"));
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.journal.borrow_mut().push(format!("remove {key}"));
        self.inner.remove(key)
    }
}

struct JournaledEvaluator {
    journal: Journal,
}

impl Evaluator for JournaledEvaluator {
    fn track(&self, _key: &str, _traffic_type: &str, event_type: &str, _properties: &Properties) {
        self.journal.borrow_mut().push(format!("track {event_type}"));
    }

    fn treatment(&self, _key: &str, _flag: &str, _attributes: &Properties) -> String {
        "control".to_string()
    }

    fn traffic_type(&self, _flag: &str) -> Option<String> {
        None
    }
}

fn stored_session(storage: &dyn Storage) -> Option<Session> {
    storage
        .get(SESSION_STORAGE_KEY)
        .expect("storage readable")
        .map(|raw| serde_json::from_str(&raw).expect("valid session record"))
}

// ============================================================================
// Shared identity
// ============================================================================

#[test]
fn second_tab_joins_existing_session() {
    let storage = MemoryStorage::new();
    let a = Tab::open(Rc::new(storage.clone()), T0);
    let b = Tab::open(Rc::new(storage.clone()), T0 + 1_000);

    let key = a.agent.session_key();
    assert_eq!(b.agent.session_key(), key);
    assert_eq!(b.agent.identities()[SESSION_TRAFFIC_TYPE], key);

    // Only the first tab started a session.
    assert_eq!(a.evaluator.events_for("device", "session.start").len(), 1);
    assert!(b.evaluator.events_for("device", "session.start").is_empty());
}

#[test]
fn tabs_share_device_key() {
    let storage = MemoryStorage::new();
    let a = Tab::open(Rc::new(storage.clone()), T0);
    let b = Tab::open(Rc::new(storage.clone()), T0);

    assert_eq!(a.agent.identities()["device"], b.agent.identities()["device"]);
}

// ============================================================================
// Recency wins over write order
// ============================================================================

#[test]
fn stale_tab_cannot_roll_back_activity() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("storage.json");
    let storage = FileStorage::new(&path);

    let a = Tab::open(Rc::new(FileStorage::new(&path)), T0);
    let b = Tab::open(Rc::new(FileStorage::new(&path)), T0 + 1_000);

    // Tab A is in use, tab B sits in the background.
    a.at(T0 + 10 * MINUTE).key_press();
    a.tick();
    b.at(T0 + 10 * MINUTE + 1_000).tick();

    let stored = stored_session(&storage).expect("session persisted");
    assert_eq!(stored.last_active_time, T0 + 10 * MINUTE);

    // Thirty-five minutes after start but only 25 after A's activity.
    b.at(T0 + 35 * MINUTE).tick();
    assert_eq!(b.session_ends(), 0);
    assert!(stored_session(&storage).is_some());
}

#[test]
fn expiry_in_one_tab_is_seen_by_the_other() {
    let storage = MemoryStorage::new();
    let a = Tab::open(Rc::new(storage.clone()), T0);
    let b = Tab::open(Rc::new(storage.clone()), T0);
    let old_key = a.agent.session_key();

    b.at(T0 + 31 * MINUTE).tick();
    assert_eq!(b.session_ends(), 1);
    assert!(stored_session(&storage).is_none());

    // Tab A must not report the same session ending again.
    a.at(T0 + 31 * MINUTE + 1_000).tick();
    assert_eq!(a.session_ends(), 0);

    a.agent.dispatch(&Signal::click(ElementId::new("#home")));
    let new_key = a.agent.identities()[SESSION_TRAFFIC_TYPE].clone();
    assert_ne!(new_key, old_key);
    assert_eq!(stored_session(&storage).map(|s| s.key), Some(new_key));
}

#[test]
fn page_views_accumulate_across_tabs() {
    let storage = MemoryStorage::new();
    let a = Tab::open(Rc::new(storage.clone()), T0);
    let b = Tab::open(Rc::new(storage.clone()), T0 + 2_000);

    a.at(T0 + 3_000).agent.dispatch(&Signal::new(SignalKind::Load));
    b.at(T0 + 4_000).agent.dispatch(&Signal::new(SignalKind::Load));

    assert_eq!(stored_session(&storage).map(|s| s.page_views), Some(2));

    a.at(T0 + 5_000).agent.end_session();
    let end = &a.evaluator.events_for("device", "session.end")[0];
    assert_eq!(end.properties["session.pages"].as_i64(), Some(2));
    assert_eq!(end.properties["session.duration"].as_i64(), Some(4_000));
}

#[test]
fn before_unload_flushes_activity_ahead_of_engagement_report() {
    let storage = MemoryStorage::new();
    let journal = Journal::default();
    let clock = Rc::new(ManualClock::new(T0));
    let agent = Agent::new(
        &Config::default(),
        Capabilities {
            source: Rc::new(RecordingSource::new()),
            page: Rc::new(StaticPage::new()),
            matcher: Rc::new(ExactMatcher),
            storage: Rc::new(JournaledStorage {
                inner: storage.clone(),
                journal: journal.clone(),
            }),
            clock: clock.clone(),
            evaluator: Rc::new(JournaledEvaluator {
                journal: journal.clone(),
            }),
        },
    );

    // Activity only reaches the cache until something flushes it.
    clock.set(T0 + 5 * MINUTE);
    agent.dispatch(&Signal::new(SignalKind::KeyDown));
    assert_eq!(stored_session(&storage).map(|s| s.last_active_time), Some(T0));

    journal.borrow_mut().clear();
    agent.dispatch(&Signal::new(SignalKind::BeforeUnload));

    assert_eq!(
        stored_session(&storage).map(|s| s.last_active_time),
        Some(T0 + 5 * MINUTE)
    );
    let entries = journal.borrow();
    let flushed = entries
        .iter()
        .position(|e| e == "set sitepulse.session")
        .expect("session flushed");
    let reported = entries
        .iter()
        .position(|e| e == "track engagement")
        .expect("engagement reported");
    assert!(flushed < reported, "{entries:?}");
}

#[test]
fn tab_returning_after_expiry_joins_the_replacement_session() {
    let storage = MemoryStorage::new();
    let a = Tab::open(Rc::new(storage.clone()), T0);
    let b = Tab::open(Rc::new(storage.clone()), T0);
    let old_key = a.agent.session_key();

    // Tab A's user keeps typing, but A never flushes before B sees expiry.
    a.at(T0 + 20 * MINUTE).key_press();
    b.at(T0 + 31 * MINUTE).key_press();
    let new_key = b.agent.identities()[SESSION_TRAFFIC_TYPE].clone();
    assert_ne!(new_key, old_key);
    assert_eq!(b.session_ends(), 1);

    a.at(T0 + 31 * MINUTE + 10).tick();

    assert_eq!(a.session_ends(), 0);
    assert_eq!(a.agent.identities()[SESSION_TRAFFIC_TYPE], new_key);
    let stored = stored_session(&storage).expect("replacement persisted");
    assert_eq!(stored.key, new_key);
    assert_eq!(stored.start_time, T0 + 31 * MINUTE);
}

// ============================================================================
// Degraded storage
// ============================================================================

#[test]
fn unavailable_storage_keeps_agent_working() {
    let storage = MemoryStorage::new();
    storage.set_available(false);
    let tab = Tab::open(Rc::new(storage.clone()), T0);

    tab.at(T0 + MINUTE).key_press();
    tab.tick();
    tab.at(T0 + 2 * MINUTE).agent.dispatch(&Signal::new(SignalKind::BeforeUnload));

    assert!(tab.agent.session_key().starts_with("session-"));
    assert_eq!(tab.evaluator.events_for("device", "session.ping").len(), 1);
    assert_eq!(tab.evaluator.events_for("device", "engagement").len(), 1);
}

#[test]
fn storage_recovery_keeps_in_memory_session() {
    let storage = MemoryStorage::new();
    storage.set_available(false);
    let tab = Tab::open(Rc::new(storage.clone()), T0);
    let key = tab.agent.session_key();

    storage.set_available(true);
    tab.at(T0 + MINUTE).key_press();
    tab.tick();

    assert_eq!(tab.agent.session_key(), key);
    assert_eq!(tab.evaluator.events_for("device", "session.start").len(), 1);
    assert_eq!(tab.session_ends(), 0);
    assert_eq!(stored_session(&storage).map(|s| s.key), Some(key));
}
