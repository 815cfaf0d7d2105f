//! Session lifecycle: one continuous period of user presence.
//!
//! A session moves through three states:
//!
//! ```text
//!              start_new_session            duty cycle: idle >= session_length
//! NoSession ───────────────────▶ Active ─────────────────────────────────────▶ Expired
//!     ▲                          │  ▲                                            │
//!     │                          └──┘ user action (last_active_time = now)       │
//!     └──────────────────────────── end_session (session.end, remove) ◀──────────┘
//! ```
//!
//! # Shared storage
//!
//! The persisted record is the source of truth for every agent instance
//! observing the same [`Storage`] scope. Each [`SessionManager`] only holds a
//! cached copy, and [`activate`](SessionManager::activate) reconciles that
//! copy with storage before anybody reads it.
//!
//! Writes follow an optimistic read-reconcile-write protocol instead of a
//! lock:
//!
//! - the earliest `startTime` owns the session identity, so two instances
//!   that start "at once" converge on one key;
//! - a record that started after the other side had already lapsed replaces
//!   it outright, so an ended session never comes back under a new one;
//! - `lastActiveTime` only ever moves forward, so a stale instance cannot
//!   roll back an extension written by a fresher one.
//!
//! User actions only touch the cache; persistence happens on the duty cycle,
//! on page views and on `before-unload`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::clock::{to_millis, Clock};
use crate::error::{AgentError, Result};
use crate::sink::ReportSink;
use crate::storage::Storage;
use crate::types::{EventType, Millis, Properties, SignalKind};

/// Storage key of the persisted session record.
pub const SESSION_STORAGE_KEY: &str = "sitepulse.session";

/// Prefix of every generated session key.
const SESSION_KEY_PREFIX: &str = "session-";

/// A persisted session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub start_time: Millis,
    pub last_active_time: Millis,
    #[serde(default)]
    pub page_views: u32,
}

impl Session {
    /// A brand-new session starting (and last active) at `now`.
    #[must_use]
    pub fn new(now: Millis) -> Self {
        Self {
            key: format!("{SESSION_KEY_PREFIX}{}", Uuid::new_v4()),
            start_time: now,
            last_active_time: now,
            page_views: 0,
        }
    }

    /// Whether `session_length` or more has passed since the last activity.
    #[must_use]
    pub fn is_expired_at(&self, now: Millis, session_length: Millis) -> bool {
        now.saturating_sub(self.last_active_time) >= session_length
    }

    /// Time between session start and last activity.
    #[must_use]
    pub fn duration(&self) -> Millis {
        self.last_active_time.saturating_sub(self.start_time)
    }

    /// Merges a persisted record into this (cached) one.
    ///
    /// Two different sessions where one started at or after the other had
    /// expired do not overlap: the later one replaces the earlier one and
    /// nothing carries over. Otherwise the earlier `start_time` wins the
    /// identity, with the persisted record winning a tie, and activity and
    /// page counts take the maximum of both sides.
    #[must_use]
    pub fn reconcile(mut self, persisted: &Session, session_length: Millis) -> Session {
        if self.key != persisted.key {
            if persisted.started_after_expiry_of(self.last_active_time, session_length) {
                return persisted.clone();
            }
            if self.started_after_expiry_of(persisted.last_active_time, session_length) {
                return self;
            }
        }

        let persisted_owns = persisted.start_time < self.start_time
            || (persisted.start_time == self.start_time && persisted.key != self.key);
        if persisted_owns {
            self.key.clone_from(&persisted.key);
            self.start_time = persisted.start_time;
        }
        self.last_active_time = self
            .last_active_time
            .max(persisted.last_active_time)
            .max(self.start_time);
        self.page_views = self.page_views.max(persisted.page_views);
        self
    }

    /// Whether this session began once a session last active at
    /// `last_active_time` had already expired.
    fn started_after_expiry_of(&self, last_active_time: Millis, session_length: Millis) -> bool {
        self.start_time >= last_active_time.saturating_add(session_length)
    }

    /// Whether writing `self` over `persisted` carries new information.
    ///
    /// `self` is expected to already be reconciled with `persisted`, so its
    /// `last_active_time` is never older than the persisted one.
    fn supersedes(&self, persisted: &Session) -> bool {
        self.last_active_time > persisted.last_active_time
            || self.key != persisted.key
            || self.page_views > persisted.page_views
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Active,
    Expired,
}

/// Result of a [`SessionManager::persist`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The reconciled record was written.
    Written,
    /// Storage already held everything this instance knows.
    Unchanged,
    /// Nothing cached, nothing to write.
    NoSession,
}

/// What a storage read turned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Found,
    Missing,
    Unreadable,
}

/// Owns the session entity for one agent instance.
pub struct SessionManager {
    storage: Rc<dyn Storage>,
    sink: Rc<dyn ReportSink>,
    session_length: Millis,
    session: Option<Session>,
    /// `last_active_time` of the cached session as last seen in storage.
    /// `None` while the cached session has never reached storage.
    synced: Option<Millis>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_length", &self.session_length)
            .field("session", &self.session)
            .field("synced", &self.synced)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager with no cached session. Call
    /// [`activate`](Self::activate) before reading anything.
    pub fn new(
        storage: Rc<dyn Storage>,
        sink: Rc<dyn ReportSink>,
        session_length: Duration,
    ) -> Self {
        Self {
            storage,
            sink,
            session_length: to_millis(session_length),
            session: None,
            synced: None,
        }
    }

    /// Wires the manager to the bus:
    ///
    /// - every duty-cycle tick flushes and checks expiry;
    /// - every user action advances `last_active_time`;
    /// - `before-unload` flushes, ahead of every other handler.
    pub fn register(manager: &Rc<RefCell<Self>>, bus: &EventBus, clock: &Rc<dyn Clock>) {
        let (m, c) = (Rc::clone(manager), Rc::clone(clock));
        bus.add_to_duty_cycle(move || m.borrow_mut().check_expired(c.now()).map(|_| ()));

        let (m, c) = (Rc::clone(manager), Rc::clone(clock));
        bus.add_on_user_action(move |_| {
            m.borrow_mut().update_last_active_time(c.now());
            Ok(())
        });

        let m = Rc::clone(manager);
        bus.add_event_listener(
            SignalKind::BeforeUnload,
            move |_| m.borrow_mut().persist().map(|_| ()),
            false,
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Reconciles with storage and returns the live session.
    ///
    /// - no persisted record: start a new session;
    /// - persisted record expired: end it, then start a new one;
    /// - otherwise: adopt the reconciled record.
    ///
    /// When storage cannot be read the cached copy is trusted instead.
    pub fn activate(&mut self, now: Millis) -> &Session {
        self.sync();

        match self.session.take() {
            Some(session) if !session.is_expired_at(now, self.session_length) => {
                &*self.session.insert(session)
            }
            Some(expired) => {
                if let Err(e) = self.close(expired) {
                    warn!(error = %e, "Failed to remove expired session");
                }
                self.start_new_session(now)
            }
            None => self.start_new_session(now),
        }
    }

    /// Key of the live session.
    pub fn session_key(&mut self, now: Millis) -> String {
        self.activate(now).key.clone()
    }

    /// Milliseconds between session start and last activity.
    pub fn total_session_time(&mut self, now: Millis) -> Millis {
        self.activate(now).duration()
    }

    /// The cached copy, without reconciling. May be stale.
    #[must_use]
    pub fn cached(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Lifecycle state as of `now`, judged from storage reconciled with the
    /// cache. Does not mutate anything.
    pub fn state(&self, now: Millis) -> SessionState {
        let current = match self.read_stored() {
            (Refresh::Found, Some(persisted)) => Some(match &self.session {
                Some(cached) => self.merge(cached.clone(), &persisted),
                None => persisted,
            }),
            (Refresh::Missing, _) if self.synced.is_none() => self.session.clone(),
            (Refresh::Unreadable, _) => self.session.clone(),
            _ => None,
        };
        match current {
            None => SessionState::NoSession,
            Some(s) if s.is_expired_at(now, self.session_length) => SessionState::Expired,
            Some(_) => SessionState::Active,
        }
    }

    // =========================================================================
    // Interaction triggers
    // =========================================================================

    /// Records user activity at `now`. Cache only; see [`persist`](Self::persist).
    pub fn update_last_active_time(&mut self, now: Millis) {
        self.activate(now);
        if let Some(session) = self.session.as_mut() {
            session.last_active_time = session.last_active_time.max(now);
        }
    }

    /// Counts a page view against the live session and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PersistenceUnavailable`] if the write failed; the
    /// count is still kept in memory.
    pub fn record_page_view(&mut self, now: Millis) -> Result<PersistOutcome> {
        self.update_last_active_time(now);
        if let Some(session) = self.session.as_mut() {
            session.page_views = session.page_views.saturating_add(1);
        }
        self.persist()
    }

    /// Duty-cycle check: ends the session if it has expired, otherwise
    /// flushes the cache. Returns `true` if a session was ended.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PersistenceUnavailable`] if storage could not be
    /// written. The expiry decision itself still happens.
    pub fn check_expired(&mut self, now: Millis) -> Result<bool> {
        self.sync();

        match self.session.take() {
            Some(session) if session.is_expired_at(now, self.session_length) => {
                info!(key = %session.key, "Session expired");
                self.close(session)?;
                Ok(true)
            }
            Some(session) => {
                self.session = Some(session);
                self.persist()?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Session object management
    // =========================================================================

    /// Starts a new session at `now`, persists it and emits `session.start`.
    ///
    /// If storage already holds a session that started no later than this
    /// one, the new session adopts its identity instead of forking.
    pub fn start_new_session(&mut self, now: Millis) -> &Session {
        let fresh = Session::new(now);
        info!(key = %fresh.key, "Starting new session");
        self.synced = None;

        let (session, outcome) = self.write_reconciled(fresh);
        if let Err(e) = outcome {
            warn!(error = %e, "Session not persisted; continuing in memory");
        }

        self.sink
            .track(EventType::SessionStart.as_str(), Properties::new());
        &*self.session.insert(session)
    }

    /// Ends the current session: emits `session.end` and deletes the record.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PersistenceUnavailable`] if the record could not
    /// be removed. The in-memory session is cleared regardless.
    pub fn end_session(&mut self) -> Result<()> {
        self.sync();
        match self.session.take() {
            Some(session) => self.close(session),
            None => {
                debug!("No session to end");
                Ok(())
            }
        }
    }

    /// Flushes the cached session to storage using read-reconcile-write.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::PersistenceUnavailable`] if storage could not be
    /// read or written. The cache is left intact.
    pub fn persist(&mut self) -> Result<PersistOutcome> {
        let Some(session) = self.session.take() else {
            return Ok(PersistOutcome::NoSession);
        };
        let (session, outcome) = self.write_reconciled(session);
        self.session = Some(session);
        outcome
    }

    fn close(&mut self, session: Session) -> Result<()> {
        info!(key = %session.key, duration_ms = session.duration(), "Ending session");
        let mut properties = Properties::new();
        properties.insert("session.start".to_string(), session.start_time.into());
        properties.insert("session.end".to_string(), session.last_active_time.into());
        properties.insert("session.duration".to_string(), session.duration().into());
        properties.insert("session.pages".to_string(), session.page_views.into());
        self.sink.track(EventType::SessionEnd.as_str(), properties);

        self.synced = None;
        self.storage.remove(SESSION_STORAGE_KEY)?;
        Ok(())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Reconciles `session` with storage and writes it back if it carries
    /// anything new. Always hands back the reconciled session.
    fn write_reconciled(&mut self, session: Session) -> (Session, Result<PersistOutcome>) {
        let persisted = match self.read_persisted() {
            Ok(p) => p,
            Err(e @ AgentError::MalformedRecord { .. }) => {
                warn!(error = %e, "Overwriting malformed session record");
                None
            }
            Err(e) => return (session, Err(e)),
        };

        let merged = match &persisted {
            Some(p) => self.merge(session, p),
            None => session,
        };
        if let Some(p) = persisted.as_ref().filter(|p| p.key == merged.key) {
            self.synced = Some(p.last_active_time);
        }

        if persisted.as_ref().is_some_and(|p| !merged.supersedes(p)) {
            return (merged, Ok(PersistOutcome::Unchanged));
        }

        let outcome = serde_json::to_string(&merged)
            .map_err(AgentError::from)
            .and_then(|json| {
                self.storage
                    .set(SESSION_STORAGE_KEY, &json)
                    .map_err(AgentError::from)
            })
            .map(|()| PersistOutcome::Written);
        if outcome.is_ok() {
            self.synced = Some(merged.last_active_time);
        }
        (merged, outcome)
    }

    /// Reconciles the cache with storage.
    ///
    /// A missing record means another instance ended the session, but only
    /// if the cached session ever reached storage. One that never did (storage
    /// was down when it started) is written back instead.
    fn sync(&mut self) {
        if self.refresh() != Refresh::Missing {
            return;
        }
        if self.synced.take().is_some() {
            self.session = None;
        } else if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to write back unpersisted session");
        }
    }

    /// Merges the persisted record into the cache.
    fn refresh(&mut self) -> Refresh {
        let (refresh, persisted) = self.read_stored();
        if let Some(persisted) = persisted {
            let merged = match self.session.take() {
                Some(cached) => self.merge(cached, &persisted),
                None => persisted.clone(),
            };
            if merged.key == persisted.key {
                self.synced = Some(persisted.last_active_time);
            }
            self.session = Some(merged);
        }
        refresh
    }

    /// [`Session::reconcile`], judging the cached session's expiry by the
    /// activity storage last held for it. Activity that only ever lived in
    /// this cache cannot keep alive a session another instance already ended.
    fn merge(&self, cached: Session, persisted: &Session) -> Session {
        let seen = self.synced.unwrap_or(cached.last_active_time);
        if cached.key != persisted.key
            && persisted.started_after_expiry_of(seen, self.session_length)
        {
            return persisted.clone();
        }
        cached.reconcile(persisted, self.session_length)
    }

    /// Reads storage, folding malformed records into "missing".
    fn read_stored(&self) -> (Refresh, Option<Session>) {
        match self.read_persisted() {
            Ok(Some(session)) => (Refresh::Found, Some(session)),
            Ok(None) => (Refresh::Missing, None),
            Err(e @ AgentError::MalformedRecord { .. }) => {
                warn!(error = %e, "Ignoring malformed session record");
                (Refresh::Missing, None)
            }
            Err(e) => {
                warn!(error = %e, "Session storage unreadable; using cached session");
                (Refresh::Unreadable, None)
            }
        }
    }

    fn read_persisted(&self) -> Result<Option<Session>> {
        let Some(raw) = self.storage.get(SESSION_STORAGE_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| AgentError::MalformedRecord {
                key: SESSION_STORAGE_KEY.to_string(),
                source,
            })
    }
}
