//! The boundary to the feature-flag evaluator.
//!
//! An [`Evaluator`] knows nothing about trackers. It records events for a
//! `(key, traffic type)` pair and evaluates flags for a key.
//! [`EvaluatorWrapper`] sits in front of it and holds what the agent adds:
//!
//! - **identities**: one key per traffic type (`session`, `device`, or any
//!   the host adds). Every report is fanned out to every identity.
//! - **default properties**: context the agent gathers itself.
//! - **private properties**: values the host attaches to every report.
//!
//! Properties merge as default < private < call-site; later layers win on
//! key collisions.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sink::ReportSink;
use crate::types::{Properties, PropertyValue};

/// Treatment returned when a flag cannot be evaluated.
pub const CONTROL_TREATMENT: &str = "control";

/// Traffic type to key.
pub type Identities = BTreeMap<String, String>;

/// A feature-flag evaluator that also accepts events.
pub trait Evaluator {
    /// Records `event_type` for `key` under `traffic_type`.
    fn track(&self, key: &str, traffic_type: &str, event_type: &str, properties: &Properties);

    /// Evaluates `flag` for `key`.
    fn treatment(&self, key: &str, flag: &str, attributes: &Properties) -> String;

    /// Traffic type `flag` is defined for, or `None` for unknown flags.
    fn traffic_type(&self, flag: &str) -> Option<String>;
}

/// One event as it crossed the evaluator boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEvent {
    pub key: String,
    pub traffic_type: String,
    pub event_type: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FlagDefinition {
    traffic_type: String,
    treatment: String,
}

/// In-memory evaluator: records every event and serves fixed treatments.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingEvaluator {
    events: Rc<RefCell<Vec<TrackedEvent>>>,
    flags: Rc<RefCell<BTreeMap<String, FlagDefinition>>>,
}

impl RecordingEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `flag` for `traffic_type`, always evaluating to `treatment`.
    pub fn define_flag(&self, flag: &str, traffic_type: &str, treatment: &str) {
        self.flags.borrow_mut().insert(
            flag.to_string(),
            FlagDefinition {
                traffic_type: traffic_type.to_string(),
                treatment: treatment.to_string(),
            },
        );
    }

    #[must_use]
    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.borrow().clone()
    }

    /// Events named `event_type` recorded for `traffic_type`.
    #[must_use]
    pub fn events_for(&self, traffic_type: &str, event_type: &str) -> Vec<TrackedEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.traffic_type == traffic_type && e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl Evaluator for RecordingEvaluator {
    fn track(&self, key: &str, traffic_type: &str, event_type: &str, properties: &Properties) {
        self.events.borrow_mut().push(TrackedEvent {
            key: key.to_string(),
            traffic_type: traffic_type.to_string(),
            event_type: event_type.to_string(),
            properties: properties.clone(),
        });
    }

    fn treatment(&self, _key: &str, flag: &str, _attributes: &Properties) -> String {
        self.flags
            .borrow()
            .get(flag)
            .map_or_else(|| CONTROL_TREATMENT.to_string(), |f| f.treatment.clone())
    }

    fn traffic_type(&self, flag: &str) -> Option<String> {
        self.flags.borrow().get(flag).map(|f| f.traffic_type.clone())
    }
}

/// Identities and property layers in front of an [`Evaluator`].
pub struct EvaluatorWrapper {
    evaluator: Rc<dyn Evaluator>,
    identities: RefCell<Identities>,
    default_properties: RefCell<Properties>,
    private_properties: RefCell<Properties>,
}

impl std::fmt::Debug for EvaluatorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorWrapper")
            .field("identities", &self.identities.borrow())
            .field("default_properties", &self.default_properties.borrow().len())
            .field("private_properties", &self.private_properties.borrow().len())
            .finish_non_exhaustive()
    }
}

impl EvaluatorWrapper {
    pub fn new(evaluator: Rc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            identities: RefCell::new(Identities::new()),
            default_properties: RefCell::new(Properties::new()),
            private_properties: RefCell::new(Properties::new()),
        }
    }

    // =========================================================================
    // Identities
    // =========================================================================

    #[must_use]
    pub fn identities(&self) -> Identities {
        self.identities.borrow().clone()
    }

    /// Replaces every identity.
    pub fn set_identities(&self, identities: Identities) {
        *self.identities.borrow_mut() = identities;
    }

    /// Adds or replaces the given identities, keeping the others.
    pub fn add_identities(&self, identities: Identities) {
        self.identities.borrow_mut().extend(identities);
    }

    pub fn add_identity(&self, traffic_type: &str, key: &str) {
        let mut identities = self.identities.borrow_mut();
        if identities.get(traffic_type).map(String::as_str) != Some(key) {
            debug!(traffic_type, key, "Identity set");
            identities.insert(traffic_type.to_string(), key.to_string());
        }
    }

    /// Removes the identity for `traffic_type`. Returns the removed key.
    pub fn remove_identity(&self, traffic_type: &str) -> Option<String> {
        self.identities.borrow_mut().remove(traffic_type)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn set_default_properties(&self, properties: Properties) {
        *self.default_properties.borrow_mut() = properties;
    }

    #[must_use]
    pub fn private_properties(&self) -> Properties {
        self.private_properties.borrow().clone()
    }

    /// Replaces every private property.
    pub fn set_properties(&self, properties: Properties) {
        *self.private_properties.borrow_mut() = properties;
    }

    pub fn add_property(&self, key: &str, value: PropertyValue) {
        self.private_properties
            .borrow_mut()
            .insert(key.to_string(), value);
    }

    /// Default, then private, then `properties` on top.
    #[must_use]
    pub fn merged_properties(&self, properties: Properties) -> Properties {
        let mut merged = self.default_properties.borrow().clone();
        merged.extend(self.private_properties.borrow().clone());
        merged.extend(properties);
        merged
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluates `flag` for the identity of the flag's traffic type.
    ///
    /// Returns [`CONTROL_TREATMENT`] for unknown flags and for flags whose
    /// traffic type has no identity.
    pub fn treatment(&self, flag: &str, attributes: Properties) -> String {
        let key = self
            .evaluator
            .traffic_type(flag)
            .and_then(|traffic_type| self.identities.borrow().get(&traffic_type).cloned());

        match key {
            Some(key) => {
                let attributes = self.merged_properties(attributes);
                self.evaluator.treatment(&key, flag, &attributes)
            }
            None => {
                debug!(flag, "No identity for flag; serving control");
                CONTROL_TREATMENT.to_string()
            }
        }
    }

    /// Sends `event_type` once per identity with merged properties.
    pub fn track(&self, event_type: &str, properties: Properties) {
        let merged = self.merged_properties(properties);
        let identities = self.identities();
        info!(event = event_type, identities = identities.len(), "Tracking");

        for (traffic_type, key) in &identities {
            self.evaluator.track(key, traffic_type, event_type, &merged);
        }
    }
}

impl ReportSink for EvaluatorWrapper {
    fn track(&self, event_type: &str, properties: Properties) {
        EvaluatorWrapper::track(self, event_type, properties);
    }
}
