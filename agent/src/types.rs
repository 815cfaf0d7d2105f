//! Shared value types for the Sitepulse agent.
//!
//! This module defines the report vocabulary that crosses the evaluator
//! boundary ([`EventType`], [`PropertyValue`], [`Properties`]) and the signal
//! vocabulary the host feeds into the [`EventBus`](crate::bus::EventBus)
//! ([`SignalKind`], [`Signal`], [`SignalPayload`]).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Ordered property map attached to every report.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A scalar (or null) report property value.
///
/// Serializes untagged so a property map renders as a flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Returns the integer value, if this is an [`PropertyValue::Int`].
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a [`PropertyValue::Bool`].
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string value, if this is a [`PropertyValue::Text`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` for [`PropertyValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Built-in report names emitted by the trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.end")]
    SessionEnd,
    #[serde(rename = "session.ping")]
    SessionPing,
    #[serde(rename = "engagement")]
    Engagement,
    #[serde(rename = "page_view")]
    PageView,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "click")]
    Click,
}

impl EventType {
    /// Wire name of the report.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session.start",
            Self::SessionEnd => "session.end",
            Self::SessionPing => "session.ping",
            Self::Engagement => "engagement",
            Self::PageView => "page_view",
            Self::Error => "error",
            Self::Click => "click",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input and lifecycle signals a host can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    PointerDown,
    PointerMove,
    KeyDown,
    KeyPress,
    Scroll,
    TouchStart,
    Click,
    VisibilityChange,
    Load,
    Unload,
    BeforeUnload,
    Error,
    UnhandledRejection,
}

impl SignalKind {
    /// Signals that count as proof of a present user.
    pub const USER_ACTIVITY: [SignalKind; 7] = [
        SignalKind::PointerDown,
        SignalKind::PointerMove,
        SignalKind::KeyPress,
        SignalKind::KeyDown,
        SignalKind::Scroll,
        SignalKind::TouchStart,
        SignalKind::Click,
    ];

    /// Name the host uses for this signal.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PointerDown => "pointer-down",
            Self::PointerMove => "pointer-move",
            Self::KeyDown => "key-down",
            Self::KeyPress => "key-press",
            Self::Scroll => "scroll",
            Self::TouchStart => "touch-start",
            Self::Click => "click",
            Self::VisibilityChange => "visibility-change",
            Self::Load => "load",
            Self::Unload => "unload",
            Self::BeforeUnload => "before-unload",
            Self::Error => "error",
            Self::UnhandledRejection => "unhandled-rejection",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identifier of a clicked element, as produced by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of a runtime error or rejected promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorValue {
    /// A bare string was thrown.
    Message { message: String },
    /// A structured error object. Either field may be missing.
    Exception {
        message: Option<String>,
        stack: Option<String>,
    },
    /// Anything else (numbers, plain objects, `undefined`).
    Other,
}

/// Data carried by a [`Signal`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignalPayload {
    #[default]
    None,
    Click(ElementId),
    Error(ErrorValue),
}

/// A single signal delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub payload: SignalPayload,
}

impl Signal {
    /// Creates a signal with no payload.
    #[must_use]
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            payload: SignalPayload::None,
        }
    }

    /// Creates a `click` signal targeting `target`.
    #[must_use]
    pub fn click(target: ElementId) -> Self {
        Self {
            kind: SignalKind::Click,
            payload: SignalPayload::Click(target),
        }
    }

    /// Creates an `error` or `unhandled-rejection` signal.
    #[must_use]
    pub fn error(kind: SignalKind, value: ErrorValue) -> Self {
        Self {
            kind,
            payload: SignalPayload::Error(value),
        }
    }

    /// The click target, if this is a click signal.
    #[must_use]
    pub fn target(&self) -> Option<&ElementId> {
        match &self.payload {
            SignalPayload::Click(target) => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_to_wire_name() {
        let json = serde_json::to_string(&EventType::SessionPing).unwrap();
        assert_eq!(json, "\"session.ping\"");
        assert_eq!(EventType::PageView.to_string(), "page_view");
    }

    #[test]
    fn signal_kind_serde_matches_as_str() {
        for kind in SignalKind::USER_ACTIVITY {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        let parsed: SignalKind = serde_json::from_str("\"before-unload\"").unwrap();
        assert_eq!(parsed, SignalKind::BeforeUnload);
    }

    #[test]
    fn properties_render_as_flat_object() {
        let mut props = Properties::new();
        props.insert("click.rage".into(), true.into());
        props.insert("click.target".into(), "#buy".into());
        props.insert("error.stack".into(), PropertyValue::Null);
        props.insert("time.idle".into(), 60_000u64.into());

        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "click.rage": true,
                "click.target": "#buy",
                "error.stack": null,
                "time.idle": 60000
            })
        );
    }

    #[test]
    fn option_converts_to_null() {
        let value: PropertyValue = Option::<String>::None.into();
        assert!(value.is_null());
        let value: PropertyValue = Some("boom").into();
        assert_eq!(value.as_str(), Some("boom"));
    }

    #[test]
    fn oversized_u64_saturates() {
        let value: PropertyValue = u64::MAX.into();
        assert_eq!(value.as_i64(), Some(i64::MAX));
    }

    #[test]
    fn click_signal_exposes_target() {
        let signal = Signal::click(ElementId::new("button.buy"));
        assert_eq!(signal.kind, SignalKind::Click);
        assert_eq!(signal.target().map(ElementId::as_str), Some("button.buy"));
        assert!(Signal::new(SignalKind::Scroll).target().is_none());
    }
}
