//! Uncaught errors and unhandled rejections.

use std::rc::Rc;

use crate::bus::EventBus;
use crate::sink::ReportSink;
use crate::types::{ErrorValue, EventType, Properties, SignalKind, SignalPayload};

#[derive(Clone)]
pub struct ErrorTracker {
    sink: Rc<dyn ReportSink>,
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker").finish_non_exhaustive()
    }
}

impl ErrorTracker {
    pub fn new(sink: Rc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    /// Reports every `error` signal and the reason of every
    /// `unhandled-rejection` signal.
    pub fn register(tracker: &Rc<Self>, bus: &EventBus) {
        for kind in [SignalKind::Error, SignalKind::UnhandledRejection] {
            let t = Rc::clone(tracker);
            bus.add_event_listener(
                kind,
                move |signal| {
                    let value = match &signal.payload {
                        SignalPayload::Error(value) => Some(value),
                        _ => None,
                    };
                    t.track_error(value);
                    Ok(())
                },
                true,
            );
        }
    }

    pub fn track_error(&self, error: Option<&ErrorValue>) {
        self.sink
            .track(EventType::Error.as_str(), error_properties(error));
    }
}

/// `error.message` and `error.stack` for a thrown value.
///
/// A bare string only carries a message. A structured error carries both,
/// with missing fields reported as null. Anything else yields no properties.
#[must_use]
pub fn error_properties(error: Option<&ErrorValue>) -> Properties {
    let mut properties = Properties::new();
    match error {
        Some(ErrorValue::Message { message }) => {
            properties.insert("error.message".to_string(), message.as_str().into());
        }
        Some(ErrorValue::Exception { message, stack }) => {
            properties.insert("error.message".to_string(), message.clone().into());
            properties.insert("error.stack".to_string(), stack.clone().into());
        }
        Some(ErrorValue::Other) | None => {}
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingSource;
    use crate::sink::MemorySink;
    use crate::types::Signal;
    use std::time::Duration;

    fn wired() -> (EventBus, MemorySink) {
        let sink = MemorySink::new();
        let bus = EventBus::new(Rc::new(RecordingSource::new()), Duration::from_secs(30));
        let tracker = Rc::new(ErrorTracker::new(Rc::new(sink.clone())));
        ErrorTracker::register(&tracker, &bus);
        (bus, sink)
    }

    #[test]
    fn string_error_has_message_only() {
        let props = error_properties(Some(&ErrorValue::Message {
            message: "boom".to_string(),
        }));

        assert_eq!(props.len(), 1);
        assert_eq!(props["error.message"].as_str(), Some("boom"));
    }

    #[test]
    fn exception_reports_missing_fields_as_null() {
        let props = error_properties(Some(&ErrorValue::Exception {
            message: Some("bad index".to_string()),
            stack: None,
        }));

        assert_eq!(props["error.message"].as_str(), Some("bad index"));
        assert!(props["error.stack"].is_null());
    }

    #[test]
    fn other_values_yield_empty_properties() {
        assert!(error_properties(Some(&ErrorValue::Other)).is_empty());
        assert!(error_properties(None).is_empty());
    }

    #[test]
    fn error_signal_is_reported() {
        let (bus, sink) = wired();

        bus.dispatch(&Signal::error(
            SignalKind::Error,
            ErrorValue::Exception {
                message: Some("x is undefined".to_string()),
                stack: Some("at main.js:1".to_string()),
            },
        ));

        let reports = sink.of_type("error");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].properties["error.stack"].as_str(), Some("at main.js:1"));
    }

    #[test]
    fn rejection_reports_its_reason() {
        let (bus, sink) = wired();

        bus.dispatch(&Signal::error(
            SignalKind::UnhandledRejection,
            ErrorValue::Message {
                message: "timeout".to_string(),
            },
        ));
        bus.dispatch(&Signal::new(SignalKind::UnhandledRejection));

        let reports = sink.of_type("error");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].properties["error.message"].as_str(), Some("timeout"));
        assert!(reports[1].properties.is_empty());
    }
}
