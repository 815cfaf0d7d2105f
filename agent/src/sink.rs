//! Report sink capability: where tracker output goes.
//!
//! Every tracker ends in a single call, `track(event_type, properties)`,
//! which is fire-and-forget. The evaluator behind the sink may batch or
//! retry; trackers never observe the outcome.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::types::Properties;

/// Receives reports from the trackers.
pub trait ReportSink {
    fn track(&self, event_type: &str, properties: Properties);
}

/// One emitted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub event_type: String,
    pub properties: Properties,
}

/// Collects reports in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    reports: Rc<RefCell<Vec<Report>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports in emission order.
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.reports.borrow().clone()
    }

    /// Reports named `event_type`, in emission order.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<Report> {
        self.reports
            .borrow()
            .iter()
            .filter(|r| r.event_type == event_type)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.reports.borrow_mut().clear();
    }
}

impl ReportSink for MemorySink {
    fn track(&self, event_type: &str, properties: Properties) {
        self.reports.borrow_mut().push(Report {
            event_type: event_type.to_string(),
            properties,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_filters_by_type() {
        let sink = MemorySink::new();
        let shared = sink.clone();

        sink.track("click", Properties::new());
        sink.track("error", Properties::new());
        sink.track("click", Properties::new());

        assert_eq!(shared.len(), 3);
        assert_eq!(shared.of_type("click").len(), 2);

        shared.clear();
        assert!(sink.is_empty());
    }
}
