//! Events delivered to a run subscriber.
//!
//! A subscriber sees one `status: init` event, then any interleaving of
//! dataset events and the remaining status transitions. Each dataset
//! event carries the aggregation of one output file: records joined by
//! the dataset's terminator sentinel.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::RunStatus;

/// SSE event name used for lifecycle transitions.
pub const STATUS_EVENT: &str = "status";

/// A named event on a run's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum StreamEvent {
    /// Lifecycle transition.
    Status(RunStatus),
    /// Aggregated records of one output file.
    Dataset {
        /// Event name, e.g. `agents` or `flood`.
        name: String,
        /// Concatenated records.
        payload: String,
    },
}

impl StreamEvent {
    /// The event name as seen by the transport.
    pub fn name(&self) -> &str {
        match self {
            Self::Status(_) => STATUS_EVENT,
            Self::Dataset { name, .. } => name,
        }
    }

    /// The event body as seen by the transport.
    pub fn data(&self) -> &str {
        match self {
            Self::Status(status) => status.as_str(),
            Self::Dataset { payload, .. } => payload,
        }
    }

    /// The status carried by this event, if it is a status event.
    pub const fn status(&self) -> Option<RunStatus> {
        match self {
            Self::Status(status) => Some(*status),
            Self::Dataset { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_wire_form() {
        let event = StreamEvent::Status(RunStatus::Ready);
        assert_eq!(event.name(), "status");
        assert_eq!(event.data(), "ready");
        assert_eq!(event.status(), Some(RunStatus::Ready));
    }

    #[test]
    fn dataset_event_wire_form() {
        let event = StreamEvent::Dataset {
            name: String::from("agents"),
            payload: String::from("1.0,2.0,1$"),
        };
        assert_eq!(event.name(), "agents");
        assert_eq!(event.data(), "1.0,2.0,1$");
        assert_eq!(event.status(), None);
    }
}
