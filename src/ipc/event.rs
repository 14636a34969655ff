//! Events carried by the bus.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag used to route events and key subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Request to shut the whole node down.
    ShutdownRequest,
    /// Plugin-defined traffic, keyed by topic.
    Custom(String),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::ShutdownRequest => write!(f, "shutdown_request"),
            EventKind::Custom(topic) => write!(f, "custom:{}", topic),
        }
    }
}

/// An immutable message delivered to every subscriber of its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    ShutdownRequest {
        /// Human-readable reason, if the requester gave one.
        reason: Option<String>,
    },
    Custom {
        topic: String,
        payload: serde_json::Value,
    },
}

impl Event {
    /// Build a shutdown request carrying `reason`.
    pub fn shutdown(reason: impl Into<String>) -> Self {
        Event::ShutdownRequest {
            reason: Some(reason.into()),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::ShutdownRequest { .. } => EventKind::ShutdownRequest,
            Event::Custom { topic, .. } => EventKind::Custom(topic.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_variant() {
        assert_eq!(Event::shutdown("test").kind(), EventKind::ShutdownRequest);

        let custom = Event::Custom {
            topic: "peers".into(),
            payload: serde_json::json!({ "count": 3 }),
        };
        assert_eq!(custom.kind(), EventKind::Custom("peers".into()));
    }

    #[test]
    fn test_shutdown_wire_shape() {
        let json = serde_json::to_value(Event::shutdown("test")).unwrap();
        assert_eq!(json["kind"], "shutdown_request");
        assert_eq!(json["reason"], "test");
    }
}
