//! Event types for the run event log.
//!
//! Every observable thing a run does is recorded as an immutable event in an
//! append-only, per-run log. Sequence numbers start at 1 and are gapless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;

/// A single event in a run's append-only log.
///
/// The on-disk and wire form flattens the kind into `kind` / `payload` keys:
/// `{"run_id": "...", "seq": 1, "timestamp": "...", "kind": "token", "payload": {"text": "4"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The run this event belongs to
    pub run_id: Uuid,

    /// Position in the run's log (1-based, gapless)
    pub seq: u64,

    /// When the event was appended
    pub timestamp: DateTime<Utc>,

    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(run_id: Uuid, seq: u64, kind: EventKind) -> Self {
        Self {
            run_id,
            seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Check if this event ends the run
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Kinds of events a run can produce, with their payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental text fragment
    Token { text: String },

    /// A tool invocation began
    ToolStart {
        tool: String,
        input: serde_json::Value,
    },

    /// A tool invocation returned
    ToolEnd {
        tool: String,
        output: serde_json::Value,
    },

    /// Successful terminal result
    Final {
        text: String,
        #[serde(default)]
        artifacts: Vec<ArtifactRef>,
    },

    /// Terminal failure
    Error { message: String },
}

impl EventKind {
    /// `final` and `error` end a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    /// Wire name of the kind (SSE event name)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
        }
    }

    /// The payload alone, as sent in SSE `data` lines
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Token { text } => serde_json::json!({ "text": text }),
            Self::ToolStart { tool, input } => serde_json::json!({ "tool": tool, "input": input }),
            Self::ToolEnd { tool, output } => serde_json::json!({ "tool": tool, "output": output }),
            Self::Final { text, artifacts } => {
                serde_json::json!({ "text": text, "artifacts": artifacts })
            }
            Self::Error { message } => serde_json::json!({ "message": message }),
        }
    }

    pub fn token(text: impl Into<String>) -> Self {
        Self::Token { text: text.into() }
    }

    pub fn final_result(text: impl Into<String>, artifacts: Vec<ArtifactRef>) -> Self {
        Self::Final {
            text: text.into(),
            artifacts,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let run_id = Uuid::new_v4();
        let event = Event::new(run_id, 1, EventKind::token("4"));

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 1);
        assert_eq!(json["kind"], "token");
        assert_eq!(json["payload"]["text"], "4");
        assert_eq!(json["run_id"], run_id.to_string());

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::final_result("done", vec![]).is_terminal());
        assert!(EventKind::error("boom").is_terminal());
        assert!(!EventKind::token("x").is_terminal());
        assert!(!EventKind::ToolStart {
            tool: "search".to_string(),
            input: serde_json::json!("q"),
        }
        .is_terminal());
    }

    #[test]
    fn test_final_without_artifacts_parses() {
        let line = format!(
            r#"{{"run_id":"{}","seq":2,"timestamp":"2024-01-01T00:00:00Z","kind":"final","payload":{{"text":"4"}}}}"#,
            Uuid::new_v4()
        );
        let event: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(event.kind, EventKind::final_result("4", vec![]));
    }

    #[test]
    fn test_payload_matches_serialized_payload() {
        let kind = EventKind::ToolEnd {
            tool: "calc".to_string(),
            output: serde_json::json!({"value": 4}),
        };
        let event = Event::new(Uuid::new_v4(), 3, kind.clone());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"], kind.payload());
        assert_eq!(kind.name(), "tool_end");
    }
}
