// ABOUTME: Typed agent events decoded from event frames
// ABOUTME: Known discriminators map to variants, anything else is preserved as Unknown

use crate::frame::EventFrame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const CONVERSATION_STARTED: &str = "conversation_started";
pub const MESSAGE: &str = "message";
pub const TOOL_CALL: &str = "tool_call";
pub const TOOL_RESULT: &str = "tool_result";
pub const STATUS: &str = "status";
pub const DONE: &str = "done";
/// Upstream fault discriminator
pub const ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, alias = "input")]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "result")]
    pub output: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    ConversationStarted {
        conversation_id: String,
    },
    Message {
        role: Option<String>,
        content: String,
    },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Status {
        message: String,
    },
    Done,
    Error {
        message: String,
    },
    /// A discriminator this client does not know, or a known one whose payload did not fit
    Unknown {
        kind: String,
        payload: Value,
    },
}

#[derive(Deserialize)]
struct ConversationPayload {
    conversation_id: String,
}

#[derive(Deserialize)]
struct MessagePayload {
    #[serde(default)]
    role: Option<String>,
    #[serde(alias = "text")]
    content: String,
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(alias = "status")]
    message: String,
}

impl AgentEvent {
    pub fn from_frame(frame: EventFrame) -> Self {
        let EventFrame { kind, payload, .. } = frame;
        let parsed = match kind.as_str() {
            CONVERSATION_STARTED => Some(
                serde_json::from_value::<ConversationPayload>(payload.clone()).map(|p| {
                    Self::ConversationStarted {
                        conversation_id: p.conversation_id,
                    }
                }),
            ),
            MESSAGE => Some(
                serde_json::from_value::<MessagePayload>(payload.clone()).map(|p| Self::Message {
                    role: p.role,
                    content: p.content,
                }),
            ),
            TOOL_CALL => Some(serde_json::from_value::<ToolCall>(payload.clone()).map(Self::ToolCall)),
            TOOL_RESULT => Some(
                serde_json::from_value::<ToolResult>(payload.clone()).map(Self::ToolResult),
            ),
            STATUS => Some(
                serde_json::from_value::<StatusPayload>(payload.clone())
                    .map(|p| Self::Status { message: p.message }),
            ),
            DONE => Some(Ok(Self::Done)),
            ERROR => Some(Ok(Self::Error {
                message: error_message(&payload),
            })),
            _ => None,
        };
        let Some(parsed) = parsed else {
            return Self::Unknown { kind, payload };
        };

        match parsed {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = %kind, "Event payload did not match its type: {}", e);
                Self::Unknown { kind, payload }
            }
        }
    }

    /// Wire discriminator for this event
    pub fn kind(&self) -> &str {
        match self {
            Self::ConversationStarted { .. } => CONVERSATION_STARTED,
            Self::Message { .. } => MESSAGE,
            Self::ToolCall(_) => TOOL_CALL,
            Self::ToolResult(_) => TOOL_RESULT,
            Self::Status { .. } => STATUS,
            Self::Done => DONE,
            Self::Error { .. } => ERROR,
            Self::Unknown { kind, .. } => kind,
        }
    }
}

fn error_message(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        Value::Null => "Unknown upstream error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(kind: &str, payload: Value) -> AgentEvent {
        AgentEvent::from_frame(EventFrame::new(kind, payload))
    }

    #[test]
    fn test_known_kinds() {
        assert_eq!(
            event("conversation_started", json!({"conversation_id": "c1"})),
            AgentEvent::ConversationStarted {
                conversation_id: "c1".into()
            }
        );
        assert_eq!(
            event("message", json!({"role": "assistant", "text": "hi"})),
            AgentEvent::Message {
                role: Some("assistant".into()),
                content: "hi".into()
            }
        );
        assert_eq!(
            event("tool_call", json!({"name": "ls", "input": {"path": "."}})),
            AgentEvent::ToolCall(ToolCall {
                id: None,
                name: "ls".into(),
                arguments: json!({"path": "."})
            })
        );
        assert_eq!(event("done", Value::Null), AgentEvent::Done);
    }

    #[test]
    fn test_error_message_sources() {
        assert_eq!(
            event("error", json!({"message": "boom"})),
            AgentEvent::Error { message: "boom".into() }
        );
        assert_eq!(
            event("error", json!({"error": "quota"})),
            AgentEvent::Error { message: "quota".into() }
        );
        assert_eq!(
            event("error", json!("plain")),
            AgentEvent::Error { message: "plain".into() }
        );
    }

    #[test]
    fn test_unknown_and_mismatched_payloads_are_preserved() {
        let unknown = event("plan_updated", json!({"steps": 3}));
        assert_eq!(unknown.kind(), "plan_updated");
        assert_eq!(
            unknown,
            AgentEvent::Unknown {
                kind: "plan_updated".into(),
                payload: json!({"steps": 3})
            }
        );

        let mismatched = event("message", json!({"role": "user"}));
        assert!(matches!(mismatched, AgentEvent::Unknown { ref kind, .. } if kind == "message"));
    }
}
