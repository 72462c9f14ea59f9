use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Caller-facing streaming chunk. Serialized as `{"type": ..., ...fields}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Content {
        agent: String,
        text: String,
    },
    ToolCall {
        agent: String,
        id: ToolCallId,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        id: ToolCallId,
        name: String,
        success: bool,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RoutingDecision {
        round: u32,
        from_agent: String,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_agent: Option<String>,
        method: String,
    },
    Error {
        kind: String,
        message: String,
    },
    Warning {
        message: String,
    },
}

impl StreamChunk {
    pub fn chunk_type(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::RoutingDecision { .. } => "routing_decision",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_type_tag() {
        let chunk = StreamChunk::Content {
            agent: "writer".into(),
            text: "Hello".into(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["text"], "Hello");
        assert_eq!(json["type"], chunk.chunk_type());
    }

    #[test]
    fn routing_decision_omits_missing_destination() {
        let chunk = StreamChunk::RoutingDecision {
            round: 1,
            from_agent: "writer".into(),
            action: "continue".into(),
            to_agent: None,
            method: "none".into(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "routing_decision");
        assert!(json.get("to_agent").is_none());
    }

    #[test]
    fn error_chunk() {
        let chunk = StreamChunk::Error {
            kind: "max_rounds_exceeded".into(),
            message: "max rounds exceeded: 3".into(),
        };
        assert!(chunk.is_error());
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"type\":\"error\""));
    }
}
