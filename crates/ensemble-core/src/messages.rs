use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::tools::ToolCallRequest;

/// Conversation history entry. The orchestrator owns the history; agents only
/// ever see it as a borrowed slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultMessage),
    /// Marker appended when control passes between agents.
    #[serde(rename = "transition")]
    Transition(TransitionMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub agent: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionMessage {
    pub from_agent: String,
    pub to_agent: String,
    pub round: u32,
}

// --- Convenience constructors ---

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: content.into(),
        })
    }

    pub fn assistant(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage {
            agent: agent.into(),
            content: content.into(),
            tool_calls: Vec::new(),
        })
    }

    pub fn tool_result(
        tool_call_id: ToolCallId,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id,
            name: name.into(),
            content: content.into(),
            is_error,
        })
    }

    pub fn transition(from_agent: impl Into<String>, to_agent: impl Into<String>, round: u32) -> Self {
        Message::Transition(TransitionMessage {
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            round,
        })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "tool_result",
            Self::Transition(_) => "transition",
        }
    }
}

impl AssistantMessage {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
