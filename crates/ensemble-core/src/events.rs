use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, StepId, TaskId};
use crate::task::TaskStatus;

/// Lifecycle events published to observers during task execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "task_created")]
    TaskCreated { task_id: TaskId, description: String },

    #[serde(rename = "task_status_changed")]
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[serde(rename = "task_start")]
    TaskStart {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
        initial_prompt: String,
    },

    #[serde(rename = "agent_start")]
    AgentStart { agent_name: String, step_id: StepId },

    #[serde(rename = "handoff")]
    Handoff {
        from_agent: String,
        to_agent: String,
        round: u32,
    },

    #[serde(rename = "tool_calls_start")]
    ToolCallsStart { count: usize },

    #[serde(rename = "tool_result")]
    ToolResult {
        name: String,
        success: bool,
        content: String,
    },

    #[serde(rename = "task_complete")]
    TaskComplete {
        task_id: TaskId,
        final_status: TaskStatus,
        total_steps: u32,
        duration_ms: u64,
        artifacts: Vec<String>,
    },

    #[serde(rename = "task_failed")]
    TaskFailed { task_id: TaskId, reason: String },
}

/// Payload-free event tag, used for subscription filters and statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskStatusChanged,
    TaskStart,
    AgentStart,
    Handoff,
    ToolCallsStart,
    ToolResult,
    TaskComplete,
    TaskFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskStatusChanged => "task_status_changed",
            Self::TaskStart => "task_start",
            Self::AgentStart => "agent_start",
            Self::Handoff => "handoff",
            Self::ToolCallsStart => "tool_calls_start",
            Self::ToolResult => "tool_result",
            Self::TaskComplete => "task_complete",
            Self::TaskFailed => "task_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskCreated { .. } => EventType::TaskCreated,
            Self::TaskStatusChanged { .. } => EventType::TaskStatusChanged,
            Self::TaskStart { .. } => EventType::TaskStart,
            Self::AgentStart { .. } => EventType::AgentStart,
            Self::Handoff { .. } => EventType::Handoff,
            Self::ToolCallsStart { .. } => EventType::ToolCallsStart,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::TaskComplete { .. } => EventType::TaskComplete,
            Self::TaskFailed { .. } => EventType::TaskFailed,
        }
    }

    /// The task this event belongs to, when the payload names one.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskStatusChanged { task_id, .. }
            | Self::TaskStart { task_id, .. }
            | Self::TaskComplete { task_id, .. }
            | Self::TaskFailed { task_id, .. } => Some(task_id),
            Self::AgentStart { .. }
            | Self::Handoff { .. }
            | Self::ToolCallsStart { .. }
            | Self::ToolResult { .. } => None,
        }
    }
}

/// A published event. Immutable once the bus has stamped `id` and `timestamp`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}
