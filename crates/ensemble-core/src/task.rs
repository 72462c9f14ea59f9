use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Lifecycle of a task record.
///
/// ```text
/// Created ──► Running ◄──► WaitingInput
///    │           │               │
///    └───────────┴──► Completed  │
///    └───────────┴──► Failed ◄───┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    WaitingInput,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the task state machine.
    /// Re-entering the same non-terminal status is allowed (touch).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (a, b) if a == b => true,
            (Created, Running | Failed) => true,
            (Running, WaitingInput | Completed | Failed) => true,
            (WaitingInput, Running | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "waiting_input" => Ok(Self::WaitingInput),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Why a task ended in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MaxRoundsExceeded,
    Cancelled,
    AgentGeneration,
    Persistence,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxRoundsExceeded => "max_rounds_exceeded",
            Self::Cancelled => "cancelled",
            Self::AgentGeneration => "agent_generation",
            Self::Persistence => "persistence",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_rounds_exceeded" => Ok(Self::MaxRoundsExceeded),
            "cancelled" => Ok(Self::Cancelled),
            "agent_generation" => Ok(Self::AgentGeneration),
            "persistence" => Ok(Self::Persistence),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// Durable task record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub config: serde_json::Value,
    pub round: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl Task {
    pub fn new(
        description: impl Into<String>,
        config: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            description: description.into(),
            status: TaskStatus::Created,
            config,
            round: 0,
            metadata,
            created_at: now,
            updated_at: now,
            result: None,
            error_message: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
