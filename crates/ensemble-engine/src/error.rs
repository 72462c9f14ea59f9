use std::time::Duration;

use ensemble_core::errors::AgentError;
use ensemble_core::ids::TaskId;
use ensemble_core::task::{FailureKind, TaskStatus};
use ensemble_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("agent generation failed: {0}")]
    AgentGeneration(#[from] AgentError),

    #[error("max rounds exceeded: {0}")]
    MaxRoundsExceeded(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("team error: {0}")]
    Team(String),

    #[error("run timeout after {0:?}")]
    RunTimeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Failure kind recorded on the task when this error ends a run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::AgentGeneration(_) => FailureKind::AgentGeneration,
            Self::MaxRoundsExceeded(_) => FailureKind::MaxRoundsExceeded,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Persistence(_) => FailureKind::Persistence,
            Self::InvalidTransition { .. }
            | Self::TaskNotFound(_)
            | Self::Team(_)
            | Self::RunTimeout(_)
            | Self::InvalidConfig(_)
            | Self::Internal(_) => FailureKind::Internal,
        }
    }
}
