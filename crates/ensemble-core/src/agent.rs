use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::ContextVariables;
use crate::errors::AgentError;
use crate::messages::Message;
use crate::tools::ToolCallRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub can_generate: bool,
    pub can_call_tools: bool,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            can_generate: true,
            can_call_tools: true,
        }
    }
}

/// Pure data describing a team member. Holds no connection, history, or tools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    /// Declaration order within the team. Assigned by the team builder.
    #[serde(default)]
    pub order: usize,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            instructions: String::new(),
            capabilities: AgentCapabilities::default(),
            order: 0,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// One item of an agent's streamed turn.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerateChunk {
    Content(String),
    ToolCallRequest(ToolCallRequest),
    Done,
}

pub type GenerateStream = Pin<Box<dyn Stream<Item = Result<GenerateChunk, AgentError>> + Send>>;

/// Stateless generate capability. The orchestrator passes in everything the
/// agent may read; the agent keeps nothing between calls.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn generate(
        &self,
        agent: &AgentDescriptor,
        history: &[Message],
        context: &ContextVariables,
    ) -> Result<GenerateStream, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_allow_everything() {
        let d = AgentDescriptor::new("writer", "drafts the report");
        assert!(d.capabilities.can_generate);
        assert!(d.capabilities.can_call_tools);
        assert_eq!(d.order, 0);
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let d: AgentDescriptor =
            serde_json::from_value(serde_json::json!({"name": "reviewer", "role": "checks"})).unwrap();
        assert_eq!(d.name, "reviewer");
        assert!(d.instructions.is_empty());
        assert!(d.capabilities.can_generate);
    }

    #[test]
    fn builder_methods() {
        let d = AgentDescriptor::new("router", "routes")
            .with_instructions("hand off quickly")
            .with_capabilities(AgentCapabilities {
                can_generate: true,
                can_call_tools: false,
            });
        assert_eq!(d.instructions, "hand off quickly");
        assert!(!d.capabilities.can_call_tools);
    }
}
