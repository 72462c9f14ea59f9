//! Built-in tools available to scripted teams.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use ensemble_core::tools::{Tool, ToolContext, ToolError, ToolOutput};
use ensemble_engine::{ToolRegistry, ToolSource};

/// Returns its `text` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text back to the caller"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to repeat"}
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let text = args["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("text must be a string".into()))?;
        Ok(ToolOutput::text(text))
    }
}

/// Records a key/value note in the task's shared context.
pub struct NoteTool;

#[async_trait]
impl Tool for NoteTool {
    fn name(&self) -> &str {
        "note"
    }

    fn description(&self) -> &str {
        "Store a note in the shared task context so later agents can read it"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "minLength": 1},
                "value": {"type": "string"}
            },
            "required": ["key", "value"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let key = args["key"].as_str().unwrap_or_default();
        let value = args["value"].as_str().unwrap_or_default();
        if key.is_empty() {
            return Err(ToolError::InvalidArguments("key must not be empty".into()));
        }

        let verb = if ctx.context.get(key).is_some() { "updated" } else { "noted" };
        Ok(ToolOutput::text(format!("{verb} {key}"))
            .with_update(key, value)
            .with_artifact(format!("note:{key}")))
    }
}

pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool), ToolSource::BuiltIn);
    registry.register(Arc::new(NoteTool), ToolSource::BuiltIn);
    registry
}
