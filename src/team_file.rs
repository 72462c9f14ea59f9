//! Team description files for `ensemble run`.
//!
//! ```json
//! {
//!   "initial": "researcher",
//!   "agents": [
//!     {"name": "researcher", "role": "finds sources",
//!      "turns": [{"text": "Research complete", "toolCalls": [{"name": "note", "arguments": {"key": "k", "value": "v"}}]}]},
//!     {"name": "writer", "role": "drafts", "turns": [{"text": "Done.", "complete": true}]}
//!   ],
//!   "rules": [{"phrase": "research complete", "to": "writer"}]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use ensemble_core::agent::{AgentCapabilities, AgentDescriptor};
use ensemble_core::errors::AgentError;
use ensemble_core::tools::ToolCallRequest;
use ensemble_engine::handoff::{COMPLETE_DIRECTIVE, TRANSFER_DIRECTIVE};
use ensemble_engine::mock::{ScriptedAgent, ScriptedTurn};
use ensemble_engine::{HandoffRouter, HandoffRule, Team};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamFile {
    #[serde(default)]
    pub initial: Option<String>,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    /// Replaces the default completion patterns when non-empty.
    #[serde(default)]
    pub completion_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub turns: Vec<TurnSpec>,
    /// Keep serving the last turn once the script runs out.
    #[serde(default)]
    pub repeat_last: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSpec {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallSpec>,
    #[serde(default)]
    pub transfer_to: Option<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// Fail this generate call with a transient backend error.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallSpec {
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub phrase: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    pub to: String,
}

impl TeamFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read team file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid team file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn build_team(&self) -> Result<Team> {
        let mut builder = Team::builder();
        for agent in &self.agents {
            let descriptor = AgentDescriptor::new(&agent.name, &agent.role)
                .with_instructions(&agent.instructions)
                .with_capabilities(agent.capabilities);
            builder = builder.member(descriptor, Arc::new(agent.scripted_agent()));
        }
        if let Some(initial) = &self.initial {
            builder = builder.initial(initial);
        }
        Ok(builder.build()?)
    }

    pub fn build_router(&self) -> Result<HandoffRouter> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for (i, rule) in self.rules.iter().enumerate() {
            let built = match (&rule.phrase, &rule.pattern) {
                (Some(phrase), None) => HandoffRule::phrase(phrase, &rule.to),
                (None, Some(pattern)) => HandoffRule::regex(pattern, &rule.to),
                _ => bail!("rule {i}: exactly one of `phrase` or `pattern` is required"),
            };
            rules.push(built.with_context(|| format!("rule {i}: invalid pattern"))?);
        }

        let router = HandoffRouter::new(rules);
        if self.completion_patterns.is_empty() {
            return Ok(router);
        }
        let patterns: Vec<&str> = self.completion_patterns.iter().map(String::as_str).collect();
        router
            .with_completion_patterns(&patterns)
            .context("invalid completion pattern")
    }
}

impl AgentSpec {
    fn scripted_agent(&self) -> ScriptedAgent {
        let turns: Vec<ScriptedTurn> = self.turns.iter().map(TurnSpec::to_turn).collect();
        let fallback = if self.repeat_last { turns.last().cloned() } else { None };
        let agent = ScriptedAgent::new(turns);
        match fallback {
            Some(turn) => agent.with_fallback(turn),
            None => agent,
        }
    }
}

impl TurnSpec {
    fn to_turn(&self) -> ScriptedTurn {
        let turn = match &self.error {
            Some(message) => ScriptedTurn::Error(AgentError::Backend(message.clone())),
            None => {
                let mut calls: Vec<ToolCallRequest> = self
                    .tool_calls
                    .iter()
                    .map(|c| ToolCallRequest::new(&c.name, c.arguments.clone()))
                    .collect();
                if let Some(to) = &self.transfer_to {
                    calls.push(ToolCallRequest::new(TRANSFER_DIRECTIVE, json!({ "agent": to })));
                }
                if self.complete {
                    calls.push(ToolCallRequest::new(COMPLETE_DIRECTIVE, json!({})));
                }
                ScriptedTurn::with_tools(&self.text, calls)
            }
        };
        match self.delay_ms {
            Some(ms) => ScriptedTurn::delayed(Duration::from_millis(ms), turn),
            None => turn,
        }
    }
}
