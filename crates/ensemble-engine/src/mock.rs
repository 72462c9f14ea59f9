use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use ensemble_core::agent::{Agent, AgentDescriptor, GenerateChunk, GenerateStream};
use ensemble_core::context::ContextVariables;
use ensemble_core::errors::AgentError;
use ensemble_core::messages::Message;
use ensemble_core::tools::ToolCallRequest;

use crate::handoff::{COMPLETE_DIRECTIVE, TRANSFER_DIRECTIVE};

/// One pre-programmed generate call.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Yield these chunks, then `Done`.
    Chunks(Vec<GenerateChunk>),
    /// Yield these chunks, then fail mid-stream.
    FailAfter(Vec<GenerateChunk>, AgentError),
    /// Fail the generate call itself.
    Error(AgentError),
    /// Wait, then resolve the inner turn.
    Delay(Duration, Box<ScriptedTurn>),
}

impl ScriptedTurn {
    pub fn text(text: &str) -> Self {
        Self::Chunks(vec![GenerateChunk::Content(text.to_string())])
    }

    /// Text followed by tool call requests.
    pub fn with_tools(text: &str, calls: Vec<ToolCallRequest>) -> Self {
        let mut chunks = Vec::new();
        if !text.is_empty() {
            chunks.push(GenerateChunk::Content(text.to_string()));
        }
        chunks.extend(calls.into_iter().map(GenerateChunk::ToolCallRequest));
        Self::Chunks(chunks)
    }

    /// Text plus a structured transfer directive.
    pub fn transfer(text: &str, agent: &str) -> Self {
        Self::with_tools(
            text,
            vec![ToolCallRequest::new(
                TRANSFER_DIRECTIVE,
                serde_json::json!({ "agent": agent }),
            )],
        )
    }

    /// Text plus a structured completion directive.
    pub fn complete(text: &str) -> Self {
        Self::with_tools(
            text,
            vec![ToolCallRequest::new(COMPLETE_DIRECTIVE, serde_json::json!({}))],
        )
    }

    pub fn delayed(delay: Duration, inner: ScriptedTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Agent that replays pre-programmed turns in order, for tests and demos.
pub struct ScriptedAgent {
    turns: Vec<ScriptedTurn>,
    /// Served once `turns` is exhausted. Without it, extra calls fail.
    fallback: Option<ScriptedTurn>,
    call_count: AtomicUsize,
    seen_history: Mutex<Vec<usize>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns,
            fallback: None,
            call_count: AtomicUsize::new(0),
            seen_history: Mutex::new(Vec::new()),
        }
    }

    /// Serve `turn` for every call.
    pub fn repeating(turn: ScriptedTurn) -> Self {
        Self::new(Vec::new()).with_fallback(turn)
    }

    pub fn with_fallback(mut self, turn: ScriptedTurn) -> Self {
        self.fallback = Some(turn);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// History length passed to each call, in call order.
    pub fn history_lengths(&self) -> Vec<usize> {
        self.seen_history.lock().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn generate(
        &self,
        agent: &AgentDescriptor,
        history: &[Message],
        _context: &ContextVariables,
    ) -> Result<GenerateStream, AgentError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().push(history.len());

        let turn = match self.turns.get(idx).or(self.fallback.as_ref()) {
            Some(turn) => turn.clone(),
            None => {
                return Err(AgentError::InvalidRequest(format!(
                    "ScriptedAgent '{}': no turn configured for call {idx}",
                    agent.name
                )))
            }
        };
        resolve_turn(turn).await
    }
}

/// Unrolls nested delays iteratively.
async fn resolve_turn(mut turn: ScriptedTurn) -> Result<GenerateStream, AgentError> {
    loop {
        match turn {
            ScriptedTurn::Chunks(mut chunks) => {
                chunks.push(GenerateChunk::Done);
                return Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok::<_, AgentError>))));
            }
            ScriptedTurn::FailAfter(chunks, error) => {
                let items = chunks.into_iter().map(Ok).chain(std::iter::once(Err(error)));
                return Ok(Box::pin(stream::iter(items)));
            }
            ScriptedTurn::Error(error) => return Err(error),
            ScriptedTurn::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                turn = *inner;
            }
        }
    }
}
