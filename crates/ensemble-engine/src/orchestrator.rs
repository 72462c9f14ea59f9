use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use ensemble_core::agent::GenerateChunk;
use ensemble_core::chunk::StreamChunk;
use ensemble_core::context::ContextVariables;
use ensemble_core::errors::AgentError;
use ensemble_core::events::EventKind;
use ensemble_core::ids::{StepId, TaskId};
use ensemble_core::messages::{AssistantMessage, Message};
use ensemble_core::task::{FailureKind, TaskStatus};
use ensemble_core::tools::{ToolCall, ToolCallRequest, ToolCallStatus, ToolContext, ToolResult};

use crate::bus::EventBus;
use crate::dispatcher::ToolDispatcher;
use crate::error::EngineError;
use crate::handoff::{Directive, HandoffRouter, RouteAction, RoutingDecision};
use crate::task_manager::TaskManager;
use crate::team::{Team, TeamMember};

const EVENT_SOURCE: &str = "orchestrator";
const DEFAULT_MAX_RUN_DURATION: Duration = Duration::from_secs(3600);

/// Error tag for tool requests from agents without tool access.
pub const TOOLS_NOT_PERMITTED: &str = "tools_not_permitted";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_rounds: u32,
    /// Tool dispatch / re-generate cycles allowed within one round.
    pub max_tool_iterations_per_round: u32,
    /// Extra attempts for a retryable generation failure.
    pub generation_retries: u32,
    pub generation_retry_delay: Duration,
    /// Chunks buffered for the caller before the run waits for it.
    pub stream_buffer: usize,
    pub max_run_duration: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_tool_iterations_per_round: 5,
            generation_retries: 2,
            generation_retry_delay: Duration::from_millis(200),
            stream_buffer: 64,
            max_run_duration: DEFAULT_MAX_RUN_DURATION,
        }
    }
}

impl OrchestratorConfig {
    /// Snapshot stored on the task record.
    fn to_json(&self) -> Value {
        json!({
            "max_rounds": self.max_rounds,
            "max_tool_iterations_per_round": self.max_tool_iterations_per_round,
            "generation_retries": self.generation_retries,
            "generation_retry_delay_ms": self.generation_retry_delay.as_millis() as u64,
            "stream_buffer": self.stream_buffer,
            "max_run_duration_ms": self.max_run_duration.as_millis() as u64,
        })
    }
}

/// Run-loop state.
///
/// ```text
/// Initial ──► Running ──► Complete
///               │  ▲
///               ▼  │
///             Handoff
/// (any non-terminal) ──► Failed | MaxRoundsExceeded
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Initial,
    Running,
    Handoff,
    Complete,
    Failed,
    MaxRoundsExceeded,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::MaxRoundsExceeded)
    }

    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        match (self, next) {
            (Complete | Failed | MaxRoundsExceeded, _) => false,
            (_, Failed) => true,
            (Initial, Running) => true,
            (Running, Handoff | Complete | MaxRoundsExceeded) => true,
            (Handoff, Running) => true,
            _ => false,
        }
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub state: OrchestratorState,
    pub rounds: u32,
    pub steps: u32,
    pub final_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    pub artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub type ChunkStream = ReceiverStream<StreamChunk>;

/// Handle to a running task.
///
/// Chunks are buffered up to the configured capacity; once full, the run
/// waits for the caller to pull. Dropping the stream (or calling
/// [`TaskRun::outcome`]) lets the run finish without streaming.
pub struct TaskRun {
    task_id: TaskId,
    chunks: ChunkStream,
    cancel: CancellationToken,
    handle: JoinHandle<TaskOutcome>,
}

impl TaskRun {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Request cooperative cancellation. Takes effect at the next round
    /// boundary; an in-flight generate call is allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.chunks.next().await
    }

    /// Wait for the run to finish, discarding any unread chunks.
    pub async fn outcome(self) -> Result<TaskOutcome, EngineError> {
        drop(self.chunks);
        join_run(self.handle).await
    }

    /// Drain every chunk, then return them with the outcome.
    pub async fn collect(mut self) -> Result<(Vec<StreamChunk>, TaskOutcome), EngineError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.chunks.next().await {
            chunks.push(chunk);
        }
        let outcome = join_run(self.handle).await?;
        Ok((chunks, outcome))
    }
}

async fn join_run(handle: JoinHandle<TaskOutcome>) -> Result<TaskOutcome, EngineError> {
    handle
        .await
        .map_err(|e| EngineError::Internal(format!("run loop failed: {e}")))
}

/// Drives tasks through rounds of agent turns.
///
/// One orchestrator can run many tasks; each `start` gets its own history,
/// context and run loop. Collaborators are injected, nothing is global.
pub struct Orchestrator {
    team: Arc<Team>,
    tasks: Arc<TaskManager>,
    dispatcher: Arc<ToolDispatcher>,
    router: Arc<HandoffRouter>,
    bus: EventBus,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        team: Arc<Team>,
        tasks: Arc<TaskManager>,
        dispatcher: Arc<ToolDispatcher>,
        router: Arc<HandoffRouter>,
        bus: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            team,
            tasks,
            dispatcher,
            router,
            bus,
            config,
        }
    }

    /// Create a task for `prompt`, mark it running and spawn its run loop.
    #[instrument(skip_all)]
    pub async fn start(&self, prompt: &str) -> Result<TaskRun, EngineError> {
        if self.config.max_rounds == 0 {
            return Err(EngineError::InvalidConfig("max_rounds must be at least 1".into()));
        }
        let initial = self.team.initial().to_string();

        let mut metadata = Map::new();
        metadata.insert("initial_agent".into(), json!(initial));
        metadata.insert("active_agent".into(), json!(initial));
        metadata.insert("team".into(), json!(self.team.names()));

        let task_id = self
            .tasks
            .create_task(prompt, self.config.to_json(), metadata)
            .await?;
        self.tasks
            .update_status(&task_id, TaskStatus::Running, None)
            .await?;

        self.bus.publish(
            EventKind::TaskStart {
                task_id: task_id.clone(),
                timestamp: Utc::now(),
                initial_prompt: prompt.to_string(),
            },
            EVENT_SOURCE,
            Some(task_id.to_string()),
            vec![],
        );
        info!(task_id = %task_id, agent = %initial, "task started");

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let cancel = CancellationToken::new();

        let session = Session {
            task_id: task_id.clone(),
            team: Arc::clone(&self.team),
            tasks: Arc::clone(&self.tasks),
            dispatcher: Arc::clone(&self.dispatcher),
            router: Arc::clone(&self.router),
            bus: self.bus.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
            tx,
            consumer_gone: false,
            history: vec![Message::user(prompt)],
            context: ContextVariables::new(),
            active: initial,
            state: OrchestratorState::Initial,
            round: 0,
            steps: 0,
            artifacts: Vec::new(),
            final_response: None,
            started: Instant::now(),
        };
        let span = tracing::info_span!("task_run", task_id = %task_id);
        let handle = tokio::spawn(session.run().instrument(span));

        Ok(TaskRun {
            task_id,
            chunks: ReceiverStream::new(rx),
            cancel,
            handle,
        })
    }

    /// Start a task and drain it to completion.
    pub async fn run(&self, prompt: &str) -> Result<(Vec<StreamChunk>, TaskOutcome), EngineError> {
        self.start(prompt).await?.collect().await
    }
}

/// What a finished turn hands to the router.
struct TurnOutput {
    text: String,
    directives: Vec<Directive>,
}

/// State of one task run. Owned by its spawned loop; nothing else touches it.
struct Session {
    task_id: TaskId,
    team: Arc<Team>,
    tasks: Arc<TaskManager>,
    dispatcher: Arc<ToolDispatcher>,
    router: Arc<HandoffRouter>,
    bus: EventBus,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamChunk>,
    consumer_gone: bool,
    history: Vec<Message>,
    context: ContextVariables,
    active: String,
    state: OrchestratorState,
    round: u32,
    steps: u32,
    artifacts: Vec<String>,
    final_response: Option<String>,
    started: Instant,
}

impl Session {
    async fn run(mut self) -> TaskOutcome {
        let limit = self.config.max_run_duration;
        let result = match tokio::time::timeout(limit, self.drive()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::RunTimeout(limit)),
        };
        match result {
            Ok(()) => self.outcome(TaskStatus::Completed, None),
            Err(err) => self.fail(err).await,
        }
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        self.transition(OrchestratorState::Running)?;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            self.round += 1;
            self.tasks.record_round(&self.task_id, self.round).await?;

            let turn = self.run_round().await?;
            let decision = self.route(&turn).await;

            match decision.action {
                RouteAction::Complete => return self.complete(turn.text).await,
                _ if self.round >= self.config.max_rounds => {
                    return Err(EngineError::MaxRoundsExceeded(self.round));
                }
                RouteAction::Handoff(to) => self.handoff(to).await?,
                RouteAction::Continue => {
                    debug!(task_id = %self.task_id, round = self.round, agent = %self.active, "continuing with same agent");
                }
            }
        }
    }

    /// One round: generate, dispatch any tool calls and re-generate until the
    /// agent produces a plain turn or the iteration cap is hit.
    async fn run_round(&mut self) -> Result<TurnOutput, EngineError> {
        let member = self
            .team
            .get(&self.active)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("active agent '{}' is not a team member", self.active)))?;
        if !member.descriptor.capabilities.can_generate {
            return Err(EngineError::Internal(format!("agent '{}' cannot generate", self.active)));
        }

        self.steps += 1;
        self.publish(EventKind::AgentStart {
            agent_name: self.active.clone(),
            step_id: StepId::new(),
        });

        let mut directives = Vec::new();
        let mut iterations = 0u32;
        loop {
            let (text, requests) = self.generate_with_retry(&member).await?;
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            self.history.push(Message::Assistant(AssistantMessage {
                agent: self.active.clone(),
                content: text.clone(),
                tool_calls: requests.clone(),
            }));

            let mut tool_requests = Vec::new();
            for request in requests {
                match Directive::from_request(&request) {
                    Some(directive) => {
                        self.history.push(Message::tool_result(
                            request.id,
                            request.name,
                            "directive recorded",
                            false,
                        ));
                        directives.push(directive);
                    }
                    None => tool_requests.push(request),
                }
            }

            if tool_requests.is_empty() {
                return Ok(TurnOutput { text, directives });
            }
            self.dispatch_tools(&member, tool_requests).await;
            if !directives.is_empty() {
                return Ok(TurnOutput { text, directives });
            }

            iterations += 1;
            if iterations >= self.config.max_tool_iterations_per_round {
                warn!(
                    task_id = %self.task_id,
                    agent = %self.active,
                    iterations,
                    "tool iteration limit reached, routing on last response"
                );
                self.emit(StreamChunk::warning(format!(
                    "tool iteration limit ({iterations}) reached for {}, routing on the last response",
                    self.active
                )))
                .await;
                return Ok(TurnOutput { text, directives });
            }
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }
    }

    async fn generate_with_retry(
        &mut self,
        member: &TeamMember,
    ) -> Result<(String, Vec<ToolCallRequest>), EngineError> {
        let mut attempt = 0;
        loop {
            match self.generate_once(member).await {
                Ok(turn) => return Ok(turn),
                Err(e) if e.is_retryable() && attempt < self.config.generation_retries => {
                    attempt += 1;
                    let delay = e.suggested_delay().unwrap_or(self.config.generation_retry_delay);
                    warn!(
                        task_id = %self.task_id,
                        agent = %member.name(),
                        attempt,
                        error = %e,
                        "generation failed, retrying"
                    );
                    self.emit(StreamChunk::warning(format!(
                        "generation failed for {} ({}), retrying {attempt}/{}",
                        member.name(),
                        e.error_kind(),
                        self.config.generation_retries
                    )))
                    .await;
                    tokio::time::sleep(delay).await;
                    if self.cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                }
                Err(e) => {
                    error!(task_id = %self.task_id, agent = %member.name(), error = %e, "generation failed");
                    return Err(EngineError::AgentGeneration(e));
                }
            }
        }
    }

    /// Pull one generate stream, re-emitting content as it arrives. Stops
    /// pulling once cancellation is requested.
    async fn generate_once(
        &mut self,
        member: &TeamMember,
    ) -> Result<(String, Vec<ToolCallRequest>), AgentError> {
        let mut stream = member
            .agent
            .generate(&member.descriptor, &self.history, &self.context)
            .await?;

        let mut text = String::new();
        let mut requests = Vec::new();
        while let Some(item) = stream.next().await {
            match item? {
                GenerateChunk::Content(delta) => {
                    text.push_str(&delta);
                    self.emit(StreamChunk::Content {
                        agent: member.name().to_string(),
                        text: delta,
                    })
                    .await;
                }
                GenerateChunk::ToolCallRequest(request) => requests.push(request),
                GenerateChunk::Done => break,
            }
            if self.cancel.is_cancelled() {
                debug!(task_id = %self.task_id, "cancellation requested, no longer pulling generate output");
                break;
            }
        }
        Ok((text, requests))
    }

    /// Run tool calls, then fold results into history and context in request order.
    async fn dispatch_tools(&mut self, member: &TeamMember, requests: Vec<ToolCallRequest>) {
        let agent = member.name().to_string();
        self.publish(EventKind::ToolCallsStart {
            count: requests.len(),
        });
        for request in &requests {
            self.emit(StreamChunk::ToolCall {
                agent: agent.clone(),
                id: request.id.clone(),
                name: request.name.clone(),
                arguments: request.arguments.clone(),
            })
            .await;
        }

        let mut calls: Vec<ToolCall> = requests
            .into_iter()
            .map(|r| ToolCall::from_request(r, &agent))
            .collect();

        let results: Vec<ToolResult> = if member.descriptor.capabilities.can_call_tools {
            let ctx = ToolContext {
                task_id: self.task_id.clone(),
                agent_name: agent.clone(),
                context: self.context.clone(),
            };
            self.dispatcher.dispatch(&mut calls, &ctx).await
        } else {
            warn!(task_id = %self.task_id, agent = %agent, count = calls.len(), "agent may not call tools");
            calls
                .iter_mut()
                .map(|call| {
                    call.status = ToolCallStatus::Failed;
                    ToolResult::failure(
                        call,
                        TOOLS_NOT_PERMITTED,
                        format!("agent '{agent}' is not permitted to call tools"),
                    )
                })
                .collect()
        };

        for result in results {
            self.context.merge(&result.context_updates);
            for artifact in &result.artifacts {
                if !self.artifacts.contains(artifact) {
                    self.artifacts.push(artifact.clone());
                }
            }

            self.publish(EventKind::ToolResult {
                name: result.name.clone(),
                success: result.success,
                content: result.content.clone(),
            });
            self.emit(StreamChunk::ToolResult {
                id: result.call_id.clone(),
                name: result.name.clone(),
                success: result.success,
                content: result.content.clone(),
                error: result.error.clone(),
            })
            .await;

            let content = match &result.error {
                Some(err) if !result.success && *err != result.content => {
                    format!("[{err}] {}", result.content)
                }
                _ => result.content,
            };
            self.history.push(Message::tool_result(
                result.call_id,
                result.name,
                content,
                !result.success,
            ));
        }
    }

    async fn route(&mut self, turn: &TurnOutput) -> RoutingDecision {
        let decision = {
            let available = self.team.available_destinations(&self.active);
            self.router.detect(&turn.text, &turn.directives, &available)
        };

        for warning in &decision.warnings {
            warn!(task_id = %self.task_id, round = self.round, warning = %warning, "handoff directive ignored");
            self.emit(StreamChunk::warning(warning.clone())).await;
        }
        if decision.is_ambiguous() {
            warn!(
                task_id = %self.task_id,
                round = self.round,
                chosen = ?decision.action.destination(),
                also_matched = ?decision.also_matched,
                "ambiguous handoff, first declared rule wins"
            );
            self.emit(StreamChunk::warning(format!(
                "ambiguous handoff: response also matched {}",
                decision.also_matched.join(", ")
            )))
            .await;
        }

        self.emit(StreamChunk::RoutingDecision {
            round: self.round,
            from_agent: self.active.clone(),
            action: decision.action.as_str().to_string(),
            to_agent: decision.action.destination().map(str::to_string),
            method: decision.method.as_str().to_string(),
        })
        .await;
        decision
    }

    async fn handoff(&mut self, to: String) -> Result<(), EngineError> {
        self.transition(OrchestratorState::Handoff)?;
        let from = std::mem::replace(&mut self.active, to.clone());
        self.history.push(Message::transition(&from, &to, self.round));
        info!(task_id = %self.task_id, from = %from, to = %to, round = self.round, "handoff");

        self.publish(EventKind::Handoff {
            from_agent: from,
            to_agent: to.clone(),
            round: self.round,
        });

        let mut entries = Map::new();
        entries.insert("active_agent".into(), json!(to));
        self.tasks.merge_metadata(&self.task_id, entries).await?;

        self.transition(OrchestratorState::Running)
    }

    async fn complete(&mut self, text: String) -> Result<(), EngineError> {
        let history = serde_json::to_value(&self.history)
            .map_err(|e| EngineError::Internal(format!("serialize task history: {e}")))?;
        let result = json!({
            "final_response": text,
            "final_agent": self.active,
            "history": history,
            "artifacts": self.artifacts,
            "context": self.context.to_value(),
        });

        let updated = self
            .tasks
            .update_status(&self.task_id, TaskStatus::Completed, Some(result))
            .await?;
        if !updated {
            return Err(EngineError::TaskNotFound(self.task_id.clone()));
        }
        self.transition(OrchestratorState::Complete)?;
        self.final_response = Some(text);

        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            task_id = %self.task_id,
            rounds = self.round,
            steps = self.steps,
            duration_ms,
            "task complete"
        );
        self.publish(EventKind::TaskComplete {
            task_id: self.task_id.clone(),
            final_status: TaskStatus::Completed,
            total_steps: self.steps,
            duration_ms,
            artifacts: self.artifacts.clone(),
        });
        Ok(())
    }

    async fn fail(&mut self, err: EngineError) -> TaskOutcome {
        let kind = err.failure_kind();
        let message = err.to_string();
        self.state = match kind {
            FailureKind::MaxRoundsExceeded => OrchestratorState::MaxRoundsExceeded,
            _ => OrchestratorState::Failed,
        };
        warn!(task_id = %self.task_id, %kind, round = self.round, reason = %message, "task run failed");

        if let Err(e) = self.tasks.fail_task(&self.task_id, kind, &message).await {
            error!(task_id = %self.task_id, error = %e, "could not record task failure");
        }
        self.publish(EventKind::TaskFailed {
            task_id: self.task_id.clone(),
            reason: message.clone(),
        });
        self.emit(StreamChunk::Error {
            kind: kind.as_str().to_string(),
            message: message.clone(),
        })
        .await;

        self.outcome(TaskStatus::Failed, Some((kind, message)))
    }

    fn outcome(&self, status: TaskStatus, failure: Option<(FailureKind, String)>) -> TaskOutcome {
        let (failure, error) = match failure {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };
        TaskOutcome {
            task_id: self.task_id.clone(),
            status,
            state: self.state,
            rounds: self.round,
            steps: self.steps,
            final_agent: self.active.clone(),
            final_response: self.final_response.clone(),
            artifacts: self.artifacts.clone(),
            failure,
            error,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn transition(&mut self, next: OrchestratorState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "illegal orchestrator transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!(task_id = %self.task_id, from = ?self.state, to = ?next, "orchestrator state");
        self.state = next;
        Ok(())
    }

    async fn emit(&mut self, chunk: StreamChunk) {
        if self.consumer_gone {
            return;
        }
        if self.tx.send(chunk).await.is_err() {
            self.consumer_gone = true;
            warn!(task_id = %self.task_id, "chunk consumer dropped, continuing without streaming");
        }
    }

    fn publish(&self, kind: EventKind) {
        self.bus
            .publish(kind, EVENT_SOURCE, Some(self.task_id.to_string()), vec![]);
    }
}
