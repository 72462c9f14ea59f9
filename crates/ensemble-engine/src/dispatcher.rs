use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use ensemble_core::tools::{ToolCall, ToolCallStatus, ToolContext, ToolError, ToolResult};

use crate::bus::panic_message;
use crate::registry::ToolRegistry;
use crate::schema;
use crate::truncate;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_OUTPUT: usize = 256 * 1024;

/// Error tag for a call naming a tool that is not registered.
pub const UNKNOWN_TOOL: &str = "unknown_tool";
/// Error tag for arguments rejected by the tool's schema.
pub const VALIDATION: &str = "validation";

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Calls in flight at once across every `dispatch` sharing this dispatcher.
    pub max_concurrency: usize,
    pub tool_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT,
        }
    }
}

/// Executes agent-requested tool calls.
///
/// Calls run concurrently up to `max_concurrency`; results come back in
/// request order. Nothing a tool does (error, panic, hang) escapes as an
/// `Err`; every outcome is a [`ToolResult`]. Dropping a `dispatch` future
/// aborts the calls it still has in flight.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            registry,
            config,
            permits,
        }
    }

    /// Dispatch `calls`, updating each call's status, and return one result per
    /// call in the same order.
    #[instrument(skip_all, fields(task_id = %ctx.task_id, agent = %ctx.agent_name, count = calls.len()))]
    pub async fn dispatch(&self, calls: &mut [ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut running = JoinSet::new();

        for (idx, call) in calls.iter_mut().enumerate() {
            let Some(tool) = self.registry.get(&call.name) else {
                warn!(tool = %call.name, "unknown tool requested");
                call.status = ToolCallStatus::Failed;
                results[idx] = Some(ToolResult::failure(
                    call,
                    UNKNOWN_TOOL,
                    format!("unknown tool: {}", call.name),
                ));
                continue;
            };

            if let Err(errors) = schema::validate_arguments(&tool.parameters_schema(), &call.arguments) {
                debug!(tool = %call.name, ?errors, "tool arguments rejected");
                call.status = ToolCallStatus::Failed;
                results[idx] = Some(ToolResult::failure(
                    call,
                    VALIDATION,
                    format!("invalid arguments for {}: {}", call.name, errors.join("; ")),
                ));
                continue;
            }

            call.status = ToolCallStatus::Running;
            let call_snapshot = call.clone();
            let ctx = ctx.clone();
            let permits = Arc::clone(&self.permits);
            let timeout = self.config.tool_timeout;
            let max_output = self.config.max_output_bytes;

            running.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    let result =
                        ToolResult::failure(&call_snapshot, "dispatcher_closed", "tool dispatcher is shut down");
                    return (idx, result);
                };

                let start = Instant::now();
                let outcome = tokio::time::timeout(
                    timeout,
                    AssertUnwindSafe(tool.execute(call_snapshot.arguments.clone(), &ctx)).catch_unwind(),
                )
                .await;
                let duration = start.elapsed();

                let mut result = match outcome {
                    Ok(Ok(Ok(output))) => ToolResult {
                        call_id: call_snapshot.id.clone(),
                        name: call_snapshot.name.clone(),
                        success: true,
                        content: truncate::truncate_output(&output.content, max_output),
                        error: None,
                        context_updates: output.context_updates,
                        artifacts: output.artifacts,
                        duration,
                    },
                    Ok(Ok(Err(e))) => {
                        debug!(tool = %call_snapshot.name, error = %e, "tool returned an error");
                        let message = e.to_string();
                        ToolResult::failure(&call_snapshot, message.clone(), message)
                    }
                    Ok(Err(panic)) => {
                        let msg = panic_message(&panic);
                        error!(tool = %call_snapshot.name, panic = %msg, "tool panicked during execution");
                        ToolResult::failure(
                            &call_snapshot,
                            format!("tool panicked: {msg}"),
                            "Internal error: tool crashed",
                        )
                    }
                    Err(_) => {
                        warn!(
                            tool = %call_snapshot.name,
                            timeout_secs = timeout.as_secs(),
                            "tool timed out"
                        );
                        let message = ToolError::Timeout(timeout).to_string();
                        ToolResult::failure(&call_snapshot, message.clone(), message)
                    }
                };
                result.duration = duration;
                (idx, result)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(join_err) => error!(error = %join_err, "tool task failed"),
            }
        }

        calls
            .iter_mut()
            .zip(results)
            .map(|(call, slot)| {
                let result = slot.unwrap_or_else(|| {
                    ToolResult::failure(call, "tool task failed", "Tool execution failed")
                });
                call.status = if result.success {
                    ToolCallStatus::Success
                } else {
                    ToolCallStatus::Failed
                };
                result
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ensemble_core::context::ContextVariables;
    use ensemble_core::ids::TaskId;
    use ensemble_core::tools::{Tool, ToolCallRequest, ToolOutput};
    use rand::Rng;
    use serde_json::json;

    use crate::registry::ToolSource;

    struct CountingTool {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "search"
        }
        fn description(&self) -> &str {
            "search the web"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            })
        }
        async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text(format!("results for {}", args["query"])))
        }
    }

    /// Sleeps for `delay_ms` and echoes `label`.
    struct SleepTool {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }
        fn description(&self) -> &str {
            "sleep then echo"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {"delay_ms": {"type": "integer", "minimum": 0}, "label": {"type": "string"}},
                "required": ["delay_ms", "label"]
            })
        }
        async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = args["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            let label = args["label"].as_str().unwrap_or_default().to_string();
            Ok(ToolOutput::text(label.clone())
                .with_update("last", label.clone())
                .with_artifact(format!("{label}.txt")))
        }
    }

    struct MisbehavingTool;

    #[async_trait]
    impl Tool for MisbehavingTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails in configurable ways"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"mode": {"type": "string", "enum": ["error", "panic", "hang", "huge"]}}})
        }
        async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            match args["mode"].as_str() {
                Some("error") => Err(ToolError::ExecutionFailed("disk full".into())),
                Some("panic") => panic!("tool bug"),
                Some("hang") => {
                    futures::future::pending::<()>().await;
                    Ok(ToolOutput::text("unreachable"))
                }
                _ => Ok(ToolOutput::text("x".repeat(2048))),
            }
        }
    }

    /// Counts executions that ran to completion after a 10s sleep.
    struct SlowWriteTool {
        writes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SlowWriteTool {
        fn name(&self) -> &str {
            "slow_write"
        }
        fn description(&self) -> &str {
            "writes after a long pause"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text("written"))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            task_id: TaskId::new(),
            agent_name: "researcher".into(),
            context: ContextVariables::new(),
        }
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::from_request(ToolCallRequest::new(name, args), "researcher")
    }

    fn dispatcher_with(tools: Vec<Arc<dyn Tool>>, config: DispatcherConfig) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool, ToolSource::BuiltIn);
        }
        ToolDispatcher::new(Arc::new(registry), config)
    }

    #[tokio::test]
    async fn invalid_arguments_never_invoke_the_tool() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(
            vec![Arc::new(CountingTool {
                invocations: Arc::clone(&invocations),
            })],
            DispatcherConfig::default(),
        );

        let mut calls = vec![call("search", json!({"q": "wrong key"}))];
        let results = dispatcher.dispatch(&mut calls, &ctx()).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some(VALIDATION));
        assert!(results[0].content.contains("missing required property 'query'"));
        assert_eq!(calls[0].status, ToolCallStatus::Failed);
    }

    #[tokio::test]
    async fn valid_call_succeeds() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(
            vec![Arc::new(CountingTool {
                invocations: Arc::clone(&invocations),
            })],
            DispatcherConfig::default(),
        );

        let mut calls = vec![call("search", json!({"query": "tokio"}))];
        let results = dispatcher.dispatch(&mut calls, &ctx()).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(results[0].success);
        assert_eq!(results[0].content, "results for \"tokio\"");
        assert_eq!(results[0].call_id, calls[0].id);
        assert_eq!(calls[0].status, ToolCallStatus::Success);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_local_failure() {
        let dispatcher = dispatcher_with(vec![], DispatcherConfig::default());
        let mut calls = vec![call("browse", json!({}))];
        let results = dispatcher.dispatch(&mut calls, &ctx()).await;
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some(UNKNOWN_TOOL));
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_request_order_under_random_delays() {
        let dispatcher = dispatcher_with(
            vec![Arc::new(SleepTool {
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            })],
            DispatcherConfig::default(),
        );

        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            let mut calls: Vec<ToolCall> = ["first", "second", "third"]
                .iter()
                .map(|label| call("sleep", json!({"delay_ms": rng.gen_range(0..200), "label": label})))
                .collect();
            let results = dispatcher.dispatch(&mut calls, &ctx()).await;
            let labels: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
            assert_eq!(labels, vec!["first", "second", "third"]);
            for (call, result) in calls.iter().zip(&results) {
                assert_eq!(call.id, result.call_id);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_completion_order_still_joins_in_request_order() {
        let dispatcher = dispatcher_with(
            vec![Arc::new(SleepTool {
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            })],
            DispatcherConfig::default(),
        );
        let mut calls = vec![
            call("sleep", json!({"delay_ms": 300, "label": "a"})),
            call("sleep", json!({"delay_ms": 200, "label": "b"})),
            call("sleep", json!({"delay_ms": 100, "label": "c"})),
        ];
        let results = dispatcher.dispatch(&mut calls, &ctx()).await;
        let labels: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert_eq!(results[2].context_updates.get_str("last"), Some("c"));
        assert_eq!(results[0].artifacts, vec!["a.txt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let peak = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(
            vec![Arc::new(SleepTool {
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::clone(&peak),
            })],
            DispatcherConfig {
                max_concurrency: 2,
                ..Default::default()
            },
        );
        let mut calls: Vec<ToolCall> = (0..6)
            .map(|i| call("sleep", json!({"delay_ms": 50, "label": format!("c{i}")})))
            .collect();
        let results = dispatcher.dispatch(&mut calls, &ctx()).await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_panics_and_timeouts_become_results() {
        let dispatcher = dispatcher_with(
            vec![Arc::new(MisbehavingTool)],
            DispatcherConfig {
                tool_timeout: Duration::from_secs(1),
                max_output_bytes: 100,
                ..Default::default()
            },
        );
        let mut calls = vec![
            call("flaky", json!({"mode": "error"})),
            call("flaky", json!({"mode": "panic"})),
            call("flaky", json!({"mode": "hang"})),
            call("flaky", json!({"mode": "huge"})),
        ];
        let results = dispatcher.dispatch(&mut calls, &ctx()).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].error.as_deref(), Some("execution failed: disk full"));
        assert!(results[1].error.as_deref().unwrap().contains("tool bug"));
        assert!(results[2].error.as_deref().unwrap().contains("timeout"));
        assert!(results[3].success);
        assert!(results[3].content.contains("[truncated: 2048 bytes -> 100 bytes]"));
        let statuses: Vec<ToolCallStatus> = calls.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                ToolCallStatus::Failed,
                ToolCallStatus::Failed,
                ToolCallStatus::Failed,
                ToolCallStatus::Success
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_dispatch_aborts_inflight_calls() {
        let writes = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(
            vec![Arc::new(SlowWriteTool {
                writes: Arc::clone(&writes),
            })],
            DispatcherConfig::default(),
        );
        let mut calls = vec![call("slow_write", json!({})), call("slow_write", json!({}))];

        let dispatched = tokio::time::timeout(Duration::from_secs(1), dispatcher.dispatch(&mut calls, &ctx())).await;
        assert!(dispatched.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }
}
