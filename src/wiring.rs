//! Settings → engine config conversion and component assembly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use ensemble_engine::{
    BusConfig, DispatcherConfig, EventBus, EventFilter, EventHandler, EventPriority, Orchestrator,
    OrchestratorConfig, TaskManager, ToolDispatcher,
};
use ensemble_settings::{BusSettings, DispatcherSettings, EnsembleSettings, OrchestratorSettings};
use ensemble_store::{Database, TaskRepo};

use crate::team_file::TeamFile;
use crate::tools::builtin_registry;

pub fn orchestrator_config(settings: &OrchestratorSettings) -> OrchestratorConfig {
    OrchestratorConfig {
        max_rounds: settings.max_rounds,
        max_tool_iterations_per_round: settings.max_tool_iterations_per_round,
        generation_retries: settings.generation_retries,
        generation_retry_delay: Duration::from_millis(settings.generation_retry_delay_ms),
        stream_buffer: settings.stream_buffer,
        max_run_duration: Duration::from_millis(settings.max_run_duration_ms),
    }
}

pub fn dispatcher_config(settings: &DispatcherSettings) -> DispatcherConfig {
    DispatcherConfig {
        max_concurrency: settings.max_concurrency,
        tool_timeout: Duration::from_millis(settings.tool_timeout_ms),
        max_output_bytes: settings.max_output_bytes,
    }
}

pub fn bus_config(settings: &BusSettings) -> BusConfig {
    BusConfig {
        drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
    }
}

/// Task manager over the database at `db_path`. With a bus, lifecycle
/// events (`task_created`, `task_status_changed`) are published on it.
pub fn open_task_manager(db_path: &Path, bus: Option<EventBus>) -> Result<TaskManager> {
    let db = Database::open(db_path)
        .with_context(|| format!("failed to open task database {}", db_path.display()))?;
    let tasks = TaskManager::new(Arc::new(TaskRepo::new(db)));
    Ok(match bus {
        Some(bus) => tasks.with_bus(bus),
        None => tasks,
    })
}

/// Started bus with a debug-level event log subscriber.
pub fn event_bus(settings: &BusSettings) -> EventBus {
    let bus = EventBus::new(bus_config(settings));
    bus.subscribe(
        EventFilter::All,
        EventHandler::sync_fn("event-log", |event| {
            debug!(
                event_type = %event.event_type(),
                correlation_id = event.correlation_id.as_deref().unwrap_or(""),
                "event"
            );
            Ok(())
        }),
        EventPriority::Low,
    );
    bus.start();
    bus
}

pub fn build_orchestrator(
    settings: &EnsembleSettings,
    team_file: &TeamFile,
    tasks: Arc<TaskManager>,
    bus: EventBus,
) -> Result<Orchestrator> {
    let team = team_file.build_team().context("invalid team")?;
    let router = team_file.build_router()?;
    let dispatcher = ToolDispatcher::new(
        Arc::new(builtin_registry()),
        dispatcher_config(&settings.dispatcher),
    );
    Ok(Orchestrator::new(
        Arc::new(team),
        tasks,
        Arc::new(dispatcher),
        Arc::new(router),
        bus,
        orchestrator_config(&settings.orchestrator),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::chunk::StreamChunk;
    use ensemble_core::events::EventKind;
    use ensemble_core::task::TaskStatus;
    use parking_lot::Mutex;

    #[test]
    fn settings_convert() {
        let settings = EnsembleSettings::default();
        let orchestrator = orchestrator_config(&settings.orchestrator);
        assert_eq!(orchestrator.max_rounds, 10);
        assert_eq!(orchestrator.generation_retry_delay, Duration::from_millis(200));
        assert_eq!(orchestrator.max_run_duration, Duration::from_secs(3600));

        let dispatcher = dispatcher_config(&settings.dispatcher);
        assert_eq!(dispatcher.max_concurrency, 4);
        assert_eq!(dispatcher.tool_timeout, Duration::from_secs(120));
        assert_eq!(bus_config(&settings.bus).drain_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn scripted_team_runs_end_to_end() {
        let team_file = TeamFile::parse(
            r#"{
                "agents": [
                    {"name": "researcher", "role": "finds sources", "turns": [
                        {"text": "noting", "toolCalls": [{"name": "note", "arguments": {"key": "topic", "value": "tokio"}}]},
                        {"text": "Research complete"}
                    ]},
                    {"name": "writer", "role": "drafts", "turns": [{"text": "Final draft", "complete": true}]}
                ],
                "rules": [{"phrase": "research complete", "to": "writer"}]
            }"#,
        )
        .unwrap();

        let dir = std::env::temp_dir().join(format!("ensemble-wiring-{}", uuid::Uuid::now_v7()));
        let settings = EnsembleSettings::default();
        let bus = event_bus(&settings.bus);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventFilter::All,
            EventHandler::sync_fn("capture", move |event| {
                sink.lock().push(event.kind.clone());
                Ok(())
            }),
            EventPriority::Normal,
        );
        let tasks = Arc::new(open_task_manager(&dir.join("tasks.db"), Some(bus.clone())).unwrap());
        let orchestrator =
            build_orchestrator(&settings, &team_file, Arc::clone(&tasks), bus.clone()).unwrap();

        let (chunks, outcome) = orchestrator.run("write about tokio").await.unwrap();
        bus.stop().await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.final_agent, "writer");
        assert_eq!(outcome.artifacts, vec!["note:topic"]);
        assert!(chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::ToolResult { content, .. } if content == "noted topic")));

        let task = tasks.get_task(&outcome.task_id).await.unwrap().unwrap();
        assert_eq!(task.result.unwrap()["context"]["topic"], "tokio");

        let seen = seen.lock();
        assert!(seen
            .iter()
            .any(|e| matches!(e, EventKind::TaskCreated { task_id, .. } if *task_id == outcome.task_id)));
        let completed = seen.iter().any(|e| {
            matches!(e, EventKind::TaskStatusChanged { to: TaskStatus::Completed, .. })
        });
        assert!(completed);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
