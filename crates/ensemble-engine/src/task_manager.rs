use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use ensemble_core::events::EventKind;
use ensemble_core::ids::TaskId;
use ensemble_core::task::{FailureKind, Task, TaskStatus};
use ensemble_store::TaskStore;

use crate::bus::EventBus;
use crate::error::EngineError;

const EVENT_SOURCE: &str = "task_manager";

/// Durable task records.
///
/// Every mutating call returns only after the store has committed the write.
/// Writes to one task are serialized through a per-task lock; different tasks
/// proceed independently.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    bus: Option<EventBus>,
    locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            bus: None,
            locks: DashMap::new(),
        }
    }

    /// Publish `TaskCreated` / `TaskStatusChanged` through `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[instrument(skip(self, config, metadata))]
    pub async fn create_task(
        &self,
        description: &str,
        config: Value,
        metadata: Map<String, Value>,
    ) -> Result<TaskId, EngineError> {
        let task = Task::new(description, config, metadata);
        self.store.put(&task)?;
        info!(task_id = %task.id, "task created");

        self.publish(
            &task.id,
            EventKind::TaskCreated {
                task_id: task.id.clone(),
                description: task.description.clone(),
            },
        );
        Ok(task.id)
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
        Ok(self.store.get(id)?)
    }

    pub async fn list_tasks(&self, limit: u32) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.list(limit)?)
    }

    /// Move a task to `status`, optionally recording a result.
    ///
    /// Returns `Ok(false)` with a warning when the task does not exist.
    /// Illegal transitions return [`EngineError::InvalidTransition`] and leave
    /// the record untouched.
    #[instrument(skip(self, result), fields(task_id = %id, status = %status))]
    pub async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<Value>,
    ) -> Result<bool, EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut task) = self.store.get(id)? else {
            warn!(task_id = %id, "update_status for unknown task, ignoring");
            return Ok(false);
        };
        let from = task.status;
        if !from.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from, to: status });
        }

        task.status = status;
        if result.is_some() {
            task.result = result;
        }
        touch(&mut task);
        self.store.put(&task)?;
        self.release_if_terminal(&task);

        if from != status {
            info!(task_id = %id, %from, to = %status, "task status changed");
            self.publish(
                id,
                EventKind::TaskStatusChanged {
                    task_id: id.clone(),
                    from,
                    to: status,
                },
            );
        }
        Ok(true)
    }

    /// Record FAILED with a reason. Same unknown-id handling as `update_status`.
    #[instrument(skip(self, message), fields(task_id = %id, kind = %kind))]
    pub async fn fail_task(
        &self,
        id: &TaskId,
        kind: FailureKind,
        message: &str,
    ) -> Result<bool, EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut task) = self.store.get(id)? else {
            warn!(task_id = %id, "fail_task for unknown task, ignoring");
            return Ok(false);
        };
        let from = task.status;
        if !from.can_transition_to(TaskStatus::Failed) {
            return Err(EngineError::InvalidTransition {
                from,
                to: TaskStatus::Failed,
            });
        }

        task.status = TaskStatus::Failed;
        task.failure = Some(kind);
        task.error_message = Some(message.to_string());
        touch(&mut task);
        self.store.put(&task)?;
        self.release_if_terminal(&task);

        warn!(task_id = %id, %kind, reason = message, "task failed");
        self.publish(
            id,
            EventKind::TaskStatusChanged {
                task_id: id.clone(),
                from,
                to: TaskStatus::Failed,
            },
        );
        Ok(true)
    }

    /// Persist the round counter. Rounds never move backwards.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn record_round(&self, id: &TaskId, round: u32) -> Result<(), EngineError> {
        self.mutate(id, |task| {
            if round < task.round {
                return Err(EngineError::Internal(format!(
                    "round counter would move backwards: {} -> {round}",
                    task.round
                )));
            }
            task.round = round;
            Ok(())
        })
        .await
    }

    /// Overlay `entries` onto the task's metadata.
    #[instrument(skip(self, entries), fields(task_id = %id))]
    pub async fn merge_metadata(
        &self,
        id: &TaskId,
        entries: Map<String, Value>,
    ) -> Result<(), EngineError> {
        self.mutate(id, |task| {
            task.metadata.extend(entries);
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, id: &TaskId, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Task) -> Result<(), EngineError>,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut task = self
            .store
            .get(id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
        if task.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: task.status,
                to: task.status,
            });
        }
        f(&mut task)?;
        touch(&mut task);
        self.store.put(&task)?;
        Ok(())
    }

    fn lock_for(&self, id: &TaskId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_if_terminal(&self, task: &Task) {
        if task.is_terminal() {
            self.locks.remove(&task.id);
        }
    }

    fn publish(&self, id: &TaskId, kind: EventKind) {
        if let Some(bus) = &self.bus {
            bus.publish(kind, EVENT_SOURCE, Some(id.to_string()), vec![]);
        }
    }
}

/// Bump `updated_at`, never moving it backwards.
fn touch(task: &mut Task) {
    let now = Utc::now();
    if now > task.updated_at {
        task.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventFilter, EventHandler, EventPriority};
    use ensemble_core::events::EventType;
    use ensemble_store::{Database, TaskRepo};
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn manager() -> TaskManager {
        TaskManager::new(Arc::new(TaskRepo::new(Database::in_memory().unwrap())))
    }

    #[tokio::test]
    async fn create_writes_created_status() {
        let tm = manager();
        let id = tm
            .create_task("write a report", json!({"max_rounds": 3}), Map::new())
            .await
            .unwrap();
        let task = tm.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.description, "write a report");
        assert_eq!(task.config["max_rounds"], 3);
    }

    #[tokio::test]
    async fn get_is_stable_without_mutation() {
        let tm = manager();
        let id = tm.create_task("stable", Value::Null, Map::new()).await.unwrap();
        let a = tm.get_task(&id).await.unwrap();
        let b = tm.get_task(&id).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_an_error() {
        let tm = manager();
        let updated = tm
            .update_status(&TaskId::new(), TaskStatus::Running, None)
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn lifecycle_and_terminal_immutability() {
        let tm = manager();
        let id = tm.create_task("t", Value::Null, Map::new()).await.unwrap();

        assert!(tm.update_status(&id, TaskStatus::Running, None).await.unwrap());
        assert!(tm
            .update_status(&id, TaskStatus::Completed, Some(json!({"final_response": "done"})))
            .await
            .unwrap());

        let err = tm
            .update_status(&id, TaskStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Running
            }
        ));
        assert!(matches!(
            tm.record_round(&id, 4).await,
            Err(EngineError::InvalidTransition { .. })
        ));

        let task = tm.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"final_response": "done"})));
        assert!(task.updated_at >= task.created_at);
    }

    #[tokio::test]
    async fn illegal_transition_leaves_record_untouched() {
        let tm = manager();
        let id = tm.create_task("t", Value::Null, Map::new()).await.unwrap();
        let before = tm.get_task(&id).await.unwrap().unwrap();
        assert!(tm
            .update_status(&id, TaskStatus::Completed, None)
            .await
            .is_err());
        assert_eq!(tm.get_task(&id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn fail_task_records_reason() {
        let tm = manager();
        let id = tm.create_task("t", Value::Null, Map::new()).await.unwrap();
        tm.update_status(&id, TaskStatus::Running, None).await.unwrap();
        assert!(tm
            .fail_task(&id, FailureKind::MaxRoundsExceeded, "max rounds exceeded: 3")
            .await
            .unwrap());

        let task = tm.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure, Some(FailureKind::MaxRoundsExceeded));
        assert_eq!(task.error_message.as_deref(), Some("max rounds exceeded: 3"));
        assert!(tm
            .fail_task(&id, FailureKind::Cancelled, "again")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rounds_and_metadata() {
        let tm = manager();
        let id = tm.create_task("t", Value::Null, Map::new()).await.unwrap();
        tm.record_round(&id, 1).await.unwrap();
        tm.record_round(&id, 2).await.unwrap();
        assert!(tm.record_round(&id, 1).await.is_err());

        let mut entries = Map::new();
        entries.insert("active_agent".into(), json!("writer"));
        tm.merge_metadata(&id, entries).await.unwrap();

        let task = tm.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.round, 2);
        assert_eq!(task.metadata["active_agent"], "writer");
        assert!(matches!(
            tm.record_round(&TaskId::new(), 1).await,
            Err(EngineError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_newest_first() {
        let tm = manager();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(tm.create_task(&format!("t{i}"), Value::Null, Map::new()).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let listed: Vec<TaskId> = tm.list_tasks(2).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
    }

    #[tokio::test]
    async fn publishes_lifecycle_events() {
        let bus = EventBus::default();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventFilter::types([EventType::TaskCreated, EventType::TaskStatusChanged]),
            EventHandler::sync_fn("capture", move |e| {
                sink.lock().push(e.kind.clone());
                Ok(())
            }),
            EventPriority::Normal,
        );
        let tm = manager().with_bus(bus);

        let id = tm.create_task("t", Value::Null, Map::new()).await.unwrap();
        tm.update_status(&id, TaskStatus::Running, None).await.unwrap();
        // same-status touch publishes nothing
        tm.update_status(&id, TaskStatus::Running, None).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], EventKind::TaskCreated { .. }));
        assert!(matches!(
            seen[1],
            EventKind::TaskStatusChanged {
                from: TaskStatus::Created,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_task_serialize() {
        let tm = Arc::new(manager());
        let id = tm.create_task("t", Value::Null, Map::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let tm = Arc::clone(&tm);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let mut entries = Map::new();
                entries.insert(format!("k{i}"), json!(i));
                tm.merge_metadata(&id, entries).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let task = tm.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.metadata.len(), 10);
    }

    #[tokio::test]
    async fn fresh_manager_sees_durable_state() {
        let dir = std::env::temp_dir().join(format!("ensemble-tm-{}", uuid::Uuid::now_v7()));
        let path = dir.join("tasks.db");

        let id = {
            let tm = TaskManager::new(Arc::new(TaskRepo::new(Database::open(&path).unwrap())));
            tm.create_task("survive a restart", Value::Null, Map::new())
                .await
                .unwrap()
        };

        let tm = TaskManager::new(Arc::new(TaskRepo::new(Database::open(&path).unwrap())));
        let task = tm.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.description, "survive a restart");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
