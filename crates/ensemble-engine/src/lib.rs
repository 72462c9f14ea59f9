//! Multi-agent task engine.
//!
//! Layers, bottom-up:
//! - [`bus`]: in-process pub/sub for lifecycle events
//! - [`task_manager`]: durable task records and their status machine
//! - [`registry`] / [`dispatcher`]: named tools and concurrent, bounded execution
//! - [`handoff`]: decides who speaks next after each turn
//! - [`orchestrator`]: the round loop tying the rest together

pub mod bus;
pub mod dispatcher;
pub mod error;
pub mod handoff;
pub mod mock;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod task_manager;
pub mod team;
pub mod truncate;

pub use bus::{
    AsyncEventHandler, BusConfig, BusStats, EventBus, EventFilter, EventHandler, EventPriority,
    HandlerError, SyncEventHandler,
};
pub use dispatcher::{DispatcherConfig, ToolDispatcher};
pub use error::EngineError;
pub use handoff::{Directive, HandoffRouter, HandoffRule, RouteAction, RouteMethod, RoutingDecision};
pub use orchestrator::{
    ChunkStream, Orchestrator, OrchestratorConfig, OrchestratorState, TaskOutcome, TaskRun,
};
pub use registry::{ToolRegistry, ToolSource};
pub use task_manager::TaskManager;
pub use team::{Team, TeamBuilder, TeamMember};
