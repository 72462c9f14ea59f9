pub mod agent;
pub mod chunk;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod task;
pub mod tools;
