//! Workflow execution engine for one verbena agent.
//!
//! The [`WorkflowScheduler`] owns the set of active workflows and polls
//! for ready tasks; a bounded worker pool consumes its dispatch channel
//! and runs each task through the [`TaskExecutor`], which acquires the
//! task's resources via the agent's coordinator, runs the work under a
//! timeout and releases everything on the way out. The [`Engine`] facade
//! wires all of it together for a single agent.

mod engine;
mod error;
mod executor;
mod scheduler;

pub use engine::{Engine, EngineConfig, HealthReport};
pub use error::SchedulerError;
pub use executor::{TaskExecutor, TaskOutcome};
pub use scheduler::{SchedulerConfig, WorkflowScheduler};
