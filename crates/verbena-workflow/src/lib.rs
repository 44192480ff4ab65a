//! Task and workflow model for verbena.
//!
//! A [`WorkflowDefinition`] is a named DAG of [`TaskDefinition`]s plus an
//! execution strategy. This crate owns the pure parts of scheduling:
//! readiness checks, priority ordering, progress accounting, and
//! cycle detection over the dependency relation. Execution lives in
//! `verbena-engine`; resource coordination lives in `verbena-sync`.

mod error;
mod graph;
mod task;
mod work;
mod workflow;

pub use error::ValidationError;
pub use graph::{DependencyGraph, validate};
pub use task::{Priority, TaskDefinition, TaskStatus, TaskStatusReport};
pub use work::{Work, WorkError, work_fn};
pub use workflow::{
  ExecutionStrategy, WorkflowDefinition, WorkflowStatus, WorkflowStatusReport,
};
