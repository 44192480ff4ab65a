use thiserror::Error;

/// Errors raised when a workflow is validated at submission.
///
/// A workflow that fails validation is rejected before any of its tasks
/// execute; no partial work is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  /// The dependency relation is not a DAG. Carries the sorted ids of every
  /// task left unprocessed by the topological ordering.
  #[error("cyclic dependencies among tasks: {}", .0.join(", "))]
  CyclicDependencies(Vec<String>),

  #[error("task `{task_id}` depends on unknown task `{dependency_id}`")]
  UnknownDependency {
    task_id: String,
    dependency_id: String,
  },

  #[error("task `{0}` depends on itself")]
  SelfDependency(String),

  #[error("duplicate task id `{0}`")]
  DuplicateTask(String),
}
