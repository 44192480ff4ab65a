use thiserror::Error;

use verbena_workflow::ValidationError;

/// Errors surfaced by workflow submission and management.
#[derive(Debug, Error)]
pub enum SchedulerError {
  /// The workflow's dependency relation failed validation; nothing was
  /// scheduled.
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("unknown workflow `{0}`")]
  UnknownWorkflow(String),

  #[error("scheduler is shut down")]
  Shutdown,
}
