//! Single-task execution with resource management.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use verbena_events::{AgentEvent, Notifier};
use verbena_sync::ResourceCoordinator;
use verbena_workflow::{TaskDefinition, TaskStatus};

/// What happened to a dispatched task.
///
/// The executor never mutates task state; the scheduler owns it and
/// applies the outcome (including the retry counter, so a task whose work
/// always fails runs exactly `max_retries + 1` times).
#[derive(Debug, Clone)]
pub enum TaskOutcome {
  Completed {
    result: serde_json::Value,
    execution_time: Duration,
  },

  /// Recoverable failure with retries remaining; the task goes back to
  /// pending and is reconsidered on the next scheduling pass.
  Retry { error: String },

  /// Permanent failure: retries exhausted.
  Failed { error: String },

  /// A required resource could not be acquired; already-acquired locks
  /// were rolled back.
  Blocked {
    resource_id: String,
    error: String,
    retry: bool,
  },

  /// Cancelled before or during the work; any result is discarded.
  Cancelled,
}

/// Runs one task at a time on behalf of a pool worker.
pub struct TaskExecutor {
  agent_id: String,
  coordinator: Arc<ResourceCoordinator>,
  notifier: Arc<dyn Notifier>,
}

impl TaskExecutor {
  pub fn new(
    agent_id: impl Into<String>,
    coordinator: Arc<ResourceCoordinator>,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    Self {
      agent_id: agent_id.into(),
      coordinator,
      notifier,
    }
  }

  /// Execute one task: acquire its resources in listed order, run the
  /// work under the task's timeout, release every acquired lock exactly
  /// once on the way out — whatever the outcome.
  #[instrument(
    name = "task_execute",
    skip(self, task, cancel),
    fields(
      workflow_id = %workflow_id,
      task_id = %task.task_id,
      attempt = task.retry_count + 1,
    )
  )]
  pub async fn execute(
    &self,
    task: &TaskDefinition,
    workflow_id: &str,
    cancel: CancellationToken,
  ) -> TaskOutcome {
    info!(name = %task.name, "task started");
    let started = Instant::now();

    let mut acquired: Vec<String> = Vec::new();
    for resource_id in &task.required_resources {
      match self
        .coordinator
        .request_lock(resource_id, task.priority, task.timeout)
        .await
      {
        Ok(()) => acquired.push(resource_id.clone()),
        Err(e) => {
          warn!(resource_id = %resource_id, error = %e, "resource acquisition failed");
          self.release_all(&mut acquired);
          let outcome = TaskOutcome::Blocked {
            resource_id: resource_id.clone(),
            error: format!("failed to acquire resource `{resource_id}`: {e}"),
            retry: task.retry_count < task.max_retries,
          };
          self.notify_outcome(task, workflow_id, &outcome);
          return outcome;
        }
      }
    }

    let outcome = self.run_work(task, started, &cancel).await;

    self.release_all(&mut acquired);
    self.notify_outcome(task, workflow_id, &outcome);
    outcome
  }

  async fn run_work(
    &self,
    task: &TaskDefinition,
    started: Instant,
    cancel: &CancellationToken,
  ) -> TaskOutcome {
    let work = Arc::clone(&task.work);

    let result = tokio::select! {
      _ = cancel.cancelled() => {
        info!("task cancelled");
        return TaskOutcome::Cancelled;
      }
      result = tokio::time::timeout(task.timeout, work.run()) => result,
    };

    match result {
      Ok(Ok(value)) => {
        let execution_time = started.elapsed();
        info!(
          execution_time_ms = execution_time.as_millis() as u64,
          "task completed"
        );
        TaskOutcome::Completed {
          result: value,
          execution_time,
        }
      }
      Ok(Err(e)) => self.failure(task, e.to_string()),
      // A timeout is indistinguishable from a failing work function.
      Err(_) => self.failure(
        task,
        format!("work exceeded timeout of {} ms", task.timeout.as_millis()),
      ),
    }
  }

  fn failure(&self, task: &TaskDefinition, error: String) -> TaskOutcome {
    if task.retry_count < task.max_retries {
      warn!(error = %error, "task failed, will retry");
      TaskOutcome::Retry { error }
    } else {
      error!(error = %error, "task failed permanently");
      TaskOutcome::Failed { error }
    }
  }

  /// Release in reverse acquisition order. Release failures are logged
  /// and swallowed: the lease expiry sweep covers whatever is left.
  fn release_all(&self, acquired: &mut Vec<String>) {
    while let Some(resource_id) = acquired.pop() {
      if let Err(e) = self.coordinator.release_lock(&resource_id) {
        warn!(resource_id = %resource_id, error = %e, "lock release failed");
      }
    }
  }

  fn notify_outcome(&self, task: &TaskDefinition, workflow_id: &str, outcome: &TaskOutcome) {
    let (status, retry_count, error, execution_time_ms) = match outcome {
      TaskOutcome::Completed { execution_time, .. } => (
        TaskStatus::Completed,
        task.retry_count,
        None,
        Some(execution_time.as_millis() as u64),
      ),
      TaskOutcome::Retry { error } => (
        TaskStatus::Pending,
        task.retry_count + 1,
        Some(error.clone()),
        None,
      ),
      TaskOutcome::Failed { error } => {
        (TaskStatus::Failed, task.retry_count, Some(error.clone()), None)
      }
      TaskOutcome::Blocked { error, retry, .. } => (
        TaskStatus::Blocked,
        task.retry_count + u32::from(*retry),
        Some(error.clone()),
        None,
      ),
      TaskOutcome::Cancelled => (TaskStatus::Cancelled, task.retry_count, None, None),
    };

    self.notifier.broadcast(
      &self.agent_id,
      AgentEvent::TaskStatusUpdate {
        workflow_id: workflow_id.to_string(),
        task_id: task.task_id.clone(),
        status,
        retry_count,
        error,
        execution_time_ms,
      },
    );
  }
}
