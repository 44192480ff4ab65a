//! Task definitions and lifecycle state.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::work::Work;

/// Priority of a task or lock request.
///
/// Ordering is `Low < Normal < High < Critical`, so comparisons pick the
/// more urgent of two.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  /// Created, or returned here after a recoverable failure with retries
  /// remaining.
  Pending,
  /// Selected for dispatch; picked up by a worker shortly.
  Ready,
  Running,
  Completed,
  Failed,
  Cancelled,
  /// A required resource could not be acquired. Retryable while retries
  /// remain.
  Blocked,
}

impl TaskStatus {
  /// Terminal statuses never transition again.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
    )
  }
}

/// A single unit of work in a workflow.
///
/// Dependencies are prerequisite task ids within the same workflow;
/// `required_resources` are named locks acquired (in listed order) before
/// the work runs.
#[derive(Clone)]
pub struct TaskDefinition {
  pub task_id: String,
  pub name: String,
  pub work: Arc<dyn Work>,
  pub dependencies: HashSet<String>,
  pub required_resources: Vec<String>,
  pub priority: Priority,
  pub timeout: Duration,
  pub retry_count: u32,
  pub max_retries: u32,
  pub status: TaskStatus,
  pub created_at: Instant,
  pub started_at: Option<Instant>,
  pub completed_at: Option<Instant>,
  pub result: Option<serde_json::Value>,
  pub error: Option<String>,
  pub execution_time: Option<Duration>,
}

impl TaskDefinition {
  /// Create a pending task with default policy: normal priority, a five
  /// minute timeout, up to three retries.
  pub fn new(task_id: impl Into<String>, name: impl Into<String>, work: Arc<dyn Work>) -> Self {
    Self {
      task_id: task_id.into(),
      name: name.into(),
      work,
      dependencies: HashSet::new(),
      required_resources: Vec::new(),
      priority: Priority::Normal,
      timeout: Duration::from_secs(300),
      retry_count: 0,
      max_retries: 3,
      status: TaskStatus::Pending,
      created_at: Instant::now(),
      started_at: None,
      completed_at: None,
      result: None,
      error: None,
      execution_time: None,
    }
  }

  pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.dependencies = dependencies.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_resources<I, S>(mut self, resources: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.required_resources = resources.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// True when every dependency id is contained in the completed set.
  pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
    self.dependencies.iter().all(|dep| completed.contains(dep))
  }

  /// Wall-clock duration of the last run, if the task started and finished.
  pub fn execution_duration(&self) -> Option<Duration> {
    match (self.started_at, self.completed_at) {
      (Some(start), Some(end)) => Some(end.duration_since(start)),
      _ => None,
    }
  }

  /// Serializable snapshot for status queries and events.
  pub fn report(&self) -> TaskStatusReport {
    TaskStatusReport {
      task_id: self.task_id.clone(),
      name: self.name.clone(),
      status: self.status,
      priority: self.priority,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      error: self.error.clone(),
      execution_time_ms: self.execution_time.map(|d| d.as_millis() as u64),
    }
  }
}

impl fmt::Debug for TaskDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskDefinition")
      .field("task_id", &self.task_id)
      .field("name", &self.name)
      .field("dependencies", &self.dependencies)
      .field("required_resources", &self.required_resources)
      .field("priority", &self.priority)
      .field("status", &self.status)
      .field("retry_count", &self.retry_count)
      .field("max_retries", &self.max_retries)
      .finish_non_exhaustive()
  }
}

/// Read-only view of a task's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusReport {
  pub task_id: String,
  pub name: String,
  pub status: TaskStatus,
  pub priority: Priority,
  pub retry_count: u32,
  pub max_retries: u32,
  pub error: Option<String>,
  pub execution_time_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::work::work_fn;

  fn noop() -> Arc<dyn Work> {
    work_fn(|| async { Ok(serde_json::Value::Null) })
  }

  #[test]
  fn priority_ordering_puts_critical_on_top() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
  }

  #[test]
  fn readiness_is_dependency_subset() {
    let task = TaskDefinition::new("c", "c", noop()).with_dependencies(["a", "b"]);

    let mut completed = HashSet::new();
    assert!(!task.is_ready(&completed));
    completed.insert("a".to_string());
    assert!(!task.is_ready(&completed));
    completed.insert("b".to_string());
    assert!(task.is_ready(&completed));

    // Extra completed ids never block readiness.
    completed.insert("z".to_string());
    assert!(task.is_ready(&completed));
  }

  #[test]
  fn task_without_dependencies_is_always_ready() {
    let task = TaskDefinition::new("a", "a", noop());
    assert!(task.is_ready(&HashSet::new()));
  }
}
