//! Workflow definitions: a named DAG of tasks plus an execution strategy.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::task::{TaskDefinition, TaskStatus};

/// How ready tasks are dispatched each scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
  /// At most one task in flight at a time, highest priority first.
  Sequential,
  /// Up to `max_concurrent_tasks` ready tasks in flight, highest priority
  /// first.
  Parallel,
  /// Treated as parallel. Staged hand-off between dependent stages is a
  /// known limitation, not implemented.
  Pipeline,
  /// Sequential for workflows of three tasks or fewer, parallel otherwise.
  #[default]
  Adaptive,
}

/// Lifecycle status of a workflow. There is no transition out of a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
  Created,
  Scheduled,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl WorkflowStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
    )
  }
}

/// A named, owned collection of tasks with scheduling parameters.
///
/// Tasks are kept in insertion order so that priority ties dispatch
/// first-added-first.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
  pub workflow_id: String,
  pub name: String,
  tasks: HashMap<String, TaskDefinition>,
  task_order: Vec<String>,
  pub execution_strategy: ExecutionStrategy,
  pub status: WorkflowStatus,
  pub max_concurrent_tasks: usize,
  pub total_timeout: Duration,
  pub progress: f64,
  pub created_at: Instant,
  pub started_at: Option<Instant>,
  pub completed_at: Option<Instant>,
}

impl WorkflowDefinition {
  /// Create an empty workflow with default scheduling parameters: five
  /// concurrent tasks, a one hour overall timeout.
  pub fn new(
    workflow_id: impl Into<String>,
    name: impl Into<String>,
    execution_strategy: ExecutionStrategy,
  ) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      name: name.into(),
      tasks: HashMap::new(),
      task_order: Vec::new(),
      execution_strategy,
      status: WorkflowStatus::Created,
      max_concurrent_tasks: 5,
      total_timeout: Duration::from_secs(3600),
      progress: 0.0,
      created_at: Instant::now(),
      started_at: None,
      completed_at: None,
    }
  }

  pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
    self.max_concurrent_tasks = max;
    self
  }

  pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
    self.total_timeout = timeout;
    self
  }

  /// Add a task. Rejects duplicate ids and self-dependencies.
  pub fn add_task(&mut self, task: TaskDefinition) -> Result<(), ValidationError> {
    if self.tasks.contains_key(&task.task_id) {
      return Err(ValidationError::DuplicateTask(task.task_id));
    }
    if task.dependencies.contains(&task.task_id) {
      return Err(ValidationError::SelfDependency(task.task_id));
    }
    self.task_order.push(task.task_id.clone());
    self.tasks.insert(task.task_id.clone(), task);
    Ok(())
  }

  /// Add a dependency edge between two existing tasks.
  pub fn add_dependency(
    &mut self,
    task_id: &str,
    dependency_id: &str,
  ) -> Result<(), ValidationError> {
    if task_id == dependency_id {
      return Err(ValidationError::SelfDependency(task_id.to_string()));
    }
    if !self.tasks.contains_key(dependency_id) {
      return Err(ValidationError::UnknownDependency {
        task_id: task_id.to_string(),
        dependency_id: dependency_id.to_string(),
      });
    }
    let task = self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| ValidationError::UnknownDependency {
        task_id: task_id.to_string(),
        dependency_id: dependency_id.to_string(),
      })?;
    task.dependencies.insert(dependency_id.to_string());
    Ok(())
  }

  pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
    self.tasks.get(task_id)
  }

  pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskDefinition> {
    self.tasks.get_mut(task_id)
  }

  /// Tasks in insertion order.
  pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
    self.task_order.iter().filter_map(|id| self.tasks.get(id))
  }

  pub fn task_count(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  /// Pending tasks whose dependencies are all completed, highest priority
  /// first, insertion order among equals.
  pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<&TaskDefinition> {
    let mut ready: Vec<&TaskDefinition> = self
      .tasks()
      .filter(|task| task.status == TaskStatus::Pending && task.is_ready(completed))
      .collect();
    // Stable sort: insertion order survives among equal priorities.
    ready.sort_by_key(|task| std::cmp::Reverse(task.priority));
    ready
  }

  /// Completion percentage, recomputed after every task transition.
  pub fn calculate_progress(&self) -> f64 {
    if self.tasks.is_empty() {
      return 0.0;
    }
    let completed = self
      .tasks
      .values()
      .filter(|task| task.status == TaskStatus::Completed)
      .count();
    (completed as f64 / self.tasks.len() as f64) * 100.0
  }

  pub fn completed_count(&self) -> usize {
    self
      .tasks
      .values()
      .filter(|task| task.status == TaskStatus::Completed)
      .count()
  }

  /// True once every task reached a terminal status.
  pub fn all_tasks_terminal(&self) -> bool {
    self.tasks.values().all(|task| task.status.is_terminal())
  }

  /// True if any task failed permanently.
  pub fn any_task_failed(&self) -> bool {
    self
      .tasks
      .values()
      .any(|task| task.status == TaskStatus::Failed)
  }

  /// Serializable snapshot for status queries.
  pub fn report(&self, active_tasks: usize) -> WorkflowStatusReport {
    WorkflowStatusReport {
      workflow_id: self.workflow_id.clone(),
      name: self.name.clone(),
      status: self.status,
      progress: self.progress,
      execution_strategy: self.execution_strategy,
      total_tasks: self.tasks.len(),
      completed_tasks: self.completed_count(),
      active_tasks,
    }
  }
}

/// Read-only view of a workflow's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
  pub workflow_id: String,
  pub name: String,
  pub status: WorkflowStatus,
  pub progress: f64,
  pub execution_strategy: ExecutionStrategy,
  pub total_tasks: usize,
  pub completed_tasks: usize,
  pub active_tasks: usize,
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::task::Priority;
  use crate::work::{Work, work_fn};

  fn noop() -> Arc<dyn Work> {
    work_fn(|| async { Ok(serde_json::Value::Null) })
  }

  fn workflow_with(ids: &[&str]) -> WorkflowDefinition {
    let mut workflow = WorkflowDefinition::new("wf", "test", ExecutionStrategy::Parallel);
    for id in ids {
      workflow
        .add_task(TaskDefinition::new(*id, *id, noop()))
        .unwrap();
    }
    workflow
  }

  #[test]
  fn duplicate_task_ids_are_rejected() {
    let mut workflow = workflow_with(&["a"]);
    let err = workflow
      .add_task(TaskDefinition::new("a", "again", noop()))
      .unwrap_err();
    assert_eq!(err, ValidationError::DuplicateTask("a".to_string()));
  }

  #[test]
  fn self_dependency_is_rejected_on_add() {
    let mut workflow = WorkflowDefinition::new("wf", "test", ExecutionStrategy::Sequential);
    let task = TaskDefinition::new("a", "a", noop()).with_dependencies(["a"]);
    let err = workflow.add_task(task).unwrap_err();
    assert_eq!(err, ValidationError::SelfDependency("a".to_string()));
  }

  #[test]
  fn add_dependency_requires_both_tasks() {
    let mut workflow = workflow_with(&["a", "b"]);
    workflow.add_dependency("b", "a").unwrap();
    assert!(workflow.task("b").unwrap().dependencies.contains("a"));

    assert!(workflow.add_dependency("b", "missing").is_err());
    assert!(workflow.add_dependency("missing", "a").is_err());
  }

  #[test]
  fn ready_tasks_sort_by_priority_then_insertion() {
    let mut workflow = WorkflowDefinition::new("wf", "test", ExecutionStrategy::Parallel);
    workflow
      .add_task(TaskDefinition::new("first-normal", "n1", noop()))
      .unwrap();
    workflow
      .add_task(TaskDefinition::new("high", "h", noop()).with_priority(Priority::High))
      .unwrap();
    workflow
      .add_task(TaskDefinition::new("second-normal", "n2", noop()))
      .unwrap();
    workflow
      .add_task(TaskDefinition::new("critical", "c", noop()).with_priority(Priority::Critical))
      .unwrap();

    let ready = workflow.ready_tasks(&HashSet::new());
    let ids: Vec<&str> = ready.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, ["critical", "high", "first-normal", "second-normal"]);
  }

  #[test]
  fn ready_tasks_skip_unsatisfied_dependencies() {
    let mut workflow = workflow_with(&["a", "b"]);
    workflow.add_dependency("b", "a").unwrap();

    let ready = workflow.ready_tasks(&HashSet::new());
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].task_id, "a");

    let completed: HashSet<String> = ["a".to_string()].into();
    // "a" is still pending in the definition, so mark it completed first.
    workflow.task_mut("a").unwrap().status = TaskStatus::Completed;
    let ready = workflow.ready_tasks(&completed);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].task_id, "b");
  }

  #[test]
  fn progress_counts_completed_tasks_only() {
    let mut workflow = workflow_with(&["a", "b", "c", "d"]);
    assert_eq!(workflow.calculate_progress(), 0.0);

    workflow.task_mut("a").unwrap().status = TaskStatus::Completed;
    workflow.task_mut("b").unwrap().status = TaskStatus::Failed;
    assert_eq!(workflow.calculate_progress(), 25.0);

    workflow.task_mut("c").unwrap().status = TaskStatus::Completed;
    workflow.task_mut("d").unwrap().status = TaskStatus::Completed;
    assert_eq!(workflow.calculate_progress(), 75.0);
    assert!(workflow.all_tasks_terminal());
    assert!(workflow.any_task_failed());
  }
}
