//! Engine facade: one agent's coordinator, executor and scheduler wired
//! together.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use verbena_events::{AgentEvent, Notifier};
use verbena_sync::{CoordinatorConfig, LockError, LockStatus, ResourceCoordinator};
use verbena_workflow::{
  ExecutionStrategy, Priority, TaskDefinition, TaskStatusReport, Work, WorkflowDefinition,
  WorkflowStatusReport,
};

use crate::error::SchedulerError;
use crate::executor::TaskExecutor;
use crate::scheduler::{SchedulerConfig, WorkflowScheduler};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub scheduler: SchedulerConfig,
  pub coordinator: CoordinatorConfig,
  /// Interval of the periodic expired-lock sweep.
  pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      scheduler: SchedulerConfig::default(),
      coordinator: CoordinatorConfig::default(),
      cleanup_interval: Duration::from_secs(1),
    }
  }
}

/// Result of a periodic health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
  pub agent_id: String,
  pub active_workflows: usize,
  pub locks_held: usize,
  pub timestamp_ms: u64,
}

/// One agent's orchestration engine.
///
/// Owns the resource coordinator, the task executor and the workflow
/// scheduler. Everything the surrounding transport/CLI layer needs goes
/// through here: workflow management, lock passthrough, peer events and
/// health checks.
pub struct Engine {
  agent_id: String,
  coordinator: Arc<ResourceCoordinator>,
  scheduler: Arc<WorkflowScheduler>,
  cancel: CancellationToken,
  cleanup_interval: Duration,
}

impl Engine {
  pub fn new(agent_id: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
    Self::with_config(agent_id, notifier, EngineConfig::default())
  }

  pub fn with_config(
    agent_id: impl Into<String>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
  ) -> Self {
    let agent_id = agent_id.into();
    let coordinator = Arc::new(ResourceCoordinator::with_config(
      agent_id.clone(),
      Arc::clone(&notifier),
      config.coordinator,
    ));
    let executor = Arc::new(TaskExecutor::new(
      agent_id.clone(),
      Arc::clone(&coordinator),
      Arc::clone(&notifier),
    ));
    let scheduler = Arc::new(WorkflowScheduler::new(
      agent_id.clone(),
      executor,
      notifier,
      config.scheduler,
    ));

    Self {
      agent_id,
      coordinator,
      scheduler,
      cancel: CancellationToken::new(),
      cleanup_interval: config.cleanup_interval,
    }
  }

  pub fn agent_id(&self) -> &str {
    &self.agent_id
  }

  /// Spawn the scheduling loop, the worker pool and the periodic
  /// expired-lock sweep.
  pub fn start(&self) {
    self.scheduler.start();

    let coordinator = Arc::clone(&self.coordinator);
    let cancel = self.cancel.clone();
    let interval = self.cleanup_interval;
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(interval) => {}
        }
        coordinator.cleanup_expired_locks();
      }
    });
  }

  /// Stop the loops. Running task work is cancelled best-effort.
  pub fn shutdown(&self) {
    self.scheduler.shutdown();
    self.cancel.cancel();
  }

  /// Create an empty workflow with a generated id.
  pub fn create_workflow(
    &self,
    name: impl Into<String>,
    strategy: ExecutionStrategy,
  ) -> WorkflowDefinition {
    WorkflowDefinition::new(generated_id("workflow"), name, strategy)
  }

  /// Build a task with a generated id; wire dependencies, resources and
  /// policy through the task's builder methods.
  pub fn create_task(&self, name: impl Into<String>, work: Arc<dyn Work>) -> TaskDefinition {
    TaskDefinition::new(generated_id("task"), name, work)
  }

  pub fn submit_workflow(&self, workflow: WorkflowDefinition) -> Result<String, SchedulerError> {
    self.scheduler.submit(workflow)
  }

  pub fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatusReport> {
    self.scheduler.status(workflow_id)
  }

  pub fn task_status(&self, workflow_id: &str, task_id: &str) -> Option<TaskStatusReport> {
    self.scheduler.task_status(workflow_id, task_id)
  }

  pub fn cancel_workflow(&self, workflow_id: &str) -> Result<(), SchedulerError> {
    self.scheduler.cancel(workflow_id)
  }

  pub async fn request_lock(
    &self,
    resource_id: &str,
    priority: Priority,
    timeout: Duration,
  ) -> Result<(), LockError> {
    self.coordinator.request_lock(resource_id, priority, timeout).await
  }

  pub fn release_lock(&self, resource_id: &str) -> Result<(), LockError> {
    self.coordinator.release_lock(resource_id)
  }

  pub fn lock_status(&self, resource_id: &str) -> Option<LockStatus> {
    self.coordinator.lock_status(resource_id)
  }

  pub fn all_locks_status(&self) -> Vec<LockStatus> {
    self.coordinator.all_locks_status()
  }

  /// Feed an inbound peer event to the coordinator. The transport that
  /// delivers events is out of scope; whatever receives them calls this.
  pub fn apply_peer_event(&self, from_agent: &str, event: &AgentEvent) {
    self.coordinator.apply_event(from_agent, event);
  }

  pub fn coordinator(&self) -> &Arc<ResourceCoordinator> {
    &self.coordinator
  }

  /// Periodic health check for operators.
  pub fn health_check(&self) -> HealthReport {
    HealthReport {
      agent_id: self.agent_id.clone(),
      active_workflows: self.scheduler.active_workflow_count(),
      locks_held: self.coordinator.locks_held(),
      timestamp_ms: epoch_ms(),
    }
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self.scheduler.shutdown();
    self.cancel.cancel();
  }
}

fn generated_id(prefix: &str) -> String {
  let hex = uuid::Uuid::new_v4().simple().to_string();
  format!("{prefix}-{}", &hex[..8])
}

fn epoch_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}
