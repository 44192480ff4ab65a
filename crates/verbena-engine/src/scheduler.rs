//! Workflow scheduling: the polling loop, execution strategies and the
//! bounded worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use verbena_events::{AgentEvent, Notifier};
use verbena_workflow::{
  ExecutionStrategy, TaskStatus, TaskStatusReport, WorkflowDefinition, WorkflowStatus,
  WorkflowStatusReport, validate,
};

use crate::error::SchedulerError;
use crate::executor::{TaskExecutor, TaskOutcome};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Interval between scheduling passes. This is the only tick in the
  /// system and bounds scheduling latency.
  pub poll_interval: Duration,
  /// Number of pool workers executing tasks. A stalled task occupies one
  /// worker, never the whole pool.
  pub worker_count: usize,
  /// Dispatch queue capacity; a full queue backpressures the loop.
  pub dispatch_buffer: usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_millis(100),
      worker_count: 8,
      dispatch_buffer: 64,
    }
  }
}

/// A task handed from the scheduling loop to the worker pool.
#[derive(Debug, Clone)]
struct Dispatch {
  workflow_id: String,
  task_id: String,
}

struct ActiveTask {
  workflow_id: String,
  cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
  workflows: HashMap<String, WorkflowDefinition>,
  /// workflow id -> ids of its completed tasks, the readiness input.
  completed: HashMap<String, HashSet<String>>,
  /// task id -> in-flight bookkeeping.
  active: HashMap<String, ActiveTask>,
}

/// Owns the set of active workflows and drives them to completion.
///
/// One scheduling loop per agent; task execution is delegated to a fixed
/// pool of workers reached through a bounded channel, so backpressure is
/// explicit and no pass spawns unbounded work.
pub struct WorkflowScheduler {
  agent_id: String,
  state: Mutex<SchedulerState>,
  executor: Arc<TaskExecutor>,
  notifier: Arc<dyn Notifier>,
  dispatch_tx: mpsc::Sender<Dispatch>,
  dispatch_rx: Mutex<Option<mpsc::Receiver<Dispatch>>>,
  shutdown: CancellationToken,
  config: SchedulerConfig,
}

impl WorkflowScheduler {
  pub fn new(
    agent_id: impl Into<String>,
    executor: Arc<TaskExecutor>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
  ) -> Self {
    let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_buffer);
    Self {
      agent_id: agent_id.into(),
      state: Mutex::new(SchedulerState::default()),
      executor,
      notifier,
      dispatch_tx,
      dispatch_rx: Mutex::new(Some(dispatch_rx)),
      shutdown: CancellationToken::new(),
      config,
    }
  }

  /// Validate and admit a workflow.
  ///
  /// A cyclic or dangling dependency relation is rejected here, before
  /// any task executes.
  pub fn submit(&self, mut workflow: WorkflowDefinition) -> Result<String, SchedulerError> {
    if self.shutdown.is_cancelled() {
      return Err(SchedulerError::Shutdown);
    }
    validate(&workflow)?;

    let workflow_id = workflow.workflow_id.clone();
    workflow.status = WorkflowStatus::Scheduled;
    {
      let mut state = self.state.lock().unwrap();
      state
        .completed
        .insert(workflow_id.clone(), HashSet::new());
      state.workflows.insert(workflow_id.clone(), workflow);
    }

    self.notifier.broadcast(
      &self.agent_id,
      AgentEvent::WorkflowSubmitted {
        workflow_id: workflow_id.clone(),
      },
    );
    info!(workflow_id = %workflow_id, "workflow submitted");
    Ok(workflow_id)
  }

  /// Spawn the worker pool and the scheduling loop. Idempotent: only the
  /// first call takes the dispatch receiver.
  pub fn start(self: &Arc<Self>) {
    let Some(receiver) = self.dispatch_rx.lock().unwrap().take() else {
      return;
    };
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

    for _ in 0..self.config.worker_count.max(1) {
      let scheduler = Arc::clone(self);
      let receiver = Arc::clone(&receiver);
      tokio::spawn(async move { scheduler.worker_loop(receiver).await });
    }

    let scheduler = Arc::clone(self);
    tokio::spawn(async move { scheduler.scheduling_loop().await });
  }

  /// Stop the loop and the pool. In-flight task work is cancelled through
  /// each task's token; work that ignores cancellation runs to completion
  /// but its result is discarded.
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  /// Best-effort cancellation of a workflow: cancel its in-flight tasks,
  /// mark it cancelled, broadcast the event. Tasks never dispatched stay
  /// pending and are simply never picked up again.
  pub fn cancel(&self, workflow_id: &str) -> Result<(), SchedulerError> {
    {
      let mut state = self.state.lock().unwrap();
      let SchedulerState {
        workflows, active, ..
      } = &mut *state;
      let workflow = workflows
        .get_mut(workflow_id)
        .ok_or_else(|| SchedulerError::UnknownWorkflow(workflow_id.to_string()))?;
      if workflow.status.is_terminal() {
        return Ok(());
      }

      for task in active.values().filter(|a| a.workflow_id == workflow_id) {
        task.cancel.cancel();
      }
      workflow.status = WorkflowStatus::Cancelled;
      workflow.completed_at = Some(Instant::now());
      workflow.progress = workflow.calculate_progress();
    }

    self.notifier.broadcast(
      &self.agent_id,
      AgentEvent::WorkflowCancelled {
        workflow_id: workflow_id.to_string(),
      },
    );
    info!(workflow_id = %workflow_id, "workflow cancelled");
    Ok(())
  }

  /// Read-only workflow snapshot.
  pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatusReport> {
    let state = self.state.lock().unwrap();
    let workflow = state.workflows.get(workflow_id)?;
    let active = state
      .active
      .values()
      .filter(|a| a.workflow_id == workflow_id)
      .count();
    Some(workflow.report(active))
  }

  /// Read-only task snapshot.
  pub fn task_status(&self, workflow_id: &str, task_id: &str) -> Option<TaskStatusReport> {
    let state = self.state.lock().unwrap();
    state
      .workflows
      .get(workflow_id)?
      .task(task_id)
      .map(|task| task.report())
  }

  /// Number of workflows not yet terminal.
  pub fn active_workflow_count(&self) -> usize {
    let state = self.state.lock().unwrap();
    state
      .workflows
      .values()
      .filter(|w| !w.status.is_terminal())
      .count()
  }

  async fn scheduling_loop(&self) {
    info!(agent_id = %self.agent_id, "scheduler started");
    loop {
      tokio::select! {
        _ = self.shutdown.cancelled() => break,
        _ = tokio::time::sleep(self.config.poll_interval) => {}
      }

      let dispatches = self.scheduling_pass();
      for dispatch in dispatches {
        if self.dispatch_tx.send(dispatch).await.is_err() {
          warn!("dispatch channel closed, stopping scheduler");
          return;
        }
      }
    }
    info!(agent_id = %self.agent_id, "scheduler stopped");
  }

  /// One pass over every workflow: start scheduled ones, finalize
  /// finished ones, select ready tasks per strategy.
  fn scheduling_pass(&self) -> Vec<Dispatch> {
    let mut dispatches = Vec::new();
    let mut events = Vec::new();

    {
      let mut state = self.state.lock().unwrap();
      let SchedulerState {
        workflows,
        completed,
        active,
      } = &mut *state;
      let mut in_flight = active.len();

      for workflow in workflows.values_mut() {
        if workflow.status.is_terminal() {
          continue;
        }

        if workflow.status == WorkflowStatus::Scheduled {
          workflow.status = WorkflowStatus::Running;
          workflow.started_at = Some(Instant::now());
          events.push(AgentEvent::WorkflowStarted {
            workflow_id: workflow.workflow_id.clone(),
          });
        }

        // A pending task whose dependency failed or was cancelled can
        // never become ready; cancel it so the workflow can settle.
        let unreachable: Vec<String> = workflow
          .tasks()
          .filter(|task| task.status == TaskStatus::Pending)
          .filter(|task| {
            task.dependencies.iter().any(|dep| {
              workflow.task(dep).is_some_and(|d| {
                matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled)
              })
            })
          })
          .map(|task| task.task_id.clone())
          .collect();
        for task_id in unreachable {
          if let Some(task) = workflow.task_mut(&task_id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Instant::now());
            task.error = Some("unreachable: a dependency failed".to_string());
          }
        }

        if workflow.all_tasks_terminal() {
          finalize(workflow, &mut events);
          continue;
        }

        let completed_ids = completed.entry(workflow.workflow_id.clone()).or_default();
        let workflow_active = active
          .values()
          .filter(|a| a.workflow_id == workflow.workflow_id)
          .count();
        let budget = dispatch_budget(workflow, in_flight, workflow_active);
        if budget == 0 {
          workflow.progress = workflow.calculate_progress();
          continue;
        }

        let selected: Vec<String> = workflow
          .ready_tasks(completed_ids)
          .into_iter()
          .take(budget)
          .map(|task| task.task_id.clone())
          .collect();

        for task_id in selected {
          if let Some(task) = workflow.task_mut(&task_id) {
            task.status = TaskStatus::Ready;
          }
          active.insert(
            task_id.clone(),
            ActiveTask {
              workflow_id: workflow.workflow_id.clone(),
              cancel: self.shutdown.child_token(),
            },
          );
          in_flight += 1;
          dispatches.push(Dispatch {
            workflow_id: workflow.workflow_id.clone(),
            task_id,
          });
        }

        workflow.progress = workflow.calculate_progress();
      }
    }

    for event in events {
      self.notifier.broadcast(&self.agent_id, event);
    }
    dispatches
  }

  async fn worker_loop(&self, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Dispatch>>>) {
    loop {
      let dispatch = {
        let mut receiver = receiver.lock().await;
        tokio::select! {
          _ = self.shutdown.cancelled() => return,
          dispatch = receiver.recv() => dispatch,
        }
      };
      let Some(dispatch) = dispatch else { return };
      self.run_dispatch(dispatch).await;
    }
  }

  async fn run_dispatch(&self, dispatch: Dispatch) {
    // Snapshot the task and mark it running; bail out if the workflow
    // went terminal while the dispatch sat in the queue.
    let (task, cancel) = {
      let mut state = self.state.lock().unwrap();
      let Some(active) = state.active.get(&dispatch.task_id) else {
        return;
      };
      let cancel = active.cancel.clone();

      let terminal = state
        .workflows
        .get(&dispatch.workflow_id)
        .map(|w| w.status.is_terminal())
        .unwrap_or(true);
      if terminal || cancel.is_cancelled() {
        state.active.remove(&dispatch.task_id);
        return;
      }

      let Some(task) = state
        .workflows
        .get_mut(&dispatch.workflow_id)
        .and_then(|w| w.task_mut(&dispatch.task_id))
      else {
        state.active.remove(&dispatch.task_id);
        return;
      };
      task.status = TaskStatus::Running;
      task.started_at = Some(Instant::now());
      (task.clone(), cancel)
    };

    let outcome = self
      .executor
      .execute(&task, &dispatch.workflow_id, cancel)
      .await;
    self.apply_outcome(&dispatch, outcome);
  }

  /// Fold a task outcome back into workflow state. Failures stay contained
  /// at the task boundary; sibling tasks and other workflows are never
  /// touched.
  fn apply_outcome(&self, dispatch: &Dispatch, outcome: TaskOutcome) {
    let mut state = self.state.lock().unwrap();
    state.active.remove(&dispatch.task_id);

    let SchedulerState {
      workflows,
      completed,
      ..
    } = &mut *state;
    let Some(workflow) = workflows.get_mut(&dispatch.workflow_id) else {
      return;
    };
    let Some(task) = workflow.task_mut(&dispatch.task_id) else {
      return;
    };
    let now = Instant::now();

    match outcome {
      TaskOutcome::Completed {
        result,
        execution_time,
      } => {
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.error = None;
        task.completed_at = Some(now);
        task.execution_time = Some(execution_time);
        completed
          .entry(dispatch.workflow_id.clone())
          .or_default()
          .insert(task.task_id.clone());
      }
      TaskOutcome::Retry { error } => {
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.error = Some(error);
        task.started_at = None;
      }
      TaskOutcome::Blocked { error, retry, .. } => {
        if retry {
          task.retry_count += 1;
          task.status = TaskStatus::Pending;
          task.started_at = None;
        } else {
          task.status = TaskStatus::Failed;
          task.completed_at = Some(now);
        }
        task.error = Some(error);
      }
      TaskOutcome::Failed { error } => {
        task.status = TaskStatus::Failed;
        task.error = Some(error);
        task.completed_at = Some(now);
      }
      TaskOutcome::Cancelled => {
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);
      }
    }

    workflow.progress = workflow.calculate_progress();
  }
}

/// How many tasks the strategy allows this workflow to dispatch now.
fn dispatch_budget(
  workflow: &WorkflowDefinition,
  global_in_flight: usize,
  workflow_in_flight: usize,
) -> usize {
  let strategy = match workflow.execution_strategy {
    ExecutionStrategy::Adaptive => {
      if workflow.task_count() <= 3 {
        ExecutionStrategy::Sequential
      } else {
        ExecutionStrategy::Parallel
      }
    }
    // Staged hand-off between dependent stages is not implemented;
    // pipeline falls back to parallel dispatch.
    ExecutionStrategy::Pipeline => ExecutionStrategy::Parallel,
    other => other,
  };

  match strategy {
    ExecutionStrategy::Sequential => {
      if global_in_flight == 0 {
        1
      } else {
        0
      }
    }
    _ => workflow
      .max_concurrent_tasks
      .saturating_sub(workflow_in_flight),
  }
}

fn finalize(workflow: &mut WorkflowDefinition, events: &mut Vec<AgentEvent>) {
  workflow.completed_at = Some(Instant::now());
  if workflow.any_task_failed() {
    workflow.status = WorkflowStatus::Failed;
    workflow.progress = workflow.calculate_progress();
    events.push(AgentEvent::WorkflowFailed {
      workflow_id: workflow.workflow_id.clone(),
      progress: workflow.progress,
    });
    warn!(workflow_id = %workflow.workflow_id, "workflow failed");
  } else {
    workflow.status = WorkflowStatus::Completed;
    workflow.progress = 100.0;
    events.push(AgentEvent::WorkflowCompleted {
      workflow_id: workflow.workflow_id.clone(),
      progress: workflow.progress,
    });
    info!(workflow_id = %workflow.workflow_id, "workflow completed");
  }
}
