//! Dependency-graph utilities: structure queries and cycle detection.

use std::collections::{HashMap, VecDeque};

use crate::error::ValidationError;
use crate::workflow::WorkflowDefinition;

/// Adjacency view over a workflow's dependency relation.
///
/// Edges point from a dependency to its dependents, so a topological walk
/// follows completion order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
  /// dependency id -> tasks that wait on it.
  dependents: HashMap<String, Vec<String>>,
  /// task id -> number of unmet dependencies.
  in_degree: HashMap<String, usize>,
}

impl DependencyGraph {
  /// Build the graph from a workflow's tasks.
  ///
  /// Fails on a dependency reference that names no task in the workflow,
  /// and on self-loops.
  pub fn new(workflow: &WorkflowDefinition) -> Result<Self, ValidationError> {
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    let mut in_degree: HashMap<String, usize> = HashMap::new();

    for task in workflow.tasks() {
      dependents.entry(task.task_id.clone()).or_default();
      in_degree.insert(task.task_id.clone(), task.dependencies.len());
    }

    for task in workflow.tasks() {
      for dependency in &task.dependencies {
        if dependency == &task.task_id {
          return Err(ValidationError::SelfDependency(task.task_id.clone()));
        }
        if workflow.task(dependency).is_none() {
          return Err(ValidationError::UnknownDependency {
            task_id: task.task_id.clone(),
            dependency_id: dependency.clone(),
          });
        }
        dependents
          .entry(dependency.clone())
          .or_default()
          .push(task.task_id.clone());
      }
    }

    Ok(Self {
      dependents,
      in_degree,
    })
  }

  /// Tasks that depend on the given task.
  pub fn dependents(&self, task_id: &str) -> &[String] {
    self
      .dependents
      .get(task_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Run Kahn's algorithm over the relation.
  ///
  /// Returns the sorted ids of every task left unprocessed once the
  /// zero-in-degree frontier is exhausted; empty when the relation is a DAG.
  pub fn cycle_members(&self) -> Vec<String> {
    let mut in_degree = self.in_degree.clone();
    let mut queue: VecDeque<String> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(id, _)| id.clone())
      .collect();

    let mut processed = 0usize;
    while let Some(current) = queue.pop_front() {
      processed += 1;
      for dependent in self.dependents(&current) {
        if let Some(degree) = in_degree.get_mut(dependent) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(dependent.clone());
          }
        }
      }
    }

    if processed == in_degree.len() {
      return Vec::new();
    }

    let mut remaining: Vec<String> = in_degree
      .into_iter()
      .filter(|(_, degree)| *degree > 0)
      .map(|(id, _)| id)
      .collect();
    remaining.sort();
    remaining
  }
}

/// Validate a workflow's dependency relation.
///
/// Runs once at submission: unknown references and self-loops are rejected
/// first, then Kahn's ordering flags any cycle. A failing workflow is
/// rejected before any task executes.
pub fn validate(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
  let graph = DependencyGraph::new(workflow)?;
  let cycle = graph.cycle_members();
  if cycle.is_empty() {
    Ok(())
  } else {
    Err(ValidationError::CyclicDependencies(cycle))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::task::TaskDefinition;
  use crate::work::{Work, work_fn};
  use crate::workflow::ExecutionStrategy;

  fn noop() -> Arc<dyn Work> {
    work_fn(|| async { Ok(serde_json::Value::Null) })
  }

  fn workflow(edges: &[(&str, &[&str])]) -> WorkflowDefinition {
    let mut wf = WorkflowDefinition::new("wf", "test", ExecutionStrategy::Parallel);
    for (id, deps) in edges {
      let task =
        TaskDefinition::new(*id, *id, noop()).with_dependencies(deps.iter().copied());
      wf.add_task(task).unwrap();
    }
    wf
  }

  #[test]
  fn acyclic_workflow_validates() {
    let wf = workflow(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
    assert!(validate(&wf).is_ok());
  }

  #[test]
  fn two_task_cycle_is_reported_exactly() {
    let wf = workflow(&[("a", &["b"]), ("b", &["a"])]);
    let err = validate(&wf).unwrap_err();
    assert_eq!(
      err,
      ValidationError::CyclicDependencies(vec!["a".to_string(), "b".to_string()])
    );
  }

  #[test]
  fn cycle_set_excludes_upstream_tasks() {
    // "root" feeds the cycle but is not part of it; Kahn processes it.
    let wf = workflow(&[
      ("root", &[]),
      ("x", &["root", "y"]),
      ("y", &["x"]),
    ]);
    let err = validate(&wf).unwrap_err();
    assert_eq!(
      err,
      ValidationError::CyclicDependencies(vec!["x".to_string(), "y".to_string()])
    );
  }

  #[test]
  fn unknown_dependency_is_rejected_before_cycle_check() {
    let wf = workflow(&[("a", &["ghost"])]);
    let err = validate(&wf).unwrap_err();
    assert_eq!(
      err,
      ValidationError::UnknownDependency {
        task_id: "a".to_string(),
        dependency_id: "ghost".to_string(),
      }
    );
  }

  #[test]
  fn empty_workflow_validates() {
    let wf = WorkflowDefinition::new("wf", "empty", ExecutionStrategy::Sequential);
    assert!(validate(&wf).is_ok());
  }

  #[test]
  fn three_task_cycle_members_are_sorted() {
    let wf = workflow(&[("c", &["b"]), ("b", &["a"]), ("a", &["c"])]);
    let err = validate(&wf).unwrap_err();
    assert_eq!(
      err,
      ValidationError::CyclicDependencies(vec![
        "a".to_string(),
        "b".to_string(),
        "c".to_string()
      ])
    );
  }
}
