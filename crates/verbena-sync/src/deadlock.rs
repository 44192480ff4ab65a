//! Wait-for graph maintenance and cycle detection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The fixed resolution policy: the blocked agent that observes the cycle
/// withdraws all of its own pending requests.
pub const RESOLUTION_SELF_ABORT: &str = "youngest_dies";

/// Output of a detection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockInfo {
  /// Agents forming the cycle, in traversal order.
  pub cycle: Vec<String>,
  /// Resources owned by the cycle members.
  pub resources: Vec<String>,
  /// Detection time, epoch milliseconds.
  pub detected_at_ms: u64,
  pub resolution: String,
}

/// Maintains one agent's wait-for graph and detects cycles in it.
///
/// An edge `A -> B` means agent A is blocked on a resource owned by B.
/// Edges are added when a wait begins and removed when it ends. The whole
/// graph sits behind a single mutex so detection may run concurrently with
/// edge mutation.
#[derive(Debug, Default)]
pub struct DeadlockDetector {
  inner: Mutex<Graph>,
}

#[derive(Debug, Default)]
struct Graph {
  /// waiter -> holders it is blocked on. BTree iteration keeps detection
  /// deterministic.
  edges: BTreeMap<String, BTreeSet<String>>,
  /// resource -> current owner, used to describe detected cycles.
  owners: BTreeMap<String, String>,
}

impl DeadlockDetector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_wait_edge(&self, waiter: &str, holder: &str) {
    let mut graph = self.inner.lock().unwrap();
    graph
      .edges
      .entry(waiter.to_string())
      .or_default()
      .insert(holder.to_string());
  }

  pub fn remove_wait_edge(&self, waiter: &str, holder: &str) {
    let mut graph = self.inner.lock().unwrap();
    if let Some(holders) = graph.edges.get_mut(waiter) {
      holders.remove(holder);
      if holders.is_empty() {
        graph.edges.remove(waiter);
      }
    }
  }

  /// Remove every edge originating from `waiter`.
  pub fn clear_waiter(&self, waiter: &str) {
    let mut graph = self.inner.lock().unwrap();
    graph.edges.remove(waiter);
  }

  pub fn record_owner(&self, resource_id: &str, owner: &str) {
    let mut graph = self.inner.lock().unwrap();
    graph
      .owners
      .insert(resource_id.to_string(), owner.to_string());
  }

  pub fn clear_owner(&self, resource_id: &str) {
    let mut graph = self.inner.lock().unwrap();
    graph.owners.remove(resource_id);
  }

  /// Look for a cycle in the wait-for graph.
  ///
  /// Depth-first search from every unvisited node with a recursion stack;
  /// the first revisit of an on-stack node yields the cycle as the
  /// sub-path from that node up to the revisit. Deterministic given the
  /// graph contents.
  pub fn detect_cycle(&self) -> Option<Vec<String>> {
    let graph = self.inner.lock().unwrap();
    let mut visited: HashSet<&String> = HashSet::new();

    for start in graph.edges.keys() {
      if visited.contains(start) {
        continue;
      }
      let mut on_stack: HashSet<&String> = HashSet::new();
      let mut path: Vec<&String> = Vec::new();
      if let Some(cycle) = dfs(&graph.edges, start, &mut visited, &mut on_stack, &mut path) {
        return Some(cycle);
      }
    }
    None
  }

  /// Map an agent cycle to the resources its members currently own.
  pub fn describe(&self, cycle: &[String]) -> DeadlockInfo {
    let graph = self.inner.lock().unwrap();
    let members: HashSet<&String> = cycle.iter().collect();
    let resources: Vec<String> = graph
      .owners
      .iter()
      .filter(|(_, owner)| members.contains(owner))
      .map(|(resource, _)| resource.clone())
      .collect();

    DeadlockInfo {
      cycle: cycle.to_vec(),
      resources,
      detected_at_ms: epoch_ms(),
      resolution: RESOLUTION_SELF_ABORT.to_string(),
    }
  }
}

fn dfs<'a>(
  edges: &'a BTreeMap<String, BTreeSet<String>>,
  node: &'a String,
  visited: &mut HashSet<&'a String>,
  on_stack: &mut HashSet<&'a String>,
  path: &mut Vec<&'a String>,
) -> Option<Vec<String>> {
  if on_stack.contains(node) {
    let start = path.iter().position(|n| *n == node).unwrap_or(0);
    return Some(path[start..].iter().map(|n| (*n).clone()).collect());
  }
  if visited.contains(node) {
    return None;
  }

  visited.insert(node);
  on_stack.insert(node);
  path.push(node);

  if let Some(holders) = edges.get(node) {
    for holder in holders {
      if let Some(cycle) = dfs(edges, holder, visited, on_stack, path) {
        return Some(cycle);
      }
    }
  }

  path.pop();
  on_stack.remove(node);
  None
}

fn epoch_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_graph_has_no_cycle() {
    let detector = DeadlockDetector::new();
    assert!(detector.detect_cycle().is_none());
  }

  #[test]
  fn chain_without_cycle_is_clean() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("a", "b");
    detector.add_wait_edge("b", "c");
    assert!(detector.detect_cycle().is_none());
  }

  #[test]
  fn two_agent_cycle_is_found_in_one_pass() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("agent1", "agent2");
    detector.add_wait_edge("agent2", "agent1");

    let cycle = detector.detect_cycle().expect("cycle expected");
    assert_eq!(cycle.len(), 2);
    assert!(cycle.contains(&"agent1".to_string()));
    assert!(cycle.contains(&"agent2".to_string()));
  }

  #[test]
  fn three_agent_cycle_preserves_traversal_order() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("a", "b");
    detector.add_wait_edge("b", "c");
    detector.add_wait_edge("c", "a");

    let cycle = detector.detect_cycle().expect("cycle expected");
    assert_eq!(cycle, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
  }

  #[test]
  fn detection_is_deterministic() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("x", "y");
    detector.add_wait_edge("y", "x");
    detector.add_wait_edge("m", "n");
    detector.add_wait_edge("n", "m");

    // Two disjoint cycles; BTree ordering means the "m"/"n" cycle is
    // always reported first.
    let first = detector.detect_cycle().expect("cycle expected");
    let second = detector.detect_cycle().expect("cycle expected");
    assert_eq!(first, second);
    assert_eq!(first[0], "m");
  }

  #[test]
  fn removing_an_edge_breaks_the_cycle() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("agent1", "agent2");
    detector.add_wait_edge("agent2", "agent1");
    detector.remove_wait_edge("agent2", "agent1");
    assert!(detector.detect_cycle().is_none());
  }

  #[test]
  fn clear_waiter_drops_all_outgoing_edges() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("a", "b");
    detector.add_wait_edge("a", "c");
    detector.add_wait_edge("b", "a");
    detector.clear_waiter("a");
    assert!(detector.detect_cycle().is_none());
  }

  #[test]
  fn describe_collects_cycle_member_resources() {
    let detector = DeadlockDetector::new();
    detector.add_wait_edge("agent1", "agent2");
    detector.add_wait_edge("agent2", "agent1");
    detector.record_owner("db", "agent1");
    detector.record_owner("cache", "agent2");
    detector.record_owner("log", "agent3");

    let cycle = detector.detect_cycle().expect("cycle expected");
    let info = detector.describe(&cycle);
    assert_eq!(info.resolution, RESOLUTION_SELF_ABORT);
    assert!(info.resources.contains(&"db".to_string()));
    assert!(info.resources.contains(&"cache".to_string()));
    assert!(!info.resources.contains(&"log".to_string()));
  }
}
