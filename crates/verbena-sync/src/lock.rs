//! Per-resource lock state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use verbena_workflow::Priority;

/// State of a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
  /// No owner, no pending hand-off.
  Available,
  /// A hand-off to a waiter is pending.
  Requested,
  /// Exclusively held by `owner_agent`.
  Granted,
  /// Just released; becomes `Available` once the waiter queue drains.
  Released,
}

/// An agent queued behind a held lock. The queue is FIFO by arrival; the
/// recorded priority feeds the priority grant strategy.
#[derive(Debug, Clone)]
pub struct Waiter {
  pub agent_id: String,
  pub priority: Priority,
  pub enqueued_at: Instant,
}

/// Mutable state of one named resource.
///
/// `owner_agent` is `Some` exactly when `state` is `Granted`. A past
/// `expires_at` makes the lock reclaimable regardless of the recorded
/// owner.
#[derive(Debug, Clone)]
pub struct ResourceLock {
  pub resource_id: String,
  pub owner_agent: Option<String>,
  pub state: LockState,
  pub requested_at: Instant,
  pub granted_at: Option<Instant>,
  pub expires_at: Option<Instant>,
  pub waiters: Vec<Waiter>,
  /// Priority of the current holder.
  pub priority: Priority,
}

impl ResourceLock {
  pub fn new(resource_id: impl Into<String>) -> Self {
    Self {
      resource_id: resource_id.into(),
      owner_agent: None,
      state: LockState::Available,
      requested_at: Instant::now(),
      granted_at: None,
      expires_at: None,
      waiters: Vec::new(),
      priority: Priority::Normal,
    }
  }

  /// True once the holder's lease ran out.
  pub fn is_expired(&self) -> bool {
    self.expires_at.is_some_and(|at| Instant::now() > at)
  }

  /// How long the current holder has held the lock.
  pub fn time_held(&self) -> Option<Duration> {
    self.granted_at.map(|at| at.elapsed())
  }

  pub(crate) fn has_waiter(&self, agent_id: &str) -> bool {
    self.waiters.iter().any(|w| w.agent_id == agent_id)
  }

  pub(crate) fn remove_waiter(&mut self, agent_id: &str) {
    self.waiters.retain(|w| w.agent_id != agent_id);
  }

  /// Hand the lock to `agent_id` with a fresh lease.
  pub(crate) fn grant_to(&mut self, agent_id: &str, priority: Priority, lease: Duration) {
    let now = Instant::now();
    self.owner_agent = Some(agent_id.to_string());
    self.state = LockState::Granted;
    self.granted_at = Some(now);
    self.expires_at = Some(now + lease);
    self.priority = priority;
  }

  /// Drop ownership and lease stamps, leaving the lock in `state`.
  pub(crate) fn clear_owner(&mut self, state: LockState) {
    self.owner_agent = None;
    self.granted_at = None;
    self.expires_at = None;
    self.state = state;
  }

  /// Read-only snapshot for observability.
  pub fn status(&self) -> LockStatus {
    LockStatus {
      resource_id: self.resource_id.clone(),
      state: self.state,
      owner_agent: self.owner_agent.clone(),
      waiters: self.waiters.iter().map(|w| w.agent_id.clone()).collect(),
      time_held_ms: self.time_held().map(|d| d.as_millis() as u64),
      expired: self.is_expired(),
      priority: self.priority,
    }
  }
}

/// Snapshot of a lock's state. Never mutates anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatus {
  pub resource_id: String,
  pub state: LockState,
  pub owner_agent: Option<String>,
  pub waiters: Vec<String>,
  pub time_held_ms: Option<u64>,
  pub expired: bool,
  pub priority: Priority,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_lock_is_available_and_unexpired() {
    let lock = ResourceLock::new("db");
    assert_eq!(lock.state, LockState::Available);
    assert!(lock.owner_agent.is_none());
    assert!(!lock.is_expired());
    assert!(lock.time_held().is_none());
  }

  #[test]
  fn grant_sets_owner_and_lease() {
    let mut lock = ResourceLock::new("db");
    lock.grant_to("agent1", Priority::High, Duration::from_secs(60));
    assert_eq!(lock.state, LockState::Granted);
    assert_eq!(lock.owner_agent.as_deref(), Some("agent1"));
    assert!(!lock.is_expired());
    assert_eq!(lock.priority, Priority::High);
  }

  #[test]
  fn zero_lease_expires_immediately() {
    let mut lock = ResourceLock::new("db");
    lock.grant_to("agent1", Priority::Normal, Duration::ZERO);
    std::thread::sleep(Duration::from_millis(5));
    assert!(lock.is_expired());
  }

  #[test]
  fn clear_owner_resets_stamps() {
    let mut lock = ResourceLock::new("db");
    lock.grant_to("agent1", Priority::Normal, Duration::from_secs(60));
    lock.clear_owner(LockState::Released);
    assert!(lock.owner_agent.is_none());
    assert!(lock.granted_at.is_none());
    assert!(lock.expires_at.is_none());
    assert_eq!(lock.state, LockState::Released);
  }
}
