//! Lock request/release orchestration for one agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

use verbena_events::{AgentEvent, Notifier};
use verbena_workflow::Priority;

use crate::deadlock::DeadlockDetector;
use crate::error::LockError;
use crate::lock::{LockState, LockStatus, ResourceLock, Waiter};

/// Which waiter a released lock is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrantStrategy {
  /// Earliest requester first.
  #[default]
  Fifo,
  /// Highest-priority waiter first, FIFO among equal priorities.
  Priority,
}

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
  /// Lease applied when a lock is handed to a waiter whose requested
  /// timeout is unknown (next-waiter grants, peer grants). The new owner
  /// re-stamps the lease with its own timeout when it observes the grant.
  pub default_lease: Duration,
  /// Fallback wakeup interval while waiting for a grant. Releases wake
  /// waiters immediately through a notify; the poll bounds the worst case.
  pub poll_interval: Duration,
  pub grant_strategy: GrantStrategy,
}

impl Default for CoordinatorConfig {
  fn default() -> Self {
    Self {
      default_lease: Duration::from_secs(60),
      poll_interval: Duration::from_millis(100),
      grant_strategy: GrantStrategy::Fifo,
    }
  }
}

/// Coordinates exclusive access to named resources for one agent.
///
/// The lock table, waiter queues and wait-for graph are all local to this
/// agent and mutated only under one mutex. The waiting portion of a
/// request never holds that mutex across a suspension point, so peer
/// requests are never blocked behind one waiter's sleep. Peer broadcasts
/// are folded in through [`apply_event`](Self::apply_event).
pub struct ResourceCoordinator {
  agent_id: String,
  locks: Mutex<HashMap<String, ResourceLock>>,
  detector: DeadlockDetector,
  notifier: Arc<dyn Notifier>,
  wake: Notify,
  config: CoordinatorConfig,
}

impl ResourceCoordinator {
  pub fn new(agent_id: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
    Self::with_config(agent_id, notifier, CoordinatorConfig::default())
  }

  pub fn with_config(
    agent_id: impl Into<String>,
    notifier: Arc<dyn Notifier>,
    config: CoordinatorConfig,
  ) -> Self {
    Self {
      agent_id: agent_id.into(),
      locks: Mutex::new(HashMap::new()),
      detector: DeadlockDetector::new(),
      notifier: Arc::clone(&notifier),
      wake: Notify::new(),
      config,
    }
  }

  pub fn agent_id(&self) -> &str {
    &self.agent_id
  }

  pub fn detector(&self) -> &DeadlockDetector {
    &self.detector
  }

  /// Request exclusive access to a resource.
  ///
  /// Grants immediately when the resource is free or its owner's lease has
  /// expired; re-requesting an already-owned resource is a no-op success.
  /// Otherwise the caller queues as a waiter (at most once) and waits
  /// until granted, until `timeout` passes, or until a deadlock cycle
  /// containing this agent is detected — in which case every pending wait
  /// of this agent is withdrawn and the call fails.
  pub async fn request_lock(
    &self,
    resource_id: &str,
    priority: Priority,
    timeout: Duration,
  ) -> Result<(), LockError> {
    let deadline = Instant::now() + timeout;
    let mut granted = false;

    {
      let mut locks = self.locks.lock().unwrap();
      let lock = locks
        .entry(resource_id.to_string())
        .or_insert_with(|| ResourceLock::new(resource_id));

      if lock.owner_agent.as_deref() == Some(self.agent_id.as_str()) {
        return Ok(());
      }

      if lock.owner_agent.is_none() || lock.is_expired() {
        self.take_over(lock, priority, timeout);
        granted = true;
      } else {
        if !lock.has_waiter(&self.agent_id) {
          lock.waiters.push(Waiter {
            agent_id: self.agent_id.clone(),
            priority,
            enqueued_at: Instant::now(),
          });
        }
        if let Some(owner) = &lock.owner_agent {
          self.detector.add_wait_edge(&self.agent_id, owner);
        }
      }
    }

    if granted {
      self.notifier.broadcast(
        &self.agent_id,
        AgentEvent::LockGranted {
          resource_id: resource_id.to_string(),
          agent_id: self.agent_id.clone(),
        },
      );
      return Ok(());
    }

    self.notifier.broadcast(
      &self.agent_id,
      AgentEvent::LockRequested {
        resource_id: resource_id.to_string(),
        agent_id: self.agent_id.clone(),
        priority,
      },
    );

    self.wait_for_grant(resource_id, priority, timeout, deadline).await
  }

  /// Release a lock held by this agent and hand it to the next eligible
  /// waiter.
  pub fn release_lock(&self, resource_id: &str) -> Result<(), LockError> {
    let granted_event;
    {
      let mut locks = self.locks.lock().unwrap();
      let lock = locks.get_mut(resource_id).ok_or_else(|| LockError::NotOwner {
        resource_id: resource_id.to_string(),
        agent_id: self.agent_id.clone(),
      })?;

      if lock.owner_agent.as_deref() != Some(self.agent_id.as_str()) {
        return Err(LockError::NotOwner {
          resource_id: resource_id.to_string(),
          agent_id: self.agent_id.clone(),
        });
      }

      // Former waiters no longer wait on this agent.
      for waiter in &lock.waiters {
        self.detector.remove_wait_edge(&waiter.agent_id, &self.agent_id);
      }
      lock.clear_owner(LockState::Released);
      self.detector.clear_owner(resource_id);

      granted_event = self.grant_to_next_waiter(lock);
    }

    self.notifier.broadcast(
      &self.agent_id,
      AgentEvent::LockReleased {
        resource_id: resource_id.to_string(),
        agent_id: self.agent_id.clone(),
      },
    );
    if let Some(event) = granted_event {
      self.notifier.broadcast(&self.agent_id, event);
    }
    self.wake.notify_waiters();
    Ok(())
  }

  /// Snapshot of one lock, if the resource has ever been touched.
  pub fn lock_status(&self, resource_id: &str) -> Option<LockStatus> {
    let locks = self.locks.lock().unwrap();
    locks.get(resource_id).map(|lock| lock.status())
  }

  /// Snapshot of every known lock, sorted by resource id.
  pub fn all_locks_status(&self) -> Vec<LockStatus> {
    let locks = self.locks.lock().unwrap();
    let mut statuses: Vec<LockStatus> = locks.values().map(|lock| lock.status()).collect();
    statuses.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
    statuses
  }

  /// Number of locks this agent currently holds.
  pub fn locks_held(&self) -> usize {
    let locks = self.locks.lock().unwrap();
    locks
      .values()
      .filter(|lock| lock.owner_agent.as_deref() == Some(self.agent_id.as_str()))
      .count()
  }

  /// Release every lock whose lease expired while an owner is still
  /// recorded, handing each to its next waiter. Returns the number of
  /// locks reclaimed. Guards against a crashed or hung holder starving
  /// all waiters; called periodically by the engine.
  pub fn cleanup_expired_locks(&self) -> usize {
    let mut events = Vec::new();
    let mut reclaimed = 0usize;

    {
      let mut locks = self.locks.lock().unwrap();
      for lock in locks.values_mut() {
        if !lock.is_expired() {
          continue;
        }
        let Some(previous) = lock.owner_agent.clone() else {
          continue;
        };
        warn!(
          resource_id = %lock.resource_id,
          owner = %previous,
          "releasing expired lock"
        );
        for waiter in &lock.waiters {
          self.detector.remove_wait_edge(&waiter.agent_id, &previous);
        }
        lock.clear_owner(LockState::Released);
        self.detector.clear_owner(&lock.resource_id);
        events.push(AgentEvent::LockReleased {
          resource_id: lock.resource_id.clone(),
          agent_id: previous,
        });
        if let Some(granted) = self.grant_to_next_waiter(lock) {
          events.push(granted);
        }
        reclaimed += 1;
      }
    }

    for event in events {
      self.notifier.broadcast(&self.agent_id, event);
    }
    if reclaimed > 0 {
      self.wake.notify_waiters();
    }
    reclaimed
  }

  /// Fold a peer's broadcast into the local lock table and wait-for graph.
  ///
  /// The physical transport is out of scope; whatever receives events for
  /// this agent hands them here. Lock events keep the local view
  /// synchronized — including remote waits, which is what lets the local
  /// detector see cross-agent cycles. Other event kinds are not the
  /// coordinator's concern and are ignored.
  pub fn apply_event(&self, from_agent: &str, event: &AgentEvent) {
    if from_agent == self.agent_id {
      return;
    }

    match event {
      AgentEvent::LockRequested {
        resource_id,
        agent_id,
        priority,
      } => {
        let mut locks = self.locks.lock().unwrap();
        let lock = locks
          .entry(resource_id.clone())
          .or_insert_with(|| ResourceLock::new(resource_id.clone()));
        if lock.owner_agent.as_deref() != Some(agent_id.as_str()) && !lock.has_waiter(agent_id) {
          lock.waiters.push(Waiter {
            agent_id: agent_id.clone(),
            priority: *priority,
            enqueued_at: Instant::now(),
          });
        }
        if let Some(owner) = &lock.owner_agent {
          if owner != agent_id {
            self.detector.add_wait_edge(agent_id, owner);
          }
        }
      }

      AgentEvent::LockGranted {
        resource_id,
        agent_id,
      } => {
        {
          let mut locks = self.locks.lock().unwrap();
          let lock = locks
            .entry(resource_id.clone())
            .or_insert_with(|| ResourceLock::new(resource_id.clone()));
          let previous = lock.owner_agent.clone();
          if previous.as_deref() == Some(agent_id.as_str()) {
            return;
          }
          // Everyone queued here stops waiting on the former owner and
          // starts waiting on the new one.
          if let Some(prev) = &previous {
            for waiter in &lock.waiters {
              self.detector.remove_wait_edge(&waiter.agent_id, prev);
            }
          }
          let priority = lock
            .waiters
            .iter()
            .find(|w| w.agent_id == *agent_id)
            .map(|w| w.priority)
            .unwrap_or_default();
          lock.remove_waiter(agent_id);
          lock.grant_to(agent_id, priority, self.config.default_lease);
          for waiter in &lock.waiters {
            self.detector.add_wait_edge(&waiter.agent_id, agent_id);
          }
          self.detector.record_owner(resource_id, agent_id);
        }
        self.wake.notify_waiters();
      }

      AgentEvent::LockReleased {
        resource_id,
        agent_id,
      } => {
        {
          let mut locks = self.locks.lock().unwrap();
          if let Some(lock) = locks.get_mut(resource_id) {
            if lock.owner_agent.as_deref() == Some(agent_id.as_str()) {
              for waiter in &lock.waiters {
                self.detector.remove_wait_edge(&waiter.agent_id, agent_id);
              }
              // Waiters left behind mean the releaser is about to hand
              // the lock to one of them; its grant event resolves this.
              let state = if lock.waiters.is_empty() {
                LockState::Available
              } else {
                LockState::Requested
              };
              lock.clear_owner(state);
              self.detector.clear_owner(resource_id);
            }
          }
        }
        self.wake.notify_waiters();
      }

      AgentEvent::DeadlockDetected { cycle, .. } => {
        if cycle.contains(&self.agent_id) {
          debug!(cycle = ?cycle, "peer reported a deadlock cycle involving this agent");
        }
      }

      _ => {}
    }
  }

  /// Grant the lock to this agent, reclaiming an expired lease if one is
  /// still recorded.
  fn take_over(&self, lock: &mut ResourceLock, priority: Priority, lease: Duration) {
    if let Some(previous) = lock.owner_agent.clone() {
      warn!(
        resource_id = %lock.resource_id,
        previous_owner = %previous,
        "reclaiming expired lock"
      );
      for waiter in &lock.waiters {
        self.detector.remove_wait_edge(&waiter.agent_id, &previous);
      }
    }
    lock.remove_waiter(&self.agent_id);
    lock.grant_to(&self.agent_id, priority, lease);
    for waiter in &lock.waiters {
      self.detector.add_wait_edge(&waiter.agent_id, &self.agent_id);
    }
    self.detector.record_owner(&lock.resource_id, &self.agent_id);
  }

  /// The waiting half of a lock request. Wakes on release/grant notifies,
  /// falls back to the poll interval (which also bounds the window between
  /// a state check and wakeup registration), and re-checks the table,
  /// deadlock state and deadline each pass.
  async fn wait_for_grant(
    &self,
    resource_id: &str,
    priority: Priority,
    lease: Duration,
    deadline: Instant,
  ) -> Result<(), LockError> {
    loop {
      let mut granted = false;
      {
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get_mut(resource_id) {
          if lock.owner_agent.as_deref() == Some(self.agent_id.as_str()) {
            // A peer handed the lock over; re-stamp the lease with this
            // request's timeout.
            lock.expires_at = Some(Instant::now() + lease);
            lock.priority = priority;
            lock.remove_waiter(&self.agent_id);
            return Ok(());
          }

          if lock.is_expired() && lock.owner_agent.is_some() {
            self.take_over(lock, priority, lease);
            granted = true;
          } else if lock.owner_agent.is_none() {
            // Freed without a direct hand-off. Take it only if this agent
            // is the next eligible waiter, so queue order holds.
            let next_is_us = self
              .next_waiter_index(&lock.waiters)
              .map(|i| lock.waiters[i].agent_id == self.agent_id)
              .unwrap_or(true);
            if next_is_us {
              self.take_over(lock, priority, lease);
              granted = true;
            }
          }
        } else {
          // Unknown entry: nothing holds the resource, claim it.
          let lock = locks
            .entry(resource_id.to_string())
            .or_insert_with(|| ResourceLock::new(resource_id));
          lock.grant_to(&self.agent_id, priority, lease);
          self.detector.record_owner(resource_id, &self.agent_id);
          granted = true;
        }
      }

      if granted {
        self.notifier.broadcast(
          &self.agent_id,
          AgentEvent::LockGranted {
            resource_id: resource_id.to_string(),
            agent_id: self.agent_id.clone(),
          },
        );
        return Ok(());
      }

      if let Some(cycle) = self.detector.detect_cycle() {
        if cycle.contains(&self.agent_id) {
          let info = self.detector.describe(&cycle);
          warn!(
            agent_id = %self.agent_id,
            cycle = ?info.cycle,
            "deadlock detected, withdrawing all pending requests"
          );
          self.notifier.broadcast(
            &self.agent_id,
            AgentEvent::DeadlockDetected {
              cycle: info.cycle.clone(),
              resources: info.resources.clone(),
              resolution: info.resolution.clone(),
            },
          );
          self.abort_own_waits();
          return Err(LockError::Deadlock { info });
        }
      }

      let now = Instant::now();
      if now >= deadline {
        self.withdraw(resource_id);
        return Err(LockError::Timeout {
          resource_id: resource_id.to_string(),
        });
      }

      let sleep_for = self.config.poll_interval.min(deadline - now);
      tokio::select! {
        _ = self.wake.notified() => {}
        _ = tokio::time::sleep(sleep_for) => {}
      }
    }
  }

  /// Remove this agent from one resource's waiter queue and drop its wait
  /// edge for that resource.
  fn withdraw(&self, resource_id: &str) {
    let mut locks = self.locks.lock().unwrap();
    if let Some(lock) = locks.get_mut(resource_id) {
      lock.remove_waiter(&self.agent_id);
      if let Some(owner) = &lock.owner_agent {
        self.detector.remove_wait_edge(&self.agent_id, owner);
      }
    }
  }

  /// Self-sacrifice: withdraw from every waiter queue and clear every
  /// outgoing wait edge of this agent.
  fn abort_own_waits(&self) {
    let mut locks = self.locks.lock().unwrap();
    for lock in locks.values_mut() {
      lock.remove_waiter(&self.agent_id);
    }
    self.detector.clear_waiter(&self.agent_id);
  }

  /// Hand a released lock to the next waiter per the grant strategy.
  /// Returns the grant event to broadcast, if anyone was waiting.
  fn grant_to_next_waiter(&self, lock: &mut ResourceLock) -> Option<AgentEvent> {
    let Some(index) = self.next_waiter_index(&lock.waiters) else {
      lock.state = LockState::Available;
      return None;
    };

    let next = lock.waiters.remove(index);
    lock.grant_to(&next.agent_id, next.priority, self.config.default_lease);
    self.detector.record_owner(&lock.resource_id, &next.agent_id);
    for waiter in &lock.waiters {
      self.detector.add_wait_edge(&waiter.agent_id, &next.agent_id);
    }

    Some(AgentEvent::LockGranted {
      resource_id: lock.resource_id.clone(),
      agent_id: next.agent_id,
    })
  }

  /// Index of the waiter the strategy would grant to next.
  fn next_waiter_index(&self, waiters: &[Waiter]) -> Option<usize> {
    if waiters.is_empty() {
      return None;
    }
    match self.config.grant_strategy {
      GrantStrategy::Fifo => Some(0),
      GrantStrategy::Priority => {
        // Strict-greater scan keeps FIFO order among equal priorities.
        let mut best = 0;
        for (i, waiter) in waiters.iter().enumerate().skip(1) {
          if waiter.priority > waiters[best].priority {
            best = i;
          }
        }
        Some(best)
      }
    }
  }
}
