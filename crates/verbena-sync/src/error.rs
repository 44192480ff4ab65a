use thiserror::Error;

use crate::deadlock::DeadlockInfo;

/// Errors from lock acquisition and release.
///
/// None of these are fatal: a timeout or deadlock is a failed acquisition
/// the caller may retry, and ownership violations are contract errors
/// surfaced to the caller.
#[derive(Debug, Clone, Error)]
pub enum LockError {
  /// The deadline passed before the resource was granted.
  #[error("timed out waiting for resource `{resource_id}`")]
  Timeout { resource_id: String },

  /// A wait-for cycle involving this agent was detected. All of this
  /// agent's pending requests were withdrawn to break the cycle.
  #[error("deadlock detected across agents: {}", .info.cycle.join(" -> "))]
  Deadlock { info: DeadlockInfo },

  /// Only the current owner may release a lock.
  #[error("agent `{agent_id}` does not own resource `{resource_id}`")]
  NotOwner {
    resource_id: String,
    agent_id: String,
  },
}
