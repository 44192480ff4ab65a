//! Resource coordination for verbena agents.
//!
//! Each agent owns one [`ResourceCoordinator`] with its own lock table and
//! wait-for graph. Exclusive, time-bounded locks over named resources are
//! requested and released through it; a [`DeadlockDetector`] watches the
//! wait-for graph and blocked agents break cycles by withdrawing their own
//! pending requests. Cross-agent knowledge arrives only through broadcast
//! events folded in via [`ResourceCoordinator::apply_event`] — there is no
//! shared memory between agents.

mod coordinator;
mod deadlock;
mod error;
mod lock;

pub use coordinator::{CoordinatorConfig, GrantStrategy, ResourceCoordinator};
pub use deadlock::{DeadlockDetector, DeadlockInfo, RESOLUTION_SELF_ABORT};
pub use error::LockError;
pub use lock::{LockState, LockStatus, ResourceLock, Waiter};
