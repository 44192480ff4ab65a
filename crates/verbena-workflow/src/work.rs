//! The opaque unit of work attached to a task.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Error raised by a failing unit of work.
///
/// Work is opaque to the engine, so the error carries only a message. A
/// work timeout is folded into the same path by the executor.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct WorkError(pub String);

impl WorkError {
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

/// A unit of work supplied by whatever domain uses the scheduler.
///
/// Implementations execute and either return a JSON result or fail. The
/// engine imposes no other contract: work may itself call back into
/// resource-requiring logic.
#[async_trait]
pub trait Work: Send + Sync {
  async fn run(&self) -> Result<serde_json::Value, WorkError>;
}

struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<serde_json::Value, WorkError>> + Send + 'static,
{
  async fn run(&self) -> Result<serde_json::Value, WorkError> {
    (self.0)().await
  }
}

/// Lift a plain async closure into a [`Work`] trait object.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<serde_json::Value, WorkError>> + Send + 'static,
{
  Arc::new(FnWork(f))
}
