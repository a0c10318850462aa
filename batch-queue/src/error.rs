use std::{error::Error, sync::Arc};
use thiserror::Error;

/// Failures of the queue itself, as opposed to failures of an individual task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
  #[error("worker pool is saturated")]
  PoolSaturated,
  #[error("worker pool is closed")]
  PoolClosed,
  #[error("submission dropped before all tasks finished")]
  Abandoned,
}

/// Terminal error of a single task. [`Clone`] so that one failure can be set on every task of a batch
#[derive(Error, Debug, Clone)]
pub enum TaskError {
  /// The task deadline passed before it could be admitted into a partition
  #[error("task timed out in queue")]
  TimedOut,
  /// The batch containing the task could not be handed to the worker pool
  #[error("failed to dispatch batch: {0}")]
  Dispatch(#[from] QueueError),
  /// Reported by the handler via [`crate::task::QueueTask::set_error`]
  #[error("{0}")]
  Handler(Arc<dyn Error + Send + Sync>),
  /// The handler returned without resolving the task
  #[error("task left unresolved by handler")]
  Unresolved,
  /// The handler panicked before resolving the task
  #[error("handler panicked before resolving task")]
  HandlerPanicked,
}

impl TaskError {
  pub fn handler<E>(err: E) -> Self
  where
    E: Error + Send + Sync + 'static,
  {
    TaskError::Handler(Arc::new(err))
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, TaskError::TimedOut)
  }
}
