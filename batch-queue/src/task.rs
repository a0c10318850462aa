use crate::{error::TaskError, key::Key};
use crossbeam::atomic::AtomicCell;
use itertools::Itertools;
use once_cell::sync::OnceCell;
use std::{
  sync::Arc,
  time::{Duration, Instant},
};

/// Completion callback bound to every task by [`crate::queue::BatchQueue::push`]
pub type FinishFn = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work that can be batched by partition. Tasks are shared as [`Arc<Self>`] between the caller, who reads the outcome once the submission completes, and the queue, which resolves it.
///
/// Implementations must invoke the bound [`FinishFn`] exactly once, after the first of [`QueueTask::set_result`] or [`QueueTask::set_error`]; embedding a [`TaskState`] takes care of this.
pub trait QueueTask: Send + Sync + 'static {
  type Partition: Key;
  type Payload: Send + Sync + 'static;
  type Output: Send + Sync + 'static;

  fn partition(&self) -> Self::Partition;

  fn payload(&self) -> &Self::Payload;

  /// Consulted once, when the task is admitted into a partition buffer
  fn is_timeout(&self) -> bool;

  fn set_result(&self, result: Self::Output);

  fn set_error(&self, err: TaskError);

  fn with_finish_fn(&self, finish_fn: FinishFn);

  fn result(&self) -> Option<&Self::Output>;

  fn error(&self) -> Option<&TaskError>;

  fn is_finished(&self) -> bool {
    self.result().is_some() || self.error().is_some()
  }
}

/// One-shot outcome slot paired with the finish callback. The first outcome wins and the callback runs exactly once, regardless of whether it was bound before or after the outcome was set
pub struct TaskState<O> {
  outcome: OnceCell<Result<O, TaskError>>,
  finish_fn: AtomicCell<Option<FinishFn>>,
}

impl<O> TaskState<O> {
  pub fn new() -> Self {
    TaskState {
      outcome: OnceCell::new(),
      finish_fn: AtomicCell::new(None),
    }
  }

  /// Store `outcome` unless one is already set. Returns `true` if this call resolved the task
  pub fn resolve(&self, outcome: Result<O, TaskError>) -> bool {
    if self.outcome.set(outcome).is_err() {
      return false;
    }

    self.finish();

    true
  }

  pub fn set_finish_fn(&self, finish_fn: FinishFn) {
    self.finish_fn.store(Some(finish_fn));

    // Resolved before the callback was bound
    if self.outcome.get().is_some() {
      self.finish();
    }
  }

  fn finish(&self) {
    if let Some(finish_fn) = self.finish_fn.take() {
      (finish_fn)();
    }
  }

  pub fn result(&self) -> Option<&O> {
    self.outcome.get()?.as_ref().ok()
  }

  pub fn error(&self) -> Option<&TaskError> {
    self.outcome.get()?.as_ref().err()
  }

  pub fn is_finished(&self) -> bool {
    self.outcome.get().is_some()
  }
}

impl<O> Default for TaskState<O> {
  fn default() -> Self {
    TaskState::new()
  }
}

/// A [`QueueTask`] that times out once its deadline has passed
pub struct DeadlineTask<K, P, O> {
  partition: K,
  payload: P,
  deadline: Instant,
  state: TaskState<O>,
}

impl<K, P, O> DeadlineTask<K, P, O>
where
  K: Key,
  P: Send + Sync + 'static,
  O: Send + Sync + 'static,
{
  pub fn new(partition: K, payload: P, deadline: Instant) -> Self {
    DeadlineTask {
      partition,
      payload,
      deadline,
      state: TaskState::new(),
    }
  }

  pub fn with_timeout(partition: K, payload: P, timeout: Duration) -> Self {
    DeadlineTask::new(partition, payload, Instant::now() + timeout)
  }

  pub fn deadline(&self) -> Instant {
    self.deadline
  }
}

impl<K, P, O> QueueTask for DeadlineTask<K, P, O>
where
  K: Key,
  P: Send + Sync + 'static,
  O: Send + Sync + 'static,
{
  type Partition = K;
  type Payload = P;
  type Output = O;

  fn partition(&self) -> K {
    self.partition.clone()
  }

  fn payload(&self) -> &P {
    &self.payload
  }

  fn is_timeout(&self) -> bool {
    Instant::now() > self.deadline
  }

  fn set_result(&self, result: O) {
    self.state.resolve(Ok(result));
  }

  fn set_error(&self, err: TaskError) {
    self.state.resolve(Err(err));
  }

  fn with_finish_fn(&self, finish_fn: FinishFn) {
    self.state.set_finish_fn(finish_fn);
  }

  fn result(&self) -> Option<&O> {
    self.state.result()
  }

  fn error(&self) -> Option<&TaskError> {
    self.state.error()
  }

  fn is_finished(&self) -> bool {
    self.state.is_finished()
  }
}

/// Payload access over a batch of tasks
pub trait Payloads<T: QueueTask> {
  fn payloads(&self) -> Vec<&T::Payload>;
}

impl<T> Payloads<T> for [Arc<T>]
where
  T: QueueTask,
{
  fn payloads(&self) -> Vec<&T::Payload> {
    self.iter().map(|task| task.payload()).collect_vec()
  }
}
