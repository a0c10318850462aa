use crate::{
  config::PoolPolicy,
  error::{QueueError, TaskError},
  task::QueueTask,
};
use itertools::Itertools;
use log::{error, trace, warn};
use num::Integer;
use std::{
  panic::{self, AssertUnwindSafe},
  sync::Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// User logic applied to one batch of same-partition tasks. Every task should be resolved with [`QueueTask::set_result`] or [`QueueTask::set_error`] before returning; tasks left pending are failed with [`TaskError::Unresolved`]
pub trait TaskHandler<T: QueueTask>: Send + Sync + 'static {
  fn handle(&self, partition: T::Partition, tasks: &[Arc<T>]);
}

impl<T, F> TaskHandler<T> for F
where
  T: QueueTask,
  F: Fn(T::Partition, &[Arc<T>]) + Send + Sync + 'static,
{
  fn handle(&self, partition: T::Partition, tasks: &[Arc<T>]) {
    (self)(partition, tasks)
  }
}

/// Bounded executor running the [`TaskHandler`] on tokio's blocking threads, one batch per permit
pub(crate) struct WorkerPool<T: QueueTask> {
  handler: Arc<dyn TaskHandler<T>>,
  permits: Arc<Semaphore>,
  policy: PoolPolicy,
}

impl<T> WorkerPool<T>
where
  T: QueueTask,
{
  pub(crate) fn new(handler: Arc<dyn TaskHandler<T>>, size: usize, policy: PoolPolicy) -> Self {
    WorkerPool {
      handler,
      permits: Arc::new(Semaphore::new(size.clamp(1, Semaphore::MAX_PERMITS))),
      policy,
    }
  }

  async fn acquire(&self) -> Result<OwnedSemaphorePermit, QueueError> {
    match self.policy {
      PoolPolicy::Wait => self
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| QueueError::PoolClosed),
      PoolPolicy::Reject => self
        .permits
        .clone()
        .try_acquire_owned()
        .map_err(|err| match err {
          TryAcquireError::NoPermits => QueueError::PoolSaturated,
          TryAcquireError::Closed => QueueError::PoolClosed,
        }),
    }
  }

  /// Split `tasks` into contiguous batches of at most `batch_size` and hand each to a worker. Batches that cannot be submitted fail every task with the submission error
  pub(crate) async fn dispatch(
    &self,
    partition: &T::Partition,
    tasks: Vec<Arc<T>>,
    batch_size: usize,
  ) {
    let batch_size = batch_size.max(1);
    let total = tasks.len();
    let batch_count = Integer::div_ceil(&total, &batch_size);

    for (i, batch) in tasks.chunks(batch_size).enumerate() {
      match self.acquire().await {
        Ok(permit) => self.spawn(permit, partition.clone(), batch.to_vec()),
        Err(err) => {
          error!(
            "{} unable to dispatch batch for partition {:?}: {}",
            tynm::type_name::<T>(),
            partition,
            err
          );

          let err = TaskError::from(err);

          batch.iter().for_each(|task| task.set_error(err.clone()));
        }
      }

      trace!(
        "dispatched batch {}/{} of {} tasks ({} total) for partition {:?}",
        i + 1,
        batch_count,
        batch.len(),
        total,
        partition
      );
    }
  }

  fn spawn(&self, permit: OwnedSemaphorePermit, partition: T::Partition, batch: Vec<Arc<T>>) {
    let handler = self.handler.clone();

    tokio::task::spawn_blocking(move || {
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.handle(partition.clone(), &batch)
      }));

      let fallback = match outcome {
        Ok(()) => TaskError::Unresolved,
        Err(_) => TaskError::HandlerPanicked,
      };

      let unresolved = batch
        .iter()
        .filter(|task| !task.is_finished())
        .collect_vec();

      if !unresolved.is_empty() {
        warn!(
          "{} of {} tasks in partition {:?} left unresolved: {}",
          unresolved.len(),
          batch.len(),
          partition,
          fallback
        );

        unresolved
          .into_iter()
          .for_each(|task| task.set_error(fallback.clone()));
      }

      drop(permit);
    });
  }

  /// Reject all further submissions. Batches already running are unaffected
  pub(crate) fn close(&self) {
    self.permits.close();
  }
}
