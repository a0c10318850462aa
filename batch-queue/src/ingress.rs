use crate::task::QueueTask;
use itertools::Itertools;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

/// Single FIFO receiving every pushed task ahead of partition assignment
pub(crate) struct Ingress<T: QueueTask> {
  queue: Mutex<VecDeque<Arc<T>>>,
}

impl<T> Ingress<T>
where
  T: QueueTask,
{
  pub(crate) fn new() -> Self {
    Ingress {
      queue: Mutex::new(VecDeque::new()),
    }
  }

  /// Enqueue `tasks` if `admit` holds. `admit` is evaluated under the ingress lock
  pub(crate) fn push_all<F>(&self, tasks: Vec<Arc<T>>, admit: F) -> bool
  where
    F: FnOnce() -> bool,
  {
    let mut queue = self.queue.lock();

    if !admit() {
      return false;
    }

    queue.extend(tasks);

    true
  }

  /// Dequeue up to `n` tasks in FIFO order. If none are queued `on_empty` runs before the lock is released
  pub(crate) fn pop_n<F>(&self, n: usize, on_empty: F) -> Vec<Arc<T>>
  where
    F: FnOnce(),
  {
    let mut queue = self.queue.lock();

    let len = n.min(queue.len());

    if len.eq(&0) {
      on_empty();
      return vec![];
    }

    queue.drain(..len).collect_vec()
  }

  pub(crate) fn len(&self) -> usize {
    self.queue.lock().len()
  }
}
