use crate::task::QueueTask;
use itertools::Itertools;
use parking_lot::Mutex;
use std::{
  collections::VecDeque,
  sync::Arc,
  time::{Duration, Instant},
};

struct Buffer<T: QueueTask> {
  tasks: VecDeque<Arc<T>>,
  /// Set when going from empty to non-empty, cleared only when emptied
  first_queued: Option<Instant>,
}

/// Per-partition FIFO awaiting a flush. Buffers live as long as the queue and keep their storage between flushes
pub(crate) struct PartitionBuffer<T: QueueTask> {
  buffer: Mutex<Buffer<T>>,
}

impl<T> PartitionBuffer<T>
where
  T: QueueTask,
{
  pub(crate) fn new() -> Self {
    PartitionBuffer {
      buffer: Mutex::new(Buffer {
        tasks: VecDeque::new(),
        first_queued: None,
      }),
    }
  }

  pub(crate) fn push(&self, task: Arc<T>) {
    let mut buffer = self.buffer.lock();

    if buffer.first_queued.is_none() {
      buffer.first_queued = Some(Instant::now());
    }

    buffer.tasks.push_back(task);
  }

  /// Take every buffered task if at least `batch_size` are queued, or if the oldest has waited longer than `max_wait`
  pub(crate) fn maybe_flush(&self, batch_size: usize, max_wait: Duration) -> Option<Vec<Arc<T>>> {
    let mut buffer = self.buffer.lock();

    let first_queued = buffer.first_queued?;

    if buffer.tasks.len().ge(&batch_size) || first_queued.elapsed().gt(&max_wait) {
      Some(Self::take_all(&mut buffer))
    } else {
      None
    }
  }

  /// Take every buffered task unconditionally
  pub(crate) fn drain(&self) -> Option<Vec<Arc<T>>> {
    let mut buffer = self.buffer.lock();

    if buffer.tasks.is_empty() {
      None
    } else {
      Some(Self::take_all(&mut buffer))
    }
  }

  fn take_all(buffer: &mut Buffer<T>) -> Vec<Arc<T>> {
    buffer.first_queued = None;
    buffer.tasks.drain(..).collect_vec()
  }

  pub(crate) fn len(&self) -> usize {
    self.buffer.lock().tasks.len()
  }
}
