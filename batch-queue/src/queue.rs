use crate::{
  batch_size::BatchSizeProvider,
  completion::{CompletionReceiver, Submission},
  config::QueueConfig,
  error::{QueueError, TaskError},
  ingress::Ingress,
  partition::PartitionBuffer,
  task::QueueTask,
  worker::{TaskHandler, WorkerPool},
};
use crossbeam::atomic::AtomicCell;
use flume::{Receiver, Sender};
use flurry::HashMap;
use itertools::Itertools;
use log::{debug, trace, warn};
use std::sync::Arc;
use tokio::{
  sync::Notify,
  time::{self, MissedTickBehavior},
};

/// Lifecycle of a [`BatchQueue`]. Each transition has a single writer: [`BatchQueue::close`] leaves `Open`, the producer leaves `AboutToClose` once ingress is empty, and the scheduler leaves `Closing` after its final pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueState {
  Open,
  AboutToClose,
  Closing,
  Closed,
}

struct Shared<T: QueueTask> {
  config: QueueConfig,
  state: AtomicCell<QueueState>,
  ingress: Ingress<T>,
  partitions: HashMap<T::Partition, Arc<PartitionBuffer<T>>>,
  batch_sizes: Box<dyn BatchSizeProvider<T::Partition>>,
  pool: WorkerPool<T>,
  closed: Notify,
}

/// Buffers pushed tasks, groups them by partition and hands batches to a bounded worker pool once a partition holds a full batch or its oldest task has waited past [`QueueConfig::max_wait`]
///
/// Dropping the queue initiates [`BatchQueue::close`]; tasks already pushed are still processed.
pub struct BatchQueue<T: QueueTask> {
  shared: Arc<Shared<T>>,
}

impl<T> BatchQueue<T>
where
  T: QueueTask,
{
  /// Start the admission producer and flush scheduler in the background. Must be called within a Tokio runtime
  pub fn new<P, H>(batch_sizes: P, handler: H, config: QueueConfig) -> Self
  where
    P: BatchSizeProvider<T::Partition>,
    H: TaskHandler<T>,
  {
    let pool = WorkerPool::new(Arc::new(handler), config.pool_size, config.pool_policy);

    let shared = Arc::new(Shared {
      config,
      state: AtomicCell::new(QueueState::Open),
      ingress: Ingress::new(),
      partitions: HashMap::new(),
      batch_sizes: Box::new(batch_sizes),
      pool,
      closed: Notify::new(),
    });

    let (trigger_tx, trigger_rx) = flume::bounded(1);

    tokio::task::spawn(shared.clone().produce(trigger_tx));
    tokio::task::spawn(shared.clone().consume(trigger_rx));

    BatchQueue { shared }
  }

  /// [`BatchQueue::new`] with default tunables and `pool_size` workers
  pub fn with_pool_size<P, H>(batch_sizes: P, handler: H, pool_size: usize) -> Self
  where
    P: BatchSizeProvider<T::Partition>,
    H: TaskHandler<T>,
  {
    BatchQueue::new(
      batch_sizes,
      handler,
      QueueConfig::default().pool_size(pool_size),
    )
  }

  /// Enqueue `tasks` without blocking. The receiver yields the number of distinct tasks once every one of them has a result or error. Repeated [`Arc`]s of one task are submitted once. Empty submissions, and submissions after the queue began closing, yield 0 immediately
  pub fn push<I>(&self, tasks: I) -> CompletionReceiver
  where
    I: IntoIterator<Item = Arc<T>>,
  {
    let tasks = tasks
      .into_iter()
      .unique_by(|task| Arc::as_ptr(task))
      .collect_vec();

    if tasks.is_empty() || !self.accepts_tasks() {
      return CompletionReceiver::completed();
    }

    let (submission, rx) = Submission::new(tasks.len());

    for task in tasks.iter() {
      task.with_finish_fn(submission.finish_fn());
    }

    // Admission is decided under the ingress lock, which the producer also holds while sealing
    if self.shared.ingress.push_all(tasks, || self.accepts_tasks()) {
      rx
    } else {
      CompletionReceiver::completed()
    }
  }

  fn accepts_tasks(&self) -> bool {
    self.shared.state.load().le(&QueueState::AboutToClose)
  }

  /// Begin a graceful shutdown. Idempotent
  pub fn close(&self) -> Result<(), QueueError> {
    if self
      .shared
      .state
      .compare_exchange(QueueState::Open, QueueState::AboutToClose)
      .is_ok()
    {
      debug!("{} queue about to close", tynm::type_name::<T>());
    }

    Ok(())
  }

  pub fn closed(&self) -> bool {
    self.shared.state.load().eq(&QueueState::Closed)
  }

  pub fn state(&self) -> QueueState {
    self.shared.state.load()
  }

  /// Resolves once the final flush pass has run and the queue is [`QueueState::Closed`]
  pub async fn wait_closed(&self) {
    loop {
      let notified = self.shared.closed.notified();

      if self.closed() {
        break;
      }

      notified.await;
    }
  }

  /// Tasks pushed but not yet handed to the worker pool
  pub fn pending(&self) -> usize {
    let partitions = self.shared.partitions.pin();

    self.shared.ingress.len()
      + partitions
        .iter()
        .map(|(_, partition)| partition.len())
        .sum::<usize>()
  }
}

impl<T> Drop for BatchQueue<T>
where
  T: QueueTask,
{
  fn drop(&mut self) {
    self.close().ok();
  }
}

impl<T> Shared<T>
where
  T: QueueTask,
{
  /// Fetch the buffer for `key`, creating it on first arrival. Concurrent creation resolves to a single buffer
  fn partition(&self, key: T::Partition) -> Arc<PartitionBuffer<T>> {
    let guard = self.partitions.guard();

    if let Some(partition) = self.partitions.get(&key, &guard) {
      return partition.clone();
    }

    match self
      .partitions
      .try_insert(key, Arc::new(PartitionBuffer::new()), &guard)
    {
      Ok(partition) => partition.clone(),
      Err(err) => err.current.clone(),
    }
  }

  fn admit(&self, tasks: Vec<Arc<T>>) {
    for task in tasks {
      // Resolved before it was pushed; its finish callback has already counted it
      if task.is_finished() {
        continue;
      }

      if task.is_timeout() {
        warn!(
          "{} timed out before admission into partition {:?}",
          tynm::type_name::<T>(),
          task.partition()
        );
        task.set_error(TaskError::TimedOut);
      } else {
        self.partition(task.partition()).push(task);
      }
    }
  }

  // Move tasks from ingress into partitions at a bounded rate until sealed
  async fn produce(self: Arc<Self>, trigger: Sender<()>) {
    loop {
      if self.state.load().ge(&QueueState::Closing) {
        break;
      }

      let tasks = self.ingress.pop_n(self.config.consume_rate, || {
        if self
          .state
          .compare_exchange(QueueState::AboutToClose, QueueState::Closing)
          .is_ok()
        {
          debug!("{} ingress sealed", tynm::type_name::<T>());
        }
      });

      if !tasks.is_empty() {
        trace!("admitting {} tasks", tasks.len());
        self.admit(tasks);

        // A pending signal already covers these tasks
        trigger.try_send(()).ok();
      }

      time::sleep(self.config.producer_interval).await;
    }
  }

  // Flush partitions on every tick or producer signal, whichever comes first
  async fn consume(self: Arc<Self>, trigger: Receiver<()>) {
    let mut ticker = time::interval(self.config.consumer_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        Ok(()) = trigger.recv_async() => {
          ticker.reset();
        }
      }

      self.flush_partitions(false).await;

      if self.state.load().eq(&QueueState::Closing) {
        self.flush_partitions(true).await;
        self.state.store(QueueState::Closed);
        self.pool.close();
        self.closed.notify_waiters();

        debug!("{} queue closed", tynm::type_name::<T>());

        break;
      }
    }
  }

  /// Dispatch every partition that is ready, or every non-empty partition when `force` is set
  async fn flush_partitions(&self, force: bool) {
    let partitions = {
      let guard = self.partitions.guard();

      self
        .partitions
        .iter(&guard)
        .map(|(key, partition)| (key.clone(), partition.clone()))
        .collect_vec()
    };

    for (key, partition) in partitions {
      let batch_size = self.batch_sizes.get(&key).max(1);

      let tasks = if force {
        partition.drain()
      } else {
        partition.maybe_flush(batch_size, self.config.max_wait)
      };

      if let Some(tasks) = tasks {
        trace!("flushed {} tasks from partition {:?}", tasks.len(), &key);

        self.pool.dispatch(&key, tasks, batch_size).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{batch_size::PartitionBatchSizes, config::PoolPolicy, task::DeadlineTask};
  use futures_util::future::join_all;
  use parking_lot::Mutex;
  use std::time::{Duration, Instant};
  use tokio::time::timeout;

  type TestTask = DeadlineTask<String, usize, String>;
  type Batches = Arc<Mutex<Vec<(String, Vec<usize>)>>>;

  const DEADLINE: Duration = Duration::from_secs(5);

  fn tasks(partition: &str, payloads: std::ops::Range<usize>) -> Vec<Arc<TestTask>> {
    payloads
      .map(|i| Arc::new(TestTask::with_timeout(partition.to_string(), i, DEADLINE)))
      .collect()
  }

  fn recording_handler(batches: Batches) -> impl TaskHandler<TestTask> {
    move |partition: String, tasks: &[Arc<TestTask>]| {
      batches.lock().push((
        partition.clone(),
        tasks.iter().map(|task| *task.payload()).collect(),
      ));

      for task in tasks {
        task.set_result(format!("{}-{}", partition, task.payload()));
      }
    }
  }

  /// Flushes are driven only by producer signals or the age trigger, never by a tick landing mid-admission
  fn signal_driven(max_wait: Duration) -> QueueConfig {
    QueueConfig::default()
      .pool_size(1)
      .max_wait(max_wait)
      .consumer_interval(Duration::from_secs(3600))
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_completes_empty_pushes_immediately() {
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(Batches::default()),
      4,
    );

    let mut rx = queue.push(Vec::<Arc<TestTask>>::new());

    assert_eq!(rx.try_recv(), Some(Ok(0)));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_completes_every_task() {
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(Batches::default()),
      10,
    );

    let first = tasks("partition", 0..20);
    let second = tasks("partition", 0..3);

    let results = join_all(vec![
      queue.push(first.clone()).recv(),
      queue.push(second.clone()).recv(),
    ])
    .await;

    assert_eq!(results, vec![Ok(20), Ok(3)]);
    assert!(first
      .iter()
      .chain(second.iter())
      .all(|task| task.result().is_some()));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_splits_partitions_into_batches() {
    let batches = Batches::default();
    let queue = BatchQueue::new(
      PartitionBatchSizes::new(8),
      recording_handler(batches.clone()),
      signal_driven(Duration::from_secs(60)),
    );

    // Let the scheduler consume its immediate first tick
    time::sleep(Duration::from_millis(20)).await;

    assert_eq!(queue.push(tasks("p", 0..20)).recv().await, Ok(20));

    assert_eq!(
      *batches.lock(),
      vec![
        ("p".to_string(), (0..8).collect()),
        ("p".to_string(), (8..16).collect()),
        ("p".to_string(), (16..20).collect()),
      ]
    );
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_reads_batch_sizes_on_every_flush() {
    let batches = Batches::default();
    let sizes = Arc::new(PartitionBatchSizes::new(8));
    let queue = BatchQueue::new(
      sizes.clone(),
      recording_handler(batches.clone()),
      signal_driven(Duration::from_secs(60)),
    );

    sizes.set("p".to_string(), 2);
    time::sleep(Duration::from_millis(20)).await;

    assert_eq!(queue.push(tasks("p", 0..4)).recv().await, Ok(4));

    let sizes = batches
      .lock()
      .iter()
      .map(|(_, payloads)| payloads.len())
      .collect_vec();

    assert_eq!(sizes, vec![2, 2]);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_fails_timed_out_tasks_without_batching() {
    let batches = Batches::default();
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(batches.clone()),
      2,
    );

    let expired = Arc::new(TestTask::new(
      "p".into(),
      0,
      Instant::now() - Duration::from_millis(1),
    ));
    let fresh = Arc::new(TestTask::with_timeout("p".into(), 1, DEADLINE));

    assert_eq!(
      queue.push(vec![expired.clone(), fresh.clone()]).recv().await,
      Ok(2)
    );

    assert!(expired.error().map_or(false, TaskError::is_timeout));
    assert!(expired.result().is_none());
    assert_eq!(fresh.result().map(String::as_str), Some("p-1"));
    assert!(batches
      .lock()
      .iter()
      .all(|(_, payloads)| !payloads.contains(&0)));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_flushes_lone_tasks_after_max_wait() {
    let flushed_at = Arc::new(Mutex::new(None));
    let handler = {
      let flushed_at = flushed_at.clone();
      move |_: String, tasks: &[Arc<TestTask>]| {
        *flushed_at.lock() = Some(Instant::now());
        tasks.iter().for_each(|task| task.set_result("ok".into()));
      }
    };

    let queue = BatchQueue::with_pool_size(PartitionBatchSizes::new(8), handler, 2);

    let pushed_at = Instant::now();
    let rx = queue.push(tasks("idle", 0..1));

    assert_eq!(rx.recv().await, Ok(1));

    let waited = flushed_at.lock().unwrap().duration_since(pushed_at);

    assert!(waited >= Duration::from_millis(50), "flushed after {:?}", waited);
    assert!(waited < Duration::from_millis(500), "flushed after {:?}", waited);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_preserves_order_within_partitions() {
    let batches = Batches::default();
    let queue = BatchQueue::new(
      PartitionBatchSizes::new(3),
      recording_handler(batches.clone()),
      QueueConfig::default().pool_size(1),
    );

    let interleaved = tasks("a", 0..10)
      .into_iter()
      .interleave(tasks("b", 0..10))
      .collect_vec();

    assert_eq!(queue.push(interleaved).recv().await, Ok(20));

    for partition in ["a", "b"] {
      let order = batches
        .lock()
        .iter()
        .filter(|(key, _)| key.as_str() == partition)
        .flat_map(|(_, payloads)| payloads.clone())
        .collect_vec();

      assert_eq!(order, (0..10).collect_vec());
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_closes_gracefully() {
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(Batches::default()),
      4,
    );

    let rx = queue.push(tasks("p", 0..5));

    queue.close().unwrap();
    queue.close().unwrap();

    assert_eq!(rx.recv().await, Ok(5));

    timeout(Duration::from_secs(2), queue.wait_closed())
      .await
      .expect("queue should close");

    assert!(queue.closed());
    assert_eq!(queue.state(), QueueState::Closed);

    let mut rx = queue.push(tasks("p", 5..8));
    assert_eq!(rx.try_recv(), Some(Ok(0)));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_drains_partitions_on_close() {
    let batches = Batches::default();
    let queue = BatchQueue::new(
      PartitionBatchSizes::new(100),
      recording_handler(batches.clone()),
      QueueConfig::default().max_wait(Duration::from_secs(60)),
    );

    let rx = queue.push(tasks("slow", 0..3));

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.pending(), 3);

    queue.close().unwrap();

    let finished = timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("resident tasks should drain on close");

    assert_eq!(finished, Ok(3));
    assert_eq!(batches.lock().len(), 1);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_drains_when_dropped() {
    let queue = BatchQueue::new(
      PartitionBatchSizes::new(100),
      recording_handler(Batches::default()),
      QueueConfig::default().max_wait(Duration::from_secs(60)),
    );

    let pushed = tasks("p", 0..3);
    let rx = queue.push(pushed.clone());

    drop(queue);

    let finished = timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("dropped queue should drain");

    assert_eq!(finished, Ok(3));
    assert!(pushed.iter().all(|task| task.result().is_some()));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_settles_pushes_racing_close() {
    let queue = Arc::new(BatchQueue::new(
      PartitionBatchSizes::new(4),
      recording_handler(Batches::default()),
      QueueConfig::default()
        .pool_size(4)
        .pool_policy(PoolPolicy::Wait),
    ));

    let pushers = (0..32)
      .map(|i| {
        let queue = queue.clone();
        tokio::spawn(async move {
          let pushed = tasks(&format!("p{}", i % 4), 0..5);
          let finished = queue.push(pushed.clone()).recv().await;
          (pushed, finished)
        })
      })
      .collect_vec();

    queue.close().unwrap();

    let outcomes = timeout(Duration::from_secs(5), join_all(pushers))
      .await
      .expect("every push should settle");

    for outcome in outcomes {
      let (pushed, finished) = outcome.unwrap();

      match finished {
        Ok(5) => assert!(pushed.iter().all(|task| task.is_finished())),
        Ok(0) => assert!(pushed.iter().all(|task| !task.is_finished())),
        other => panic!("unexpected completion {:?}", other),
      }
    }

    timeout(Duration::from_secs(2), queue.wait_closed())
      .await
      .expect("queue should close");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_submits_repeated_tasks_once() {
    let batches = Batches::default();
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(batches.clone()),
      2,
    );

    let task = Arc::new(TestTask::with_timeout("p".into(), 7, DEADLINE));
    let other = Arc::new(TestTask::with_timeout("p".into(), 8, DEADLINE));

    let finished = timeout(
      Duration::from_secs(2),
      queue
        .push(vec![task.clone(), other.clone(), task.clone()])
        .recv(),
    )
    .await
    .expect("repeated tasks should settle");

    assert_eq!(finished, Ok(2));
    assert_eq!(task.result().map(String::as_str), Some("p-7"));

    let handled = batches
      .lock()
      .iter()
      .flat_map(|(_, payloads)| payloads.clone())
      .collect_vec();

    assert_eq!(handled, vec![7, 8]);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_skips_tasks_resolved_before_push() {
    let batches = Batches::default();
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(batches.clone()),
      2,
    );

    let resolved = Arc::new(TestTask::with_timeout("p".into(), 0, DEADLINE));
    resolved.set_result("cached".into());
    let fresh = Arc::new(TestTask::with_timeout("p".into(), 1, DEADLINE));

    assert_eq!(
      queue.push(vec![resolved.clone(), fresh.clone()]).recv().await,
      Ok(2)
    );

    assert_eq!(resolved.result().map(String::as_str), Some("cached"));
    assert_eq!(fresh.result().map(String::as_str), Some("p-1"));
    assert!(batches
      .lock()
      .iter()
      .all(|(_, payloads)| !payloads.contains(&0)));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn it_creates_one_buffer_per_partition() {
    let queue = BatchQueue::with_pool_size(
      PartitionBatchSizes::new(8),
      recording_handler(Batches::default()),
      2,
    );

    let barrier = Arc::new(std::sync::Barrier::new(16));

    let threads = (0..16)
      .map(|_| {
        let shared = queue.shared.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
          barrier.wait();
          shared.partition("fresh".to_string())
        })
      })
      .collect_vec();

    let buffers = threads
      .into_iter()
      .map(|thread| thread.join().unwrap())
      .collect_vec();

    assert!(buffers
      .iter()
      .all(|buffer| Arc::ptr_eq(buffer, &buffers[0])));
    assert_eq!(queue.shared.partitions.len(), 1);
  }
}
