use crate::{error::QueueError, task::FinishFn};
use atomic_take::AtomicTake;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Bookkeeping for one [`crate::queue::BatchQueue::push`] call of `total` tasks
pub(crate) struct Submission {
  total: usize,
  finished: Mutex<usize>,
  tx: AtomicTake<oneshot::Sender<usize>>,
}

impl Submission {
  pub(crate) fn new(total: usize) -> (Arc<Submission>, CompletionReceiver) {
    let (tx, rx) = oneshot::channel();

    let submission = Submission {
      total,
      finished: Mutex::new(0),
      tx: AtomicTake::new(tx),
    };

    (Arc::new(submission), rx.into())
  }

  pub(crate) fn finish_fn(self: &Arc<Self>) -> FinishFn {
    let submission = self.clone();
    Box::new(move || submission.finish_one())
  }

  fn finish_one(&self) {
    let mut finished = self.finished.lock();

    *finished += 1;

    // Compared under the same lock as the increment, so only the last task can send
    if finished.eq(&self.total) {
      if let Some(tx) = self.tx.take() {
        tx.send(*finished).ok();
      }
    }
  }
}

/// Resolves with the number of finished tasks once every task of a submission reached a terminal state
pub struct CompletionReceiver(oneshot::Receiver<usize>);

impl From<oneshot::Receiver<usize>> for CompletionReceiver {
  fn from(rx: oneshot::Receiver<usize>) -> Self {
    CompletionReceiver(rx)
  }
}

impl CompletionReceiver {
  /// Already resolved with 0, for empty submissions and submissions to a closing queue
  pub(crate) fn completed() -> Self {
    let (tx, rx) = oneshot::channel();

    tx.send(0).ok();

    rx.into()
  }

  pub async fn recv(self) -> Result<usize, QueueError> {
    self.0.await.map_err(|_| QueueError::Abandoned)
  }

  /// Non-blocking check; `None` while tasks are still pending
  pub fn try_recv(&mut self) -> Option<Result<usize, QueueError>> {
    match self.0.try_recv() {
      Ok(finished) => Some(Ok(finished)),
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Closed) => Some(Err(QueueError::Abandoned)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn it_is_completed() {
    let mut rx = CompletionReceiver::completed();

    assert_eq!(rx.try_recv(), Some(Ok(0)));
  }

  #[tokio::test]
  async fn it_signals_once_all_finished() {
    let (submission, mut rx) = Submission::new(64);

    let handles: Vec<_> = (0..64)
      .map(|_| {
        let finish_fn = submission.finish_fn();
        thread::spawn(move || (finish_fn)())
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(rx.try_recv(), Some(Ok(64)));
  }

  #[tokio::test]
  async fn it_waits_for_stragglers() {
    let (submission, mut rx) = Submission::new(2);

    (submission.finish_fn())();
    assert_eq!(rx.try_recv(), None);

    (submission.finish_fn())();
    assert_eq!(rx.recv().await, Ok(2));
  }

  #[tokio::test]
  async fn it_reports_abandoned_submissions() {
    let (submission, rx) = Submission::new(3);
    let finish_fn = submission.finish_fn();

    drop(submission);
    drop(finish_fn);

    assert_eq!(rx.recv().await, Err(QueueError::Abandoned));
  }
}
