//! ```rust
//! use batch_queue::{BatchQueue, DeadlineTask, PartitionBatchSizes, QueueConfig, QueueTask};
//! use std::{sync::Arc, time::Duration};
//!
//! type Transcode = DeadlineTask<String, Vec<u8>, usize>;
//!
//! #[tokio::main]
//! async fn main() {
//!   let queue = BatchQueue::new(
//!     PartitionBatchSizes::new(8),
//!     |_model: String, tasks: &[Arc<Transcode>]| {
//!       for task in tasks {
//!         task.set_result(task.payload().len());
//!       }
//!     },
//!     QueueConfig::default().pool_size(4),
//!   );
//!
//!   let tasks: Vec<Arc<Transcode>> = (0..20)
//!     .map(|i| {
//!       Arc::new(Transcode::with_timeout(
//!         format!("model-{}", i % 2),
//!         vec![0; i],
//!         Duration::from_secs(1),
//!       ))
//!     })
//!     .collect();
//!
//!   let finished = queue.push(tasks.clone()).recv().await.unwrap();
//!
//!   assert_eq!(finished, 20);
//!   assert_eq!(tasks[3].result(), Some(&3));
//!
//!   queue.close().unwrap();
//!   queue.wait_closed().await;
//! }
//! ```

pub mod batch_size;
mod completion;
pub mod config;
pub mod error;
mod ingress;
mod key;
mod partition;
pub mod queue;
pub mod task;
pub mod worker;

pub use batch_size::{BatchSizeProvider, PartitionBatchSizes};
pub use completion::CompletionReceiver;
pub use config::{PoolPolicy, QueueConfig};
pub use error::{QueueError, TaskError};
pub use key::Key;
pub use queue::{BatchQueue, QueueState};
pub use task::{DeadlineTask, FinishFn, Payloads, QueueTask, TaskState};
pub use worker::TaskHandler;
