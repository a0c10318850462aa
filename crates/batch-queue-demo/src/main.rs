use batch_queue::{
  BatchQueue, BatchSizeProvider, DeadlineTask, Payloads, PartitionBatchSizes, QueueConfig,
  QueueTask, TaskError,
};
use log::{info, warn};
use std::{sync::Arc, thread, time::Duration};
use thiserror::Error;

/// Frame range of a clip to transcode
#[derive(Debug)]
struct Clip {
  frames: u32,
}

type Transcode = DeadlineTask<String, Clip, u32>;

#[derive(Error, Debug)]
#[error("clip has no frames")]
struct EmptyClip;

fn transcode(profile: String, tasks: &[Arc<Transcode>]) {
  info!(
    "transcoding {} clips with profile {}: {:?}",
    tasks.len(),
    profile,
    tasks.payloads()
  );

  // Simulated encoder cost per batch
  thread::sleep(Duration::from_millis(20));

  for task in tasks {
    match task.payload().frames {
      0 => task.set_error(TaskError::handler(EmptyClip)),
      frames => task.set_result(frames * 2),
    }
  }
}

fn clips(profile: &str, count: u32, timeout: Duration) -> Vec<Arc<Transcode>> {
  (0..count)
    .map(|frames| {
      Arc::new(Transcode::with_timeout(
        profile.to_string(),
        Clip { frames },
        timeout,
      ))
    })
    .collect()
}

#[tokio::main]
async fn main() {
  dotenv::dotenv().ok();
  pretty_env_logger::init();

  let batch_sizes = Arc::new(PartitionBatchSizes::new(8));
  batch_sizes.set("h264-720p".to_string(), 4);

  let config = QueueConfig::from_env();
  info!("starting queue with {:?}", config);

  let queue = BatchQueue::new(batch_sizes.clone(), transcode, config);

  let hd = clips("h264-1080p", 20, Duration::from_secs(5));
  let sd = clips("h264-720p", 10, Duration::from_secs(5));
  let expired = clips("av1-4k", 2, Duration::ZERO);

  let (hd_done, sd_done, expired_done) = tokio::join!(
    queue.push(hd.clone()).recv(),
    queue.push(sd.clone()).recv(),
    queue.push(expired.clone()).recv(),
  );

  info!(
    "finished {:?} 1080p, {:?} 720p, {:?} 4k clips",
    hd_done, sd_done, expired_done
  );

  for task in hd.iter().chain(sd.iter()).chain(expired.iter()) {
    if let Some(err) = task.error() {
      warn!(
        "{} clip with {} frames failed: {}",
        task.partition(),
        task.payload().frames,
        err
      );
    }
  }

  queue.close().ok();
  queue.wait_closed().await;

  info!("queue closed");
}
