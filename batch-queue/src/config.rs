use std::{env, str::FromStr, time::Duration};
use tokio::sync::Semaphore;

/// Age of the oldest buffered task after which a partition is flushed regardless of size
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);
/// Tasks moved from ingress into partitions per producer cycle
pub const DEFAULT_CONSUME_RATE: usize = 100;
/// Scheduler tick between flush passes
pub const DEFAULT_CONSUMER_INTERVAL: Duration = Duration::from_millis(10);
/// Producer pause between ingress drains
pub const DEFAULT_PRODUCER_INTERVAL: Duration = Duration::from_millis(10);

/// What the scheduler does when every worker slot is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
  /// Wait for a free slot. A saturated pool delays the flush pass for every partition
  Wait,
  /// Fail the batch immediately with [`crate::error::QueueError::PoolSaturated`]
  Reject,
}

impl FromStr for PoolPolicy {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "wait" | "block" => Ok(PoolPolicy::Wait),
      "reject" | "nonblocking" => Ok(PoolPolicy::Reject),
      _ => Err(()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
  pub max_wait: Duration,
  pub consume_rate: usize,
  pub consumer_interval: Duration,
  pub producer_interval: Duration,
  pub pool_size: usize,
  pub pool_policy: PoolPolicy,
}

impl Default for QueueConfig {
  fn default() -> Self {
    QueueConfig {
      max_wait: DEFAULT_MAX_WAIT,
      consume_rate: DEFAULT_CONSUME_RATE,
      consumer_interval: DEFAULT_CONSUMER_INTERVAL,
      producer_interval: DEFAULT_PRODUCER_INTERVAL,
      pool_size: num_cpus::get(),
      pool_policy: PoolPolicy::Wait,
    }
  }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
  env::var(name).ok()?.parse().ok()
}

fn env_millis(name: &str) -> Option<Duration> {
  env_parse::<u64>(name).map(Duration::from_millis)
}

impl QueueConfig {
  /// Defaults overridden by `BATCH_QUEUE_*` environment variables. Missing or unparsable values keep their default
  pub fn from_env() -> Self {
    let defaults = QueueConfig::default();

    defaults
      .clone()
      .max_wait(env_millis("BATCH_QUEUE_MAX_WAIT_MS").unwrap_or(defaults.max_wait))
      .consume_rate(env_parse("BATCH_QUEUE_CONSUME_RATE").unwrap_or(defaults.consume_rate))
      .consumer_interval(
        env_millis("BATCH_QUEUE_CONSUMER_INTERVAL_MS").unwrap_or(defaults.consumer_interval),
      )
      .producer_interval(
        env_millis("BATCH_QUEUE_PRODUCER_INTERVAL_MS").unwrap_or(defaults.producer_interval),
      )
      .pool_size(env_parse("BATCH_QUEUE_POOL_SIZE").unwrap_or(defaults.pool_size))
      .pool_policy(env_parse("BATCH_QUEUE_POOL_POLICY").unwrap_or(defaults.pool_policy))
  }

  pub fn max_wait(mut self, max_wait: Duration) -> Self {
    self.max_wait = max_wait;
    self
  }

  pub fn consume_rate(mut self, consume_rate: usize) -> Self {
    self.consume_rate = consume_rate.max(1);
    self
  }

  /// Clamped to at least 1ms, as the scheduler tick cannot be zero
  pub fn consumer_interval(mut self, interval: Duration) -> Self {
    self.consumer_interval = interval.max(Duration::from_millis(1));
    self
  }

  pub fn producer_interval(mut self, interval: Duration) -> Self {
    self.producer_interval = interval;
    self
  }

  /// Clamped to `1..=Semaphore::MAX_PERMITS`
  pub fn pool_size(mut self, pool_size: usize) -> Self {
    self.pool_size = pool_size.clamp(1, Semaphore::MAX_PERMITS);
    self
  }

  pub fn pool_policy(mut self, pool_policy: PoolPolicy) -> Self {
    self.pool_policy = pool_policy;
    self
  }
}
