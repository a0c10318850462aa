use crate::key::Key;
use crossbeam::atomic::AtomicCell;
use flurry::HashMap;
use std::sync::Arc;

/// Desired batch size per partition. Read on every flush decision, so changes apply on the next scheduler pass
pub trait BatchSizeProvider<K: Key>: Send + Sync + 'static {
  fn get(&self, partition: &K) -> usize;
  fn set(&self, partition: K, size: usize);
}

impl<K, P> BatchSizeProvider<K> for Arc<P>
where
  K: Key,
  P: BatchSizeProvider<K>,
{
  fn get(&self, partition: &K) -> usize {
    self.as_ref().get(partition)
  }

  fn set(&self, partition: K, size: usize) {
    self.as_ref().set(partition, size)
  }
}

/// Per-partition batch sizes over a shared default
pub struct PartitionBatchSizes<K: Key> {
  default_size: AtomicCell<usize>,
  sizes: HashMap<K, usize>,
}

impl<K> PartitionBatchSizes<K>
where
  K: Key,
{
  pub fn new(default_size: usize) -> Self {
    PartitionBatchSizes {
      default_size: AtomicCell::new(default_size),
      sizes: HashMap::new(),
    }
  }

  pub fn default_size(&self) -> usize {
    self.default_size.load()
  }

  pub fn set_default_size(&self, size: usize) {
    self.default_size.store(size);
  }

  /// Revert a partition to the default size
  pub fn unset(&self, partition: &K) {
    self.sizes.pin().remove(partition);
  }
}

impl<K> BatchSizeProvider<K> for PartitionBatchSizes<K>
where
  K: Key,
{
  fn get(&self, partition: &K) -> usize {
    self
      .sizes
      .pin()
      .get(partition)
      .copied()
      .unwrap_or_else(|| self.default_size.load())
  }

  fn set(&self, partition: K, size: usize) {
    self.sizes.pin().insert(partition, size);
  }
}
