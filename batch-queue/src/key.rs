use std::{fmt::Debug, hash::Hash};

/// Partition identity of a [`crate::task::QueueTask`]; typically [`String`], [`i32`] or a newtype wrapper
pub trait Key: Send + Sync + Hash + Ord + Eq + Clone + Debug + 'static {}
impl<T: Send + Sync + Hash + Ord + Eq + Clone + Debug + 'static> Key for T {}
