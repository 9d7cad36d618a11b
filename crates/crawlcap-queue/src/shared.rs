//! Thread-safe wrapper around [`HybridQueue`].
//!
//! Every operation takes one `parking_lot::Mutex`. Multi-step work that
//! must not interleave with other threads (iterate and remove, peek then
//! dequeue) goes through [`SharedHybridQueue::with_lock`].

use std::path::Path;
use std::sync::Arc;

use crawlcap_core::{QueueConfig, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::hybrid::HybridQueue;

pub struct SharedHybridQueue<T> {
    inner: Arc<Mutex<HybridQueue<T>>>,
}

impl<T> Clone for SharedHybridQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Serialize + DeserializeOwned> SharedHybridQueue<T> {
    pub fn open(directory: impl AsRef<Path>, name: &str, head_max: usize) -> Result<Self> {
        Ok(Self::new(HybridQueue::open(directory, name, head_max)?))
    }

    pub fn from_config(config: &QueueConfig, name: &str) -> Result<Self> {
        Ok(Self::new(HybridQueue::from_config(config, name)?))
    }

    pub fn new(queue: HybridQueue<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        self.inner.lock().enqueue(item)
    }

    pub fn dequeue(&self) -> Result<Option<T>> {
        self.inner.lock().dequeue()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn remove_matching<F>(&self, predicate: F) -> Result<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.inner.lock().remove_matching(predicate)
    }

    /// Run `f` with the queue locked.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut HybridQueue<T>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Unwrap the queue if this is the last handle.
    pub fn into_inner(self) -> std::result::Result<HybridQueue<T>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner()),
            Err(inner) => Err(Self { inner }),
        }
    }
}

impl<T: Clone> SharedHybridQueue<T> {
    /// A copy of the head's first item; see [`HybridQueue::peek`].
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().peek().cloned()
    }
}

impl<T> std::fmt::Debug for SharedHybridQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHybridQueue")
            .field("queue", &*self.inner.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let queue: SharedHybridQueue<u32> = SharedHybridQueue::open(dir.path(), "shared", 8).unwrap();

        let handles: Vec<_> = (0..4u32)
            .map(|p| {
                let q = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        q.enqueue(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.len(), 1000);

        let mut seen = Vec::new();
        while let Some(v) = queue.dequeue().unwrap() {
            seen.push(v);
        }
        // Each producer's items keep their relative order.
        for p in 0..4u32 {
            let mine: Vec<_> = seen.iter().copied().filter(|v| v / 1000 == p).collect();
            assert_eq!(mine, (0..250).map(|i| p * 1000 + i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_peek_returns_head_copy() {
        let dir = TempDir::new().unwrap();
        let queue: SharedHybridQueue<String> =
            SharedHybridQueue::open(dir.path(), "peek", 1).unwrap();
        assert_eq!(queue.peek(), None);

        queue.enqueue("first".to_string()).unwrap();
        queue.enqueue("second".to_string()).unwrap();
        assert_eq!(queue.peek().as_deref(), Some("first"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().unwrap().as_deref(), Some("first"));
        assert_eq!(queue.peek().as_deref(), Some("second"));
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_into_inner_requires_last_handle() {
        let dir = TempDir::new().unwrap();
        let queue: SharedHybridQueue<u32> = SharedHybridQueue::open(dir.path(), "unwrap", 2).unwrap();
        let other = queue.clone();
        let queue = queue.into_inner().unwrap_err();
        drop(other);
        let inner = queue.into_inner().unwrap();
        inner.release().unwrap();
    }
}
