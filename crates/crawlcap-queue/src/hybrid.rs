//! Hybrid Memory/Disk Queue
//!
//! A FIFO whose first `head_max` items live in memory and whose remainder
//! spills to a [`DiskQueue`].
//!
//! ```text
//!            dequeue ◀── [ head: VecDeque, len ≤ head_max ] ◀── refill ── [ tail: DiskQueue ] ◀── enqueue
//!                                       ▲                                                        │
//!                                       └──────── enqueue (head has room after refill) ──────────┘
//! ```
//!
//! ## Refill rules
//!
//! - `enqueue`: if the head has room, first refill it from the tail, then
//!   append to the head only if it still has room; otherwise append to the
//!   tail. New items never overtake older tail items.
//! - `dequeue`: refill first when the head is empty, and again after taking
//!   the head's last item. With `head_max == 0` nothing is ever refilled and
//!   items come straight from the tail.
//! - `peek`: looks at the head only and never refills. A head emptied by
//!   removal, or `head_max == 0`, peeks as `None` over a non-empty tail even
//!   though `dequeue` would return an item.

use std::collections::VecDeque;
use std::path::Path;

use crawlcap_core::{Error, QueueConfig, Result};
use crawlcap_observability::metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::disk::{DiskQueue, TailScan};

pub struct HybridQueue<T> {
    head: VecDeque<T>,
    head_max: usize,
    tail: DiskQueue<T>,
}

impl<T> HybridQueue<T> {
    /// The first item of the head. Does not refill from the tail.
    pub fn peek(&self) -> Option<&T> {
        self.head.front()
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head_len(&self) -> usize {
        self.head.len()
    }

    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    pub fn head_max(&self) -> usize {
        self.head_max
    }

    pub fn name(&self) -> &str {
        self.tail.name()
    }
}

impl<T: Serialize + DeserializeOwned> HybridQueue<T> {
    /// Open an empty queue; the tail's files are `{directory}/{name}.q*`.
    pub fn open(directory: impl AsRef<Path>, name: &str, head_max: usize) -> Result<Self> {
        let tail = DiskQueue::open(directory, name)?;
        debug!(name = name, head_max = head_max, "Hybrid queue opened");
        Ok(Self {
            head: VecDeque::with_capacity(head_max.min(1024)),
            head_max,
            tail,
        })
    }

    pub fn from_config(config: &QueueConfig, name: &str) -> Result<Self> {
        Self::open(&config.directory, name, config.head_max)
    }

    pub fn enqueue(&mut self, item: T) -> Result<()> {
        if self.head.len() < self.head_max {
            self.refill()?;
            if self.head.len() < self.head_max {
                self.head.push_back(item);
                return Ok(());
            }
        }
        self.tail.enqueue(&item)?;
        metrics::QUEUE_SPILLED_TOTAL.inc();
        Ok(())
    }

    /// Remove and return the first item, or `None` when the queue is empty.
    pub fn dequeue(&mut self) -> Result<Option<T>> {
        if self.head.is_empty() {
            self.refill()?;
        }
        match self.head.pop_front() {
            Some(item) => {
                if self.head.is_empty() {
                    if let Err(e) = self.refill() {
                        self.head.push_front(item);
                        return Err(e);
                    }
                }
                Ok(Some(item))
            }
            None => self.tail.dequeue(),
        }
    }

    /// Move tail items into the head until it is full or the tail is empty.
    /// Returns how many moved.
    fn refill(&mut self) -> Result<usize> {
        let mut moved = 0;
        while self.head.len() < self.head_max {
            match self.tail.dequeue()? {
                Some(item) => {
                    self.head.push_back(item);
                    moved += 1;
                }
                None => break,
            }
        }
        if moved > 0 {
            metrics::QUEUE_REFILLED_TOTAL.inc_by(moved as u64);
            debug!(
                name = self.tail.name(),
                moved = moved,
                tail_len = self.tail.len(),
                "Refilled queue head"
            );
        }
        Ok(moved)
    }

    /// Remove every item, head and tail, matching `predicate`. Returns the
    /// number removed.
    pub fn remove_matching<F>(&mut self, mut predicate: F) -> Result<usize>
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.head.len();
        self.head.retain(|item| !predicate(item));
        let from_head = before - self.head.len();
        let from_tail = self.tail.remove_matching(&mut predicate)?;

        if from_head + from_tail > 0 {
            info!(
                name = self.tail.name(),
                from_head = from_head,
                from_tail = from_tail,
                "Removed matching queue items"
            );
        }
        Ok(from_head + from_tail)
    }

    /// Discard the tail's files. The queue is gone afterwards.
    pub fn release(self) -> Result<()> {
        info!(name = self.tail.name(), dropped = self.len(), "Releasing hybrid queue");
        self.tail.release()
    }
}

impl<T: Serialize + DeserializeOwned + Clone> HybridQueue<T> {
    /// Iterate the queue in FIFO order without consuming it.
    ///
    /// With `memory_only` only the head is visited. Otherwise the head is
    /// followed by the tail. [`QueueIter::remove`] deletes the item the
    /// iterator last yielded, wherever it lives.
    pub fn iter(&mut self, memory_only: bool) -> Result<QueueIter<'_, T>> {
        let tail = if memory_only {
            None
        } else {
            Some(self.tail.scan()?)
        };
        Ok(QueueIter {
            queue: self,
            head_index: 0,
            tail,
            last: None,
        })
    }
}

impl<T> std::fmt::Debug for HybridQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridQueue")
            .field("head_len", &self.head.len())
            .field("head_max", &self.head_max)
            .field("tail", &self.tail)
            .finish()
    }
}

// ============================================================================
// Compound iterator
// ============================================================================

enum Yielded {
    Head(usize),
    Tail(u64),
}

/// Head-then-tail iterator returned by [`HybridQueue::iter`].
pub struct QueueIter<'a, T> {
    queue: &'a mut HybridQueue<T>,
    head_index: usize,
    tail: Option<TailScan<T>>,
    last: Option<Yielded>,
}

impl<T: Serialize + DeserializeOwned + Clone> QueueIter<'_, T> {
    /// Remove the item most recently returned by `next`.
    pub fn remove(&mut self) -> Result<()> {
        match self.last.take() {
            None => Err(Error::IllegalState(
                "remove() without a preceding next()".to_string(),
            )),
            Some(Yielded::Head(index)) => {
                self.queue.head.remove(index);
                self.head_index -= 1;
                Ok(())
            }
            Some(Yielded::Tail(seq)) => self.queue.tail.tombstone(seq),
        }
    }
}

impl<T: Serialize + DeserializeOwned + Clone> Iterator for QueueIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.queue.head.get(self.head_index) {
            let item = item.clone();
            self.last = Some(Yielded::Head(self.head_index));
            self.head_index += 1;
            return Some(Ok(item));
        }

        match self.tail.as_mut()?.next()? {
            Ok((seq, item)) => {
                self.last = Some(Yielded::Tail(seq));
                Some(Ok(item))
            }
            Err(e) => {
                self.last = None;
                Some(Err(e))
            }
        }
    }
}
