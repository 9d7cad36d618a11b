//! Crawlcap Queue
//!
//! A FIFO for crawl frontiers that keeps its first `head_max` items in
//! memory and spills the rest to a pair of files on disk.
//!
//! ## Modules
//!
//! - [`hybrid`]: [`HybridQueue`], the memory head plus disk tail, and its
//!   removing iterator
//! - [`disk`]: [`DiskQueue`], the CRC-framed file queue used as the tail
//! - [`shared`]: [`SharedHybridQueue`], a cloneable locked handle
//!
//! ## Usage
//!
//! ```ignore
//! use crawlcap_queue::HybridQueue;
//!
//! let mut queue = HybridQueue::open("/var/lib/crawl/queues", "example.com", 1000)?;
//! queue.enqueue("https://example.com/".to_string())?;
//! while let Some(url) = queue.dequeue()? {
//!     fetch(url);
//! }
//! queue.release()?;
//! ```

pub mod disk;
pub mod hybrid;
pub mod shared;

pub use disk::DiskQueue;
pub use hybrid::{HybridQueue, QueueIter};
pub use shared::SharedHybridQueue;
