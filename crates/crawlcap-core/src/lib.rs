pub mod config;
pub mod error;

pub use config::{CaptureConfig, GzipConfig, QueueConfig, RecorderConfig};
pub use error::{Error, Result};
