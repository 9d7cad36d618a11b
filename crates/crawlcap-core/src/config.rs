//! Capture Configuration
//!
//! This module defines configuration for the recording, queue and archive
//! reading paths.
//!
//! ## RecorderConfig
//!
//! Controls how each fetch is captured:
//!
//! - **scratch_dir**: Directory where per-session backing files are created
//! - **buffer_size**: In-memory region per session before spilling to disk (default: 64KB)
//! - **backing_file_prefix**: Prefix prepended to every backing file name
//! - **digest_content**: Whether sessions start with a SHA-256 digest installed (default: false)
//!
//! ## QueueConfig
//!
//! - **directory**: Where disk-backed tail files live
//! - **head_max**: Maximum number of items kept in memory per queue (default: 1000)
//!
//! ## GzipConfig
//!
//! - **read_buffer_size**: Compressed input buffered per read (default: 4KB)
//!
//! ## Usage
//!
//! ```ignore
//! use crawlcap_core::CaptureConfig;
//!
//! // From a file (falls back to defaults when the file does not exist)
//! let config = CaptureConfig::load("crawlcap.toml")?;
//!
//! // Inline overrides for tests
//! let config = CaptureConfig::from_toml_str(r#"
//!     [recorder]
//!     scratch_dir = "/tmp/scratch"
//!     buffer_size = 4
//! "#)?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Recorder
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Directory for backing files (default: system temp dir)
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Memory region size in bytes (default: 64KB)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Prefix for backing file names
    #[serde(default = "default_backing_file_prefix")]
    pub backing_file_prefix: String,

    /// Install a SHA-256 digest on new sessions
    #[serde(default)]
    pub digest_content: bool,
}

impl RecorderConfig {
    /// Path of the backing file for the session called `name`.
    pub fn backing_path(&self, name: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("{}{}", self.backing_file_prefix, name))
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            buffer_size: default_buffer_size(),
            backing_file_prefix: default_backing_file_prefix(),
            digest_content: false,
        }
    }
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_buffer_size() -> usize {
    64 * 1024 // 64KB
}

fn default_backing_file_prefix() -> String {
    "crawlcap-".to_string()
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory for tail spill files
    #[serde(default = "default_queue_directory")]
    pub directory: PathBuf,

    /// Items held in memory before spilling (default: 1000)
    #[serde(default = "default_head_max")]
    pub head_max: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            directory: default_queue_directory(),
            head_max: default_head_max(),
        }
    }
}

fn default_queue_directory() -> PathBuf {
    std::env::temp_dir().join("crawlcap-queues")
}

fn default_head_max() -> usize {
    1000
}

// ============================================================================
// Gzip
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GzipConfig {
    /// Compressed bytes buffered per source read (default: 4KB)
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

fn default_read_buffer_size() -> usize {
    4 * 1024 // one page
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub gzip: GzipConfig,
}

impl CaptureConfig {
    /// Parse configuration from a TOML document. Missing sections and keys
    /// take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: CaptureConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.gzip.read_buffer_size == 0 {
            return Err(Error::Config(
                "gzip.read_buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.recorder.buffer_size, 64 * 1024);
        assert_eq!(config.queue.head_max, 1000);
        assert_eq!(config.gzip.read_buffer_size, 4096);
        assert!(!config.recorder.digest_content);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CaptureConfig::from_toml_str(
            r#"
            [recorder]
            buffer_size = 4
            backing_file_prefix = "tt"

            [queue]
            head_max = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.recorder.buffer_size, 4);
        assert_eq!(config.recorder.backing_file_prefix, "tt");
        assert_eq!(config.queue.head_max, 2);
        assert_eq!(config.gzip.read_buffer_size, 4096);
    }

    #[test]
    fn test_backing_path() {
        let config = RecorderConfig {
            scratch_dir: PathBuf::from("/scratch"),
            backing_file_prefix: "tt12-".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.backing_path("http"),
            PathBuf::from("/scratch/tt12-http")
        );
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CaptureConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.queue.head_max, 1000);
    }

    #[test]
    fn test_load_written_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crawlcap.toml");

        let mut config = CaptureConfig::default();
        config.queue.head_max = 7;
        config.recorder.digest_content = true;
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = CaptureConfig::load(&path).unwrap();
        assert_eq!(loaded.queue.head_max, 7);
        assert!(loaded.recorder.digest_content);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = CaptureConfig::from_toml_str("[queue]\nhead_max = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_read_buffer_rejected() {
        let err = CaptureConfig::from_toml_str("[gzip]\nread_buffer_size = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
