//! Backing file ownership.
//!
//! A recording session creates exactly one backing file. The session, every
//! [`Recording`](crate::Recording) frozen from it and every reader derived
//! from those share one [`BackingFile`] through an `Arc`; the file is
//! deleted when the last holder is dropped.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crawlcap_core::Result;
use crawlcap_observability::metrics;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct BackingFile {
    path: PathBuf,
}

impl BackingFile {
    /// Create (or truncate) the file at `path`, returning the shared owner
    /// and a write handle.
    pub(crate) fn create(path: &Path) -> Result<(Arc<BackingFile>, File)> {
        let file = File::create(path)?;
        metrics::BACKING_FILES_LIVE.inc();
        debug!(path = ?path, "Backing file created");
        Ok((
            Arc::new(BackingFile {
                path: path.to_path_buf(),
            }),
            file,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        metrics::BACKING_FILES_LIVE.dec();
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Backing file deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to delete backing file"),
        }
    }
}

/// Where the disk tier of a recording lives.
#[derive(Debug, Clone)]
pub(crate) enum Backing {
    /// Created by a recording session; deleted with its last holder.
    Shared(Arc<BackingFile>),
    /// Supplied by the caller, who owns its lifetime.
    External(PathBuf),
}

impl Backing {
    pub(crate) fn path(&self) -> &Path {
        match self {
            Backing::Shared(file) => file.path(),
            Backing::External(path) => path,
        }
    }

    pub(crate) fn open_read(&self) -> Result<File> {
        Ok(File::open(self.path())?)
    }
}
