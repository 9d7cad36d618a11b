//! Hybrid Recording Buffer
//!
//! Records every byte written through it into a fixed-size memory region and,
//! once that region is full, into a per-session backing file, while
//! forwarding the same bytes to a downstream sink.
//!
//! ## Layout
//!
//! ```text
//!   write(buf) ──┬──────────────────────────────────────→ sink
//!                │
//!                ▼
//!   offset 0                 buffer_size                      size
//!   ├──────── memory ─────────┼────────── backing file ─────────┤
//!   [0, min(size, buffer_size))  [buffer_size, size) at file offset - buffer_size
//! ```
//!
//! A single `write` that straddles `buffer_size` is split: the head fills the
//! memory region and the rest goes to the backing file.
//!
//! ## Lifecycle
//!
//! 1. `open(sink)` / `open_unwrapped()` creates the backing file (fail-fast)
//! 2. `write(...)` records and forwards
//! 3. `mark_content_start()` at the header/body boundary
//! 4. `close()` flushes, closes the disk handle, hands the sink back and
//!    freezes the session
//! 5. `recording()` returns a [`Recording`] that any number of
//!    [`ReplayReader`]s can be built from
//!
//! The writer can be reopened for the next fetch once every `Recording` of
//! the previous session has been dropped.
//!
//! ## Usage
//!
//! ```ignore
//! let mut recorder = RecordingWriter::new(64 * 1024, scratch.join("tt0http"));
//! recorder.open(socket_sink)?;
//! recorder.write_all(&headers)?;
//! recorder.mark_content_start();
//! recorder.write_all(&body)?;
//! recorder.close()?;
//!
//! let recording = recorder.recording()?;
//! let mut archive_reader = recording.replay()?;
//! let mut extractor_reader = recording.content_replay()?;
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use crawlcap_core::{Error, RecorderConfig, Result};
use crawlcap_observability::metrics;
use sha2::digest::DynDigest;
use sha2::Sha256;
use tracing::debug;

use crate::backing::{Backing, BackingFile};
use crate::char_sequence::ReplayCharSequence;
use crate::replay::ReplayReader;

const DISK_WRITE_BUFFER: usize = 4096;

// ============================================================================
// Recording (frozen session)
// ============================================================================

/// A frozen recording: the memory region, the recorded size, the content
/// start offset and a shared handle on the backing file.
///
/// Cloning is cheap. The backing file stays on disk while any clone, or any
/// reader built from one, is alive.
#[derive(Debug, Clone)]
pub struct Recording {
    memory: Bytes,
    size: u64,
    content_start: u64,
    backing: Backing,
}

impl Recording {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_start(&self) -> u64 {
        self.content_start
    }

    /// Bytes recorded after the content start mark.
    pub fn response_content_length(&self) -> u64 {
        self.size - self.content_start
    }

    pub fn backing_path(&self) -> &Path {
        self.backing.path()
    }

    /// A reader positioned at offset 0.
    pub fn replay(&self) -> Result<ReplayReader> {
        ReplayReader::from_parts(
            self.memory.clone(),
            self.size,
            self.content_start,
            Some(self.backing.clone()),
        )
    }

    /// A reader already positioned at the content start.
    pub fn content_replay(&self) -> Result<ReplayReader> {
        let mut reader = self.replay()?;
        reader.set_to_response_body_start();
        Ok(reader)
    }

    pub fn char_sequence(&self) -> Result<ReplayCharSequence> {
        ReplayCharSequence::from_parts(
            self.memory.clone(),
            self.size,
            self.content_start,
            Some(self.backing.clone()),
        )
    }

    /// Write the content (everything after the content start) to `path`.
    /// Returns the number of bytes copied.
    pub fn copy_content_body_to(&self, path: impl AsRef<Path>) -> Result<u64> {
        let mut reader = self.content_replay()?;
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        let copied = reader.copy_all_to(&mut out)?;
        out.flush()?;
        Ok(copied)
    }
}

// ============================================================================
// RecordingWriter
// ============================================================================

/// The recording side of a capture session.
///
/// `W` is the downstream sink. Sessions opened with [`open_unwrapped`]
/// have no sink and only record.
///
/// [`open_unwrapped`]: RecordingWriter::open_unwrapped
pub struct RecordingWriter<W: Write> {
    buffer_size: usize,
    backing_path: PathBuf,

    sink: Option<W>,
    memory: Vec<u8>,
    disk: Option<BufWriter<File>>,
    backing: Option<Arc<BackingFile>>,
    frozen: Option<Bytes>,

    position: u64,
    content_start: u64,
    open: bool,

    digest: Option<Box<dyn DynDigest + Send>>,
    should_digest: bool,
}

impl<W: Write> RecordingWriter<W> {
    /// A recorder keeping `buffer_size` bytes in memory and spilling the
    /// rest to `backing_path`. Nothing touches the disk until `open`.
    pub fn new(buffer_size: usize, backing_path: impl Into<PathBuf>) -> Self {
        Self {
            buffer_size,
            backing_path: backing_path.into(),
            sink: None,
            memory: Vec::new(),
            disk: None,
            backing: None,
            frozen: None,
            position: 0,
            content_start: 0,
            open: false,
            digest: None,
            should_digest: false,
        }
    }

    /// A recorder for the session called `name`, sized and placed per
    /// `config`. Installs a SHA-256 digest when `digest_content` is set.
    pub fn from_config(config: &RecorderConfig, name: &str) -> Self {
        let mut recorder = Self::new(config.buffer_size, config.backing_path(name));
        if config.digest_content {
            recorder.set_sha256_digest();
        }
        recorder
    }

    /// Begin a session that records and forwards to `sink`.
    pub fn open(&mut self, sink: W) -> Result<()> {
        self.begin(Some(sink))
    }

    /// Begin a session that only records.
    pub fn open_unwrapped(&mut self) -> Result<()> {
        self.begin(None)
    }

    fn begin(&mut self, sink: Option<W>) -> Result<()> {
        if self.open {
            return Err(Error::IllegalState(
                "recording session is already open".to_string(),
            ));
        }
        if let Some(previous) = &self.backing {
            if Arc::strong_count(previous) > 1 {
                return Err(Error::IllegalState(format!(
                    "backing file {:?} is still referenced by an earlier recording",
                    previous.path()
                )));
            }
        }
        // Deletes the previous session's file before the path is reused.
        self.backing = None;
        self.frozen = None;

        let (backing, file) = BackingFile::create(&self.backing_path)?;
        self.backing = Some(backing);
        self.disk = Some(BufWriter::with_capacity(DISK_WRITE_BUFFER, file));
        self.memory = Vec::with_capacity(self.buffer_size);
        self.sink = sink;
        self.position = 0;
        self.content_start = 0;
        // Always begins false; start_digest() turns it on.
        self.should_digest = false;
        self.open = true;

        debug!(
            path = ?self.backing_path,
            buffer_size = self.buffer_size,
            wrapped = self.sink.is_some(),
            "Recording opened"
        );
        Ok(())
    }

    fn record(&mut self, buf: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::IllegalState(
                "write to a recording that is not open".to_string(),
            ));
        }
        if self.should_digest {
            if let Some(digest) = self.digest.as_mut() {
                digest.update(buf);
            }
        }

        let room = self.buffer_size.saturating_sub(self.memory.len());
        let to_memory = room.min(buf.len());
        if to_memory > 0 {
            self.memory.extend_from_slice(&buf[..to_memory]);
            metrics::RECORDED_BYTES_TOTAL
                .with_label_values(&["memory"])
                .inc_by(to_memory as u64);
        }

        let rest = &buf[to_memory..];
        if !rest.is_empty() {
            let disk = self.disk.as_mut().ok_or_else(|| {
                Error::IllegalState("backing file handle is closed".to_string())
            })?;
            disk.write_all(rest)?;
            metrics::RECORDED_BYTES_TOTAL
                .with_label_values(&["disk"])
                .inc_by(rest.len() as u64);
        }

        self.position += buf.len() as u64;
        Ok(())
    }

    /// Remember the current position as the start of the content body.
    /// Calling it again overwrites the earlier mark.
    pub fn mark_content_start(&mut self) {
        self.content_start = self.position;
    }

    pub fn content_start(&self) -> u64 {
        self.content_start
    }

    /// Bytes recorded so far.
    pub fn size(&self) -> u64 {
        self.position
    }

    pub fn response_content_length(&self) -> u64 {
        self.position - self.content_start
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing_path
    }

    /// The sink of the open session, if any.
    pub fn sink(&self) -> Option<&W> {
        self.sink.as_ref()
    }

    /// Close the session: flush and close the backing file, flush the sink
    /// and hand it back, freeze the recorded bytes.
    ///
    /// Idempotent. A second call returns `Ok(None)`.
    pub fn close(&mut self) -> Result<Option<W>> {
        if !self.open {
            return Ok(None);
        }
        self.open = false;

        let mut sink = self.sink.take();
        let sink_result = match sink.as_mut() {
            Some(s) => s.flush(),
            None => Ok(()),
        };
        let disk_result = match self.disk.take() {
            Some(mut disk) => disk.flush(),
            None => Ok(()),
        };
        self.frozen = Some(Bytes::from(std::mem::take(&mut self.memory)));

        debug!(
            path = ?self.backing_path,
            size = self.position,
            content_start = self.content_start,
            "Recording closed"
        );

        disk_result?;
        sink_result?;
        Ok(sink)
    }

    /// The frozen recording of the last closed session.
    pub fn recording(&self) -> Result<Recording> {
        if self.open {
            return Err(Error::IllegalState(
                "recording is still open; close() it before replaying".to_string(),
            ));
        }
        let (memory, backing) = match (&self.frozen, &self.backing) {
            (Some(memory), Some(backing)) => (memory.clone(), backing.clone()),
            _ => {
                return Err(Error::IllegalState(
                    "nothing has been recorded yet".to_string(),
                ))
            }
        };
        Ok(Recording {
            memory,
            size: self.position,
            content_start: self.content_start,
            backing: Backing::Shared(backing),
        })
    }

    /// Shorthand for `recording()?.replay()`.
    pub fn replay(&self) -> Result<ReplayReader> {
        self.recording()?.replay()
    }

    /// Shorthand for `recording()?.content_replay()`.
    pub fn content_replay(&self) -> Result<ReplayReader> {
        self.recording()?.content_replay()
    }

    // ------------------------------------------------------------------------
    // Digest
    // ------------------------------------------------------------------------

    /// Install a digest. It is only fed once `start_digest()` is called.
    pub fn set_digest(&mut self, digest: Box<dyn DynDigest + Send>) {
        self.digest = Some(digest);
    }

    pub fn set_sha256_digest(&mut self) {
        self.set_digest(Box::new(Sha256::default()));
    }

    /// Reset the installed digest and feed it every byte recorded from now
    /// on. No-op without a digest.
    pub fn start_digest(&mut self) {
        if let Some(digest) = self.digest.as_mut() {
            digest.reset();
            self.should_digest = true;
        }
    }

    /// Finalize the digest over everything fed since `start_digest()`.
    /// Resets the digest state.
    pub fn digest_value(&mut self) -> Option<Vec<u8>> {
        self.digest
            .as_mut()
            .map(|digest| digest.finalize_reset().into_vec())
    }
}

impl<W: Write> Write for RecordingWriter<W> {
    /// Records (and digests) `buf` before forwarding it. If the sink then
    /// fails, the error is returned but the bytes stay in the recording, so
    /// an `Err` here does not mean nothing was written. Callers treat a sink
    /// failure as fatal to the session rather than retrying the write.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.record(buf)?;
        if let Some(sink) = self.sink.as_mut() {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        if let Some(disk) = self.disk.as_mut() {
            disk.flush()?;
        }
        Ok(())
    }
}

impl<W: Write> fmt::Debug for RecordingWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingWriter")
            .field("backing_path", &self.backing_path)
            .field("buffer_size", &self.buffer_size)
            .field("position", &self.position)
            .field("content_start", &self.content_start)
            .field("open", &self.open)
            .finish()
    }
}
