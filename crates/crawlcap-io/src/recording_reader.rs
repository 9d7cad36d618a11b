//! Input-side recording.
//!
//! [`RecordingReader`] wraps a source (typically a socket) and records every
//! byte read from it through an unwrapped [`RecordingWriter`]. Fetchers read
//! the response through it, then hand the frozen [`Recording`] to the
//! archive writer and extractors.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crawlcap_core::{Error, RecorderConfig, Result};
use sha2::digest::DynDigest;
use tracing::debug;

use crate::char_sequence::ReplayCharSequence;
use crate::recorder::{Recording, RecordingWriter};
use crate::replay::ReplayReader;

const DRAIN_BUFFER_SIZE: usize = 4096;

pub struct RecordingReader<R: Read> {
    inner: Option<R>,
    recorder: RecordingWriter<io::Sink>,
}

impl<R: Read> RecordingReader<R> {
    pub fn new(buffer_size: usize, backing_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: None,
            recorder: RecordingWriter::new(buffer_size, backing_path),
        }
    }

    pub fn from_config(config: &RecorderConfig, name: &str) -> Self {
        Self {
            inner: None,
            recorder: RecordingWriter::from_config(config, name),
        }
    }

    /// Start recording everything read from `source`.
    pub fn open(&mut self, source: R) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::IllegalState(
                "recording reader is already open".to_string(),
            ));
        }
        self.recorder.open_unwrapped()?;
        self.inner = Some(source);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Read the source to EOF. Returns the total recorded size.
    pub fn read_fully(&mut self) -> Result<u64> {
        let mut buf = [0u8; DRAIN_BUFFER_SIZE];
        loop {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.recorder.size())
    }

    /// Read the source to EOF, giving up once `max_length` bytes have been
    /// recorded (`LengthExceeded`) or `timeout` has elapsed (`Timeout`).
    /// Zero disables either limit.
    ///
    /// A read that times out at the socket level is retried until the
    /// overall deadline passes. Does nothing if the reader is not open.
    pub fn read_fully_or_until(&mut self, max_length: u64, timeout: Duration) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = (!timeout.is_zero()).then(|| started + timeout);
        let buf_len = if max_length > 0 {
            DRAIN_BUFFER_SIZE.min(max_length as usize)
        } else {
            DRAIN_BUFFER_SIZE
        };
        let mut buf = vec![0u8; buf_len];
        let mut total = 0u64;

        loop {
            match self.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => total += n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) && deadline.is_some() => {}
                Err(e) => return Err(e.into()),
            }

            if max_length > 0 && total >= max_length {
                debug!(limit = max_length, "Recording length limit reached");
                return Err(Error::LengthExceeded { limit: max_length });
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    debug!(elapsed_ms = elapsed_ms, "Recording timed out");
                    return Err(Error::Timeout { elapsed_ms });
                }
            }
        }
    }

    /// Drop the source and close the recorder.
    pub fn close(&mut self) -> Result<()> {
        self.inner = None;
        self.recorder.close()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.recorder.size()
    }

    pub fn mark_content_start(&mut self) {
        self.recorder.mark_content_start();
    }

    pub fn response_content_length(&self) -> u64 {
        self.recorder.response_content_length()
    }

    pub fn backing_path(&self) -> &Path {
        self.recorder.backing_path()
    }

    pub fn set_digest(&mut self, digest: Box<dyn DynDigest + Send>) {
        self.recorder.set_digest(digest);
    }

    pub fn set_sha256_digest(&mut self) {
        self.recorder.set_sha256_digest();
    }

    pub fn start_digest(&mut self) {
        self.recorder.start_digest();
    }

    pub fn digest_value(&mut self) -> Option<Vec<u8>> {
        self.recorder.digest_value()
    }

    pub fn recording(&self) -> Result<Recording> {
        self.recorder.recording()
    }

    pub fn replay(&self) -> Result<ReplayReader> {
        self.recorder.replay()
    }

    pub fn content_replay(&self) -> Result<ReplayReader> {
        self.recorder.content_replay()
    }

    pub fn char_sequence(&self) -> Result<ReplayCharSequence> {
        self.recording()?.char_sequence()
    }

    pub fn copy_content_body_to(&self, path: impl AsRef<Path>) -> Result<u64> {
        self.recording()?.copy_content_body_to(path)
    }
}

impl<R: Read> Read for RecordingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream closed"))?;
        let n = inner.read(buf)?;
        if n > 0 {
            io::Write::write_all(&mut self.recorder, &buf[..n])?;
        }
        Ok(n)
    }
}
