//! Replay Reader
//!
//! Re-reads a frozen recording: memory region first, then the backing file.
//! Every reader owns its position, its mark and its own file handle, so any
//! number of readers over one recording can advance independently.
//!
//! A bulk read never crosses the memory/disk boundary. It stops at
//! `min(size, memory.len())` and the follow-up read falls through to disk.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;
use crawlcap_core::{Error, Result};
use crawlcap_observability::metrics;

use crate::backing::Backing;

const DISK_READ_BUFFER: usize = 4096;
const COPY_BUFFER_SIZE: usize = 16 * 1024;

pub struct ReplayReader {
    memory: Bytes,
    size: u64,
    content_start: u64,
    backing: Option<Backing>,

    /// Lazily opened handle and the offset it is positioned at.
    file: Option<(BufReader<File>, u64)>,

    position: u64,
    mark: Option<Mark>,
    copy_buffer: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    position: u64,
    read_limit: u64,
}

impl ReplayReader {
    /// Build a reader over bytes recorded elsewhere.
    ///
    /// `memory` holds the first bytes of the recording; offsets at or past
    /// `memory.len()` are read from `backing_path` at `offset - memory.len()`.
    /// The caller keeps ownership of the backing file.
    pub fn new(
        memory: impl Into<Bytes>,
        size: u64,
        content_start: u64,
        backing_path: Option<PathBuf>,
    ) -> Result<Self> {
        Self::from_parts(
            memory.into(),
            size,
            content_start,
            backing_path.map(Backing::External),
        )
    }

    pub(crate) fn from_parts(
        memory: Bytes,
        size: u64,
        content_start: u64,
        backing: Option<Backing>,
    ) -> Result<Self> {
        if content_start > size {
            return Err(Error::InvalidArgument(format!(
                "content start {} is past the recording size {}",
                content_start, size
            )));
        }
        if size > memory.len() as u64 && backing.is_none() {
            return Err(Error::InvalidArgument(format!(
                "recording of {} bytes needs a backing file beyond the {} bytes in memory",
                size,
                memory.len()
            )));
        }
        metrics::REPLAY_READERS_OPENED_TOTAL.inc();
        Ok(Self {
            memory,
            size,
            content_start,
            backing,
            file: None,
            position: 0,
            mark: None,
            copy_buffer: Vec::new(),
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_start(&self) -> u64 {
        self.content_start
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.position
    }

    /// Jump to the content start, skipping protocol headers. Returns the new
    /// position.
    pub fn set_to_response_body_start(&mut self) -> u64 {
        self.position = self.content_start;
        self.position
    }

    /// Read one byte, or `None` at the end of the recording.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read_into(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Read up to `buf.len()` bytes. Returns 0 at the end of the recording.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.size {
            return Ok(0);
        }

        let memory_len = self.memory.len() as u64;
        if self.position < memory_len {
            let end = self.size.min(memory_len);
            let n = (end - self.position).min(buf.len() as u64) as usize;
            let start = self.position as usize;
            buf[..n].copy_from_slice(&self.memory[start..start + n]);
            self.position += n as u64;
            return Ok(n);
        }

        let want = (self.size - self.position).min(buf.len() as u64) as usize;
        let n = self.read_from_disk(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "backing file ended at recording offset {} of {}",
                    self.position, self.size
                ),
            )));
        }
        self.position += n as u64;
        Ok(n)
    }

    fn read_from_disk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let offset = self.position - self.memory.len() as u64;
        let (mut file, mut file_pos) = match self.file.take() {
            Some(open) => open,
            None => {
                let backing = self.backing.as_ref().ok_or_else(|| {
                    Error::IllegalState("recording has no backing file".to_string())
                })?;
                (
                    BufReader::with_capacity(DISK_READ_BUFFER, backing.open_read()?),
                    0,
                )
            }
        };
        if file_pos != offset {
            file.seek(SeekFrom::Start(offset))?;
            file_pos = offset;
        }
        let n = file.read(buf)?;
        self.file = Some((file, file_pos + n as u64));
        Ok(n)
    }

    /// Remember the current position.
    pub fn mark(&mut self, read_limit: u64) {
        self.mark = Some(Mark {
            position: self.position,
            read_limit,
        });
    }

    /// Return to the marked position.
    ///
    /// The position is restored only when `mark_position - position` is
    /// below the read limit. Reading forward makes that difference zero or
    /// negative, so a reset after reading always succeeds; one after seeking
    /// backward past `mark_position - read_limit` is declined.
    ///
    /// Returns `Ok(true)` when the position was restored, `Ok(false)` when
    /// the limit check declined, and `IllegalState` without a prior mark.
    pub fn reset(&mut self) -> Result<bool> {
        let mark = self
            .mark
            .ok_or_else(|| Error::IllegalState("reset() without mark()".to_string()))?;
        if (mark.position as i128 - self.position as i128) < mark.read_limit as i128 {
            self.position = mark.position;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drain the rest of the recording into `sink`. Returns the number of
    /// bytes copied.
    pub fn copy_all_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64> {
        let mut buf = std::mem::take(&mut self.copy_buffer);
        if buf.is_empty() {
            buf = vec![0u8; COPY_BUFFER_SIZE];
        }
        let mut copied = 0u64;
        let result = loop {
            match self.read_into(&mut buf) {
                Ok(0) => break Ok(copied),
                Ok(n) => {
                    if let Err(e) = sink.write_all(&buf[..n]) {
                        break Err(Error::Io(e));
                    }
                    copied += n as u64;
                }
                Err(e) => break Err(e),
            }
        };
        self.copy_buffer = buf;
        result
    }
}

impl Read for ReplayReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf)?)
    }
}

impl Seek for ReplayReader {
    /// Targets past the end clamp to `size`.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }
        self.position = (target as u64).min(self.size);
        Ok(self.position)
    }
}

impl std::fmt::Debug for ReplayReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayReader")
            .field("size", &self.size)
            .field("memory_len", &self.memory.len())
            .field("content_start", &self.content_start)
            .field("position", &self.position)
            .field("backing", &self.backing.as_ref().map(|b| b.path().to_path_buf()))
            .finish()
    }
}
