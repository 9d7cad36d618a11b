//! Random-access character view over a recording's content.
//!
//! Extractors scan the body of a fetched document by index. The view starts
//! at the content start offset and maps each byte to the Latin-1 character
//! with the same value.
//!
//! Content still in the memory region is served from it directly. Content
//! on disk goes through a fixed-size window over the backing file: a fault
//! past the window slides it forward so the requested index is its last
//! element, a fault before it recentres the window on the index.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use crawlcap_core::{Error, Result};
use tracing::debug;

use crate::backing::Backing;

const MIN_WINDOW: usize = 4096;

pub struct ReplayCharSequence {
    /// Content bytes that live in the memory region.
    prefix: Bytes,
    len: u64,
    window: Option<Window>,
}

struct Window {
    file: File,
    buf: Vec<u8>,
    capacity: usize,
    /// Character index of `buf[0]`.
    origin: u64,
    /// Character index stored at backing file offset 0.
    disk_start: u64,
    // Held so a shared backing file is not deleted under us.
    backing: Backing,
}

impl ReplayCharSequence {
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
        if content_start > memory.len() as u64 {
            return Err(Error::InvalidArgument(format!(
                "content start {} lies beyond the {} bytes held in memory",
                content_start,
                memory.len()
            )));
        }

        let len = size - content_start;
        let memory_end = size.min(memory.len() as u64) as usize;
        let prefix = memory.slice(content_start as usize..memory_end);

        let window = if len > prefix.len() as u64 {
            let backing = backing.ok_or_else(|| {
                Error::InvalidArgument(
                    "content extends past memory but there is no backing file".to_string(),
                )
            })?;
            let capacity = prefix.len().max(MIN_WINDOW);
            let mut window = Window {
                file: backing.open_read()?,
                buf: Vec::with_capacity(capacity),
                capacity,
                origin: prefix.len() as u64,
                disk_start: prefix.len() as u64,
                backing,
            };
            window.load(prefix.len() as u64, len)?;
            Some(window)
        } else {
            None
        };

        Ok(Self {
            prefix,
            len,
            window,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The character at `index`, counted from the content start.
    pub fn char_at(&mut self, index: u64) -> Result<char> {
        if index >= self.len {
            return Err(Error::InvalidArgument(format!(
                "index {} out of range for length {}",
                index, self.len
            )));
        }
        if index < self.prefix.len() as u64 {
            return Ok(char::from(self.prefix[index as usize]));
        }

        let prefix_len = self.prefix.len() as u64;
        let len = self.len;
        let window = self.window.as_mut().ok_or_else(|| {
            Error::IllegalState("disk content without a window".to_string())
        })?;

        if !window.contains(index) {
            let origin = if index >= window.origin + window.buf.len() as u64 {
                // Forward: the index becomes the window's last element.
                (index + 1).saturating_sub(window.capacity as u64)
            } else {
                debug!(
                    index = index,
                    path = ?window.backing.path(),
                    "Recentering replay window"
                );
                index.saturating_sub(window.capacity as u64 / 2)
            };
            window.load(origin.max(prefix_len), len)?;
        }

        Ok(char::from(window.buf[(index - window.origin) as usize]))
    }

    /// Characters in `[start, end)` as a `String`.
    pub fn sub_sequence(&mut self, start: u64, end: u64) -> Result<String> {
        if start > end || end > self.len {
            return Err(Error::InvalidArgument(format!(
                "range {}..{} out of bounds for length {}",
                start, end, self.len
            )));
        }
        let mut out = String::with_capacity((end - start) as usize);
        for index in start..end {
            out.push(self.char_at(index)?);
        }
        Ok(out)
    }
}

impl Window {
    fn contains(&self, index: u64) -> bool {
        index >= self.origin && index < self.origin + self.buf.len() as u64
    }

    /// Fill the window starting at character index `origin`.
    fn load(&mut self, origin: u64, len: u64) -> Result<()> {
        let count = (len - origin).min(self.capacity as u64) as usize;
        self.file.seek(SeekFrom::Start(origin - self.disk_start))?;
        self.buf.resize(count, 0);
        self.file.read_exact(&mut self.buf)?;
        self.origin = origin;
        Ok(())
    }
}

impl std::fmt::Debug for ReplayCharSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCharSequence")
            .field("len", &self.len)
            .field("prefix_len", &self.prefix.len())
            .field("windowed", &self.window.is_some())
            .finish()
    }
}
