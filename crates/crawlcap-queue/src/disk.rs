//! Disk-backed FIFO (the tail of a hybrid queue)
//!
//! Items are serialized with bincode and appended to files in the queue's
//! directory. Only the current frame is ever held in memory.
//!
//! ## Files
//!
//! ```text
//! {dir}/{name}.qin    read side: frames not yet dequeued start at read_offset
//! {dir}/{name}.qout   append side: every enqueue lands here
//! ```
//!
//! When `.qin` is used up and `.qout` holds frames, the queue "flips": the
//! append file is renamed over the read file and a fresh append file is
//! started. Global order is `.qin` (from read_offset) then `.qout`.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┐
//! │ Payload Size │ CRC32        │ Payload         │
//! │ (4 bytes LE) │ (4 bytes LE) │ (bincode bytes) │
//! └──────────────┴──────────────┴─────────────────┘
//! ```
//!
//! A frame whose checksum does not match is consumed and reported as
//! `CrcMismatch`; the counts and sequence numbers move past it, so the next
//! `dequeue` returns the following item.
//!
//! A frame cut short, a failed read or a failed append leaves the files in
//! an unknown state. The queue is then poisoned: every later operation except
//! `release` fails with `IllegalState` naming the original error.
//!
//! ## Removal
//!
//! Every enqueued item gets a sequence number. Removing an item in the
//! middle of the queue (through a hybrid queue iterator) records a tombstone
//! for its sequence number; the frame is dropped when `dequeue` reaches it.
//! `remove_matching` instead compacts with one full dequeue/requeue pass.
//!
//! Files from an earlier process with the same name are deleted at open; the
//! queue does not survive restarts.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crawlcap_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

const FRAME_HEADER_LEN: u64 = 8;

pub struct DiskQueue<T> {
    name: String,
    in_path: PathBuf,
    out_path: PathBuf,

    reader: Option<BufReader<File>>,
    read_offset: u64,
    in_frames: u64,

    writer: Option<BufWriter<File>>,
    out_frames: u64,

    /// Sequence number of the next frame `dequeue` will read.
    head_seq: u64,
    /// Tombstoned sequence numbers not yet reached by `dequeue`.
    removed: BTreeSet<u64>,

    /// Set once the files can no longer be trusted.
    poisoned: Option<String>,

    _item: PhantomData<fn() -> T>,
}

impl<T> DiskQueue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live items (tombstoned frames excluded).
    pub fn len(&self) -> usize {
        (self.in_frames + self.out_frames) as usize - self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_seq(&self) -> u64 {
        self.head_seq + self.in_frames + self.out_frames
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    fn check_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(Error::IllegalState(format!(
                "disk queue {} is unusable after an earlier failure: {}",
                self.name, reason
            ))),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: Error) -> Error {
        warn!(name = %self.name, error = %err, "Disk queue poisoned");
        self.poisoned = Some(err.to_string());
        err
    }
}

impl<T: Serialize + DeserializeOwned> DiskQueue<T> {
    /// Open an empty queue called `name` in `directory`, creating the
    /// directory if needed and deleting leftover files of the same name.
    pub fn open(directory: impl AsRef<Path>, name: &str) -> Result<Self> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let in_path = directory.join(format!("{}.qin", name));
        let out_path = directory.join(format!("{}.qout", name));
        for stale in [&in_path, &out_path] {
            if remove_if_exists(stale)? {
                info!(path = ?stale, "Removed stale queue file");
            }
        }

        let writer = BufWriter::new(File::create(&out_path)?);
        debug!(name = name, path = ?out_path, "Disk queue opened");

        Ok(Self {
            name: name.to_string(),
            in_path,
            out_path,
            reader: None,
            read_offset: 0,
            in_frames: 0,
            writer: Some(writer),
            out_frames: 0,
            head_seq: 0,
            removed: BTreeSet::new(),
            poisoned: None,
            _item: PhantomData,
        })
    }

    pub fn enqueue(&mut self, item: &T) -> Result<()> {
        self.check_usable()?;
        let payload =
            bincode::serialize(item).map_err(|e| Error::Serialization(e.to_string()))?;
        let frame = encode_frame(&payload)?;

        if let Err(e) = self.append(&frame) {
            return Err(self.poison(e));
        }
        self.out_frames += 1;
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(BufWriter::new(File::create(&self.out_path)?));
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(frame)?;
        }
        Ok(())
    }

    /// Remove and return the oldest live item.
    pub fn dequeue(&mut self) -> Result<Option<T>> {
        self.check_usable()?;
        loop {
            if self.in_frames == 0 {
                if self.out_frames == 0 {
                    return Ok(None);
                }
                if let Err(e) = self.flip() {
                    return Err(self.poison(e));
                }
            }

            let (payload, stored_crc) = match self.read_next_frame() {
                Ok(frame) => frame,
                Err(e) => return Err(self.poison(e)),
            };
            // Read whole, so the position moves past it even if the
            // checksum is bad.
            self.read_offset += FRAME_HEADER_LEN + payload.len() as u64;
            self.in_frames -= 1;
            let seq = self.head_seq;
            self.head_seq += 1;

            if self.removed.remove(&seq) {
                continue;
            }
            if crc32fast::hash(&payload) != stored_crc {
                warn!(
                    name = %self.name,
                    seq = seq,
                    path = ?self.in_path,
                    "Dropped queue frame with bad checksum"
                );
                return Err(Error::CrcMismatch {
                    path: self.in_path.clone(),
                });
            }
            return decode(&payload).map(Some);
        }
    }

    fn read_next_frame(&mut self) -> Result<(Vec<u8>, u32)> {
        if self.reader.is_none() {
            let mut file = File::open(&self.in_path)?;
            file.seek(SeekFrom::Start(self.read_offset))?;
            self.reader = Some(BufReader::new(file));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::IllegalState("queue reader unavailable".to_string()))?;

        match read_raw_frame(reader)? {
            Some(frame) => Ok(frame),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{:?} ended with {} frames still expected",
                    self.in_path, self.in_frames
                ),
            ))),
        }
    }

    /// Make the append file the read file.
    fn flip(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.reader = None;
        remove_if_exists(&self.in_path)?;
        fs::rename(&self.out_path, &self.in_path)?;

        self.read_offset = 0;
        self.in_frames = self.out_frames;
        self.out_frames = 0;
        self.writer = Some(BufWriter::new(File::create(&self.out_path)?));

        debug!(name = %self.name, frames = self.in_frames, "Disk queue flipped");
        Ok(())
    }

    /// Tombstone the item with sequence number `seq` (as reported by
    /// [`scan`](Self::scan)).
    pub fn tombstone(&mut self, seq: u64) -> Result<()> {
        self.check_usable()?;
        if seq < self.head_seq || seq >= self.next_seq() {
            return Err(Error::InvalidArgument(format!(
                "sequence {} is not in the queue (live range {}..{})",
                seq,
                self.head_seq,
                self.next_seq()
            )));
        }
        if !self.removed.insert(seq) {
            return Err(Error::IllegalState(format!(
                "item {} was already removed",
                seq
            )));
        }
        Ok(())
    }

    /// Iterate the live items in order without consuming them.
    ///
    /// The scan reads through its own file handles and reflects the queue
    /// as of this call.
    pub fn scan(&mut self) -> Result<TailScan<T>> {
        self.check_usable()?;
        let flushed = match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        };
        if let Err(e) = flushed {
            return Err(self.poison(e.into()));
        }

        let mut segments = Vec::with_capacity(2);
        if self.in_frames > 0 {
            let mut file = File::open(&self.in_path)?;
            file.seek(SeekFrom::Start(self.read_offset))?;
            segments.push(Segment {
                reader: BufReader::new(file),
                path: self.in_path.clone(),
                frames: self.in_frames,
            });
        }
        if self.out_frames > 0 {
            segments.push(Segment {
                reader: BufReader::new(File::open(&self.out_path)?),
                path: self.out_path.clone(),
                frames: self.out_frames,
            });
        }
        segments.reverse();

        Ok(TailScan {
            segments,
            seq: self.head_seq,
            removed: self.removed.clone(),
            _item: PhantomData,
        })
    }

    /// Remove every item matching `predicate`, keeping the order of the
    /// rest. Returns how many were removed. Frames with a bad checksum are
    /// dropped along the way and not counted.
    pub fn remove_matching<F>(&mut self, mut predicate: F) -> Result<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.check_usable()?;
        let live = self.len();
        let mut removed = 0;
        for _ in 0..live {
            let item = match self.dequeue() {
                Ok(Some(item)) => item,
                Ok(None) => {
                    return Err(Error::IllegalState(
                        "disk queue shrank during compaction".to_string(),
                    ))
                }
                Err(Error::CrcMismatch { .. }) => continue,
                Err(e) => return Err(e),
            };
            if predicate(&item) {
                removed += 1;
            } else {
                self.enqueue(&item)?;
            }
        }
        if removed > 0 {
            debug!(name = %self.name, removed = removed, "Disk queue compacted");
        }
        Ok(removed)
    }

    /// Delete both files.
    pub fn release(mut self) -> Result<()> {
        self.reader = None;
        self.writer = None;
        remove_if_exists(&self.in_path)?;
        remove_if_exists(&self.out_path)?;
        info!(name = %self.name, "Disk queue released");
        Ok(())
    }

    pub fn paths(&self) -> (&Path, &Path) {
        (&self.in_path, &self.out_path)
    }
}

impl<T> std::fmt::Debug for DiskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("name", &self.name)
            .field("in_frames", &self.in_frames)
            .field("out_frames", &self.out_frames)
            .field("tombstones", &self.removed.len())
            .finish()
    }
}

// ============================================================================
// Scan
// ============================================================================

struct Segment {
    reader: BufReader<File>,
    path: PathBuf,
    frames: u64,
}

/// Non-consuming iterator over a [`DiskQueue`], yielding each live item
/// with its sequence number.
pub struct TailScan<T> {
    /// Remaining segments, last one first.
    segments: Vec<Segment>,
    seq: u64,
    removed: BTreeSet<u64>,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for TailScan<T> {
    type Item = Result<(u64, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.segments.last_mut()?;
            if segment.frames == 0 {
                self.segments.pop();
                continue;
            }

            let payload = match read_frame(&mut segment.reader, &segment.path) {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{:?} ended before its last frame", segment.path),
                    );
                    self.segments.clear();
                    return Some(Err(err.into()));
                }
                Err(e) => {
                    self.segments.clear();
                    return Some(Err(e));
                }
            };
            segment.frames -= 1;
            let seq = self.seq;
            self.seq += 1;

            if self.removed.contains(&seq) {
                continue;
            }
            return Some(decode(&payload).map(|item| (seq, item)));
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        Error::Serialization(format!("item of {} bytes is too large", payload.len()))
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one frame's payload and stored checksum without verifying it.
/// `None` at a clean end of file.
fn read_raw_frame<R: Read>(reader: &mut R) -> Result<Option<(Vec<u8>, u32)>> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some((payload, stored_crc)))
}

/// Read and verify one frame. `None` at a clean end of file.
fn read_frame<R: Read>(reader: &mut R, path: &Path) -> Result<Option<Vec<u8>>> {
    let Some((payload, stored_crc)) = read_raw_frame(reader)? else {
        return Ok(None);
    };
    if crc32fast::hash(&payload) != stored_crc {
        return Err(Error::CrcMismatch {
            path: path.to_path_buf(),
        });
    }
    Ok(Some(payload))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| Error::Serialization(e.to_string()))
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DiskQueue<String> {
        DiskQueue::open(dir.path(), "test").unwrap()
    }

    #[test]
    fn test_fifo_across_flips() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);

        q.enqueue(&"a".to_string()).unwrap();
        q.enqueue(&"b".to_string()).unwrap();
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("a"));

        // Lands in the new append file while "b" is still in the read file.
        q.enqueue(&"c".to_string()).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("b"));
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("c"));
        assert_eq!(q.dequeue().unwrap(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_stale_files_removed_at_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("test.qin"), b"garbage").unwrap();
        let mut q = open(&dir);
        assert!(!dir.path().join("test.qin").exists());
        assert_eq!(q.dequeue().unwrap(), None);
    }

    /// Write pending frames to disk without consuming anything.
    fn flush(q: &mut DiskQueue<String>) {
        q.scan().unwrap();
    }

    #[test]
    fn test_bad_checksum_frame_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);
        for s in ["a", "b", "c"] {
            q.enqueue(&s.to_string()).unwrap();
        }
        flush(&mut q);

        // First payload byte of "a".
        let path = dir.path().join("test.qout");
        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER_LEN as usize] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(q.dequeue(), Err(Error::CrcMismatch { .. })));
        assert!(!q.is_poisoned());
        assert_eq!(q.len(), 2);

        let seen: Vec<(u64, String)> = q.scan().unwrap().map(|r| r.unwrap()).collect();
        let items: Vec<&str> = seen.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(items, ["b", "c"]);

        // Sequence numbers still line up with the frames after the bad one.
        q.tombstone(seen[1].0).unwrap();
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("b"));
        assert_eq!(q.dequeue().unwrap(), None);
        assert!(q.is_empty());
        assert_eq!(q.scan().unwrap().count(), 0);
    }

    #[test]
    fn test_remove_matching_drops_bad_checksum_frame() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);
        for s in ["a", "b", "c", "d"] {
            q.enqueue(&s.to_string()).unwrap();
        }
        flush(&mut q);

        let path = dir.path().join("test.qout");
        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER_LEN as usize] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(q.remove_matching(|s| s == "c").unwrap(), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("b"));
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("d"));
        assert_eq!(q.dequeue().unwrap(), None);
    }

    #[test]
    fn test_truncated_frame_poisons_queue() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);
        q.enqueue(&"payload".to_string()).unwrap();
        flush(&mut q);

        let path = dir.path().join("test.qout");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        match q.dequeue() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(q.is_poisoned());

        // Every later operation reports the original failure instead of
        // misreading the files.
        match q.dequeue() {
            Err(Error::IllegalState(msg)) => assert!(msg.contains("unusable after an earlier failure")),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            q.enqueue(&"more".to_string()),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(q.scan(), Err(Error::IllegalState(_))));
        assert!(matches!(q.tombstone(0), Err(Error::IllegalState(_))));
        assert!(matches!(
            q.remove_matching(|_| true),
            Err(Error::IllegalState(_))
        ));

        let (qin, qout) = (q.paths().0.to_path_buf(), q.paths().1.to_path_buf());
        q.release().unwrap();
        assert!(!qin.exists() && !qout.exists());
    }

    #[test]
    fn test_scan_does_not_consume_and_skips_tombstones() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);
        for s in ["a", "b", "c", "d"] {
            q.enqueue(&s.to_string()).unwrap();
        }
        assert_eq!(q.dequeue().unwrap().as_deref(), Some("a"));
        q.enqueue(&"e".to_string()).unwrap();

        let seen: Vec<(u64, String)> = q.scan().unwrap().map(|r| r.unwrap()).collect();
        let items: Vec<&str> = seen.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(items, ["b", "c", "d", "e"]);

        let c_seq = seen[1].0;
        q.tombstone(c_seq).unwrap();
        assert_eq!(q.len(), 3);
        assert!(q.tombstone(c_seq).is_err());

        let items: Vec<String> = q.scan().unwrap().map(|r| r.unwrap().1).collect();
        assert_eq!(items, ["b", "d", "e"]);

        let mut drained = Vec::new();
        while let Some(s) = q.dequeue().unwrap() {
            drained.push(s);
        }
        assert_eq!(drained, ["b", "d", "e"]);
    }

    #[test]
    fn test_tombstone_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);
        q.enqueue(&"only".to_string()).unwrap();
        assert!(matches!(q.tombstone(5), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_remove_matching_keeps_order() {
        let dir = TempDir::new().unwrap();
        let mut q: DiskQueue<u32> = DiskQueue::open(dir.path(), "nums").unwrap();
        for i in 0..20 {
            q.enqueue(&i).unwrap();
        }
        assert_eq!(q.remove_matching(|n| n % 3 == 0).unwrap(), 7);
        assert_eq!(q.len(), 13);

        let mut rest = Vec::new();
        while let Some(n) = q.dequeue().unwrap() {
            rest.push(n);
        }
        let expected: Vec<u32> = (0..20).filter(|n| n % 3 != 0).collect();
        assert_eq!(rest, expected);
    }

    #[test]
    fn test_release_deletes_files() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir);
        q.enqueue(&"x".to_string()).unwrap();
        q.enqueue(&"y".to_string()).unwrap();
        q.dequeue().unwrap();
        let (qin, qout) = (q.paths().0.to_path_buf(), q.paths().1.to_path_buf());
        assert!(qin.exists());

        q.release().unwrap();
        assert!(!qin.exists());
        assert!(!qout.exists());
    }
}
