//! Multi-Member Gzip Reader
//!
//! Archive files (ARC/WARC) are written as one gzip member per record,
//! concatenated. This module iterates such files member by member, exposing
//! each member's start offset so callers can build record indexes, and jumps
//! straight to a known offset when an index already exists.
//!
//! ## Member layout
//!
//! ```text
//! offset 0                        offset k
//! ├─ header ─┼─ deflate ─┼─ trailer ─┼─ header ─┼─ deflate ─┼─ trailer ─┤ ...
//!   ≥10 bytes             CRC32+ISIZE
//!                          (8 bytes)
//! ```
//!
//! ## State machine
//!
//! ```text
//!  BeforeFirstMember ──next_member──→ InMember ──(trailer read)──→ BetweenMembers
//!         ▲                              │  ▲                           │
//!         │ seek_to_offset               │  └──────next_member──────────┤
//!         │                        has_next (drains)                    │ has_next == false
//!                                                                       ▼
//!                                                                   Exhausted
//! ```
//!
//! Locating the next member never relies on decompressor bookkeeping alone:
//! [`scan_for_member`] walks forward from the end of the previous trailer
//! looking for the magic bytes, and needs a full minimal header to remain.

mod header;
mod reader;

pub use header::GzipHeader;
pub use reader::{GzipMembers, MemberState};

use std::io::{self, Read, Seek, SeekFrom, Write};

use crawlcap_core::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const DEFLATE_METHOD: u8 = 8;
/// Fixed part of every member header.
pub const MINIMAL_HEADER_LEN: u64 = 10;
/// CRC32 + ISIZE.
pub const TRAILER_LEN: u64 = 8;

const SCAN_CHUNK: usize = 4096;

/// Find the first gzip magic at or after `from` that still leaves room for
/// a minimal header before `len`. Returns its absolute offset.
///
/// The source's position afterwards is unspecified.
pub fn scan_for_member<R: Read + Seek + ?Sized>(
    source: &mut R,
    from: u64,
    len: u64,
) -> Result<Option<u64>> {
    if from + MINIMAL_HEADER_LEN > len {
        return Ok(None);
    }
    source.seek(SeekFrom::Start(from))?;

    let mut scratch = [0u8; SCAN_CHUNK];
    let mut offset = from;
    let mut previous: Option<u8> = None;

    loop {
        let n = match source.read(&mut scratch) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        for &byte in &scratch[..n] {
            if previous == Some(GZIP_MAGIC[0]) && byte == GZIP_MAGIC[1] {
                let candidate = offset - 1;
                if candidate + MINIMAL_HEADER_LEN > len {
                    return Ok(None);
                }
                return Ok(Some(candidate));
            }
            previous = Some(byte);
            offset += 1;
        }
    }
}

/// One decompressed member.
#[derive(Debug, Clone)]
pub struct GzipMember {
    pub offset: u64,
    /// Header, deflate data and trailer.
    pub compressed_len: u64,
    pub header: GzipHeader,
    pub data: Vec<u8>,
}

/// Decompress every member of `source`.
///
/// Fails with [`Error::MemberScan`] on the first fault, reporting how many
/// members were read before it.
pub fn read_members<R: Read + Seek>(source: R) -> Result<Vec<GzipMember>> {
    let mut members = GzipMembers::new(source)?;
    let mut out = Vec::new();
    loop {
        match next_decoded(&mut members) {
            Ok(Some(member)) => out.push(member),
            Ok(None) => return Ok(out),
            Err(e) => {
                return Err(Error::MemberScan {
                    members_read: out.len(),
                    source: Box::new(e),
                })
            }
        }
    }
}

fn next_decoded<R: Read + Seek>(members: &mut GzipMembers<R>) -> Result<Option<GzipMember>> {
    if !members.has_next()? {
        return Ok(None);
    }
    let offset = members.position()?;
    let header = members.next_member()?.clone();
    let mut data = Vec::new();
    members.read_member_to_end(&mut data)?;
    let end = members.position()?;
    Ok(Some(GzipMember {
        offset,
        compressed_len: end - offset,
        header,
        data,
    }))
}

/// Compress `data` into a single gzip member.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
