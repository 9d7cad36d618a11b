use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};

use crawlcap_core::{Error, GzipConfig, Result};
use crawlcap_observability::metrics;
use flate2::{Decompress, FlushDecompress, Status};
use tracing::{debug, warn};

use super::header::GzipHeader;
use super::{scan_for_member, TRAILER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Positioned at the start of the input or at a seek target; nothing
    /// decompressed yet.
    BeforeFirstMember,
    /// A header has been read; decompressed reads are possible.
    InMember,
    /// The last member's trailer was consumed (or a header was rejected).
    BetweenMembers,
    /// A scan found no further member.
    Exhausted,
}

/// Iterates the members of a file holding several concatenated gzip
/// streams.
///
/// ```ignore
/// let mut members = GzipMembers::new(File::open(path)?)?;
/// while members.has_next()? {
///     let offset = members.position()?;
///     members.next_member()?;
///     io::copy(&mut members, &mut out)?;
/// }
/// ```
///
/// Compressed input is pulled through a `BufReader`, and only the bytes the
/// inflater reports as consumed are taken out of it, so the stream position
/// after a member is where its trailer ends. `has_next` still rescans for the
/// next header's magic from there rather than trusting that arithmetic.
pub struct GzipMembers<R: Read + Seek> {
    source: BufReader<R>,
    source_len: u64,
    state: MemberState,

    inflater: Decompress,
    crc: crc32fast::Hasher,
    member_out: u64,
    member_start: u64,
    header: Option<GzipHeader>,
    members_read: usize,
}

impl<R: Read + Seek> GzipMembers<R> {
    pub fn new(source: R) -> Result<Self> {
        Self::with_config(source, &GzipConfig::default())
    }

    /// Starts at the source's current position.
    pub fn with_config(mut source: R, config: &GzipConfig) -> Result<Self> {
        let start = source.stream_position()?;
        let source_len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(start))?;

        Ok(Self {
            source: BufReader::with_capacity(config.read_buffer_size.max(1), source),
            source_len,
            state: MemberState::BeforeFirstMember,
            inflater: Decompress::new(false),
            crc: crc32fast::Hasher::new(),
            member_out: 0,
            member_start: start,
            header: None,
            members_read: 0,
        })
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    /// Absolute offset in the source.
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.source.stream_position()?)
    }

    /// Offset of the current (or last) member's header.
    pub fn member_start(&self) -> u64 {
        self.member_start
    }

    pub fn header(&self) -> Option<&GzipHeader> {
        self.header.as_ref()
    }

    /// Headers successfully read so far.
    pub fn members_read(&self) -> usize {
        self.members_read
    }

    /// Whether another member follows. When it returns `true` the source is
    /// positioned at that member's first byte.
    ///
    /// Finishes the current member first if it has not been read to its end.
    pub fn has_next(&mut self) -> Result<bool> {
        match self.state {
            MemberState::Exhausted => Ok(false),
            MemberState::BeforeFirstMember => Ok(self.position()? < self.source_len),
            MemberState::InMember => {
                self.goto_end_of_member()?;
                self.locate_next()
            }
            MemberState::BetweenMembers => self.locate_next(),
        }
    }

    fn locate_next(&mut self) -> Result<bool> {
        let from = self.position()?;
        match scan_for_member(&mut self.source, from, self.source_len)? {
            Some(offset) => {
                self.source.seek(SeekFrom::Start(offset))?;
                if offset != from {
                    warn!(
                        from = from,
                        offset = offset,
                        skipped = offset - from,
                        "Skipped bytes between gzip members"
                    );
                }
                self.state = MemberState::BetweenMembers;
                Ok(true)
            }
            None => {
                debug!(position = from, members = self.members_read, "No further gzip member");
                self.state = MemberState::Exhausted;
                Ok(false)
            }
        }
    }

    /// Read the header at the current position and prepare to decompress
    /// the member. The running checksum starts over.
    pub fn next_member(&mut self) -> Result<&GzipHeader> {
        match self.state {
            MemberState::InMember => {
                return Err(Error::IllegalState(
                    "current gzip member has not been read to its end".to_string(),
                ))
            }
            MemberState::Exhausted => {
                return Err(Error::IllegalState("no more gzip members".to_string()))
            }
            MemberState::BeforeFirstMember | MemberState::BetweenMembers => {}
        }

        let offset = self.position()?;
        self.reset_member_state();
        self.member_start = offset;

        let header = match GzipHeader::read_from(&mut self.source, offset) {
            Ok(header) => header,
            Err(e) => {
                if e.is_corruption() {
                    metrics::GZIP_MALFORMED_MEMBERS_TOTAL.inc();
                }
                self.state = MemberState::BetweenMembers;
                return Err(e);
            }
        };

        debug!(
            offset = offset,
            header_len = header.length,
            filename = ?header.filename_lossy(),
            "Gzip member opened"
        );
        metrics::GZIP_MEMBERS_READ_TOTAL.inc();
        self.members_read += 1;
        self.state = MemberState::InMember;
        Ok(self.header.insert(header))
    }

    /// Seek to a known member start (for instance from an index) without
    /// scanning.
    pub fn seek_to_offset(&mut self, position: u64) -> Result<()> {
        if position > self.source_len {
            return Err(Error::InvalidArgument(format!(
                "offset {} is past the end of the input ({} bytes)",
                position, self.source_len
            )));
        }
        self.source.seek(SeekFrom::Start(position))?;
        self.reset_member_state();
        self.header = None;
        self.member_start = position;
        self.state = MemberState::BeforeFirstMember;
        Ok(())
    }

    /// `seek_to_offset` followed by `next_member`.
    pub fn seek_to_member(&mut self, position: u64) -> Result<&GzipHeader> {
        self.seek_to_offset(position)?;
        self.next_member()
    }

    /// Decompress and discard the rest of the current member. Returns the
    /// number of decompressed bytes skipped.
    pub fn goto_end_of_member(&mut self) -> Result<u64> {
        let mut scratch = [0u8; 4096];
        let mut skipped = 0u64;
        while self.state == MemberState::InMember {
            skipped += self.read_member(&mut scratch)? as u64;
        }
        Ok(skipped)
    }

    /// Decompress the rest of the current member into `out`.
    pub fn read_member_to_end(&mut self, out: &mut Vec<u8>) -> Result<u64> {
        let mut scratch = [0u8; 8192];
        let mut total = 0u64;
        while self.state == MemberState::InMember {
            let n = self.read_member(&mut scratch)?;
            out.extend_from_slice(&scratch[..n]);
            total += n as u64;
        }
        Ok(total)
    }

    /// Decompressed bytes of the current member. Returns 0 once the member's
    /// trailer has been verified, or outside a member.
    pub fn read_member(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.state != MemberState::InMember || out.is_empty() {
            return Ok(0);
        }
        let member_start = self.member_start;

        loop {
            let input = self.source.fill_buf()?;
            let at_eof = input.is_empty();
            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();

            let status = self
                .inflater
                .decompress(input, out, FlushDecompress::None)
                .map_err(|e| Error::MalformedMember {
                    offset: member_start,
                    reason: format!("corrupt deflate data: {}", e),
                });
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    metrics::GZIP_MALFORMED_MEMBERS_TOTAL.inc();
                    self.state = MemberState::BetweenMembers;
                    return Err(e);
                }
            };

            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = (self.inflater.total_out() - out_before) as usize;
            self.source.consume(consumed);
            self.crc.update(&out[..produced]);
            self.member_out += produced as u64;

            if status == Status::StreamEnd {
                self.finish_member()?;
                return Ok(produced);
            }
            if produced > 0 {
                return Ok(produced);
            }
            if at_eof {
                metrics::GZIP_MALFORMED_MEMBERS_TOTAL.inc();
                self.state = MemberState::BetweenMembers;
                return Err(Error::MalformedMember {
                    offset: member_start,
                    reason: "truncated deflate stream".to_string(),
                });
            }
            if consumed == 0 {
                self.state = MemberState::BetweenMembers;
                return Err(Error::MalformedMember {
                    offset: member_start,
                    reason: "inflater made no progress".to_string(),
                });
            }
        }
    }

    fn finish_member(&mut self) -> Result<()> {
        // Leaves the member either way so has_next() can resynchronise.
        self.state = MemberState::BetweenMembers;

        let mut trailer = [0u8; TRAILER_LEN as usize];
        if let Err(e) = self.source.read_exact(&mut trailer) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                metrics::GZIP_MALFORMED_MEMBERS_TOTAL.inc();
                return Err(Error::MalformedMember {
                    offset: self.member_start,
                    reason: "truncated trailer".to_string(),
                });
            }
            return Err(e.into());
        }

        let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let stored_size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        let crc = std::mem::replace(&mut self.crc, crc32fast::Hasher::new()).finalize();

        if stored_crc != crc || stored_size != self.member_out as u32 {
            metrics::GZIP_MALFORMED_MEMBERS_TOTAL.inc();
            return Err(Error::MalformedMember {
                offset: self.member_start,
                reason: format!(
                    "trailer mismatch: stored crc {:#010x} size {}, computed crc {:#010x} size {}",
                    stored_crc, stored_size, crc, self.member_out as u32
                ),
            });
        }

        debug!(
            offset = self.member_start,
            decompressed = self.member_out,
            compressed = self.inflater.total_in(),
            "Gzip member finished"
        );
        Ok(())
    }

    fn reset_member_state(&mut self) {
        self.inflater.reset(false);
        self.crc = crc32fast::Hasher::new();
        self.member_out = 0;
    }

    pub fn into_inner(self) -> R {
        self.source.into_inner()
    }
}

impl<R: Read + Seek> Read for GzipMembers<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_member(buf)?)
    }
}

impl<R: Read + Seek> std::fmt::Debug for GzipMembers<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipMembers")
            .field("state", &self.state)
            .field("source_len", &self.source_len)
            .field("member_start", &self.member_start)
            .field("members_read", &self.members_read)
            .finish()
    }
}
