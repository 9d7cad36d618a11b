//! RFC 1952 member header.
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+
//! |ID1|ID2|CM |FLG|     MTIME     |XFL|OS |   10 bytes, always present
//! +---+---+---+---+---+---+---+---+---+---+
//! (if FEXTRA)   XLEN (2 bytes LE) + XLEN bytes
//! (if FNAME)    zero-terminated file name
//! (if FCOMMENT) zero-terminated comment
//! (if FHCRC)    CRC16 (2 bytes LE) = low 16 bits of CRC32 over all preceding header bytes
//! ```

use std::io::{self, Read};

use crawlcap_core::{Error, Result};

use super::{DEFLATE_METHOD, GZIP_MAGIC, MINIMAL_HEADER_LEN};

const FTEXT: u8 = 0x01;
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const RESERVED: u8 = 0xe0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipHeader {
    pub flags: u8,
    pub mtime: u32,
    pub extra_flags: u8,
    pub os: u8,
    pub extra: Option<Vec<u8>>,
    pub filename: Option<Vec<u8>>,
    pub comment: Option<Vec<u8>>,
    pub header_crc: Option<u16>,
    /// Bytes the header occupied on disk.
    pub length: u64,
}

impl GzipHeader {
    /// Parse a header from `reader`. `offset` is the header's absolute
    /// position and only used in error reports.
    pub fn read_from<R: Read>(reader: &mut R, offset: u64) -> Result<Self> {
        let mut src = HeaderSource {
            reader,
            crc: crc32fast::Hasher::new(),
            length: 0,
            offset,
        };

        let mut fixed = [0u8; MINIMAL_HEADER_LEN as usize];
        src.read_exact(&mut fixed)?;

        if fixed[..2] != GZIP_MAGIC {
            return Err(malformed(
                offset,
                format!("bad magic {:02x} {:02x}", fixed[0], fixed[1]),
            ));
        }
        if fixed[2] != DEFLATE_METHOD {
            return Err(malformed(
                offset,
                format!("unsupported compression method {}", fixed[2]),
            ));
        }
        let flags = fixed[3];
        if flags & RESERVED != 0 {
            return Err(malformed(
                offset,
                format!("reserved flag bits set: {:#04x}", flags),
            ));
        }
        let mtime = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);

        let extra = if flags & FEXTRA != 0 {
            let mut xlen = [0u8; 2];
            src.read_exact(&mut xlen)?;
            let mut data = vec![0u8; u16::from_le_bytes(xlen) as usize];
            src.read_exact(&mut data)?;
            Some(data)
        } else {
            None
        };

        let filename = if flags & FNAME != 0 {
            Some(src.read_zero_terminated()?)
        } else {
            None
        };

        let comment = if flags & FCOMMENT != 0 {
            Some(src.read_zero_terminated()?)
        } else {
            None
        };

        let header_crc = if flags & FHCRC != 0 {
            let expected = (src.crc.clone().finalize() & 0xffff) as u16;
            let mut stored = [0u8; 2];
            src.read_exact(&mut stored)?;
            let stored = u16::from_le_bytes(stored);
            if stored != expected {
                return Err(malformed(
                    offset,
                    format!(
                        "header CRC16 mismatch: stored {:#06x}, computed {:#06x}",
                        stored, expected
                    ),
                ));
            }
            Some(stored)
        } else {
            None
        };

        Ok(Self {
            flags,
            mtime,
            extra_flags: fixed[8],
            os: fixed[9],
            extra,
            filename,
            comment,
            header_crc,
            length: src.length,
        })
    }

    pub fn is_text(&self) -> bool {
        self.flags & FTEXT != 0
    }

    pub fn filename_lossy(&self) -> Option<String> {
        self.filename
            .as_ref()
            .map(|name| String::from_utf8_lossy(name).into_owned())
    }

    pub fn comment_lossy(&self) -> Option<String> {
        self.comment
            .as_ref()
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }
}

/// Reads header bytes while keeping the running CRC and length.
struct HeaderSource<'a, R> {
    reader: &'a mut R,
    crc: crc32fast::Hasher,
    length: u64,
    offset: u64,
}

impl<R: Read> HeaderSource<'_, R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf) {
            Ok(()) => {
                self.crc.update(buf);
                self.length += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(malformed(self.offset, "truncated header".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_zero_terminated(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_exact(&mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            out.push(byte[0]);
        }
    }
}

fn malformed(offset: u64, reason: String) -> Error {
    Error::MalformedMember { offset, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::{Compression, GzBuilder};
    use std::io::{Cursor, Write};

    #[test]
    fn test_minimal_header() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"x").unwrap();
        let bytes = encoder.finish().unwrap();

        let header = GzipHeader::read_from(&mut Cursor::new(&bytes), 0).unwrap();
        assert_eq!(header.length, 10);
        assert!(header.filename.is_none());
    }

    #[test]
    fn test_optional_fields() {
        let mut encoder = GzBuilder::new()
            .filename("record.warc")
            .comment("crawl 42")
            .extra(vec![1, 2, 3])
            .write(Vec::new(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        let bytes = encoder.finish().unwrap();

        let header = GzipHeader::read_from(&mut Cursor::new(&bytes), 0).unwrap();
        assert_eq!(header.filename_lossy().as_deref(), Some("record.warc"));
        assert_eq!(header.comment_lossy().as_deref(), Some("crawl 42"));
        assert_eq!(header.extra.as_deref(), Some(&[1u8, 2, 3][..]));
        // 10 fixed + 2 xlen + 3 extra + 12 name + 9 comment
        assert_eq!(header.length, 36);
    }

    #[test]
    fn test_header_crc_verified() {
        let mut bytes = vec![0x1f, 0x8b, 8, FHCRC, 0, 0, 0, 0, 0, 255];
        let crc = (crc32fast::hash(&bytes) & 0xffff) as u16;
        bytes.extend_from_slice(&crc.to_le_bytes());
        let header = GzipHeader::read_from(&mut Cursor::new(&bytes), 0).unwrap();
        assert_eq!(header.header_crc, Some(crc));
        assert_eq!(header.length, 12);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = GzipHeader::read_from(&mut Cursor::new(&bytes), 0).unwrap_err();
        assert!(matches!(err, Error::MalformedMember { .. }));
    }

    #[test]
    fn test_bad_magic() {
        let bytes = [0x1f, 0x8c, 8, 0, 0, 0, 0, 0, 0, 0];
        let err = GzipHeader::read_from(&mut Cursor::new(&bytes), 77).unwrap_err();
        match err {
            Error::MalformedMember { offset, reason } => {
                assert_eq!(offset, 77);
                assert!(reason.contains("magic"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_wrong_method_and_truncation() {
        let bytes = [0x1f, 0x8b, 7, 0, 0, 0, 0, 0, 0, 0];
        assert!(GzipHeader::read_from(&mut Cursor::new(&bytes), 0).is_err());

        let bytes = [0x1f, 0x8b, 8, FNAME, 0, 0, 0, 0, 0, 0, b'a'];
        let err = GzipHeader::read_from(&mut Cursor::new(&bytes), 0).unwrap_err();
        assert!(err.to_string().contains("truncated header"));
    }
}
