//! Error Types for crawlcap
//!
//! This module defines all error types that can occur while recording,
//! replaying, reading archives, or spilling queues to disk.
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - Backing file creation, writes and reads
//! - Queue directory and spill file operations
//! - Seeks on archive files
//!
//! ### Protocol/State Errors
//! - `IllegalState`: An operation was called out of order (`reset()` without
//!   `mark()`, replaying a recording that is still open, reading a member
//!   before locating one)
//! - `InvalidArgument`: A caller-supplied offset or limit is out of range
//!
//! ### Data Integrity Errors
//! - `MalformedMember`: A gzip member has a bad header, a truncated body, or a
//!   trailer that does not match the decompressed bytes
//! - `MemberScan`: Iterating an archive stopped on a fault; carries how many
//!   members were read before it
//! - `CrcMismatch`: A queue spill frame failed its checksum
//! - `Serialization`: A queued item could not be encoded or decoded
//!
//! ### Recording Limits
//! - `LengthExceeded`: A recording grew past its configured maximum
//! - `Timeout`: A recording took longer than its configured budget
//!
//! ## Usage
//! All functions in crawlcap return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows using `?` operator for error propagation.
//!
//! "No more members" is not an error: `GzipMembers::has_next()` returning
//! `false` is the normal end of iteration.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed gzip member at offset {offset}: {reason}")]
    MalformedMember { offset: u64, reason: String },

    #[error("Member scan failed after {members_read} members: {source}")]
    MemberScan {
        members_read: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Recording exceeded maximum length of {limit} bytes")]
    LengthExceeded { limit: u64 },

    #[error("Recording timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("CRC mismatch in {path:?}")]
    CrcMismatch { path: PathBuf },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that mean the bytes themselves are bad, as opposed to
    /// the environment failing underneath us.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::MalformedMember { .. } | Error::CrcMismatch { .. } => true,
            Error::MemberScan { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}

/// Lets `std::io::Read`/`Write` implementations surface crate errors.
///
/// `Io` errors pass through untouched so callers can still match on the
/// original `ErrorKind`.
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::MalformedMember { .. } | Error::CrcMismatch { .. } => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            Error::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
