//! crawlcap I/O
//!
//! Capture-and-replay primitives for a crawler's fetch path:
//!
//! - [`RecordingWriter`]: records bytes flowing to a sink into a memory
//!   region plus an overflow backing file
//! - [`RecordingReader`]: the same, for bytes read from a source
//! - [`Recording`] / [`ReplayReader`]: independent re-reads of a frozen
//!   recording, each with its own cursor and mark
//! - [`ReplayCharSequence`]: random-access Latin-1 view of the content
//! - [`gzip::GzipMembers`]: member-by-member iteration over concatenated
//!   gzip files
//!
//! Everything here is blocking and single-owner. Concurrency comes from
//! handing the same `Recording` to several readers, which share nothing
//! mutable.

mod backing;
pub mod char_sequence;
pub mod gzip;
pub mod recorder;
pub mod recording_reader;
pub mod replay;

pub use char_sequence::ReplayCharSequence;
pub use gzip::{GzipHeader, GzipMembers};
pub use recorder::{Recording, RecordingWriter};
pub use recording_reader::RecordingReader;
pub use replay::ReplayReader;
