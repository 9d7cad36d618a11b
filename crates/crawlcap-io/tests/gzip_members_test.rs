//! Multi-Member Gzip Integration Tests
//!
//! Archives are built by concatenating independently compressed members,
//! written to real files, and iterated back.

use std::fs::File;
use std::io::{Cursor, Read, Write};

use crawlcap_core::Error;
use crawlcap_io::gzip::{gzip, read_members, GzipMembers, MemberState};
use flate2::{Compression, GzBuilder};
use tempfile::TempDir;

fn payloads() -> Vec<Vec<u8>> {
    vec![
        b"first record".to_vec(),
        Vec::new(),
        (0..20_000u32).map(|i| (i % 7) as u8).collect(),
        b"WARC/1.0\r\nWARC-Type: response\r\n\r\n".repeat(50),
    ]
}

fn archive(members: &[Vec<u8>]) -> (Vec<u8>, Vec<u64>) {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for data in members {
        offsets.push(out.len() as u64);
        out.extend_from_slice(&gzip(data).unwrap());
    }
    (out, offsets)
}

#[test]
fn test_iterates_every_member_with_offsets() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("records.warc.gz");
    let (bytes, offsets) = archive(&payloads());
    std::fs::write(&path, &bytes).unwrap();

    let mut members = GzipMembers::new(File::open(&path).unwrap()).unwrap();
    let mut seen = Vec::new();
    let mut positions = Vec::new();
    while members.has_next().unwrap() {
        positions.push(members.position().unwrap());
        members.next_member().unwrap();
        let mut data = Vec::new();
        members.read_to_end(&mut data).unwrap();
        seen.push(data);
    }

    assert_eq!(seen, payloads());
    assert_eq!(positions, offsets);
    assert_eq!(members.state(), MemberState::Exhausted);
    assert_eq!(members.members_read(), 4);
}

#[test]
fn test_has_next_drains_unread_member() {
    let (bytes, offsets) = archive(&payloads());
    let mut members = GzipMembers::new(Cursor::new(bytes)).unwrap();

    let mut positions = Vec::new();
    while members.has_next().unwrap() {
        positions.push(members.position().unwrap());
        members.next_member().unwrap();
        let mut one = [0u8; 1];
        let _ = members.read(&mut one).unwrap();
    }
    assert_eq!(positions, offsets);
}

#[test]
fn test_goto_end_of_member_reports_skipped() {
    let (bytes, _) = archive(&[b"0123456789".to_vec(), b"xyz".to_vec()]);
    let mut members = GzipMembers::new(Cursor::new(bytes)).unwrap();
    assert!(members.has_next().unwrap());
    members.next_member().unwrap();
    let mut two = [0u8; 2];
    members.read_exact(&mut two).unwrap();
    assert_eq!(members.goto_end_of_member().unwrap(), 8);
    assert_eq!(members.state(), MemberState::BetweenMembers);
}

#[test]
fn test_seek_to_member_from_index() {
    let (bytes, offsets) = archive(&payloads());
    let mut members = GzipMembers::new(Cursor::new(bytes)).unwrap();

    members.seek_to_member(offsets[3]).unwrap();
    let mut data = Vec::new();
    members.read_member_to_end(&mut data).unwrap();
    assert_eq!(data, payloads()[3]);

    members.seek_to_member(offsets[0]).unwrap();
    let mut data = Vec::new();
    members.read_to_end(&mut data).unwrap();
    assert_eq!(data, payloads()[0]);

    // Iteration continues from there.
    assert!(members.has_next().unwrap());
    assert_eq!(members.position().unwrap(), offsets[1]);
}

#[test]
fn test_seek_past_end_rejected() {
    let (bytes, _) = archive(&payloads());
    let len = bytes.len() as u64;
    let mut members = GzipMembers::new(Cursor::new(bytes)).unwrap();
    assert!(matches!(
        members.seek_to_offset(len + 1),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_headers_are_per_member() {
    let mut bytes = Vec::new();
    for name in ["a.txt", "b.txt"] {
        let mut encoder = GzBuilder::new()
            .filename(name)
            .write(Vec::new(), Compression::best());
        encoder.write_all(name.as_bytes()).unwrap();
        bytes.extend_from_slice(&encoder.finish().unwrap());
    }

    let members = read_members(Cursor::new(bytes)).unwrap();
    let names: Vec<_> = members
        .iter()
        .map(|m| m.header.filename_lossy().unwrap())
        .collect();
    assert_eq!(names, ["a.txt", "b.txt"]);
    assert_eq!(members[0].data, b"a.txt");
}

#[test]
fn test_compressed_lengths_add_up() {
    let (bytes, _) = archive(&payloads());
    let total = bytes.len() as u64;
    let members = read_members(Cursor::new(bytes)).unwrap();
    assert_eq!(members.iter().map(|m| m.compressed_len).sum::<u64>(), total);
}

#[test]
fn test_empty_input_has_no_members() {
    let members = read_members(Cursor::new(Vec::new())).unwrap();
    assert!(members.is_empty());
}

#[test]
fn test_corrupt_trailer_reports_members_read() {
    let (mut bytes, offsets) = archive(&payloads());
    // Last byte of member 1's trailer (ISIZE).
    let idx = offsets[2] as usize - 1;
    bytes[idx] ^= 0x01;

    let err = read_members(Cursor::new(bytes)).unwrap_err();
    match err {
        Error::MemberScan {
            members_read,
            source,
        } => {
            assert_eq!(members_read, 1);
            assert!(matches!(*source, Error::MalformedMember { offset, .. } if offset == offsets[1]));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_truncated_member_is_malformed_not_end() {
    let (bytes, offsets) = archive(&payloads());
    let cut = offsets[3] as usize + 20;
    let err = read_members(Cursor::new(bytes[..cut].to_vec())).unwrap_err();
    assert!(matches!(err, Error::MemberScan { members_read: 3, .. }));
    assert!(err.is_corruption());
}

#[test]
fn test_read_after_exhaustion() {
    let (bytes, _) = archive(&[b"only".to_vec()]);
    let mut members = GzipMembers::new(Cursor::new(bytes)).unwrap();
    assert!(members.has_next().unwrap());
    members.next_member().unwrap();
    assert!(!members.has_next().unwrap());
    assert!(matches!(members.next_member(), Err(Error::IllegalState(_))));
    let mut buf = [0u8; 4];
    assert_eq!(members.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_next_member_mid_member_is_illegal() {
    let (bytes, _) = archive(&payloads());
    let mut members = GzipMembers::new(Cursor::new(bytes)).unwrap();
    members.next_member().unwrap();
    assert!(matches!(members.next_member(), Err(Error::IllegalState(_))));
}

#[test]
fn test_garbage_between_members_is_skipped() {
    let mut bytes = gzip(b"one").unwrap();
    bytes.extend_from_slice(b"\0\0\0junk");
    let second = bytes.len() as u64;
    bytes.extend_from_slice(&gzip(b"two").unwrap());

    let members = read_members(Cursor::new(bytes)).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[1].offset, second);
    assert_eq!(members[1].data, b"two");
}
