// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! On-wire layout of segment entries. Every entry is an 8 byte header
//! followed by a variable-length payload. The first entry in a segment is
//! always a `SegHeader` carrying the segment id and capacity; a sealed
//! segment ends with a `SegFooter` carrying a checksum over everything that
//! precedes the footer payload. All fields are little-endian.
//!
//! Entry:
//! ```text
//! ┌──────────┬──────────────────────┬──────────────┐
//! │   TYPE   │       RESERVED       │    LENGTH    │
//! │          │                      │              │
//! │   8 bit  │        24 bit        │    32 bit    │
//! ├──────────┴──────────────────────┴──────────────┤
//! │                    PAYLOAD                     │
//! │                                                │
//! │                 LENGTH bytes                   │
//! └────────────────────────────────────────────────┘
//! ```

use core::convert::TryInto;

/// Size of the entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Size of the `SegmentHeader` payload in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Size of the `SegmentFooter` payload in bytes.
pub const SEGMENT_FOOTER_SIZE: usize = 8;

/// The closed set of entry types recognized by the framing layer. Payload
/// schemas for `Object`, `Tombstone`, and `LogDigest` belong to the embedding
/// store and are opaque here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    SegHeader = 1,
    SegFooter = 2,
    Object = 3,
    Tombstone = 4,
    LogDigest = 5,
    Invalid = 0xFF,
}

impl EntryType {
    /// Decode a raw type byte. Returns `None` for any byte outside the
    /// recognized set, including the `Invalid` sentinel.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EntryType::SegHeader),
            2 => Some(EntryType::SegFooter),
            3 => Some(EntryType::Object),
            4 => Some(EntryType::Tombstone),
            5 => Some(EntryType::LogDigest),
            _ => None,
        }
    }

    /// Entry types the log accepts through the public append path. Segment
    /// framing entries are written only by the engine itself.
    pub fn appendable(&self) -> bool {
        matches!(
            self,
            EntryType::Object | EntryType::Tombstone | EntryType::LogDigest
        )
    }
}

/// Header preceding every entry in a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    entry_type: EntryType,
    length: u32,
}

impl EntryHeader {
    pub fn new(entry_type: EntryType, length: u32) -> Self {
        Self { entry_type, length }
    }

    #[inline]
    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Total on-wire footprint of the entry, header included.
    #[inline]
    pub fn total_size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.length as usize
    }

    pub fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0; ENTRY_HEADER_SIZE];
        buf[0] = self.entry_type as u8;
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Decode an entry header. Returns `None` if the type byte is not in the
    /// recognized set. Bounds checking against the containing segment is the
    /// iterator's job.
    pub fn decode(buf: &[u8; ENTRY_HEADER_SIZE]) -> Option<Self> {
        let entry_type = EntryType::from_raw(buf[0])?;
        let length = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Some(Self { entry_type, length })
    }
}

/// Payload of the `SegHeader` entry which opens every segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    segment_id: u64,
    segment_capacity: u32,
}

impl SegmentHeader {
    pub fn new(segment_id: u64, segment_capacity: u32) -> Self {
        Self {
            segment_id,
            segment_capacity,
        }
    }

    #[inline]
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    #[inline]
    pub fn segment_capacity(&self) -> u32 {
        self.segment_capacity
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0; SEGMENT_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.segment_capacity.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        Self {
            segment_id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            segment_capacity: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Payload of the `SegFooter` entry which seals a segment. The checksum
/// covers every byte from the start of the segment up to, but not including,
/// the footer payload itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentFooter {
    checksum: u64,
}

impl SegmentFooter {
    pub fn new(checksum: u64) -> Self {
        Self { checksum }
    }

    #[inline]
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn encode(&self) -> [u8; SEGMENT_FOOTER_SIZE] {
        self.checksum.to_le_bytes()
    }

    pub fn decode(buf: &[u8; SEGMENT_FOOTER_SIZE]) -> Self {
        Self {
            checksum: u64::from_le_bytes(*buf),
        }
    }
}
