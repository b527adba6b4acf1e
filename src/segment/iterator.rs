// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Streaming iterator over the entries of a segment. The iterator validates
//! framing only: entry headers must be recognized and stay in bounds. It
//! never interprets payloads.
//!
//! Construction over a raw byte buffer (a replica) is fallible and performs
//! a full framing scan up front, so a malformed replica is rejected before
//! any entry is consumed. Iteration over an in-memory segment is created by
//! the engine itself and skips holes left by in-memory compaction.

use crate::entry::*;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MalformedSegment {
    #[error("buffer too small to hold a segment header")]
    TooSmall,
    #[error("segment does not begin with a well-formed header entry")]
    BadHeader,
    #[error("declared capacity {declared} does not match buffer length {actual}")]
    CapacityMismatch { declared: u32, actual: usize },
    #[error("entry at offset {offset} overruns the segment")]
    EntryOverrun { offset: usize },
    #[error("unrecognized entry type {raw:#04x} at offset {offset}")]
    UnknownType { raw: u8, offset: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IterError {
    #[error("iterator exhausted")]
    Exhausted,
}

/// Where a logical offset falls within a source that may contain holes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skip {
    /// The offset is backed by real bytes.
    Present,
    /// The offset falls in a reclaimed hole; resume at the given offset.
    Resume(usize),
    /// Nothing iterable remains at or after this offset.
    End,
}

/// Byte source an iterator walks. Implemented for contiguous replica
/// buffers and for locked views of seglet-backed segments.
pub trait EntrySource {
    /// Offset one past the last iterable byte.
    fn limit(&self) -> usize;

    /// Copy `dst.len()` bytes at `offset`; false if any byte is missing.
    fn read(&self, offset: usize, dst: &mut [u8]) -> bool;

    /// Resolve holes at `offset`.
    fn skip(&self, offset: usize) -> Skip;

    /// For a read which failed because it reached into a hole just past
    /// `offset`: the recorded resume offset of that hole.
    fn resume_after(&self, offset: usize) -> Option<usize>;
}

impl EntrySource for &[u8] {
    fn limit(&self) -> usize {
        self.len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> bool {
        match self.get(offset..offset + dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn skip(&self, offset: usize) -> Skip {
        if offset >= self.len() {
            Skip::End
        } else {
            Skip::Present
        }
    }

    fn resume_after(&self, _offset: usize) -> Option<usize> {
        None
    }
}

struct Current {
    entry_type: EntryType,
    length: u32,
    offset: usize,
}

pub struct SegmentIterator<S> {
    source: S,
    current: Option<Current>,
}

impl<'a> SegmentIterator<&'a [u8]> {
    /// Construct an iterator over a contiguous segment buffer, e.g. a
    /// replica fetched from a backup. Fails if the buffer cannot hold a
    /// segment header, does not begin with one, declares a capacity other
    /// than the buffer's length, or contains an entry that overruns the
    /// buffer or carries an unrecognized type.
    pub fn from_buffer(buf: &'a [u8]) -> Result<Self, MalformedSegment> {
        if buf.len() < ENTRY_HEADER_SIZE + SEGMENT_HEADER_SIZE {
            return Err(MalformedSegment::TooSmall);
        }

        let mut header_bytes = [0; ENTRY_HEADER_SIZE];
        header_bytes.copy_from_slice(&buf[0..ENTRY_HEADER_SIZE]);
        let first = match EntryHeader::decode(&header_bytes) {
            Some(header)
                if header.entry_type() == EntryType::SegHeader
                    && header.length() as usize == SEGMENT_HEADER_SIZE =>
            {
                header
            }
            _ => return Err(MalformedSegment::BadHeader),
        };

        let mut payload = [0; SEGMENT_HEADER_SIZE];
        payload.copy_from_slice(&buf[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + SEGMENT_HEADER_SIZE]);
        let segment_header = SegmentHeader::decode(&payload);
        if segment_header.segment_capacity() as usize != buf.len() {
            return Err(MalformedSegment::CapacityMismatch {
                declared: segment_header.segment_capacity(),
                actual: buf.len(),
            });
        }

        Self::validate_framing(buf)?;

        Ok(Self {
            source: buf,
            current: Some(Current {
                entry_type: first.entry_type(),
                length: first.length(),
                offset: 0,
            }),
        })
    }

    /// Walk the whole buffer checking entry framing. Scanning stops at the
    /// footer; a buffer may carry zero padding beyond it up to capacity.
    fn validate_framing(buf: &[u8]) -> Result<(), MalformedSegment> {
        let mut offset = 0;
        loop {
            if offset == buf.len() {
                return Ok(());
            }
            if offset + ENTRY_HEADER_SIZE > buf.len() {
                return Err(MalformedSegment::EntryOverrun { offset });
            }
            let mut header_bytes = [0; ENTRY_HEADER_SIZE];
            header_bytes.copy_from_slice(&buf[offset..offset + ENTRY_HEADER_SIZE]);
            let header = EntryHeader::decode(&header_bytes).ok_or(MalformedSegment::UnknownType {
                raw: header_bytes[0],
                offset,
            })?;
            let end = offset + header.total_size();
            if end > buf.len() {
                return Err(MalformedSegment::EntryOverrun { offset });
            }
            if header.entry_type() == EntryType::SegFooter {
                return Ok(());
            }
            offset = end;
        }
    }
}

impl<S: EntrySource> SegmentIterator<S> {
    /// Iterate an engine-written segment. The first entry is the segment
    /// header by construction, so no validation happens here.
    pub(crate) fn over_segment(source: S) -> Self {
        let current = Self::load(&source, 0);
        Self {
            source,
            current,
        }
    }

    fn load(source: &S, mut offset: usize) -> Option<Current> {
        loop {
            match source.skip(offset) {
                Skip::Present => {}
                Skip::Resume(resume) => {
                    if resume <= offset {
                        return None;
                    }
                    offset = resume;
                    continue;
                }
                Skip::End => return None,
            }
            if offset + ENTRY_HEADER_SIZE > source.limit() {
                return None;
            }
            let mut header_bytes = [0; ENTRY_HEADER_SIZE];
            if !source.read(offset, &mut header_bytes) {
                // the header itself reaches into a hole; the entry is dead,
                // hop to the hole's recorded resume offset
                match source.resume_after(offset) {
                    Some(resume) if resume > offset => {
                        offset = resume;
                        continue;
                    }
                    _ => return None,
                }
            }
            let header = EntryHeader::decode(&header_bytes)?;
            if offset + header.total_size() > source.limit() {
                return None;
            }
            return Some(Current {
                entry_type: header.entry_type(),
                length: header.length(),
                offset,
            });
        }
    }

    /// True once the footer has been consumed or nothing iterable remains.
    pub fn is_done(&self) -> bool {
        self.current.is_none()
    }

    /// Advance to the next entry.
    pub fn next(&mut self) {
        let current = match self.current.take() {
            Some(current) => current,
            None => return,
        };
        if current.entry_type == EntryType::SegFooter {
            return;
        }
        let next = current.offset + ENTRY_HEADER_SIZE + current.length as usize;
        self.current = Self::load(&self.source, next);
    }

    /// Type of the current entry.
    pub fn entry_type(&self) -> Result<EntryType, IterError> {
        self.current
            .as_ref()
            .map(|c| c.entry_type)
            .ok_or(IterError::Exhausted)
    }

    /// Payload length of the current entry.
    pub fn length(&self) -> Result<u32, IterError> {
        self.current
            .as_ref()
            .map(|c| c.length)
            .ok_or(IterError::Exhausted)
    }

    /// Offset of the current entry's payload within the segment.
    pub fn offset(&self) -> Result<u32, IterError> {
        self.current
            .as_ref()
            .map(|c| (c.offset + ENTRY_HEADER_SIZE) as u32)
            .ok_or(IterError::Exhausted)
    }

    /// Whether the current entry's payload bytes are all present. False for
    /// entries whose payload reaches into a reclaimed hole; such entries
    /// are necessarily dead.
    pub fn payload_present(&self) -> Result<bool, IterError> {
        let current = self.current.as_ref().ok_or(IterError::Exhausted)?;
        Ok(self.range_readable(current.offset + ENTRY_HEADER_SIZE, current.length as usize))
    }

    /// Copy out the current entry's payload.
    pub fn payload(&self) -> Result<Vec<u8>, IterError> {
        let current = self.current.as_ref().ok_or(IterError::Exhausted)?;
        let mut payload = vec![0; current.length as usize];
        let ok = self
            .source
            .read(current.offset + ENTRY_HEADER_SIZE, &mut payload);
        assert!(ok, "payload read crossed a reclaimed seglet");
        Ok(payload)
    }

    fn range_readable(&self, offset: usize, len: usize) -> bool {
        let mut buf = vec![0; len];
        self.source.read(offset, &mut buf)
    }
}
