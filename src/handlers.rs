// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Contract with the embedding store for per-entry-type callbacks. The
//! cleaner knows nothing about payload schemas; it asks the handlers for an
//! entry's age and, during relocation, whether the entry is still needed.

use crate::entry::EntryType;
use crate::segment::{AppendError, LogSegment};
use crate::writer::LogPosition;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RelocationError {
    #[error("append failed: insufficient space in survivor")]
    AppendFailed,
}

/// Callbacks the embedding store registers with the log. `relocate` must
/// either append the entry through the relocator or return without
/// appending, which marks the entry dead. It must be idempotent with
/// respect to whatever index the store maintains: relocating an entry that
/// was already relocated must not corrupt state.
pub trait LogEntryHandlers: Send + Sync {
    /// WallTime timestamp, in seconds, for the entry. Used to segregate
    /// entries by age when producing survivors.
    fn timestamp(&self, entry_type: EntryType, payload: &[u8]) -> u32;

    /// Decide whether the entry is still live, and if so perpetuate it via
    /// [`EntryRelocator::append`] and update the store's index to the new
    /// position.
    fn relocate(&self, entry_type: EntryType, payload: &[u8], relocator: &mut EntryRelocator<'_>);
}

enum Target<'a> {
    /// Disk cleaning: append into a survivor segment.
    Survivor(&'a LogSegment),
    /// In-memory compaction: the entry keeps its segment and offset, so a
    /// liveness decision is recorded without copying bytes.
    Preserve(LogPosition),
}

/// Hands a single entry from a segment being cleaned to the handler. The
/// handler either appends (the entry is live) or declines (the entry is
/// dead). An append that does not fit reports `AppendFailed`; the cleaner
/// then closes the survivor and retries the entry on a fresh one.
pub struct EntryRelocator<'a> {
    target: Option<Target<'a>>,
    entry_length: usize,
    appended: Option<LogPosition>,
    failed: bool,
    append_nanos: u64,
}

impl<'a> EntryRelocator<'a> {
    /// Relocator targeting a survivor segment. `survivor` may be `None`, in
    /// which case any append attempt fails and the caller allocates one.
    pub(crate) fn new(survivor: Option<&'a LogSegment>, entry_length: usize) -> Self {
        Self {
            target: survivor.map(Target::Survivor),
            entry_length,
            appended: None,
            failed: false,
            append_nanos: 0,
        }
    }

    /// Relocator for in-memory compaction: offsets are preserved, so an
    /// append is a liveness vote rather than a copy.
    pub(crate) fn preserving(position: LogPosition, entry_length: usize) -> Self {
        Self {
            target: Some(Target::Preserve(position)),
            entry_length,
            appended: None,
            failed: false,
            append_nanos: 0,
        }
    }

    /// Total on-wire size of the entry being relocated, header included.
    pub fn entry_length(&self) -> usize {
        self.entry_length
    }

    /// Perpetuate the entry. Returns the entry's new position; the handler
    /// must update its index to point there. Calling append twice returns
    /// the first position again without writing.
    pub fn append(
        &mut self,
        entry_type: EntryType,
        payload: &[u8],
    ) -> Result<LogPosition, RelocationError> {
        if let Some(position) = self.appended {
            return Ok(position);
        }
        match &self.target {
            None => {
                self.failed = true;
                Err(RelocationError::AppendFailed)
            }
            Some(Target::Preserve(position)) => {
                self.appended = Some(*position);
                Ok(*position)
            }
            Some(Target::Survivor(survivor)) => {
                let begin = std::time::Instant::now();
                match survivor.append(entry_type, payload) {
                    Ok(offset) => {
                        self.append_nanos += begin.elapsed().as_nanos() as u64;
                        let position = LogPosition::new(survivor.id(), offset);
                        self.appended = Some(position);
                        Ok(position)
                    }
                    Err(AppendError::SegmentFull) => {
                        self.append_nanos += begin.elapsed().as_nanos() as u64;
                        self.failed = true;
                        Err(RelocationError::AppendFailed)
                    }
                }
            }
        }
    }

    /// Whether the handler appended the entry.
    pub fn did_append(&self) -> bool {
        self.appended.is_some()
    }

    /// The entry's new position, if it was appended.
    pub fn new_position(&self) -> Option<LogPosition> {
        self.appended
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn append_nanos(&self) -> u64 {
        self.append_nanos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ENTRY_HEADER_SIZE;
    use crate::seglets::SegletPool;

    #[test]
    fn append_without_survivor_fails() {
        let mut relocator = EntryRelocator::new(None, ENTRY_HEADER_SIZE + 100);
        assert_eq!(
            relocator.append(EntryType::Object, &[0; 100]),
            Err(RelocationError::AppendFailed)
        );
        assert!(relocator.failed());
        assert!(!relocator.did_append());
    }

    #[test]
    fn append_into_survivor() {
        let pool = SegletPool::new(1024, 1);
        let survivor = LogSegment::new(7, pool.alloc_many(1).unwrap(), 1024);

        let mut relocator = EntryRelocator::new(Some(&survivor), ENTRY_HEADER_SIZE + 6);
        let position = relocator.append(EntryType::Object, b"coffee").unwrap();
        assert_eq!(position.segment_id(), 7);
        assert!(relocator.did_append());
        assert!(!relocator.failed());

        // a second call must not write again
        let again = relocator.append(EntryType::Object, b"coffee").unwrap();
        assert_eq!(again, position);
        assert_eq!(survivor.used_bytes(), 24 + ENTRY_HEADER_SIZE + 6);
    }

    #[test]
    fn preserving_append_keeps_position() {
        let position = LogPosition::new(3, 96);
        let mut relocator = EntryRelocator::preserving(position, 40);
        assert_eq!(relocator.append(EntryType::Object, &[0; 32]), Ok(position));
        assert!(relocator.did_append());
    }

    #[test]
    fn full_survivor_reports_append_failed() {
        let pool = SegletPool::new(64, 1);
        let survivor = LogSegment::new(9, pool.alloc_many(1).unwrap(), 64);

        let mut relocator = EntryRelocator::new(Some(&survivor), ENTRY_HEADER_SIZE + 100);
        assert_eq!(
            relocator.append(EntryType::Object, &[0; 100]),
            Err(RelocationError::AppendFailed)
        );
        assert!(relocator.failed());
    }
}
