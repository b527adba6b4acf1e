// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The [`Log`] appends entries to the current head segment and rolls to a
//! fresh head when it fills. Appends are serialized; positions returned are
//! stable for the life of the entry because entries are never rewritten in
//! place, and in-memory compaction preserves offsets.

use crate::entry::{EntryType, ENTRY_HEADER_SIZE};
use crate::manager::SegmentManager;
use crate::metrics::*;
use crate::segment::{AppendError, LogSegment};

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogError {
    #[error("log out of space")]
    OutOfSpace,
    #[error("entry type cannot be appended")]
    NotAppendable,
}

/// Stable address of an entry: the id of the segment holding it and the
/// byte offset of its payload within that segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPosition {
    segment_id: u64,
    offset: u32,
}

impl LogPosition {
    pub fn new(segment_id: u64, offset: u32) -> Self {
        Self { segment_id, offset }
    }

    #[inline]
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

pub struct Log {
    manager: Arc<SegmentManager>,
    head: Mutex<Option<Arc<LogSegment>>>,
}

impl Log {
    /// Open a log with a freshly allocated head segment.
    pub fn new(manager: Arc<SegmentManager>) -> Result<Self, LogError> {
        let log = Self {
            manager,
            head: Mutex::new(None),
        };
        {
            let mut head = log.lock_head();
            log.roll(&mut head)?;
        }
        Ok(log)
    }

    /// Append an entry, returning its stable position. On a full head the
    /// log seals it, rolls to a fresh segment, and retries once; a second
    /// failure is fatal for the server.
    pub fn append(&self, entry_type: EntryType, payload: &[u8]) -> Result<LogPosition, LogError> {
        if !entry_type.appendable() {
            return Err(LogError::NotAppendable);
        }

        let mut head = self.lock_head();

        if let Some(segment) = head.as_ref() {
            match segment.append(entry_type, payload) {
                Ok(offset) => {
                    LOG_APPEND.increment();
                    return Ok(LogPosition::new(segment.id(), offset));
                }
                Err(AppendError::SegmentFull) => {}
            }
        }

        self.roll(&mut head)?;

        let segment = head.as_ref().ok_or(LogError::OutOfSpace)?;
        match segment.append(entry_type, payload) {
            Ok(offset) => {
                LOG_APPEND.increment();
                Ok(LogPosition::new(segment.id(), offset))
            }
            Err(AppendError::SegmentFull) => {
                LOG_APPEND_EX.increment();
                error!(
                    "append of {} bytes failed on a fresh head segment",
                    payload.len()
                );
                Err(LogError::OutOfSpace)
            }
        }
    }

    /// Record that the entry at `position` with the given payload length is
    /// dead, so the cleaner can account for reclaimable space.
    pub fn free(&self, position: LogPosition, payload_length: usize) {
        if let Some(segment) = self.manager.get(position.segment_id()) {
            segment.mark_dead(ENTRY_HEADER_SIZE + payload_length);
        }
    }

    /// The current head segment.
    pub fn head_segment(&self) -> Option<Arc<LogSegment>> {
        self.lock_head().clone()
    }

    fn roll(&self, head: &mut Option<Arc<LogSegment>>) -> Result<(), LogError> {
        if let Some(old) = head.take() {
            self.manager.close(&old, false);
        }

        let segment = self.manager.allocate_head().map_err(|e| {
            error!("head segment allocation failed: {}", e);
            LogError::OutOfSpace
        })?;
        LOG_ROLLOVER.increment();

        // every new head opens with a digest of the segments in the log
        let digest = self.digest_payload();
        if segment.append(EntryType::LogDigest, &digest).is_err() {
            error!("log digest did not fit in a fresh head segment");
            return Err(LogError::OutOfSpace);
        }

        *head = Some(segment);
        Ok(())
    }

    /// Little-endian u32 count followed by that many u64 segment ids.
    fn digest_payload(&self) -> Vec<u8> {
        let ids = self.manager.segment_ids();
        let mut buf = Vec::with_capacity(4 + ids.len() * 8);
        buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf
    }

    fn lock_head(&self) -> MutexGuard<'_, Option<Arc<LogSegment>>> {
        match self.head.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entry::SEGMENT_HEADER_SIZE;
    use crate::replica::NullReplicaManager;
    use crate::segment::SegmentState;

    fn log_with(config: Config) -> (Arc<SegmentManager>, Log) {
        let manager =
            Arc::new(SegmentManager::new(&config, Arc::new(NullReplicaManager::new())).unwrap());
        let log = Log::new(manager.clone()).unwrap();
        (manager, log)
    }

    fn small_log() -> (Arc<SegmentManager>, Log) {
        // 64 B seglets, 256 B segments, 16 segments, 2 survivor segments
        log_with(Config::debug(64, 256, 16 * 256, 2))
    }

    #[test]
    fn new_head_carries_digest() {
        let (_manager, log) = small_log();
        let head = log.head_segment().unwrap();

        let mut iter = head.iter();
        assert_eq!(iter.entry_type(), Ok(EntryType::SegHeader));
        iter.next();
        assert_eq!(iter.entry_type(), Ok(EntryType::LogDigest));

        let digest = iter.payload().unwrap();
        let count = u32::from_le_bytes(digest[0..4].try_into().unwrap());
        assert_eq!(count, 1);
        let id = u64::from_le_bytes(digest[4..12].try_into().unwrap());
        assert_eq!(id, head.id());
    }

    #[test]
    fn append_returns_running_offsets() {
        let (_manager, log) = small_log();
        let head = log.head_segment().unwrap();
        let digest_len = 4 + 8;
        let first_offset =
            (ENTRY_HEADER_SIZE + SEGMENT_HEADER_SIZE + ENTRY_HEADER_SIZE + digest_len) as u32
                + ENTRY_HEADER_SIZE as u32;

        let a = log.append(EntryType::Object, &[1; 10]).unwrap();
        assert_eq!(a.segment_id(), head.id());
        assert_eq!(a.offset(), first_offset);

        let b = log.append(EntryType::Object, &[2; 10]).unwrap();
        assert_eq!(b.offset(), a.offset() + 10 + ENTRY_HEADER_SIZE as u32);
    }

    #[test]
    fn rollover_closes_old_head() {
        let (_manager, log) = small_log();
        let first = log.head_segment().unwrap();

        // fill the 256 byte head; each entry is 58 bytes on the wire
        for _ in 0..8 {
            log.append(EntryType::Object, &[0; 50]).unwrap();
        }
        let second = log.head_segment().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), SegmentState::Closed);
        assert!(first.is_sealed());
    }

    #[test]
    fn rejects_framing_types() {
        let (_manager, log) = small_log();
        assert_eq!(
            log.append(EntryType::SegHeader, &[]),
            Err(LogError::NotAppendable)
        );
        assert_eq!(
            log.append(EntryType::SegFooter, &[]),
            Err(LogError::NotAppendable)
        );
    }

    #[test]
    fn out_of_space_when_pool_drains() {
        // tiny heap: only the head plus reservations
        let (_manager, log) = log_with(Config::debug(64, 256, 7 * 256, 2));
        // general pool: 7 - 2 survivor - 2 emergency = 3 segments, one of
        // which is the initial head; emergency heads extend the runway
        let mut failures = 0;
        for _ in 0..64 {
            if log.append(EntryType::Object, &[0; 100]).is_err() {
                failures += 1;
            }
        }
        assert!(failures > 0);
    }

    #[test]
    fn free_marks_bytes_dead() {
        let (manager, log) = small_log();
        let position = log.append(EntryType::Object, &[0; 40]).unwrap();
        let segment = manager.get(position.segment_id()).unwrap();

        let dead_before = segment.dead_bytes();
        log.free(position, 40);
        assert_eq!(segment.dead_bytes(), dead_before + 40 + ENTRY_HEADER_SIZE);
    }
}
