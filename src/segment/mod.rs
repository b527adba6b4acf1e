// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A [`LogSegment`] is an append-only run of typed entries backed by an
//! ordered list of seglets. The seglets need not be contiguous in physical
//! memory; logical offsets within the segment map to a seglet and an offset
//! within it. Entries may span seglet boundaries.
//!
//! Segments move through a fixed lifecycle. The writer mutates the segment
//! only while it is `Open`; once sealed the bytes are immutable and may be
//! shared with the replica manager. The cleaner may later reclaim wholly
//! dead seglets in place, leaving holes that iteration skips via recorded
//! resume offsets, so entry offsets stay stable for the life of the id.

mod iterator;

pub use iterator::{EntrySource, IterError, MalformedSegment, SegmentIterator, Skip};

use crate::entry::*;
use crate::seglets::Seglet;

use crc64fast_nvme::Digest;
use rustcommon_time::CoarseInstant as Instant;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AppendError {
    #[error("segment full")]
    SegmentFull,
}

/// Lifecycle state of a segment. Transitions are monotonic except that a
/// segment's seglets return to the pool at `Free` and may later back a new
/// segment with a new id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    Open = 1,
    Closed = 2,
    Cleanable = 3,
    Cleaning = 4,
    Freeable = 5,
    Free = 6,
}

impl SegmentState {
    fn from_raw(raw: u8) -> SegmentState {
        match raw {
            1 => SegmentState::Open,
            2 => SegmentState::Closed,
            3 => SegmentState::Cleanable,
            4 => SegmentState::Cleaning,
            5 => SegmentState::Freeable,
            _ => SegmentState::Free,
        }
    }
}

/// Resume sentinel for seglet slots which have not been reclaimed.
const NO_RESUME: u32 = u32::MAX;

pub(crate) struct SegmentData {
    seglets: Vec<Option<Seglet>>,
    /// For reclaimed slots, the offset at which iteration resumes after the
    /// hole, or `NO_RESUME`.
    resume: Vec<u32>,
    seglet_size: usize,
    capacity: usize,
    append_offset: usize,
    sealed: bool,
}

impl SegmentData {
    fn write(&mut self, mut offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity);
        let mut remaining = src;
        while !remaining.is_empty() {
            let idx = offset / self.seglet_size;
            let within = offset % self.seglet_size;
            let n = core::cmp::min(self.seglet_size - within, remaining.len());
            let seglet = self.seglets[idx]
                .as_mut()
                .expect("write into reclaimed seglet");
            seglet.as_mut_slice()[within..within + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            offset += n;
        }
    }

    pub(crate) fn read(&self, mut offset: usize, dst: &mut [u8]) -> bool {
        if offset + dst.len() > self.capacity {
            return false;
        }
        let mut filled = 0;
        while filled < dst.len() {
            let idx = offset / self.seglet_size;
            let within = offset % self.seglet_size;
            let n = core::cmp::min(self.seglet_size - within, dst.len() - filled);
            match &self.seglets[idx] {
                Some(seglet) => {
                    dst[filled..filled + n].copy_from_slice(&seglet.as_slice()[within..within + n]);
                }
                None => return false,
            }
            filled += n;
            offset += n;
        }
        true
    }

    pub(crate) fn range_present(&self, offset: usize, len: usize) -> bool {
        if offset + len > self.capacity {
            return false;
        }
        let first = offset / self.seglet_size;
        let last = if len == 0 {
            first
        } else {
            (offset + len - 1) / self.seglet_size
        };
        (first..=last).all(|idx| self.seglets[idx].is_some())
    }

    /// Checksum over the logical range `[0, end)`.
    fn checksum_to(&self, end: usize) -> u64 {
        let mut digest = Digest::new();
        let mut offset = 0;
        while offset < end {
            let idx = offset / self.seglet_size;
            let within = offset % self.seglet_size;
            let n = core::cmp::min(self.seglet_size - within, end - offset);
            let seglet = self.seglets[idx]
                .as_ref()
                .expect("checksum over reclaimed seglet");
            digest.write(&seglet.as_slice()[within..within + n]);
            offset += n;
        }
        digest.sum64()
    }
}

/// A segment in the log, identified by a cluster-unique, monotonically
/// increasing id. Byte-level mutation happens only through the exclusive
/// owner dictated by the segment's state; statistics are updated through
/// atomics so the cleaner can rank candidates without taking the data lock.
pub struct LogSegment {
    id: u64,
    created: Instant,
    state: AtomicU8,
    replication_id: AtomicU64,
    on_backup: AtomicBool,
    sealed: AtomicBool,
    capacity_bytes: AtomicUsize,
    used_bytes: AtomicUsize,
    dead_bytes: AtomicUsize,
    tombstone_bytes: AtomicUsize,
    inner: RwLock<SegmentData>,
}

impl LogSegment {
    /// Create a new open segment over the given seglets and write its
    /// header entry.
    pub(crate) fn new(id: u64, seglets: Vec<Seglet>, seglet_size: usize) -> Self {
        assert!(!seglets.is_empty());
        let slots = seglets.len();
        let capacity = slots * seglet_size;

        let segment = Self {
            id,
            created: Instant::recent(),
            state: AtomicU8::new(SegmentState::Open as u8),
            replication_id: AtomicU64::new(0),
            on_backup: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            capacity_bytes: AtomicUsize::new(capacity),
            used_bytes: AtomicUsize::new(0),
            dead_bytes: AtomicUsize::new(0),
            tombstone_bytes: AtomicUsize::new(0),
            inner: RwLock::new(SegmentData {
                seglets: seglets.into_iter().map(Some).collect(),
                resume: vec![NO_RESUME; slots],
                seglet_size,
                capacity,
                append_offset: 0,
                sealed: false,
            }),
        };

        {
            let mut data = segment.write_lock();
            let entry = EntryHeader::new(EntryType::SegHeader, SEGMENT_HEADER_SIZE as u32);
            let header = SegmentHeader::new(id, capacity as u32);
            data.write(0, &entry.encode());
            data.write(ENTRY_HEADER_SIZE, &header.encode());
            data.append_offset = ENTRY_HEADER_SIZE + SEGMENT_HEADER_SIZE;
        }
        segment
            .used_bytes
            .store(ENTRY_HEADER_SIZE + SEGMENT_HEADER_SIZE, Ordering::Release);

        segment
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn created(&self) -> Instant {
        self.created
    }

    #[inline]
    pub fn state(&self) -> SegmentState {
        SegmentState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Attempt a state transition. Returns false if the segment was not in
    /// the expected state.
    pub(crate) fn transition(&self, from: SegmentState, to: SegmentState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn replication_id(&self) -> u64 {
        self.replication_id.load(Ordering::Acquire)
    }

    /// Set by the replica manager when it opens a replication group for the
    /// segment. Opaque to the engine.
    pub fn set_replication_id(&self, id: u64) {
        self.replication_id.store(id, Ordering::Release);
    }

    #[inline]
    pub fn on_backup(&self) -> bool {
        self.on_backup.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_backup(&self, value: bool) {
        self.on_backup.store(value, Ordering::Release);
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn dead_bytes(&self) -> usize {
        self.dead_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tombstone_bytes(&self) -> usize {
        self.tombstone_bytes.load(Ordering::Acquire)
    }

    /// Bytes not yet known to be dead, segment framing included.
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.used_bytes().saturating_sub(self.dead_bytes())
    }

    /// Fraction of the segment's capacity holding live data.
    pub fn live_fraction(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 1.0;
        }
        self.live_bytes() as f64 / capacity as f64
    }

    /// Live data as a percentage of capacity, for utilization thresholds.
    pub fn utilization(&self) -> u32 {
        (self.live_fraction() * 100.0) as u32
    }

    /// Estimate of the seglets an in-memory compaction pass could reclaim:
    /// the dead fraction of the segment in whole seglets, less the holes
    /// already reclaimed by earlier passes.
    pub fn freeable_seglets(&self) -> usize {
        let data = self.read_lock();
        let dead_seglets = data.capacity.saturating_sub(self.live_bytes()) / data.seglet_size;
        let holes = data.seglets.iter().filter(|s| s.is_none()).count();
        dead_seglets.saturating_sub(holes)
    }

    /// Number of seglets the segment currently owns.
    pub fn owned_seglets(&self) -> usize {
        self.read_lock()
            .seglets
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Presence of each seglet slot; reclaimed slots read false.
    pub(crate) fn seglet_presence(&self) -> Vec<bool> {
        self.read_lock()
            .seglets
            .iter()
            .map(|s| s.is_some())
            .collect()
    }

    /// Record that an entry of `bytes` total on-wire size is dead.
    pub fn mark_dead(&self, bytes: usize) {
        self.dead_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Append an entry. Returns the offset of the entry's payload within
    /// the segment. Fails with `SegmentFull` when the entry plus the footer
    /// the segment must always have room for would overrun capacity.
    pub fn append(&self, entry_type: EntryType, payload: &[u8]) -> Result<u32, AppendError> {
        let mut data = self.write_lock();
        if data.sealed {
            return Err(AppendError::SegmentFull);
        }

        let footer_room = ENTRY_HEADER_SIZE + SEGMENT_FOOTER_SIZE;
        let total = ENTRY_HEADER_SIZE + payload.len();
        if data.append_offset + total + footer_room > data.capacity {
            return Err(AppendError::SegmentFull);
        }

        let header = EntryHeader::new(entry_type, payload.len() as u32);
        let offset = data.append_offset;
        data.write(offset, &header.encode());
        data.write(offset + ENTRY_HEADER_SIZE, payload);
        data.append_offset += total;
        self.used_bytes.store(data.append_offset, Ordering::Release);

        if entry_type == EntryType::Tombstone {
            self.tombstone_bytes.fetch_add(total, Ordering::AcqRel);
        }

        Ok((offset + ENTRY_HEADER_SIZE) as u32)
    }

    /// Seal the segment: optionally trim trailing unused seglets, patch the
    /// declared capacity, and write the footer entry whose checksum covers
    /// every byte up to the footer payload. Returns the trimmed seglets.
    pub(crate) fn seal(&self, trim: bool) -> Vec<Seglet> {
        let mut data = self.write_lock();
        assert!(!data.sealed, "segment sealed twice");

        let footer_end = data.append_offset + ENTRY_HEADER_SIZE + SEGMENT_FOOTER_SIZE;
        let mut trimmed = Vec::new();

        if trim {
            let needed_slots = (footer_end + data.seglet_size - 1) / data.seglet_size;
            while data.seglets.len() > needed_slots {
                if let Some(seglet) = data.seglets.pop().flatten() {
                    trimmed.push(seglet);
                }
                data.resume.pop();
            }
            data.capacity = data.seglets.len() * data.seglet_size;
            self.capacity_bytes.store(data.capacity, Ordering::Release);

            // the header entry declared the untrimmed capacity; patch it
            let header = SegmentHeader::new(self.id, data.capacity as u32);
            data.write(ENTRY_HEADER_SIZE, &header.encode());
        }

        let entry = EntryHeader::new(EntryType::SegFooter, SEGMENT_FOOTER_SIZE as u32);
        let offset = data.append_offset;
        data.write(offset, &entry.encode());

        let checksum = data.checksum_to(offset + ENTRY_HEADER_SIZE);
        let footer = SegmentFooter::new(checksum);
        data.write(offset + ENTRY_HEADER_SIZE, &footer.encode());

        data.append_offset = offset + ENTRY_HEADER_SIZE + SEGMENT_FOOTER_SIZE;
        data.sealed = true;
        self.used_bytes.store(data.append_offset, Ordering::Release);
        self.sealed.store(true, Ordering::Release);

        trimmed
    }

    /// Reclaim wholly dead seglets in place, recording for each hole the
    /// offset iteration should resume at. Entry offsets are untouched.
    pub(crate) fn reclaim_seglets(&self, reclaim: &[(usize, u32)]) -> Vec<Seglet> {
        let mut data = self.write_lock();
        let mut freed = Vec::with_capacity(reclaim.len());
        for &(idx, resume) in reclaim {
            assert!(idx > 0, "header seglet is never reclaimable");
            if let Some(seglet) = data.seglets[idx].take() {
                data.resume[idx] = resume;
                freed.push(seglet);
            }
        }
        freed
    }

    /// Take every remaining seglet out of the segment. Called once the
    /// replica manager has confirmed remote replicas are retired.
    pub(crate) fn take_seglets(&self) -> Vec<Seglet> {
        let mut data = self.write_lock();
        let mut out = Vec::new();
        for slot in data.seglets.iter_mut() {
            if let Some(seglet) = slot.take() {
                out.push(seglet);
            }
        }
        out
    }

    /// Materialize the segment as the contiguous byte buffer a backup
    /// stores: seglet boundaries elided, zero padding to capacity.
    pub fn replica_buffer(&self) -> Vec<u8> {
        let data = self.read_lock();
        let mut buf = vec![0; data.capacity];
        for (idx, slot) in data.seglets.iter().enumerate() {
            if let Some(seglet) = slot {
                let begin = idx * data.seglet_size;
                buf[begin..begin + data.seglet_size].copy_from_slice(seglet.as_slice());
            }
        }
        buf
    }

    /// Walk the segment verifying that framing agrees with the header
    /// byte accounting. Expensive; intended for debugging.
    pub fn check_integrity(&self) -> bool {
        let mut end = 0;
        {
            let mut iter = self.iter();
            while !iter.is_done() {
                let (offset, length) = match (iter.offset(), iter.length()) {
                    (Ok(offset), Ok(length)) => (offset as usize, length as usize),
                    _ => return false,
                };
                end = offset + length;
                iter.next();
            }
        }

        if end > self.used_bytes() {
            error!("segment {} iterates past its append offset", self.id);
            return false;
        }
        let contiguous = self.read_lock().seglets.iter().all(|s| s.is_some());
        if contiguous && self.is_sealed() && end != self.used_bytes() {
            error!(
                "segment {} accounts for {} bytes but iterates {}",
                self.id,
                self.used_bytes(),
                end
            );
            return false;
        }
        true
    }

    /// A read-locked view for iteration and payload extraction.
    pub fn view(&self) -> SegmentView<'_> {
        SegmentView {
            data: self.read_lock(),
        }
    }

    /// Iterate the entries written so far.
    pub fn iter(&self) -> SegmentIterator<SegmentView<'_>> {
        SegmentIterator::over_segment(self.view())
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, SegmentData> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, SegmentData> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for LogSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        f.debug_struct("LogSegment")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("capacity", &self.capacity())
            .field("used_bytes", &self.used_bytes())
            .field("dead_bytes", &self.dead_bytes())
            .finish()
    }
}

/// Read-only view over a segment's bytes, holding the data lock. Do not
/// hold a view across calls back into the segment manager or seglet pool.
pub struct SegmentView<'a> {
    data: RwLockReadGuard<'a, SegmentData>,
}

impl SegmentView<'_> {
    #[inline]
    pub fn append_offset(&self) -> usize {
        self.data.append_offset
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> bool {
        self.data.read(offset, dst)
    }

    pub fn range_present(&self, offset: usize, len: usize) -> bool {
        self.data.range_present(offset, len)
    }
}

impl EntrySource for SegmentView<'_> {
    fn limit(&self) -> usize {
        self.data.append_offset
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> bool {
        self.data.read(offset, dst)
    }

    fn skip(&self, offset: usize) -> Skip {
        if offset >= self.data.append_offset {
            return Skip::End;
        }
        let idx = offset / self.data.seglet_size;
        if self.data.seglets[idx].is_some() {
            return Skip::Present;
        }
        match self.data.resume[idx] {
            NO_RESUME => Skip::End,
            resume => Skip::Resume(resume as usize),
        }
    }

    fn resume_after(&self, offset: usize) -> Option<usize> {
        let first = offset / self.data.seglet_size;
        for idx in first..self.data.seglets.len() {
            if self.data.seglets[idx].is_none() {
                return match self.data.resume[idx] {
                    NO_RESUME => None,
                    resume => Some(resume as usize),
                };
            }
        }
        None
    }
}
