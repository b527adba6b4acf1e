// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The [`SegmentManager`] owns the seglet pool and every segment in the
//! system. It allocates heads for the writer and survivors for the cleaner,
//! tracks lifecycle transitions, publishes cleaning candidates once their
//! replicas are durable, and returns seglets to the pool only after the
//! replica manager confirms the remote copies are retired.

use crate::config::Config;
use crate::metrics::*;
use crate::replica::{Completion, ReplicaManager};
use crate::seglets::{Reservation, SegletError, SegletPool};
use crate::segment::{LogSegment, SegmentState};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Head segments kept in reserve so the log can always roll over, even
/// when cleaning is behind and the general pool is empty.
const EMERGENCY_HEAD_SEGMENTS: usize = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ManagerError {
    #[error("segment is no longer cleanable")]
    NotCleanable,
    #[error(transparent)]
    Seglets(#[from] SegletError),
}

struct ManagerInner {
    next_id: u64,
    segments: HashMap<u64, Arc<LogSegment>>,
    /// Closed segments whose replication has not yet been confirmed.
    replicating: Vec<(Arc<LogSegment>, Completion)>,
    /// Published cleaning candidates.
    cleanable: Vec<Arc<LogSegment>>,
    /// Freeable segments waiting for backups to drop their replicas.
    retiring: Vec<(Arc<LogSegment>, Completion)>,
}

pub struct SegmentManager {
    pool: SegletPool,
    seglet_size: usize,
    seglets_per_segment: usize,
    replica: Arc<dyn ReplicaManager>,
    inner: Mutex<ManagerInner>,
}

impl SegmentManager {
    pub fn new(config: &Config, replica: Arc<dyn ReplicaManager>) -> Result<Self, ManagerError> {
        let seglet_size = config.seglet_size();
        let seglets_per_segment = config.seglets_per_segment();
        let pool = SegletPool::new(seglet_size, config.total_seglets());

        pool.reserve(
            config.survivor_segments_to_reserve() * seglets_per_segment,
            Reservation::Survivor,
        )?;
        pool.reserve(
            EMERGENCY_HEAD_SEGMENTS * seglets_per_segment,
            Reservation::EmergencyHead,
        )?;

        Ok(Self {
            pool,
            seglet_size,
            seglets_per_segment,
            replica,
            inner: Mutex::new(ManagerInner {
                next_id: 0,
                segments: HashMap::new(),
                replicating: Vec::new(),
                cleanable: Vec::new(),
                retiring: Vec::new(),
            }),
        })
    }

    #[inline]
    pub fn seglet_size(&self) -> usize {
        self.seglet_size
    }

    #[inline]
    pub fn seglets_per_segment(&self) -> usize {
        self.seglets_per_segment
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.seglets_per_segment * self.seglet_size
    }

    pub fn pool(&self) -> &SegletPool {
        &self.pool
    }

    /// Allocate a new open segment for the log head. Falls back to the
    /// emergency reservation when the general pool is exhausted, so the log
    /// can seal its current head and write a digest.
    pub fn allocate_head(&self) -> Result<Arc<LogSegment>, ManagerError> {
        SEGMENT_REQUEST.increment();
        let seglets = match self.pool.alloc_many(self.seglets_per_segment) {
            Ok(seglets) => seglets,
            Err(SegletError::OutOfSeglets) => {
                SEGMENT_EMERGENCY_REQUEST.increment();
                self.pool
                    .alloc_many_from(self.seglets_per_segment, Reservation::EmergencyHead)
                    .map_err(|_| {
                        SEGMENT_REQUEST_FAILURE.increment();
                        SegletError::OutOfSeglets
                    })?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.install(seglets))
    }

    /// Allocate a new open segment for the cleaner, drawn strictly from the
    /// survivor reservation.
    pub fn allocate_survivor(&self) -> Result<Arc<LogSegment>, ManagerError> {
        SEGMENT_REQUEST.increment();
        let seglets = self
            .pool
            .alloc_many_from(self.seglets_per_segment, Reservation::Survivor)
            .map_err(|e| {
                SEGMENT_REQUEST_FAILURE.increment();
                e
            })?;
        Ok(self.install(seglets))
    }

    fn install(&self, seglets: Vec<crate::seglets::Seglet>) -> Arc<LogSegment> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let segment = Arc::new(LogSegment::new(id, seglets, self.seglet_size));
        inner.segments.insert(id, segment.clone());
        SEGMENT_CURRENT.increment();
        segment
    }

    /// Seal a segment and hand it to the replica manager. Returns
    /// immediately with the replication completion; the segment becomes a
    /// cleaning candidate once that completion fires. Survivors pass
    /// `trim` so unused trailing seglets return to the pool.
    pub fn close(&self, segment: &Arc<LogSegment>, trim: bool) -> Completion {
        let trimmed = segment.seal(trim);
        if !trimmed.is_empty() {
            self.pool.free_many(trimmed);
        }

        let transitioned = segment.transition(SegmentState::Open, SegmentState::Closed);
        debug_assert!(transitioned, "closed a segment that was not open");
        SEGMENT_CLOSE.increment();

        let completion = self.replica.replicate(segment);
        segment.set_on_backup(true);
        SEGMENT_ON_BACKUP.increment();

        self.lock()
            .replicating
            .push((segment.clone(), completion.clone()));
        completion
    }

    fn publish_replicated(inner: &mut ManagerInner) {
        let mut i = 0;
        while i < inner.replicating.len() {
            if inner.replicating[i].1.is_complete() {
                let (segment, _) = inner.replicating.swap_remove(i);
                if segment.transition(SegmentState::Closed, SegmentState::Cleanable) {
                    SEGMENT_CLEANABLE.increment();
                    inner.cleanable.push(segment);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Snapshot of the segments currently in the cleanable state. Newly
    /// durable segments are published first.
    pub fn cleanable_candidates(&self) -> Vec<Arc<LogSegment>> {
        let mut inner = self.lock();
        Self::publish_replicated(&mut inner);
        inner.cleanable.clone()
    }

    /// Atomically claim a set of candidates for cleaning. Fails if any of
    /// them is no longer cleanable, e.g. because another cleaner thread got
    /// there first.
    pub fn mark_cleaning(&self, segments: &[Arc<LogSegment>]) -> Result<(), ManagerError> {
        let mut inner = self.lock();
        if segments
            .iter()
            .any(|s| s.state() != SegmentState::Cleanable)
        {
            return Err(ManagerError::NotCleanable);
        }
        for segment in segments {
            let transitioned = segment.transition(SegmentState::Cleanable, SegmentState::Cleaning);
            debug_assert!(transitioned);
        }
        inner
            .cleanable
            .retain(|s| s.state() == SegmentState::Cleanable);
        SEGMENT_CLEANABLE.sub(segments.len() as i64);
        Ok(())
    }

    /// Return a segment claimed for cleaning to the candidate set, e.g.
    /// after an in-memory compaction pass or an abandoned disk pass.
    pub fn return_to_cleanable(&self, segment: &Arc<LogSegment>) {
        let mut inner = self.lock();
        if segment.transition(SegmentState::Cleaning, SegmentState::Cleanable) {
            SEGMENT_CLEANABLE.increment();
            inner.cleanable.push(segment.clone());
        }
    }

    /// Retire segments whose live entries have been relocated. Their
    /// seglets return to the pool only once the replica manager confirms
    /// the backups have dropped the replicas.
    pub fn free(&self, segments: Vec<Arc<LogSegment>>) {
        let mut batch = Vec::with_capacity(segments.len());
        for segment in segments {
            if segment.transition(SegmentState::Cleaning, SegmentState::Freeable) {
                let completion = self.replica.free_replicas(&segment);
                batch.push((segment, completion));
            } else {
                debug_assert!(false, "freed a segment that was not being cleaned");
            }
        }
        self.lock().retiring.append(&mut batch);
    }

    /// Reclaim the seglets of retired segments whose replicas are confirmed
    /// freed. Returns the number of segments reclaimed.
    pub fn reclaim_retired(&self) -> usize {
        let ready: Vec<Arc<LogSegment>> = {
            let mut inner = self.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < inner.retiring.len() {
                if inner.retiring[i].1.is_complete() {
                    let (segment, _) = inner.retiring.swap_remove(i);
                    ready.push(segment);
                } else {
                    i += 1;
                }
            }
            for segment in &ready {
                inner.segments.remove(&segment.id());
            }
            ready
        };

        let count = ready.len();
        for segment in ready {
            let seglets = segment.take_seglets();
            segment.set_on_backup(false);
            SEGMENT_ON_BACKUP.decrement();
            let transitioned = segment.transition(SegmentState::Freeable, SegmentState::Free);
            debug_assert!(transitioned);
            self.pool.free_many(seglets);
            SEGMENT_RETURN.increment();
            SEGMENT_CURRENT.decrement();
        }
        count
    }

    /// Look up a segment by id. Retired segments are not found.
    pub fn get(&self, id: u64) -> Option<Arc<LogSegment>> {
        self.lock().segments.get(&id).cloned()
    }

    /// Seglets currently owned by segments. With the pool's free and
    /// reserved counts this accounts for the entire population.
    pub fn owned_seglets(&self) -> usize {
        let segments: Vec<Arc<LogSegment>> = self.lock().segments.values().cloned().collect();
        segments.iter().map(|s| s.owned_seglets()).sum()
    }

    /// Checks the integrity of every segment.
    /// *NOTE*: this operation is relatively expensive
    pub fn check_integrity(&self) -> bool {
        let segments: Vec<Arc<LogSegment>> = self.lock().segments.values().cloned().collect();
        let mut integrity = true;
        for segment in segments {
            if !segment.check_integrity() {
                integrity = false;
            }
        }
        integrity
    }

    /// Ids of the segments comprising the log, for the head digest.
    pub fn segment_ids(&self) -> Vec<u64> {
        let inner = self.lock();
        let mut ids: Vec<u64> = inner
            .segments
            .values()
            .filter(|s| {
                matches!(
                    s.state(),
                    SegmentState::Open
                        | SegmentState::Closed
                        | SegmentState::Cleanable
                        | SegmentState::Cleaning
                )
            })
            .map(|s| s.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Allocated fraction of the general seglet population, in percent.
    pub fn memory_utilization(&self) -> u32 {
        self.pool.memory_utilization()
    }

    /// Fraction of segment slots whose replicas are still held on backups,
    /// in percent.
    pub fn disk_utilization(&self) -> u32 {
        let inner = self.lock();
        let total_slots = self.pool.total() / self.seglets_per_segment;
        if total_slots == 0 {
            return 100;
        }
        let on_backup = inner.segments.values().filter(|s| s.on_backup()).count();
        (on_backup * 100 / total_slots) as u32
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::NullReplicaManager;

    fn manager() -> SegmentManager {
        // 64 B seglets, 4 per segment, room for 16 segments total with 2
        // reserved for survivors
        let config = Config::debug(64, 256, 16 * 256, 2);
        SegmentManager::new(&config, Arc::new(NullReplicaManager::new())).unwrap()
    }

    #[test]
    fn ids_are_monotonic() {
        let manager = manager();
        let a = manager.allocate_head().unwrap();
        let b = manager.allocate_head().unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn lifecycle_to_cleanable() {
        let manager = manager();
        let segment = manager.allocate_head().unwrap();
        assert_eq!(segment.state(), SegmentState::Open);

        manager.close(&segment, false);
        // the null replica manager is immediately durable, so the segment
        // publishes on the next candidate poll
        let candidates = manager.cleanable_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(segment.state(), SegmentState::Cleanable);
        assert!(segment.on_backup());
    }

    #[test]
    fn mark_cleaning_is_atomic() {
        let manager = manager();
        let segment = manager.allocate_head().unwrap();
        manager.close(&segment, false);
        let candidates = manager.cleanable_candidates();

        manager.mark_cleaning(&candidates).unwrap();
        assert_eq!(segment.state(), SegmentState::Cleaning);

        // claiming again must fail and must not change state
        assert_eq!(
            manager.mark_cleaning(&candidates),
            Err(ManagerError::NotCleanable)
        );
        assert_eq!(segment.state(), SegmentState::Cleaning);
        assert!(manager.cleanable_candidates().is_empty());
    }

    #[test]
    fn survivors_come_from_the_reservation() {
        let manager = manager();
        let before = manager.pool().reserved_count(Reservation::Survivor);
        let survivor = manager.allocate_survivor().unwrap();
        assert_eq!(
            manager.pool().reserved_count(Reservation::Survivor),
            before - manager.seglets_per_segment()
        );
        assert_eq!(survivor.state(), SegmentState::Open);
    }

    #[test]
    fn emergency_heads_when_pool_exhausted() {
        let manager = manager();
        // drain the general pool
        let mut heads = Vec::new();
        while let Ok(segment) = manager.allocate_head() {
            let last_id = segment.id();
            heads.push(segment);
            if last_id > 64 {
                panic!("pool failed to exhaust");
            }
        }
        // 16 total segments - 2 survivor - 2 emergency = 12 general, plus
        // the 2 emergency heads
        assert_eq!(heads.len(), 14);
        assert_eq!(manager.pool().reserved_count(Reservation::EmergencyHead), 0);
    }

    #[test]
    fn seglets_return_only_after_replicas_freed() {
        let manager = manager();
        let segment = manager.allocate_head().unwrap();
        manager.close(&segment, false);
        let candidates = manager.cleanable_candidates();
        manager.mark_cleaning(&candidates).unwrap();

        let free_before = manager.pool().free_count();
        manager.free(candidates);
        assert_eq!(segment.state(), SegmentState::Freeable);

        // null replica manager retires immediately
        assert_eq!(manager.reclaim_retired(), 1);
        assert_eq!(segment.state(), SegmentState::Free);
        assert_eq!(
            manager.pool().free_count(),
            free_before + manager.seglets_per_segment()
        );
        assert!(manager.get(segment.id()).is_none());
    }

    #[test]
    fn disk_utilization_counts_backed_segments() {
        let manager = manager();
        assert_eq!(manager.disk_utilization(), 0);
        let segment = manager.allocate_head().unwrap();
        assert_eq!(manager.disk_utilization(), 0);
        manager.close(&segment, false);
        // 1 of 16 slots
        assert_eq!(manager.disk_utilization(), 6);
    }
}
