// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The [`LogCleaner`] reclaims space from dead log entries so the log does
//! not grow without bound. It runs two kinds of passes in one or more
//! worker threads, concurrently with the writer:
//!
//! * **in-memory compaction** rewrites a single segment into fewer seglets
//!   without touching entry offsets, relieving memory pressure cheaply but
//!   leaving the backup replicas (and their tombstones) untouched;
//! * **disk cleaning** relocates the live entries of several candidate
//!   segments into fresh survivor segments with new ids, then retires the
//!   candidates and their replicas.
//!
//! Candidates are picked by cost-benefit: segments that are mostly dead,
//! and old segments whose dead space is unlikely to grow, clean best.
//! Relocated entries are sorted by age first, so survivors hold
//! temporally-close cohorts and stay cheap to clean in the future.

use crate::config::Config;
use crate::entry::{EntryHeader, EntryType, ENTRY_HEADER_SIZE};
use crate::handlers::{EntryRelocator, LogEntryHandlers};
use crate::writer::LogPosition;
use crate::manager::SegmentManager;
use crate::metrics::*;
use crate::replica::Completion;
use crate::seglets::Reservation;
use crate::segment::LogSegment;

use rustcommon_time::CoarseInstant as Instant;
use thiserror::Error;

use core::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CleanerError {
    #[error("survivor segments exhausted during relocation")]
    SurvivorExhaustion,
}

/// Relocation counters for one cleaning mode.
#[derive(Default)]
pub struct PassMetrics {
    total_relocation_callbacks: AtomicU64,
    total_relocation_appends: AtomicU64,
    relocation_callback_ticks: AtomicU64,
    relocation_append_ticks: AtomicU64,
    bytes_freed: AtomicU64,
    segments_processed: AtomicU64,
}

impl PassMetrics {
    fn record_callback(&self, nanos: u64) {
        self.total_relocation_callbacks.fetch_add(1, Ordering::Relaxed);
        self.relocation_callback_ticks
            .fetch_add(nanos, Ordering::Relaxed);
    }

    fn record_append(&self, nanos: u64) {
        self.total_relocation_appends.fetch_add(1, Ordering::Relaxed);
        self.relocation_append_ticks
            .fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn total_relocation_callbacks(&self) -> u64 {
        self.total_relocation_callbacks.load(Ordering::Relaxed)
    }

    pub fn total_relocation_appends(&self) -> u64 {
        self.total_relocation_appends.load(Ordering::Relaxed)
    }

    pub fn relocation_callback_ticks(&self) -> u64 {
        self.relocation_callback_ticks.load(Ordering::Relaxed)
    }

    pub fn relocation_append_ticks(&self) -> u64 {
        self.relocation_append_ticks.load(Ordering::Relaxed)
    }

    pub fn bytes_freed(&self) -> u64 {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    pub fn segments_processed(&self) -> u64 {
        self.segments_processed.load(Ordering::Relaxed)
    }
}

/// Read-only cleaner metrics surface.
#[derive(Default)]
pub struct CleanerMetrics {
    do_work_ticks: AtomicU64,
    do_work_sleep_ticks: AtomicU64,
    active_threads: AtomicI64,
    in_memory: PassMetrics,
    on_disk: PassMetrics,
}

impl CleanerMetrics {
    pub fn do_work_ticks(&self) -> u64 {
        self.do_work_ticks.load(Ordering::Relaxed)
    }

    pub fn do_work_sleep_ticks(&self) -> u64 {
        self.do_work_sleep_ticks.load(Ordering::Relaxed)
    }

    pub fn active_threads(&self) -> i64 {
        self.active_threads.load(Ordering::Relaxed)
    }

    pub fn in_memory(&self) -> &PassMetrics {
        &self.in_memory
    }

    pub fn on_disk(&self) -> &PassMetrics {
        &self.on_disk
    }
}

/// Reference to a live entry extracted from a segment being cleaned, with
/// its timestamp cached so the age sort does not call back per comparison.
/// Valid only for the duration of the pass.
struct LiveEntry {
    segment: usize,
    offset: u32,
    timestamp: u32,
}

/// Cost-benefit score for a cleaning candidate: `((1 - u) * age) / (1 + u)`
/// where `u` is the live fraction. A fully dead segment is the best
/// possible candidate; a fully live one has no benefit at all.
fn cost_benefit_score(live_fraction: f64, age_secs: u64) -> f64 {
    if live_fraction <= 0.0 {
        return f64::INFINITY;
    }
    if live_fraction >= 1.0 {
        return 0.0;
    }
    ((1.0 - live_fraction) * age_secs as f64) / (1.0 + live_fraction)
}

struct Core {
    manager: Arc<SegmentManager>,
    handlers: Arc<dyn LogEntryHandlers>,
    seglet_size: usize,
    segment_size: usize,
    num_threads: usize,
    poll: Duration,
    min_memory_utilization: u32,
    min_disk_utilization: u32,
    max_cleanable_memory_utilization: u32,
    max_live_segments_per_disk_pass: usize,
    survivor_segments_reserved: usize,
    write_cost_threshold: f64,
    disable_in_memory_cleaning: bool,
    /// Shared cleaning candidate list. Held only across snapshot and claim.
    candidates: Mutex<Vec<Arc<LogSegment>>>,
    /// Write cost of the most recent compaction pass. Crossing the
    /// threshold forces a disk pass, which resets it.
    last_write_cost: Mutex<f64>,
    threads_should_exit: AtomicBool,
    metrics: CleanerMetrics,
}

pub struct LogCleaner {
    core: Arc<Core>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LogCleaner {
    pub fn new(
        config: &Config,
        manager: Arc<SegmentManager>,
        handlers: Arc<dyn LogEntryHandlers>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                manager,
                handlers,
                seglet_size: config.seglet_size(),
                segment_size: config.segment_size(),
                num_threads: config.num_threads(),
                poll: Duration::from_micros(config.poll_usec()),
                min_memory_utilization: config.min_memory_utilization(),
                min_disk_utilization: config.min_disk_utilization(),
                max_cleanable_memory_utilization: config.max_cleanable_memory_utilization(),
                max_live_segments_per_disk_pass: config.max_live_segments_per_disk_pass(),
                survivor_segments_reserved: config.survivor_segments_to_reserve(),
                write_cost_threshold: config.write_cost_threshold(),
                disable_in_memory_cleaning: config.disable_in_memory_cleaning(),
                candidates: Mutex::new(Vec::new()),
                last_write_cost: Mutex::new(0.0),
                threads_should_exit: AtomicBool::new(false),
                metrics: CleanerMetrics::default(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the cleaner threads.
    pub fn start(&self) {
        let mut threads = self.lock_threads();
        if !threads.is_empty() {
            return;
        }
        self.core.threads_should_exit.store(false, Ordering::Release);
        for i in 0..self.core.num_threads {
            let core = self.core.clone();
            let handle = std::thread::Builder::new()
                .name(format!("seglog_cleaner_{}", i))
                .spawn(move || {
                    while !core.threads_should_exit.load(Ordering::Acquire) {
                        core.do_work();
                    }
                })
                .expect("failed to spawn cleaner thread");
            threads.push(handle);
        }
    }

    /// Request cooperative shutdown and join the cleaner threads. A pass in
    /// progress completes normally; survivors are closed and replicated.
    pub fn stop(&self) {
        self.core.threads_should_exit.store(true, Ordering::Release);
        let mut threads = self.lock_threads();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn metrics(&self) -> &CleanerMetrics {
        &self.core.metrics
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for LogCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Core {
    /// One iteration of the cleaner policy loop.
    fn do_work(&self) {
        rustcommon_time::refresh_clock();
        let begin = std::time::Instant::now();
        CLEANER_ACTIVE_THREADS.increment();
        self.metrics.active_threads.fetch_add(1, Ordering::Relaxed);

        self.manager.reclaim_retired();

        let memory_utilization = self.manager.memory_utilization();
        let disk_utilization = self.manager.disk_utilization();
        let write_cost = self.last_write_cost();
        let memory_pressure = memory_utilization >= self.min_memory_utilization;

        let mut idle = false;
        if memory_pressure
            && !self.disable_in_memory_cleaning
            && write_cost < self.write_cost_threshold
        {
            let cost = self.do_memory_cleaning();
            self.set_last_write_cost(cost);
        } else if disk_utilization >= self.min_disk_utilization
            || write_cost >= self.write_cost_threshold
        {
            match self.do_disk_cleaning() {
                Ok(0) => {
                    // nothing to clean; let compaction be reconsidered
                    self.set_last_write_cost(0.0);
                    idle = true;
                }
                Ok(_) => self.set_last_write_cost(0.0),
                Err(CleanerError::SurvivorExhaustion) => {
                    CLEANER_SURVIVOR_EXHAUSTION.increment();
                    error!("disk cleaning pass failed: survivor segments exhausted");
                    idle = true;
                }
            }
        } else {
            idle = true;
        }

        if idle && !self.threads_should_exit.load(Ordering::Acquire) {
            let sleep_begin = std::time::Instant::now();
            std::thread::sleep(self.poll);
            self.metrics
                .do_work_sleep_ticks
                .fetch_add(sleep_begin.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }

        self.metrics.active_threads.fetch_sub(1, Ordering::Relaxed);
        CLEANER_ACTIVE_THREADS.decrement();
        self.metrics
            .do_work_ticks
            .fetch_add(begin.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn last_write_cost(&self) -> f64 {
        *self.lock_write_cost()
    }

    fn set_last_write_cost(&self, cost: f64) {
        *self.lock_write_cost() = cost;
    }

    /// Compact the segment with the most freeable seglets in place, and
    /// return the pass's write cost: bytes processed per byte freed. When
    /// no segment can free a seglet, returns infinity so the policy loop
    /// escalates to disk cleaning.
    fn do_memory_cleaning(&self) -> f64 {
        let segment = {
            let mut candidates = self.lock_candidates();
            *candidates = self.manager.cleanable_candidates();
            let best = candidates
                .iter()
                .filter(|s| s.utilization() <= self.max_cleanable_memory_utilization)
                .filter(|s| s.freeable_seglets() > 0)
                .max_by(|a, b| {
                    a.freeable_seglets()
                        .cmp(&b.freeable_seglets())
                        .then_with(|| b.id().cmp(&a.id()))
                })
                .cloned();
            let segment = match best {
                Some(segment) => segment,
                None => return f64::INFINITY,
            };
            if self
                .manager
                .mark_cleaning(std::slice::from_ref(&segment))
                .is_err()
            {
                // another thread claimed it; not a reason to force a disk pass
                return 0.0;
            }
            segment
        };

        let used = segment.used_bytes();
        let reclaim = self.plan_compaction(&segment);
        if reclaim.is_empty() {
            self.manager.return_to_cleanable(&segment);
            return f64::INFINITY;
        }

        let freed = segment.reclaim_seglets(&reclaim);
        let freed_bytes = freed.len() * self.seglet_size;
        self.manager.pool().free_many(freed);
        self.manager.return_to_cleanable(&segment);

        SEGMENT_COMPACTED.increment();
        self.metrics
            .in_memory
            .segments_processed
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .in_memory
            .bytes_freed
            .fetch_add(freed_bytes as u64, Ordering::Relaxed);
        debug!(
            "compacted segment {}: freed {} seglets",
            segment.id(),
            freed_bytes / self.seglet_size
        );

        used as f64 / freed_bytes as f64
    }

    /// Walk the segment asking the handlers which entries are live, and
    /// compute which seglets hold no live bytes. Returns the reclaimable
    /// slots paired with the offset iteration resumes at after each hole.
    fn plan_compaction(&self, segment: &Arc<LogSegment>) -> Vec<(usize, u32)> {
        let slots = segment.capacity() / self.seglet_size;
        let mut live = vec![false; slots];
        let mut boundaries: Vec<u32> = Vec::new();

        let seglet_size = self.seglet_size;
        let mark = |from: usize, len: usize, live: &mut Vec<bool>| {
            if len == 0 {
                return;
            }
            for idx in (from / seglet_size)..=((from + len - 1) / seglet_size) {
                live[idx] = true;
            }
        };

        // copy the entries out first so no lock is held across the
        // relocation callbacks below
        let mut extracted: Vec<(EntryType, usize, Vec<u8>)> = Vec::new();
        {
            let mut iter = segment.iter();
            while !iter.is_done() {
                let entry_type = match iter.entry_type() {
                    Ok(entry_type) => entry_type,
                    Err(_) => break,
                };
                let length = iter.length().unwrap_or(0) as usize;
                let payload_offset = match iter.offset() {
                    Ok(offset) => offset as usize,
                    Err(_) => break,
                };
                let header_offset = payload_offset - ENTRY_HEADER_SIZE;
                let total = ENTRY_HEADER_SIZE + length;
                boundaries.push(header_offset as u32);

                match entry_type {
                    EntryType::SegHeader | EntryType::SegFooter => {
                        mark(header_offset, total, &mut live);
                    }
                    _ => {
                        // entries reaching into an existing hole are known
                        // dead and need no callback
                        if iter.payload_present().unwrap_or(false) {
                            if let Ok(payload) = iter.payload() {
                                extracted.push((entry_type, header_offset, payload));
                            }
                        }
                    }
                }
                iter.next();
            }
        }

        for (entry_type, header_offset, payload) in extracted {
            let total = ENTRY_HEADER_SIZE + payload.len();
            let position =
                LogPosition::new(segment.id(), (header_offset + ENTRY_HEADER_SIZE) as u32);
            let mut relocator = EntryRelocator::preserving(position, total);
            let begin = std::time::Instant::now();
            self.handlers.relocate(entry_type, &payload, &mut relocator);
            self.metrics
                .in_memory
                .record_callback(begin.elapsed().as_nanos() as u64);
            if relocator.did_append() {
                self.metrics
                    .in_memory
                    .record_append(relocator.append_nanos());
                mark(header_offset, total, &mut live);
            }
        }

        let presence = segment.seglet_presence();
        let header_kept = |offset: u32, live: &[bool]| {
            let begin = offset as usize / self.seglet_size;
            let end = (offset as usize + ENTRY_HEADER_SIZE - 1) / self.seglet_size;
            (begin..=end).all(|idx| live[idx])
        };

        let append_end = segment.used_bytes();
        let mut reclaim = Vec::new();
        for idx in 1..slots {
            if live[idx] || !presence[idx] {
                continue;
            }
            if idx * self.seglet_size >= append_end {
                // trailing seglet past the written region; iteration never
                // reaches it, so no resume offset is needed
                reclaim.push((idx, 0));
                continue;
            }
            let seglet_end = ((idx + 1) * self.seglet_size) as u32;
            let resume = boundaries
                .iter()
                .copied()
                .find(|&b| b >= seglet_end && header_kept(b, &live));
            if let Some(resume) = resume {
                reclaim.push((idx, resume));
            }
        }
        reclaim
    }

    /// One disk cleaning pass: pick candidates by cost-benefit, relocate
    /// their live entries into survivors in age order, and retire them.
    /// Returns the number of segments cleaned.
    fn do_disk_cleaning(&self) -> Result<usize, CleanerError> {
        let to_clean = self.get_segments_to_clean();
        if to_clean.is_empty() {
            return Ok(0);
        }

        let total_live: usize = to_clean.iter().map(|s| s.live_bytes()).sum();
        let survivors_needed = (total_live / self.segment_size + 1)
            .min(self.survivor_segments_reserved);
        if !self.wait_for_available_survivors(survivors_needed) {
            // shutting down before the pass started
            for segment in &to_clean {
                self.manager.return_to_cleanable(segment);
            }
            return Ok(0);
        }

        let entries = self.get_sorted_entries(&to_clean);
        let (survivors, completions) = match self.relocate_live_entries(&to_clean, entries) {
            Ok(result) => result,
            Err(e) => {
                // survivors already produced stay in the log; the
                // candidates return with their remaining live entries
                for segment in &to_clean {
                    self.manager.return_to_cleanable(segment);
                }
                return Err(e);
            }
        };

        // survivor replicas must be durable before the candidates retire
        for completion in &completions {
            completion.wait();
        }

        let freed_bytes: usize = to_clean.iter().map(|s| s.capacity()).sum::<usize>()
            .saturating_sub(survivors.iter().map(|s| s.capacity()).sum());
        let cleaned = to_clean.len();

        self.manager.free(to_clean);
        self.manager.reclaim_retired();

        SEGMENT_CLEANED.add(cleaned as u64);
        self.metrics
            .on_disk
            .segments_processed
            .fetch_add(cleaned as u64, Ordering::Relaxed);
        self.metrics
            .on_disk
            .bytes_freed
            .fetch_add(freed_bytes as u64, Ordering::Relaxed);
        debug!(
            "disk cleaning: {} segments into {} survivors",
            cleaned,
            survivors.len()
        );

        Ok(cleaned)
    }

    /// Snapshot the candidate set, rank it by cost-benefit, and claim the
    /// best candidates up to the live-byte cap. Scores are computed once
    /// with a captured timestamp so they cannot shift during the sort.
    fn get_segments_to_clean(&self) -> Vec<Arc<LogSegment>> {
        let mut candidates = self.lock_candidates();
        *candidates = self.manager.cleanable_candidates();

        let now = Instant::recent();
        let mut scored: Vec<(f64, Arc<LogSegment>)> = candidates
            .iter()
            .map(|s| {
                let age = if now > s.created() {
                    (now - s.created()).as_secs() as u64
                } else {
                    0
                };
                (cost_benefit_score(s.live_fraction(), age), s.clone())
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.1.id().cmp(&b.1.id()))
        });

        let max_live = self.max_live_segments_per_disk_pass * self.segment_size;
        let mut total_live = 0;
        let mut selected = Vec::new();
        for (_, segment) in scored {
            let live = segment.live_bytes();
            if total_live + live > max_live {
                break;
            }
            total_live += live;
            selected.push(segment);
        }

        if selected.is_empty() {
            return selected;
        }
        if self.manager.mark_cleaning(&selected).is_err() {
            // lost a race with a sibling thread; retry next iteration
            return Vec::new();
        }
        selected
    }

    /// Block until the survivor reservation can supply `count` segments,
    /// reclaiming retired segments while waiting. Returns false if shutdown
    /// was requested before the reservation filled.
    fn wait_for_available_survivors(&self, count: usize) -> bool {
        let per_segment = self.manager.seglets_per_segment();
        loop {
            let available = self.manager.pool().reserved_count(Reservation::Survivor) / per_segment;
            if available >= count {
                return true;
            }
            if self.threads_should_exit.load(Ordering::Acquire) {
                return false;
            }
            if self.manager.reclaim_retired() == 0 {
                std::thread::sleep(self.poll);
            }
        }
    }

    /// Extract every live entry from the segments being cleaned and sort
    /// by timestamp so survivors hold cohorts of similar age.
    fn get_sorted_entries(&self, segments: &[Arc<LogSegment>]) -> Vec<LiveEntry> {
        let mut entries = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            let mut iter = segment.iter();
            while !iter.is_done() {
                let entry_type = match iter.entry_type() {
                    Ok(entry_type) => entry_type,
                    Err(_) => break,
                };
                if entry_type != EntryType::SegHeader
                    && entry_type != EntryType::SegFooter
                    && iter.payload_present().unwrap_or(false)
                {
                    if let (Ok(payload), Ok(offset)) = (iter.payload(), iter.offset()) {
                        let timestamp = self.handlers.timestamp(entry_type, &payload);
                        entries.push(LiveEntry {
                            segment: index,
                            offset,
                            timestamp,
                        });
                    }
                }
                iter.next();
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Offer every extracted entry to the handlers for relocation into
    /// survivor segments. A survivor that fills is closed and replaced; two
    /// consecutive failures on freshly allocated survivors fail the pass.
    #[allow(clippy::type_complexity)]
    fn relocate_live_entries(
        &self,
        segments: &[Arc<LogSegment>],
        entries: Vec<LiveEntry>,
    ) -> Result<(Vec<Arc<LogSegment>>, Vec<Completion>), CleanerError> {
        let mut survivors: Vec<Arc<LogSegment>> = Vec::new();
        let mut completions: Vec<Completion> = Vec::new();
        let mut current: Option<Arc<LogSegment>> = None;
        // true while the current survivor has received nothing
        let mut fresh = false;

        for entry in entries {
            let segment = &segments[entry.segment];
            let (entry_type, payload) = {
                let view = segment.view();
                let header_offset = entry.offset as usize - ENTRY_HEADER_SIZE;
                let mut header_bytes = [0; ENTRY_HEADER_SIZE];
                if !view.read(header_offset, &mut header_bytes) {
                    continue;
                }
                let header = match EntryHeader::decode(&header_bytes) {
                    Some(header) => header,
                    None => continue,
                };
                let mut payload = vec![0; header.length() as usize];
                if !view.read(entry.offset as usize, &mut payload) {
                    continue;
                }
                (header.entry_type(), payload)
            };

            let total = ENTRY_HEADER_SIZE + payload.len();
            let mut fresh_failures = 0;
            loop {
                let mut relocator = EntryRelocator::new(current.as_deref(), total);
                let begin = std::time::Instant::now();
                self.handlers.relocate(entry_type, &payload, &mut relocator);
                self.metrics
                    .on_disk
                    .record_callback(begin.elapsed().as_nanos() as u64);

                if !relocator.failed() {
                    if relocator.did_append() {
                        self.metrics.on_disk.record_append(relocator.append_nanos());
                        fresh = false;
                    }
                    break;
                }

                // the entry needs space the current survivor (if any) does
                // not have: close it and retry on a fresh one
                if fresh {
                    fresh_failures += 1;
                    if fresh_failures >= 2 {
                        if let Some(survivor) = current.take() {
                            completions.push(self.close_survivor(&survivor));
                        }
                        return Err(CleanerError::SurvivorExhaustion);
                    }
                }
                if let Some(survivor) = current.take() {
                    completions.push(self.close_survivor(&survivor));
                }
                let survivor = self.allocate_survivor()?;
                current = Some(survivor.clone());
                survivors.push(survivor);
                fresh = true;
            }
        }

        if let Some(survivor) = current.take() {
            completions.push(self.close_survivor(&survivor));
        }
        Ok((survivors, completions))
    }

    fn allocate_survivor(&self) -> Result<Arc<LogSegment>, CleanerError> {
        for attempt in 0..2 {
            match self.manager.allocate_survivor() {
                Ok(survivor) => return Ok(survivor),
                Err(_) if attempt == 0 => {
                    // retired segments may be holding the reservation down
                    self.manager.reclaim_retired();
                }
                Err(_) => break,
            }
        }
        Err(CleanerError::SurvivorExhaustion)
    }

    /// Close a filled survivor: seal it, trim unused trailing seglets back
    /// to the reservation, and hand it to the replica manager.
    fn close_survivor(&self, survivor: &Arc<LogSegment>) -> Completion {
        self.manager.close(survivor, true)
    }

    fn lock_candidates(&self) -> MutexGuard<'_, Vec<Arc<LogSegment>>> {
        match self.candidates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_write_cost(&self) -> MutexGuard<'_, f64> {
        match self.last_write_cost.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::replica::{NullReplicaManager, ReplicaManager};
    use crate::segment::SegmentState;
    use crate::writer::Log;

    use ahash::RandomState;
    use std::collections::HashMap;

    /// Entry handlers backed by a payload-keyed index, standing in for the
    /// store's hash table.
    struct TestHandlers {
        index: Mutex<HashMap<Vec<u8>, LogPosition, RandomState>>,
        timestamps: Mutex<HashMap<Vec<u8>, u32, RandomState>>,
    }

    impl TestHandlers {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                index: Mutex::new(HashMap::default()),
                timestamps: Mutex::new(HashMap::default()),
            })
        }

        fn insert(&self, payload: &[u8], position: LogPosition, timestamp: u32) {
            self.index
                .lock()
                .unwrap()
                .insert(payload.to_vec(), position);
            self.timestamps
                .lock()
                .unwrap()
                .insert(payload.to_vec(), timestamp);
        }

        fn remove(&self, payload: &[u8]) {
            self.index.lock().unwrap().remove(payload);
        }

        fn position(&self, payload: &[u8]) -> Option<LogPosition> {
            self.index.lock().unwrap().get(payload).copied()
        }
    }

    impl LogEntryHandlers for TestHandlers {
        fn timestamp(&self, _entry_type: EntryType, payload: &[u8]) -> u32 {
            self.timestamps
                .lock()
                .unwrap()
                .get(payload)
                .copied()
                .unwrap_or(0)
        }

        fn relocate(
            &self,
            entry_type: EntryType,
            payload: &[u8],
            relocator: &mut EntryRelocator<'_>,
        ) {
            let mut index = self.index.lock().unwrap();
            if index.contains_key(payload) {
                if let Ok(position) = relocator.append(entry_type, payload) {
                    index.insert(payload.to_vec(), position);
                }
            }
        }
    }

    /// Replica manager whose retirements complete only when released, for
    /// exercising the seglet reclamation gate.
    struct GatedReplicaManager {
        pending_frees: Mutex<Vec<Completion>>,
    }

    impl GatedReplicaManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pending_frees: Mutex::new(Vec::new()),
            })
        }

        fn release_all(&self) {
            for completion in self.pending_frees.lock().unwrap().drain(..) {
                completion.complete();
            }
        }
    }

    impl ReplicaManager for GatedReplicaManager {
        fn replicate(&self, _segment: &Arc<LogSegment>) -> Completion {
            Completion::completed()
        }

        fn free_replicas(&self, _segment: &Arc<LogSegment>) -> Completion {
            let completion = Completion::pending();
            self.pending_frees.lock().unwrap().push(completion.clone());
            completion
        }
    }

    fn engine(config: &Config) -> (Arc<SegmentManager>, Arc<TestHandlers>, LogCleaner) {
        engine_with(config, Arc::new(NullReplicaManager::new()))
    }

    fn engine_with(
        config: &Config,
        replica: Arc<dyn ReplicaManager>,
    ) -> (Arc<SegmentManager>, Arc<TestHandlers>, LogCleaner) {
        let manager = Arc::new(SegmentManager::new(config, replica).unwrap());
        let handlers = TestHandlers::new();
        let cleaner = LogCleaner::new(
            config,
            manager.clone(),
            handlers.clone() as Arc<dyn LogEntryHandlers>,
        );
        (manager, handlers, cleaner)
    }

    /// Append `(payload, timestamp, live)` triples into a fresh segment and
    /// close it, registering live entries with the handlers.
    fn fill_segment(
        manager: &SegmentManager,
        handlers: &TestHandlers,
        entries: &[(&[u8], u32, bool)],
    ) -> Arc<LogSegment> {
        let segment = manager.allocate_head().unwrap();
        for (payload, timestamp, live) in entries {
            let offset = segment.append(EntryType::Object, payload).unwrap();
            if *live {
                handlers.insert(payload, LogPosition::new(segment.id(), offset), *timestamp);
            } else {
                segment.mark_dead(ENTRY_HEADER_SIZE + payload.len());
            }
        }
        manager.close(&segment, false);
        segment
    }

    fn assert_seglets_conserved(manager: &SegmentManager) {
        let pool = manager.pool();
        let accounted = pool.free_count()
            + pool.reserved_count(Reservation::Survivor)
            + pool.reserved_count(Reservation::EmergencyHead)
            + manager.owned_seglets();
        assert_eq!(accounted, pool.total(), "seglets leaked or duplicated");
    }

    #[test]
    fn cost_benefit_scores() {
        // a mostly-dead old segment beats a half-dead segment of the same
        // age, which beats a mostly-dead young segment
        let a = cost_benefit_score(0.1, 100);
        let b = cost_benefit_score(0.5, 100);
        let c = cost_benefit_score(0.1, 10);
        assert!((a - 81.8181).abs() < 0.01);
        assert!((b - 33.3333).abs() < 0.01);
        assert!((c - 8.1818).abs() < 0.01);
        assert!(a > b && b > c);

        // boundary utilizations
        assert_eq!(cost_benefit_score(0.0, 7), f64::INFINITY);
        assert_eq!(cost_benefit_score(1.0, 1000), 0.0);
    }

    #[test]
    fn compaction_reclaims_wholly_dead_seglets() {
        let config = Config::debug(64, 256, 16 * 256, 2);
        let (manager, handlers, cleaner) = engine(&config);

        // layout: header 0..24, a 24..64, b 64..192, c 192..216, footer
        // 216..232; b covers seglets 1 and 2 exactly and is dead
        let a = vec![0xAA; 32];
        let b = vec![0xBB; 120];
        let c = vec![0xCC; 16];
        let segment = fill_segment(
            &manager,
            &handlers,
            &[(&a, 1, true), (&b, 2, false), (&c, 3, true)],
        );

        let a_position = handlers.position(&a).unwrap();
        let c_position = handlers.position(&c).unwrap();
        let free_before = manager.pool().free_count();

        let cost = cleaner.core.do_memory_cleaning();
        assert!((cost - 232.0 / 128.0).abs() < 0.001);

        // two seglets back in the general pool, offsets untouched
        assert_eq!(segment.owned_seglets(), 2);
        assert_eq!(manager.pool().free_count(), free_before + 2);
        assert_eq!(handlers.position(&a), Some(a_position));
        assert_eq!(handlers.position(&c), Some(c_position));
        assert_eq!(segment.state(), SegmentState::Cleanable);
        assert!(segment.check_integrity());
        assert_seglets_conserved(&manager);

        // the hole is skipped during iteration
        let mut types = Vec::new();
        let mut iter = segment.iter();
        while !iter.is_done() {
            types.push(iter.entry_type().unwrap());
            iter.next();
        }
        assert_eq!(
            types,
            vec![
                EntryType::SegHeader,
                EntryType::Object,
                EntryType::Object,
                EntryType::SegFooter,
            ]
        );

        let metrics = cleaner.metrics();
        assert_eq!(metrics.in_memory().segments_processed(), 1);
        assert_eq!(metrics.in_memory().bytes_freed(), 128);
    }

    #[test]
    fn compaction_yields_when_nothing_freeable() {
        let config = Config::debug(64, 256, 16 * 256, 2);
        let (manager, handlers, cleaner) = engine(&config);

        // every entry is live and the segment is full
        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 40]).collect();
        let entries: Vec<(&[u8], u32, bool)> = payloads
            .iter()
            .map(|p| (p.as_slice(), 1, true))
            .collect();
        let segment = fill_segment(&manager, &handlers, &entries);
        assert_eq!(segment.freeable_seglets(), 0);

        let cost = cleaner.core.do_memory_cleaning();
        assert_eq!(cost, f64::INFINITY);
        assert_eq!(segment.owned_seglets(), 4);
        assert_eq!(segment.state(), SegmentState::Cleanable);
        assert_seglets_conserved(&manager);
    }

    #[test]
    fn disk_cleaning_relocates_in_age_order() {
        let config = Config::debug(64, 512, 16 * 512, 4);
        let (manager, handlers, cleaner) = engine(&config);

        let e1 = vec![1u8; 60];
        let e2 = vec![2u8; 60];
        let e3 = vec![3u8; 60];
        let f1 = vec![4u8; 60];
        let f2 = vec![5u8; 120];

        let old1 = fill_segment(
            &manager,
            &handlers,
            &[(&e1, 30, true), (&e2, 10, true), (&e3, 5, false)],
        );
        let old2 = fill_segment(&manager, &handlers, &[(&f1, 20, true), (&f2, 9, false)]);

        // cost-benefit needs nonzero age
        std::thread::sleep(std::time::Duration::from_secs(2));
        rustcommon_time::refresh_clock();

        assert_eq!(cleaner.core.do_disk_cleaning(), Ok(2));

        // the old segments retire completely
        assert!(manager.get(old1.id()).is_none());
        assert!(manager.get(old2.id()).is_none());
        assert_eq!(old1.state(), SegmentState::Free);
        assert_eq!(old2.state(), SegmentState::Free);
        assert_seglets_conserved(&manager);

        // live entries survive at new positions in timestamp order, dead
        // entries do not
        let p_e1 = handlers.position(&e1).unwrap();
        let p_e2 = handlers.position(&e2).unwrap();
        let p_f1 = handlers.position(&f1).unwrap();
        assert!(p_e1.segment_id() > old2.id());
        assert!(p_e2 < p_f1 && p_f1 < p_e1);

        let survivor = manager.get(p_e2.segment_id()).unwrap();
        assert!(survivor.is_sealed());
        let mut payloads = Vec::new();
        let mut iter = survivor.iter();
        while !iter.is_done() {
            if iter.entry_type() == Ok(EntryType::Object) {
                payloads.push(iter.payload().unwrap());
            }
            iter.next();
        }
        assert!(payloads.contains(&e2));
        assert!(!payloads.contains(&e3));
        assert!(!payloads.contains(&f2));

        let metrics = cleaner.metrics();
        assert_eq!(metrics.on_disk().segments_processed(), 2);
        assert_eq!(metrics.on_disk().total_relocation_appends(), 3);
        assert!(metrics.on_disk().bytes_freed() > 0);
    }

    #[test]
    fn relocation_retries_count_appends_once() {
        let config = Config::debug(64, 256, 16 * 256, 4);
        let (manager, handlers, cleaner) = engine(&config);

        // six live 50 byte entries; a 256 byte survivor holds three, so the
        // fourth append fails and retries on a fresh survivor
        let payloads: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i + 10; 50]).collect();
        let first: Vec<(&[u8], u32, bool)> = payloads[0..3]
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_slice(), i as u32, true))
            .collect();
        let second: Vec<(&[u8], u32, bool)> = payloads[3..6]
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_slice(), 10 + i as u32, true))
            .collect();
        fill_segment(&manager, &handlers, &first);
        fill_segment(&manager, &handlers, &second);

        std::thread::sleep(std::time::Duration::from_secs(2));
        rustcommon_time::refresh_clock();

        assert_eq!(cleaner.core.do_disk_cleaning(), Ok(2));

        let metrics = cleaner.metrics();
        // every live entry appended exactly once, retries show up only as
        // extra callbacks
        assert_eq!(metrics.on_disk().total_relocation_appends(), 6);
        assert!(metrics.on_disk().total_relocation_callbacks() > 6);
        for payload in &payloads {
            assert!(handlers.position(payload).is_some());
        }
        assert_seglets_conserved(&manager);
    }

    #[test]
    fn survivor_exhaustion_fails_the_pass() {
        // no survivor reservation at all
        let config = Config::debug(64, 256, 16 * 256, 0);
        let (manager, handlers, cleaner) = engine(&config);

        let payload = vec![7u8; 100];
        let segment = fill_segment(&manager, &handlers, &[(&payload, 1, true)]);

        std::thread::sleep(std::time::Duration::from_secs(2));
        rustcommon_time::refresh_clock();

        assert_eq!(
            cleaner.core.do_disk_cleaning(),
            Err(CleanerError::SurvivorExhaustion)
        );

        // the candidate goes back to the cleanable set with its data intact
        assert_eq!(segment.state(), SegmentState::Cleanable);
        assert!(handlers.position(&payload).is_some());
        assert_seglets_conserved(&manager);
    }

    #[test]
    fn fully_dead_segment_cleans_without_survivors() {
        let config = Config::debug(64, 256, 16 * 256, 2);
        let (manager, handlers, cleaner) = engine(&config);

        let payload = vec![9u8; 100];
        let segment = fill_segment(&manager, &handlers, &[(&payload, 1, false)]);
        // framing bytes are dead too once the store gives up the segment
        segment.mark_dead(segment.live_bytes());

        // live fraction zero scores infinite, so no age is needed
        assert_eq!(cleaner.core.do_disk_cleaning(), Ok(1));
        assert_eq!(segment.state(), SegmentState::Free);
        // nothing was live, so no survivor was produced
        assert!(manager.segment_ids().is_empty());
        assert_seglets_conserved(&manager);
    }

    #[test]
    fn replica_retirement_gates_seglet_return() {
        let config = Config::debug(64, 256, 16 * 256, 2);
        let gate = GatedReplicaManager::new();
        let (manager, handlers, cleaner) =
            engine_with(&config, gate.clone() as Arc<dyn ReplicaManager>);

        let dead = vec![3u8; 100];
        let segment = fill_segment(&manager, &handlers, &[(&dead, 1, false)]);
        segment.mark_dead(segment.live_bytes());

        let free_before = manager.pool().free_count();
        assert_eq!(cleaner.core.do_disk_cleaning(), Ok(1));

        // the pool must not grow until the backups drop their replicas
        assert_eq!(segment.state(), SegmentState::Freeable);
        assert_eq!(manager.pool().free_count(), free_before);
        assert_eq!(manager.reclaim_retired(), 0);

        gate.release_all();
        assert_eq!(manager.reclaim_retired(), 1);
        assert_eq!(segment.state(), SegmentState::Free);
        assert_eq!(
            manager.pool().free_count(),
            free_before + manager.seglets_per_segment()
        );
        assert_seglets_conserved(&manager);
    }

    #[test]
    fn do_work_sleeps_when_idle() {
        let config = Config::debug(64, 256, 16 * 256, 2).set_poll_usec(100);
        let (_manager, _handlers, cleaner) = engine(&config);

        cleaner.core.do_work();
        let metrics = cleaner.metrics();
        assert!(metrics.do_work_ticks() > 0);
        assert!(metrics.do_work_sleep_ticks() > 0);
        assert_eq!(metrics.active_threads(), 0);
    }

    #[test]
    fn shutdown_mid_pass_leaks_nothing() {
        let config = Config::debug(64, 512, 32 * 512, 4)
            .set_poll_usec(100)
            .set_num_threads(2)
            .set_min_memory_utilization(10)
            .set_min_disk_utilization(10);
        let (manager, handlers, cleaner) = engine(&config);
        let log = Log::new(manager.clone()).unwrap();

        cleaner.start();

        for i in 0..200u32 {
            let payload = i.to_le_bytes().repeat(10);
            match log.append(EntryType::Object, &payload) {
                Ok(position) => {
                    handlers.insert(&payload, position, i);
                    if i % 2 == 0 {
                        log.free(position, payload.len());
                        handlers.remove(&payload);
                    }
                }
                Err(_) => break,
            }
            if i % 16 == 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }

        std::thread::sleep(std::time::Duration::from_millis(50));
        cleaner.stop();

        // the pass in progress completed: nothing is mid-cleaning and the
        // seglet population is fully accounted for
        assert_seglets_conserved(&manager);
        for (_, position) in handlers.index.lock().unwrap().iter() {
            let segment = manager.get(position.segment_id());
            assert!(segment.is_some(), "live entry points at missing segment");
            assert_ne!(segment.unwrap().state(), SegmentState::Cleaning);
        }
    }
}
