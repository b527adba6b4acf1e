// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Seglets are the fixed-size memory blocks segments are composed of. The
//! [`SegletPool`] pre-allocates the entire population up front and then only
//! moves blocks between the general free list, named reservations, and the
//! segments that own them. The population never grows or shrinks.

use crate::metrics::*;

use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SegletError {
    #[error("general seglet pool exhausted")]
    OutOfSeglets,
    #[error("reservation exhausted")]
    OutOfReserved,
}

/// Named reservations carved out of the seglet population. An exhausted
/// general free list must never dip into these; only the reverse refill
/// happens, when freed seglets top a drained reservation back up to target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// Seglets set aside for cleaner survivor segments.
    Survivor,
    /// Seglets set aside so the log can always roll to a fresh head.
    EmergencyHead,
}

const RESERVATIONS: usize = 2;

impl Reservation {
    fn index(self) -> usize {
        match self {
            Reservation::Survivor => 0,
            Reservation::EmergencyHead => 1,
        }
    }
}

/// A fixed-size block of memory owned by exactly one of: the free list, a
/// named reservation, or a segment.
pub struct Seglet {
    data: Box<[u8]>,
}

impl Seglet {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the block before it changes owner.
    pub(crate) fn scrub(&mut self) {
        self.data.fill(0);
    }
}

struct PoolInner {
    free: Vec<Seglet>,
    reserved: [Vec<Seglet>; RESERVATIONS],
    targets: [usize; RESERVATIONS],
}

/// Owner of the whole seglet population. Internally synchronized; safe to
/// call from the writer and all cleaner threads.
pub struct SegletPool {
    seglet_size: usize,
    total: usize,
    inner: Mutex<PoolInner>,
}

impl SegletPool {
    /// Pre-allocate `total` seglets of `seglet_size` bytes each.
    pub fn new(seglet_size: usize, total: usize) -> Self {
        assert!(seglet_size > 0, "seglet size must be non-zero");

        let mut free = Vec::with_capacity(total);
        for _ in 0..total {
            free.push(Seglet::new(seglet_size));
        }

        SEGLET_CURRENT.add(total as i64);
        SEGLET_FREE.add(total as i64);

        Self {
            seglet_size,
            total,
            inner: Mutex::new(PoolInner {
                free,
                reserved: [Vec::new(), Vec::new()],
                targets: [0; RESERVATIONS],
            }),
        }
    }

    #[inline]
    pub fn seglet_size(&self) -> usize {
        self.seglet_size
    }

    /// Total seglets in circulation. Constant for the pool's lifetime.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Move `count` seglets from the free list into a named reservation and
    /// raise that reservation's refill target.
    pub fn reserve(&self, count: usize, pool: Reservation) -> Result<(), SegletError> {
        let mut inner = self.lock();
        if inner.free.len() < count {
            return Err(SegletError::OutOfSeglets);
        }
        let idx = pool.index();
        for _ in 0..count {
            let seglet = match inner.free.pop() {
                Some(s) => s,
                None => return Err(SegletError::OutOfSeglets),
            };
            inner.reserved[idx].push(seglet);
        }
        inner.targets[idx] += count;
        SEGLET_FREE.sub(count as i64);
        Ok(())
    }

    /// Allocate a single seglet from the general free list.
    pub fn alloc(&self) -> Result<Seglet, SegletError> {
        let mut inner = self.lock();
        match inner.free.pop() {
            Some(seglet) => {
                SEGLET_FREE.decrement();
                Ok(seglet)
            }
            None => {
                SEGLET_REQUEST_FAILURE.increment();
                Err(SegletError::OutOfSeglets)
            }
        }
    }

    /// Allocate `count` seglets from the general free list, all or nothing.
    pub fn alloc_many(&self, count: usize) -> Result<Vec<Seglet>, SegletError> {
        let mut inner = self.lock();
        if inner.free.len() < count {
            SEGLET_REQUEST_FAILURE.increment();
            return Err(SegletError::OutOfSeglets);
        }
        let at = inner.free.len() - count;
        let seglets = inner.free.split_off(at);
        SEGLET_FREE.sub(count as i64);
        Ok(seglets)
    }

    /// Allocate a single seglet from a named reservation.
    pub fn alloc_from(&self, pool: Reservation) -> Result<Seglet, SegletError> {
        let mut inner = self.lock();
        inner.reserved[pool.index()]
            .pop()
            .ok_or(SegletError::OutOfReserved)
    }

    /// Allocate `count` seglets from a named reservation, all or nothing.
    pub fn alloc_many_from(
        &self,
        count: usize,
        pool: Reservation,
    ) -> Result<Vec<Seglet>, SegletError> {
        let mut inner = self.lock();
        let reserved = &mut inner.reserved[pool.index()];
        if reserved.len() < count {
            return Err(SegletError::OutOfReserved);
        }
        let at = reserved.len() - count;
        Ok(reserved.split_off(at))
    }

    /// Return a seglet to the pool. Drained reservations are refilled to
    /// target before the general free list grows.
    pub fn free(&self, seglet: Seglet) {
        self.free_many(vec![seglet])
    }

    /// Return a batch of seglets to the pool.
    pub fn free_many(&self, seglets: Vec<Seglet>) {
        let mut inner = self.lock();
        for mut seglet in seglets {
            debug_assert_eq!(seglet.len(), self.seglet_size);
            seglet.scrub();
            let mut seglet = Some(seglet);
            for idx in 0..RESERVATIONS {
                if inner.reserved[idx].len() < inner.targets[idx] {
                    if let Some(s) = seglet.take() {
                        inner.reserved[idx].push(s);
                    }
                    break;
                }
            }
            if let Some(s) = seglet {
                inner.free.push(s);
                SEGLET_FREE.increment();
            }
        }
    }

    /// Number of seglets on the general free list.
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of seglets currently held by a named reservation.
    pub fn reserved_count(&self, pool: Reservation) -> usize {
        self.lock().reserved[pool.index()].len()
    }

    /// The general (unreserved) population: total seglets minus all
    /// reservation targets.
    pub fn general_total(&self) -> usize {
        let inner = self.lock();
        self.total - inner.targets.iter().sum::<usize>()
    }

    /// Fraction of the general population currently allocated to segments,
    /// in percent. This is the engine's memory utilization signal.
    pub fn memory_utilization(&self) -> u32 {
        let inner = self.lock();
        let reserved_total: usize = inner.targets.iter().sum();
        let general = self.total.saturating_sub(reserved_total);
        if general == 0 {
            return 100;
        }
        let used = general.saturating_sub(inner.free.len());
        (used * 100 / general) as u32
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_conservation() {
        let pool = SegletPool::new(64, 8);
        assert_eq!(pool.total(), 8);
        assert_eq!(pool.free_count(), 8);

        let a = pool.alloc().unwrap();
        let b = pool.alloc_many(3).unwrap();
        assert_eq!(pool.free_count(), 4);

        pool.free(a);
        pool.free_many(b);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn reservations_honored_strictly() {
        let pool = SegletPool::new(64, 4);
        pool.reserve(3, Reservation::Survivor).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.reserved_count(Reservation::Survivor), 3);

        // the general list must never dip into the reservation
        let only = pool.alloc().unwrap();
        assert!(matches!(pool.alloc(), Err(SegletError::OutOfSeglets)));
        assert_eq!(pool.reserved_count(Reservation::Survivor), 3);

        let reserved = pool.alloc_many_from(3, Reservation::Survivor).unwrap();
        assert!(matches!(
            pool.alloc_from(Reservation::Survivor),
            Err(SegletError::OutOfReserved)
        ));

        // freed seglets refill the reservation before the free list
        pool.free(only);
        assert_eq!(pool.reserved_count(Reservation::Survivor), 1);
        assert_eq!(pool.free_count(), 0);
        pool.free_many(reserved);
        assert_eq!(pool.reserved_count(Reservation::Survivor), 3);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn reserve_requires_free_seglets() {
        let pool = SegletPool::new(64, 2);
        let held = pool.alloc_many(2).unwrap();
        assert_eq!(
            pool.reserve(1, Reservation::EmergencyHead),
            Err(SegletError::OutOfSeglets)
        );
        pool.free_many(held);
        pool.reserve(1, Reservation::EmergencyHead).unwrap();
        assert_eq!(pool.reserved_count(Reservation::EmergencyHead), 1);
    }

    #[test]
    fn memory_utilization_tracks_general_pool() {
        let pool = SegletPool::new(64, 10);
        pool.reserve(2, Reservation::Survivor).unwrap();
        assert_eq!(pool.memory_utilization(), 0);

        let held = pool.alloc_many(4).unwrap();
        assert_eq!(pool.memory_utilization(), 50);

        let rest = pool.alloc_many(4).unwrap();
        assert_eq!(pool.memory_utilization(), 100);

        pool.free_many(held);
        pool.free_many(rest);
        assert_eq!(pool.memory_utilization(), 0);
    }
}
