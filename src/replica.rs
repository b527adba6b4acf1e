// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Contract with the replica manager that stores copies of closed segments
//! on remote backups. The engine relies on two guarantees: a segment's
//! seglets are not reclaimed until `free_replicas` completes, and survivor
//! segments become cleanable only after their replication completes.

use crate::segment::LogSegment;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Completion handle for an asynchronous replica operation. Cheap to clone;
/// all clones observe the same completion.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    /// A completion which has not yet fired.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// A completion which fired before it was returned.
    pub fn completed() -> Self {
        let completion = Self::pending();
        completion.complete();
        completion
    }

    /// Fire the completion, waking any waiters.
    pub fn complete(&self) {
        let mut done = match self.inner.done.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done = true;
        self.inner.cv.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        match self.inner.done.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Block until the completion fires.
    pub fn wait(&self) {
        let mut done = match self.inner.done.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*done {
            done = match self.inner.cv.wait(done) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Replicates segments to remote backups. Implementations run their own
/// threads; both operations return immediately with a completion handle.
pub trait ReplicaManager: Send + Sync {
    /// Begin replicating a sealed segment. The completion fires once every
    /// replica is durable.
    fn replicate(&self, segment: &Arc<LogSegment>) -> Completion;

    /// Begin retiring a segment's replicas. The completion fires once the
    /// backups no longer need them; only then may the segment's seglets be
    /// reclaimed.
    fn free_replicas(&self, segment: &Arc<LogSegment>) -> Completion;
}

/// Replica manager for unreplicated operation: everything is immediately
/// durable and immediately retired.
pub struct NullReplicaManager {
    next_replication_id: AtomicU64,
}

impl NullReplicaManager {
    pub fn new() -> Self {
        Self {
            next_replication_id: AtomicU64::new(1),
        }
    }
}

impl Default for NullReplicaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaManager for NullReplicaManager {
    fn replicate(&self, segment: &Arc<LogSegment>) -> Completion {
        segment.set_replication_id(self.next_replication_id.fetch_add(1, Ordering::AcqRel));
        Completion::completed()
    }

    fn free_replicas(&self, _segment: &Arc<LogSegment>) -> Completion {
        Completion::completed()
    }
}
