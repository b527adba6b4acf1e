// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! This crate is the log-structured in-memory storage engine of a
//! distributed key-value store. Object versions are appended to a log of
//! fixed-capacity segments, each composed of fixed-size seglets; sealed
//! segments are replicated to remote backups and a background cleaner
//! continuously reclaims the space of dead entries so the log does not grow
//! without bound.
//!
//! The engine is deliberately index-agnostic: the embedding store registers
//! [`LogEntryHandlers`] so the cleaner can ask which entries are still
//! needed, and a [`ReplicaManager`] so seglets are only reclaimed once the
//! remote replicas are retired.
//!
//! ```
//! use seglog::*;
//! use std::sync::Arc;
//!
//! // a store which keeps nothing: every entry is dead at cleaning time
//! struct Discard;
//!
//! impl LogEntryHandlers for Discard {
//!     fn timestamp(&self, _: EntryType, _: &[u8]) -> u32 {
//!         0
//!     }
//!     fn relocate(&self, _: EntryType, _: &[u8], _: &mut EntryRelocator<'_>) {}
//! }
//!
//! let engine = SegLog::builder()
//!     .config(Config::debug(4096, 65536, 64 * 65536, 2))
//!     .build(Arc::new(Discard))
//!     .unwrap();
//!
//! let position = engine.log().append(EntryType::Object, b"coffee").unwrap();
//! assert!(position.offset() > 0);
//!
//! engine.cleaner().start();
//! engine.cleaner().stop();
//! ```

// macro includes
#[macro_use]
extern crate log;

// submodules
mod cleaner;
mod config;
mod entry;
mod handlers;
mod manager;
mod metrics;
mod replica;
mod seglets;
mod segment;
mod writer;

// publicly exported items from submodules
pub use cleaner::{CleanerError, CleanerMetrics, LogCleaner, PassMetrics};
pub use config::Config;
pub use entry::{
    EntryHeader, EntryType, SegmentFooter, SegmentHeader, ENTRY_HEADER_SIZE, SEGMENT_FOOTER_SIZE,
    SEGMENT_HEADER_SIZE,
};
pub use handlers::{EntryRelocator, LogEntryHandlers, RelocationError};
pub use manager::{ManagerError, SegmentManager};
pub use replica::{Completion, NullReplicaManager, ReplicaManager};
pub use seglets::{Reservation, Seglet, SegletError, SegletPool};
pub use segment::{
    AppendError, EntrySource, IterError, LogSegment, MalformedSegment, SegmentIterator,
    SegmentState, SegmentView, Skip,
};
pub use writer::{Log, LogError, LogPosition};

use std::sync::Arc;

/// A fully wired engine: segment manager, head writer, and cleaner.
pub struct SegLog {
    manager: Arc<SegmentManager>,
    log: Log,
    cleaner: LogCleaner,
}

impl SegLog {
    /// Returns a new [`Builder`] used to configure and construct a `SegLog`
    /// instance.
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn cleaner(&self) -> &LogCleaner {
        &self.cleaner
    }

    pub fn manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }
}

/// A `Builder` is used to construct a new [`SegLog`] instance.
#[derive(Default)]
pub struct Builder {
    config: Config,
    replica: Option<Arc<dyn ReplicaManager>>,
}

impl Builder {
    /// Specify the engine configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Specify the replica manager backing the log. Defaults to
    /// [`NullReplicaManager`] for unreplicated operation.
    pub fn replica_manager(mut self, replica: Arc<dyn ReplicaManager>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Consumes the builder and returns a fully-allocated engine. The
    /// cleaner is constructed but not started; call
    /// [`LogCleaner::start`] to spawn its threads.
    pub fn build(self, handlers: Arc<dyn LogEntryHandlers>) -> Result<SegLog, LogError> {
        let replica = self
            .replica
            .unwrap_or_else(|| Arc::new(NullReplicaManager::new()));
        let manager = Arc::new(SegmentManager::new(&self.config, replica).map_err(|e| {
            error!("failed to provision the seglet pool: {}", e);
            LogError::OutOfSpace
        })?);
        let log = Log::new(manager.clone())?;
        let cleaner = LogCleaner::new(&self.config, manager.clone(), handlers);
        Ok(SegLog {
            manager,
            log,
            cleaner,
        })
    }
}
