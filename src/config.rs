// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Engine configuration. All sizes are bytes; the segment size must be a
//! whole multiple of the seglet size and the heap a whole multiple of the
//! segment size.

use serde::{Deserialize, Serialize};

use std::io::Read;
use std::path::Path;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

// sizing
const SEGLET_SIZE: usize = 64 * KB;
const SEGMENT_SIZE: usize = 8 * MB;
const HEAP_SIZE: usize = GB;

// cleaner reservations and thresholds
const SURVIVOR_SEGMENTS_TO_RESERVE: usize = 15;
const MIN_MEMORY_UTILIZATION: u32 = 90;
const MIN_DISK_UTILIZATION: u32 = 95;
const MAX_CLEANABLE_MEMORY_UTILIZATION: u32 = 98;
const MAX_LIVE_SEGMENTS_PER_DISK_PASS: usize = 10;
const POLL_USEC: u64 = 10_000;
const WRITE_COST_THRESHOLD: f64 = 8.0;
const DISABLE_IN_MEMORY_CLEANING: bool = false;
const NUM_THREADS: usize = 1;

// helper functions for default values
fn seglet_size() -> usize {
    SEGLET_SIZE
}

fn segment_size() -> usize {
    SEGMENT_SIZE
}

fn heap_size() -> usize {
    HEAP_SIZE
}

fn survivor_segments_to_reserve() -> usize {
    SURVIVOR_SEGMENTS_TO_RESERVE
}

fn min_memory_utilization() -> u32 {
    MIN_MEMORY_UTILIZATION
}

fn min_disk_utilization() -> u32 {
    MIN_DISK_UTILIZATION
}

fn max_cleanable_memory_utilization() -> u32 {
    MAX_CLEANABLE_MEMORY_UTILIZATION
}

fn max_live_segments_per_disk_pass() -> usize {
    MAX_LIVE_SEGMENTS_PER_DISK_PASS
}

fn poll_usec() -> u64 {
    POLL_USEC
}

fn write_cost_threshold() -> f64 {
    WRITE_COST_THRESHOLD
}

fn disable_in_memory_cleaning() -> bool {
    DISABLE_IN_MEMORY_CLEANING
}

fn num_threads() -> usize {
    NUM_THREADS
}

// definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "seglet_size")]
    seglet_size: usize,
    #[serde(default = "segment_size")]
    segment_size: usize,
    #[serde(default = "heap_size")]
    heap_size: usize,
    #[serde(default = "survivor_segments_to_reserve")]
    survivor_segments_to_reserve: usize,
    #[serde(default = "min_memory_utilization")]
    min_memory_utilization: u32,
    #[serde(default = "min_disk_utilization")]
    min_disk_utilization: u32,
    #[serde(default = "max_cleanable_memory_utilization")]
    max_cleanable_memory_utilization: u32,
    #[serde(default = "max_live_segments_per_disk_pass")]
    max_live_segments_per_disk_pass: usize,
    #[serde(default = "poll_usec")]
    poll_usec: u64,
    #[serde(default = "write_cost_threshold")]
    write_cost_threshold: f64,
    #[serde(default = "disable_in_memory_cleaning")]
    disable_in_memory_cleaning: bool,
    #[serde(default = "num_threads")]
    num_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seglet_size: seglet_size(),
            segment_size: segment_size(),
            heap_size: heap_size(),
            survivor_segments_to_reserve: survivor_segments_to_reserve(),
            min_memory_utilization: min_memory_utilization(),
            min_disk_utilization: min_disk_utilization(),
            max_cleanable_memory_utilization: max_cleanable_memory_utilization(),
            max_live_segments_per_disk_pass: max_live_segments_per_disk_pass(),
            poll_usec: poll_usec(),
            write_cost_threshold: write_cost_threshold(),
            disable_in_memory_cleaning: disable_in_memory_cleaning(),
            num_threads: num_threads(),
        }
    }
}

// implementation
impl Config {
    /// Load a configuration from a TOML file, filling in defaults for any
    /// option not present.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        config.validate();
        Ok(config)
    }

    /// Compact constructor used by tests and tools that size the engine
    /// explicitly.
    pub fn debug(
        seglet_size: usize,
        segment_size: usize,
        heap_size: usize,
        survivor_segments_to_reserve: usize,
    ) -> Self {
        let config = Self {
            seglet_size,
            segment_size,
            heap_size,
            survivor_segments_to_reserve,
            ..Default::default()
        };
        config.validate();
        config
    }

    fn validate(&self) {
        assert!(self.seglet_size > 0, "seglet size must be non-zero");
        assert!(
            self.segment_size % self.seglet_size == 0,
            "segment size must be a multiple of the seglet size"
        );
        assert!(
            self.heap_size % self.segment_size == 0,
            "heap size must be a multiple of the segment size"
        );
    }

    pub fn seglet_size(&self) -> usize {
        self.seglet_size
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn seglets_per_segment(&self) -> usize {
        self.segment_size / self.seglet_size
    }

    pub fn total_seglets(&self) -> usize {
        self.heap_size / self.seglet_size
    }

    pub fn survivor_segments_to_reserve(&self) -> usize {
        self.survivor_segments_to_reserve
    }

    pub fn min_memory_utilization(&self) -> u32 {
        self.min_memory_utilization
    }

    pub fn min_disk_utilization(&self) -> u32 {
        self.min_disk_utilization
    }

    pub fn max_cleanable_memory_utilization(&self) -> u32 {
        self.max_cleanable_memory_utilization
    }

    pub fn max_live_segments_per_disk_pass(&self) -> usize {
        self.max_live_segments_per_disk_pass
    }

    pub fn poll_usec(&self) -> u64 {
        self.poll_usec
    }

    pub fn write_cost_threshold(&self) -> f64 {
        self.write_cost_threshold
    }

    pub fn disable_in_memory_cleaning(&self) -> bool {
        self.disable_in_memory_cleaning
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Builder-style setters for the cleaner knobs tests exercise.
    pub fn set_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn set_disable_in_memory_cleaning(mut self, disable: bool) -> Self {
        self.disable_in_memory_cleaning = disable;
        self
    }

    pub fn set_write_cost_threshold(mut self, threshold: f64) -> Self {
        self.write_cost_threshold = threshold;
        self
    }

    pub fn set_poll_usec(mut self, poll_usec: u64) -> Self {
        self.poll_usec = poll_usec;
        self
    }

    pub fn set_min_memory_utilization(mut self, percent: u32) -> Self {
        self.min_memory_utilization = percent;
        self
    }

    pub fn set_min_disk_utilization(mut self, percent: u32) -> Self {
        self.min_disk_utilization = percent;
        self
    }

    pub fn set_max_live_segments_per_disk_pass(mut self, segments: usize) -> Self {
        self.max_live_segments_per_disk_pass = segments;
        self
    }
}
