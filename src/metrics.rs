// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

// Ambient metrics for the seglog crate. The cleaner additionally keeps
// per-mode pass metrics on its own struct, see `cleaner::CleanerMetrics`.

use rustcommon_metrics::*;

// segment related
counter!(SEGMENT_REQUEST, "number of segment allocation attempts");
counter!(
    SEGMENT_REQUEST_FAILURE,
    "number of segment allocation attempts which failed"
);
counter!(
    SEGMENT_EMERGENCY_REQUEST,
    "number of head segments allocated from the emergency reservation"
);
counter!(SEGMENT_CLOSE, "number of segments sealed and closed");
counter!(
    SEGMENT_RETURN,
    "total number of segments whose seglets were returned to the pool"
);
counter!(SEGMENT_COMPACTED, "number of segments compacted in memory");
counter!(
    SEGMENT_CLEANED,
    "number of segments processed by disk cleaning"
);
gauge!(SEGMENT_CURRENT, "current number of live segments");
gauge!(
    SEGMENT_CLEANABLE,
    "current number of segments eligible for cleaning"
);
gauge!(
    SEGMENT_ON_BACKUP,
    "current number of segments with replicas held on backups"
);

// seglet related
counter!(
    SEGLET_REQUEST_FAILURE,
    "number of seglet allocation attempts which failed"
);
gauge!(SEGLET_CURRENT, "current number of seglets");
gauge!(SEGLET_FREE, "current number of seglets on the free list");

// log related
counter!(LOG_APPEND, "number of entries appended to the log head");
counter!(
    LOG_APPEND_EX,
    "number of log appends which failed after rollover"
);
counter!(LOG_ROLLOVER, "number of head segment rollovers");

// cleaner related
gauge!(
    CLEANER_ACTIVE_THREADS,
    "number of cleaner threads currently running a pass"
);
counter!(
    CLEANER_SURVIVOR_EXHAUSTION,
    "number of disk passes abandoned because survivors were exhausted"
);
