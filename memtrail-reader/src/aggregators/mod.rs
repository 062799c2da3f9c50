// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumers of the reader's event stream. Each aggregator folds
//! [`crate::reader::AllocationEvent`]s into one requested shape; none of
//! them ever consults memory records for accounting. Deallocations of
//! addresses no aggregator has seen are skipped everywhere, which is also
//! what keeps spurious frees (`free(NULL)`, unmapped `munmap`) out of
//! every report.

mod high_water_mark;
mod snapshot;
mod stats;
mod temporal;
mod temporary;

pub use high_water_mark::HighWaterMarkFinder;
pub use snapshot::{AllocationRecord, SnapshotAggregator};
pub use stats::{StatsAggregator, SIZE_BUCKETS};
pub use temporal::{Interval, TemporalIntervalBuilder, DEFAULT_SNAPSHOT_MS};
pub use temporary::TemporaryAllocationDetector;

use memtrail_format::AllocatorKind;

/// The location an allocation is attributed to: where (both stacks) and
/// how (allocator kind), per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub tid: u64,
    pub kind: AllocatorKind,
    pub stack_id: u32,
    pub native_frame_index: u32,
    pub native_segment_generation: u32,
}

impl LocationKey {
    pub fn of(event: &crate::reader::AllocationEvent) -> Self {
        LocationKey {
            tid: event.tid,
            kind: event.kind,
            stack_id: event.stack_id,
            native_frame_index: event.native_frame_index,
            native_segment_generation: event.native_segment_generation,
        }
    }
}
