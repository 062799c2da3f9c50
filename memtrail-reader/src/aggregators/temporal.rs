// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregators::LocationKey;
use crate::reader::AllocationEvent;
use memtrail_format::MemoryRecord;
use rustc_hash::FxHashMap;

pub const DEFAULT_SNAPSHOT_MS: u64 = 10;

/// One lifetime interval of allocations from a single location:
/// everything allocated before snapshot `allocated_before` and
/// deallocated before `deallocated_before` (or never, for leaks).
/// Reports sweep a time window by summing the intervals that overlap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub allocated_before: u64,
    pub deallocated_before: Option<u64>,
    pub n_allocations: u64,
    pub n_bytes: u64,
}

struct LiveAllocation {
    key: LocationKey,
    size: u64,
    snapshot: u64,
}

/// Buckets the capture into fixed-duration snapshots, advanced by the
/// stream's memory records, and builds per-location interval lists.
///
/// An allocation freed in the snapshot it was made in yields an interval
/// with `deallocated_before == allocated_before`: it contributes to that
/// snapshot's peak but can never look like a leak.
pub struct TemporalIntervalBuilder {
    snapshot_ms: u64,
    start_ms: Option<u64>,
    current_snapshot: u64,
    live: FxHashMap<u64, LiveAllocation>,
    intervals: FxHashMap<(LocationKey, u64, Option<u64>), (u64, u64)>,
}

impl Default for TemporalIntervalBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_MS)
    }
}

impl TemporalIntervalBuilder {
    pub fn new(snapshot_ms: u64) -> Self {
        TemporalIntervalBuilder {
            snapshot_ms: snapshot_ms.max(1),
            start_ms: None,
            current_snapshot: 0,
            live: FxHashMap::default(),
            intervals: FxHashMap::default(),
        }
    }

    /// Memory records are the stream's clock; each one may advance the
    /// current snapshot index.
    pub fn process_memory_record(&mut self, record: &MemoryRecord) {
        let start = *self.start_ms.get_or_insert(record.ms_since_epoch);
        let elapsed = record.ms_since_epoch.saturating_sub(start);
        self.current_snapshot = self.current_snapshot.max(elapsed / self.snapshot_ms);
    }

    pub fn process(&mut self, event: &AllocationEvent) {
        if event.kind.is_deallocator() {
            let Some(live) = self.live.remove(&event.address) else {
                return;
            };
            let slot = self
                .intervals
                .entry((live.key, live.snapshot, Some(self.current_snapshot)))
                .or_insert((0, 0));
            slot.0 += 1;
            slot.1 += live.size;
            return;
        }
        self.live.insert(
            event.address,
            LiveAllocation {
                key: LocationKey::of(event),
                size: event.size,
                snapshot: self.current_snapshot,
            },
        );
    }

    pub fn current_snapshot(&self) -> u64 {
        self.current_snapshot
    }

    /// Finishes the pass: still-live allocations become open intervals.
    /// Returns the interval lists grouped per location.
    pub fn finish(mut self) -> FxHashMap<LocationKey, Vec<Interval>> {
        let live = std::mem::take(&mut self.live);
        for (_address, live) in live {
            let slot = self
                .intervals
                .entry((live.key, live.snapshot, None))
                .or_insert((0, 0));
            slot.0 += 1;
            slot.1 += live.size;
        }
        let mut grouped: FxHashMap<LocationKey, Vec<Interval>> = FxHashMap::default();
        for ((key, allocated_before, deallocated_before), (count, bytes)) in self.intervals {
            grouped.entry(key).or_default().push(Interval {
                allocated_before,
                deallocated_before,
                n_allocations: count,
                n_bytes: bytes,
            });
        }
        for intervals in grouped.values_mut() {
            intervals.sort_by_key(|i| (i.allocated_before, i.deallocated_before));
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrail_format::AllocatorKind;

    fn alloc(index: u64, address: u64, size: u64) -> AllocationEvent {
        AllocationEvent {
            index,
            tid: 1,
            kind: AllocatorKind::Malloc,
            address,
            size,
            stack_id: 3,
            native_frame_index: 0,
            native_segment_generation: 0,
        }
    }

    fn free(index: u64, address: u64) -> AllocationEvent {
        AllocationEvent {
            index,
            tid: 1,
            kind: AllocatorKind::Free,
            address,
            size: 0,
            stack_id: 0,
            native_frame_index: 0,
            native_segment_generation: 0,
        }
    }

    fn tick(builder: &mut TemporalIntervalBuilder, ms: u64) {
        builder.process_memory_record(&MemoryRecord {
            ms_since_epoch: ms,
            rss_bytes: 0,
        });
    }

    #[test]
    fn test_same_snapshot_lifetime() {
        let mut builder = TemporalIntervalBuilder::new(10);
        tick(&mut builder, 1000);
        builder.process(&alloc(0, 0x100, 64));
        builder.process(&free(1, 0x100));
        let grouped = builder.finish();
        let intervals: Vec<_> = grouped.into_values().flatten().collect();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].allocated_before, 0);
        assert_eq!(intervals[0].deallocated_before, Some(0));
        assert_eq!(intervals[0].n_bytes, 64);
    }

    #[test]
    fn test_cross_snapshot_lifetime_and_leak() {
        let mut builder = TemporalIntervalBuilder::new(10);
        tick(&mut builder, 1000);
        builder.process(&alloc(0, 0x100, 64));
        builder.process(&alloc(1, 0x200, 32));
        tick(&mut builder, 1035);
        builder.process(&free(2, 0x100));
        let grouped = builder.finish();
        let intervals: Vec<_> = grouped.into_values().flatten().collect();
        assert_eq!(intervals.len(), 2);
        let freed = intervals
            .iter()
            .find(|i| i.deallocated_before.is_some())
            .unwrap();
        assert_eq!(freed.allocated_before, 0);
        assert_eq!(freed.deallocated_before, Some(3));
        let leaked = intervals
            .iter()
            .find(|i| i.deallocated_before.is_none())
            .unwrap();
        assert_eq!(leaked.n_bytes, 32);
    }

    #[test]
    fn test_equal_intervals_merge() {
        let mut builder = TemporalIntervalBuilder::new(10);
        tick(&mut builder, 0);
        builder.process(&alloc(0, 0x100, 10));
        builder.process(&alloc(1, 0x200, 20));
        tick(&mut builder, 25);
        builder.process(&free(2, 0x100));
        builder.process(&free(3, 0x200));
        let grouped = builder.finish();
        assert_eq!(grouped.len(), 1);
        let intervals = grouped.into_values().next().unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].n_allocations, 2);
        assert_eq!(intervals[0].n_bytes, 30);
    }

    #[test]
    fn test_unseen_free_is_skipped() {
        let mut builder = TemporalIntervalBuilder::new(10);
        builder.process(&free(0, 0xBAD));
        assert!(builder.finish().is_empty());
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut builder = TemporalIntervalBuilder::new(10);
        tick(&mut builder, 1000);
        tick(&mut builder, 1050);
        assert_eq!(builder.current_snapshot(), 5);
        tick(&mut builder, 1010);
        assert_eq!(builder.current_snapshot(), 5);
    }
}
