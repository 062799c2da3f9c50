// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregators::LocationKey;
use crate::reader::AllocationEvent;
use memtrail_format::AllocatorKind;
use rustc_hash::FxHashMap;

/// One aggregated row of a snapshot: everything currently allocated from
/// one location. `tid` is `None` when threads were merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub tid: Option<u64>,
    pub kind: AllocatorKind,
    pub stack_id: u32,
    pub native_frame_index: u32,
    pub native_segment_generation: u32,
    pub n_allocations: u64,
    pub total_bytes: u64,
    /// Lowest live address of the group, as a stable representative.
    pub representative_address: u64,
}

struct LiveAllocation {
    key: LocationKey,
    size: u64,
}

/// Tracks the set of live allocations while events stream through and
/// yields per-location records for any chosen point of the stream (the
/// high-water mark index, or the end of stream for leaks).
#[derive(Default)]
pub struct SnapshotAggregator {
    live: FxHashMap<u64, LiveAllocation>,
}

impl SnapshotAggregator {
    pub fn process(&mut self, event: &AllocationEvent) {
        if event.kind.is_deallocator() {
            self.live.remove(&event.address);
            return;
        }
        self.live.insert(
            event.address,
            LiveAllocation {
                key: LocationKey::of(event),
                size: event.size,
            },
        );
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.live.values().map(|l| l.size).sum()
    }

    /// The current snapshot, one record per location. With
    /// `merge_threads` the thread id is dropped from the grouping key.
    pub fn records(&self, merge_threads: bool) -> Vec<AllocationRecord> {
        let mut grouped: FxHashMap<LocationKey, AllocationRecord> = FxHashMap::default();
        for (&address, live) in &self.live {
            let mut key = live.key;
            if merge_threads {
                key.tid = 0;
            }
            grouped
                .entry(key)
                .and_modify(|record| {
                    record.n_allocations += 1;
                    record.total_bytes += live.size;
                    record.representative_address = record.representative_address.min(address);
                })
                .or_insert(AllocationRecord {
                    tid: (!merge_threads).then_some(live.key.tid),
                    kind: key.kind,
                    stack_id: key.stack_id,
                    native_frame_index: key.native_frame_index,
                    native_segment_generation: key.native_segment_generation,
                    n_allocations: 1,
                    total_bytes: live.size,
                    representative_address: address,
                });
        }
        let mut records: Vec<AllocationRecord> = grouped.into_values().collect();
        records.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then(a.representative_address.cmp(&b.representative_address))
        });
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        index: u64,
        tid: u64,
        kind: AllocatorKind,
        address: u64,
        size: u64,
        stack_id: u32,
    ) -> AllocationEvent {
        AllocationEvent {
            index,
            tid,
            kind,
            address,
            size,
            stack_id,
            native_frame_index: 0,
            native_segment_generation: 0,
        }
    }

    #[test]
    fn test_snapshot_groups_by_location() {
        let mut agg = SnapshotAggregator::default();
        agg.process(&event(0, 1, AllocatorKind::Malloc, 0x100, 10, 7));
        agg.process(&event(1, 1, AllocatorKind::Malloc, 0x200, 30, 7));
        agg.process(&event(2, 1, AllocatorKind::Malloc, 0x300, 5, 8));
        let records = agg.records(false);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stack_id, 7);
        assert_eq!(records[0].n_allocations, 2);
        assert_eq!(records[0].total_bytes, 40);
        assert_eq!(records[0].representative_address, 0x100);
        assert_eq!(records[1].total_bytes, 5);
    }

    #[test]
    fn test_free_removes_from_snapshot() {
        let mut agg = SnapshotAggregator::default();
        agg.process(&event(0, 1, AllocatorKind::Malloc, 0x100, 10, 7));
        agg.process(&event(1, 1, AllocatorKind::Free, 0x100, 0, 0));
        assert_eq!(agg.live_allocations(), 0);
        assert!(agg.records(false).is_empty());
    }

    #[test]
    fn test_merge_threads_drops_tid() {
        let mut agg = SnapshotAggregator::default();
        agg.process(&event(0, 1, AllocatorKind::Malloc, 0x100, 10, 7));
        agg.process(&event(1, 2, AllocatorKind::Malloc, 0x200, 10, 7));
        let split = agg.records(false);
        assert_eq!(split.len(), 2);
        let merged = agg.records(true);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].tid, None);
        assert_eq!(merged[0].n_allocations, 2);
        assert_eq!(merged[0].total_bytes, 20);
    }

    #[test]
    fn test_unseen_free_is_skipped() {
        let mut agg = SnapshotAggregator::default();
        agg.process(&event(0, 1, AllocatorKind::Munmap, 0xBAD, 0, 0));
        assert!(agg.records(false).is_empty());
    }
}
