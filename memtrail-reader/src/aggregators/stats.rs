// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregators::LocationKey;
use crate::reader::AllocationEvent;
use memtrail_format::AllocatorKind;
use rustc_hash::FxHashMap;

/// Power-of-two size buckets; the last bucket absorbs everything from
/// 2^62 up.
pub const SIZE_BUCKETS: usize = 63;

/// Whole-capture allocation statistics: totals, size distribution,
/// allocator mix and the heaviest locations. Counts every allocation the
/// stream carries, whether or not it is ever freed.
pub struct StatsAggregator {
    n_allocations: u64,
    total_bytes: u64,
    min_size: Option<u64>,
    max_size: u64,
    size_histogram: [u64; SIZE_BUCKETS],
    allocator_counts: FxHashMap<AllocatorKind, u64>,
    by_location: FxHashMap<LocationKey, (u64, u64)>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self {
            n_allocations: 0,
            total_bytes: 0,
            min_size: None,
            max_size: 0,
            size_histogram: [0; SIZE_BUCKETS],
            allocator_counts: FxHashMap::default(),
            by_location: FxHashMap::default(),
        }
    }
}

impl StatsAggregator {
    pub fn process(&mut self, event: &AllocationEvent) {
        if event.kind.is_deallocator() {
            return;
        }
        self.n_allocations += 1;
        self.total_bytes += event.size;
        self.min_size = Some(self.min_size.map_or(event.size, |m| m.min(event.size)));
        self.max_size = self.max_size.max(event.size);
        self.size_histogram[size_bucket(event.size)] += 1;
        *self.allocator_counts.entry(event.kind).or_insert(0) += 1;
        let entry = self.by_location.entry(LocationKey::of(event)).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += event.size;
    }

    pub fn n_allocations(&self) -> u64 {
        self.n_allocations
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn min_size(&self) -> u64 {
        self.min_size.unwrap_or(0)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Allocation counts per power-of-two size bucket.
    pub fn size_histogram(&self) -> &[u64; SIZE_BUCKETS] {
        &self.size_histogram
    }

    pub fn allocator_counts(&self) -> &FxHashMap<AllocatorKind, u64> {
        &self.allocator_counts
    }

    /// The `n` locations that allocated the most bytes, descending.
    pub fn top_locations_by_size(&self, n: usize) -> Vec<(LocationKey, u64)> {
        let mut locations: Vec<(LocationKey, u64)> = self
            .by_location
            .iter()
            .map(|(&key, &(_, bytes))| (key, bytes))
            .collect();
        locations.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.stack_id.cmp(&b.0.stack_id)));
        locations.truncate(n);
        locations
    }

    /// The `n` locations with the most allocations, descending.
    pub fn top_locations_by_count(&self, n: usize) -> Vec<(LocationKey, u64)> {
        let mut locations: Vec<(LocationKey, u64)> = self
            .by_location
            .iter()
            .map(|(&key, &(count, _))| (key, count))
            .collect();
        locations.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.stack_id.cmp(&b.0.stack_id)));
        locations.truncate(n);
        locations
    }
}

fn size_bucket(size: u64) -> usize {
    match size {
        0 => 0,
        _ => ((63 - size.leading_zeros()) as usize).min(SIZE_BUCKETS - 1),
    }
}
