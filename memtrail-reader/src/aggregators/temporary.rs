// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::reader::AllocationEvent;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Detects temporary allocations: an allocation whose deallocation
/// happens within a bounded number of intervening allocations on the same
/// thread. Each thread keeps a FIFO of its most recent allocations; a
/// deallocation that still finds its allocation in the window reports it.
pub struct TemporaryAllocationDetector {
    /// Maximum allocations allowed between an allocation and its free.
    max_interleaved: usize,
    threads: FxHashMap<u64, VecDeque<AllocationEvent>>,
    temporaries: Vec<AllocationEvent>,
}

pub const DEFAULT_MAX_INTERLEAVED: usize = 1;

impl Default for TemporaryAllocationDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTERLEAVED)
    }
}

impl TemporaryAllocationDetector {
    pub fn new(max_interleaved: usize) -> Self {
        TemporaryAllocationDetector {
            max_interleaved,
            threads: FxHashMap::default(),
            temporaries: Vec::new(),
        }
    }

    pub fn process(&mut self, event: &AllocationEvent) {
        let window = self.threads.entry(event.tid).or_default();
        if event.kind.is_deallocator() {
            if let Some(at) = window.iter().position(|a| a.address == event.address) {
                let allocation = window.remove(at);
                // Position found implies Some; remove cannot miss.
                if let Some(allocation) = allocation {
                    self.temporaries.push(allocation);
                }
            }
            return;
        }
        window.push_back(*event);
        // One slot more than the bound: the allocation itself plus up to
        // `max_interleaved` newer ones may coexist in the window.
        while window.len() > self.max_interleaved + 1 {
            window.pop_front();
        }
    }

    /// Allocation events that turned out to be temporary, in stream
    /// order.
    pub fn temporaries(&self) -> &[AllocationEvent] {
        &self.temporaries
    }

    pub fn temporary_bytes(&self) -> u64 {
        self.temporaries.iter().map(|a| a.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrail_format::AllocatorKind;

    fn alloc(index: u64, tid: u64, address: u64, size: u64) -> AllocationEvent {
        AllocationEvent {
            index,
            tid,
            kind: AllocatorKind::Malloc,
            address,
            size,
            stack_id: 0,
            native_frame_index: 0,
            native_segment_generation: 0,
        }
    }

    fn free(index: u64, tid: u64, address: u64) -> AllocationEvent {
        AllocationEvent {
            index,
            tid,
            kind: AllocatorKind::Free,
            address,
            size: 0,
            stack_id: 0,
            native_frame_index: 0,
            native_segment_generation: 0,
        }
    }

    #[test]
    fn test_immediate_free_is_temporary() {
        let mut detector = TemporaryAllocationDetector::default();
        detector.process(&alloc(0, 1, 0x100, 64));
        detector.process(&free(1, 1, 0x100));
        assert_eq!(detector.temporaries().len(), 1);
        assert_eq!(detector.temporary_bytes(), 64);
    }

    #[test]
    fn test_one_interleaved_allocation_still_temporary() {
        let mut detector = TemporaryAllocationDetector::default();
        detector.process(&alloc(0, 1, 0x100, 64));
        detector.process(&alloc(1, 1, 0x200, 8));
        detector.process(&free(2, 1, 0x100));
        assert_eq!(detector.temporaries().len(), 1);
    }

    #[test]
    fn test_exceeding_bound_is_not_temporary() {
        let mut detector = TemporaryAllocationDetector::default();
        detector.process(&alloc(0, 1, 0x100, 64));
        detector.process(&alloc(1, 1, 0x200, 8));
        detector.process(&alloc(2, 1, 0x300, 8));
        detector.process(&free(3, 1, 0x100));
        assert!(detector.temporaries().is_empty());
    }

    #[test]
    fn test_windows_are_per_thread() {
        let mut detector = TemporaryAllocationDetector::default();
        detector.process(&alloc(0, 1, 0x100, 64));
        // Other threads' churn does not push thread 1's window.
        for i in 0..10 {
            detector.process(&alloc(1 + i, 2, 0x1000 + i, 8));
        }
        detector.process(&free(11, 1, 0x100));
        assert_eq!(detector.temporaries().len(), 1);
    }

    #[test]
    fn test_larger_bound() {
        let mut detector = TemporaryAllocationDetector::new(3);
        detector.process(&alloc(0, 1, 0x100, 64));
        detector.process(&alloc(1, 1, 0x200, 8));
        detector.process(&alloc(2, 1, 0x300, 8));
        detector.process(&alloc(3, 1, 0x400, 8));
        detector.process(&free(4, 1, 0x100));
        assert_eq!(detector.temporaries().len(), 1);
    }
}
