// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::reader::AllocationEvent;
use rustc_hash::FxHashMap;

/// Finds the allocation event at which the running total of live bytes
/// was maximal. Ties go to the earliest occurrence.
#[derive(Default)]
pub struct HighWaterMarkFinder {
    live: FxHashMap<u64, u64>,
    current_bytes: u64,
    peak_bytes: u64,
    peak_index: u64,
}

impl HighWaterMarkFinder {
    pub fn process(&mut self, event: &AllocationEvent) {
        if event.kind.is_deallocator() {
            // Only previously seen allocations decrement; spurious frees
            // are skipped.
            if let Some(size) = self.live.remove(&event.address) {
                self.current_bytes -= size;
            }
            return;
        }
        // An address reused without an observed free (e.g. realloc noticed
        // in place) replaces its old accounting.
        if let Some(old) = self.live.insert(event.address, event.size) {
            self.current_bytes -= old;
        }
        self.current_bytes += event.size;
        if self.current_bytes > self.peak_bytes {
            self.peak_bytes = self.current_bytes;
            self.peak_index = event.index;
        }
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    /// Index of the event where the peak was first reached. Zero for an
    /// empty capture.
    pub fn peak_index(&self) -> u64 {
        self.peak_index
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }
}
