// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The typed record model of the capture stream. One type per wire record;
//! the encode/decode halves live in [`crate::writer`] and [`crate::parser`]
//! and must stay bit-exact with each other.

/// Every allocator entry point the hook layer intercepts.
///
/// The discriminant is the wire value and doubles as the flag nibble of an
/// allocation token byte, so it must fit in four bits and zero stays
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocatorKind {
    Malloc = 1,
    Calloc = 2,
    Realloc = 3,
    Free = 4,
    PosixMemalign = 5,
    AlignedAlloc = 6,
    Memalign = 7,
    Valloc = 8,
    Pvalloc = 9,
    Mmap = 10,
    Munmap = 11,
    PoolMalloc = 12,
    PoolCalloc = 13,
    PoolRealloc = 14,
    PoolFree = 15,
}

impl AllocatorKind {
    /// True for the entry points that release memory. Deallocation records
    /// carry no size and no stack.
    #[inline]
    pub fn is_deallocator(self) -> bool {
        matches!(
            self,
            AllocatorKind::Free | AllocatorKind::Munmap | AllocatorKind::PoolFree
        )
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => AllocatorKind::Malloc,
            2 => AllocatorKind::Calloc,
            3 => AllocatorKind::Realloc,
            4 => AllocatorKind::Free,
            5 => AllocatorKind::PosixMemalign,
            6 => AllocatorKind::AlignedAlloc,
            7 => AllocatorKind::Memalign,
            8 => AllocatorKind::Valloc,
            9 => AllocatorKind::Pvalloc,
            10 => AllocatorKind::Mmap,
            11 => AllocatorKind::Munmap,
            12 => AllocatorKind::PoolMalloc,
            13 => AllocatorKind::PoolCalloc,
            14 => AllocatorKind::PoolRealloc,
            15 => AllocatorKind::PoolFree,
            _ => return None,
        })
    }
}

/// Record kinds, i.e. the upper nibble of every token byte in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Allocation = 1,
    NativeAllocation = 2,
    FramePush = 3,
    FramePop = 4,
    CodeObject = 5,
    NativeFrame = 6,
    SegmentsStart = 7,
    ImageSegments = 8,
    MemoryRecord = 9,
    ContextSwitch = 10,
    ThreadName = 11,
    AggregatedAllocation = 12,
    PythonStackIndex = 13,
    Trailer = 14,
}

impl RecordKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => RecordKind::Allocation,
            2 => RecordKind::NativeAllocation,
            3 => RecordKind::FramePush,
            4 => RecordKind::FramePop,
            5 => RecordKind::CodeObject,
            6 => RecordKind::NativeFrame,
            7 => RecordKind::SegmentsStart,
            8 => RecordKind::ImageSegments,
            9 => RecordKind::MemoryRecord,
            10 => RecordKind::ContextSwitch,
            11 => RecordKind::ThreadName,
            12 => RecordKind::AggregatedAllocation,
            13 => RecordKind::PythonStackIndex,
            14 => RecordKind::Trailer,
            _ => return None,
        })
    }
}

/// A frame-push event for the interpreted shadow stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramePush {
    pub code_id: u64,
    pub offset: u32,
    /// Set when this push is the first logical frame of a fresh native
    /// invocation of the host's evaluation loop.
    pub is_entry: bool,
}

/// One entry of a code object's bytecode-offset-to-line mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub offset: u32,
    pub line: u32,
}

/// Monotonic (by offset) mapping from bytecode offset to source line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineTable {
    entries: Vec<LineTableEntry>,
}

impl LineTable {
    /// Entries must already be sorted by offset; out-of-order input is a
    /// caller bug and trips a debug assertion.
    pub fn new(entries: Vec<LineTableEntry>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].offset <= w[1].offset));
        Self { entries }
    }

    pub fn entries(&self) -> &[LineTableEntry] {
        &self.entries
    }

    /// The source line attributed to `offset`: the last entry at or below
    /// it. Several entries may share an offset; the last one wins, matching
    /// the host interpreter's attribution of the innermost range.
    pub fn line_for(&self, offset: u32) -> Option<u32> {
        let idx = self.entries.partition_point(|e| e.offset <= offset);
        idx.checked_sub(1).map(|i| self.entries[i].line)
    }
}

/// Frozen descriptor of a callable in the host interpreter, captured once
/// per capture the first time a frame referencing it is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeObject {
    pub id: u64,
    pub function_name: Box<str>,
    pub filename: Box<str>,
    pub first_line: u32,
    pub line_table: LineTable,
}

/// One loaded image and its mapped segments, captured at tracking start and
/// again on every image-load event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegments {
    pub path: Box<str>,
    pub base: u64,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub size: u64,
}

impl ImageSegments {
    /// Whether `ip` falls inside one of this image's mapped segments.
    pub fn contains(&self, ip: u64) -> bool {
        self.segments
            .iter()
            .any(|s| ip >= s.vaddr && ip - s.vaddr < s.size)
    }
}

/// A periodic resident-set-size sample. Used for overview plots only; the
/// aggregators never consult it for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRecord {
    pub ms_since_epoch: u64,
    pub rss_bytes: u64,
}

/// Per-location counters, the only per-allocation payload that survives in
/// an aggregated capture. Emitted once per distinct key at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedAllocation {
    pub tid: u64,
    pub kind: AllocatorKind,
    pub python_stack_id: u32,
    pub native_frame_index: u32,
    pub n_allocations_in_high_water_mark: u64,
    pub bytes_in_high_water_mark: u64,
    pub n_allocations_leaked: u64,
    pub bytes_leaked: u64,
}

/// Interned interpreted-stack node for the aggregated format, where frame
/// push/pop replay is unavailable and whole stacks are keyed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonStackIndex {
    pub id: u32,
    pub parent: u32,
    pub code_id: u64,
    pub offset: u32,
    pub is_entry: bool,
}

/// Final counters carried by the trailer. Sinks that cannot seek (the
/// live protocol) never rewrite their header, so the trailer is the only
/// place their final stats exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrailerStats {
    pub end_time_ms: u64,
    pub n_allocations: u64,
    pub n_frames: u64,
}

/// A raw record as it appears on the wire, before any reader-side state
/// (thread attribution, address deltas, frame replay) is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Allocation {
        kind: AllocatorKind,
        /// Zigzag delta against the previous allocation address on the
        /// same thread.
        address_delta: i64,
        /// Present for allocators, absent for deallocators.
        size: Option<u64>,
        /// Present only for `RecordKind::NativeAllocation`.
        native_frame_index: Option<u32>,
    },
    FramePush(FramePush),
    FramePop {
        count: u32,
    },
    CodeObject(CodeObject),
    NativeFrame {
        ip: u64,
        parent: u32,
    },
    SegmentsStart {
        image_count: u64,
    },
    ImageSegments(ImageSegments),
    MemoryRecord(MemoryRecord),
    ContextSwitch {
        tid: u64,
    },
    ThreadName(Box<str>),
    AggregatedAllocation(AggregatedAllocation),
    PythonStackIndex(PythonStackIndex),
    Trailer(TrailerStats),
}
