// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The sequential capture decoder. `next_event` folds bookkeeping records
//! (context switches, frame pushes/pops, code objects, native frames,
//! image tables, thread names) into reader state and surfaces only the
//! events aggregators care about. At any point of the stream the reader
//! can answer "what was thread T's interpreted stack" because it replays
//! exactly the records the writer emitted before each allocation.

use crate::stacks::{FrameKey, StackInterner};
use crate::symbols::{ResolvedNativeFrame, SymbolResolver};
use memtrail_format::{
    AggregatedAllocation, AllocatorKind, CaptureHeader, CodeObject, FileFormat, FileSource,
    ImageSegments, MemoryRecord, ParseError, RawRecord, RecordParser, Source, TrailerStats,
};
use rustc_hash::FxHashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] memtrail_format::SourceError),
    #[error("aggregated capture is incomplete; the process was killed before writing its statistics")]
    IncompleteAggregatedCapture,
    #[error("record references an unknown {what}")]
    UnknownReference { what: &'static str },
}

/// One allocation or deallocation event, with reader-resolved address and
/// stack attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEvent {
    /// Ordinal of this event among the capture's allocation events.
    pub index: u64,
    pub tid: u64,
    pub kind: AllocatorKind,
    pub address: u64,
    /// Zero for deallocators.
    pub size: u64,
    /// Interned interpreted-stack id at the event; 0 is the empty stack.
    pub stack_id: u32,
    /// Leaf of the native-frame tree; 0 when native traces are off.
    pub native_frame_index: u32,
    pub native_segment_generation: u32,
}

/// An interpreted frame resolved for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonFrame {
    pub function_name: Box<str>,
    pub filename: Box<str>,
    pub line: u32,
    pub is_entry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Allocation(AllocationEvent),
    AggregatedAllocation(AggregatedAllocation),
    MemoryRecord(MemoryRecord),
    /// Clean end of the stream.
    Eof,
    /// The stream ended mid-record; everything before is valid.
    Truncated { records: u64 },
}

#[derive(Default)]
struct NativeGeneration {
    /// (ip, parent) per node; index 0 is the empty root, nodes from 1.
    nodes: Vec<(u64, u32)>,
    images: Vec<ImageSegments>,
}

pub struct CaptureReader<S: Source> {
    parser: RecordParser<S>,
    header: CaptureHeader,
    current_tid: u64,
    last_address: FxHashMap<u64, u64>,
    code_objects: FxHashMap<u64, CodeObject>,
    thread_names: FxHashMap<u64, Box<str>>,
    stacks: StackInterner,
    thread_stack: FxHashMap<u64, u32>,
    /// Aggregated-format python stack nodes, id -> (parent, frame).
    python_index: Vec<(u32, FrameKey)>,
    generations: Vec<NativeGeneration>,
    allocation_index: u64,
    trailer_stats: Option<TrailerStats>,
    saw_trailer: bool,
    finished: bool,
}

impl CaptureReader<FileSource> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReaderError> {
        Self::from_source(FileSource::open(path)?)
    }
}

impl<S: Source> CaptureReader<S> {
    pub fn from_source(source: S) -> Result<Self, ReaderError> {
        let mut parser = RecordParser::new(source);
        let header = parser.read_header()?;
        Ok(CaptureReader {
            parser,
            header,
            current_tid: 0,
            last_address: FxHashMap::default(),
            code_objects: FxHashMap::default(),
            thread_names: FxHashMap::default(),
            stacks: StackInterner::default(),
            thread_stack: FxHashMap::default(),
            python_index: Vec::new(),
            generations: Vec::new(),
            allocation_index: 0,
            trailer_stats: None,
            saw_trailer: false,
            finished: false,
        })
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// Whether the capture terminated with its trailer record.
    pub fn is_complete(&self) -> bool {
        self.saw_trailer
    }

    /// Final counters from the trailer. For live streams, whose header is
    /// never rewritten, this is the only place they exist.
    pub fn trailer_stats(&self) -> Option<TrailerStats> {
        self.trailer_stats
    }

    pub fn records_decoded(&self) -> u64 {
        self.parser.records_decoded()
    }

    fn current_generation(&self) -> u32 {
        self.generations.len() as u32
    }

    fn generation_mut(&mut self) -> &mut NativeGeneration {
        if self.generations.is_empty() {
            // Native frames without a preceding segments record: a
            // tracker without image capture; give them generation 1.
            self.generations.push(NativeGeneration::default());
        }
        // Unwrap-free: just ensured non-empty.
        let last = self.generations.len() - 1;
        &mut self.generations[last]
    }

    /// Decodes until the next reportable event.
    pub fn next_event(&mut self) -> Result<Event, ReaderError> {
        if self.finished {
            return Ok(Event::Eof);
        }
        loop {
            let record = match self.parser.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.finished = true;
                    if self.header.file_format == FileFormat::AggregatedRecords
                        && !self.saw_trailer
                    {
                        return Err(ReaderError::IncompleteAggregatedCapture);
                    }
                    return Ok(Event::Eof);
                }
                Err(ParseError::Truncated { records }) => {
                    self.finished = true;
                    if self.header.file_format == FileFormat::AggregatedRecords {
                        return Err(ReaderError::IncompleteAggregatedCapture);
                    }
                    return Ok(Event::Truncated { records });
                }
                Err(e) => return Err(e.into()),
            };
            match record {
                RawRecord::ContextSwitch { tid } => self.current_tid = tid,
                RawRecord::FramePush(push) => {
                    let parent = self
                        .thread_stack
                        .get(&self.current_tid)
                        .copied()
                        .unwrap_or(0);
                    let id = self.stacks.push(
                        parent,
                        FrameKey {
                            code_id: push.code_id,
                            offset: push.offset,
                            is_entry: push.is_entry,
                        },
                    );
                    self.thread_stack.insert(self.current_tid, id);
                }
                RawRecord::FramePop { count } => {
                    let mut id = self
                        .thread_stack
                        .get(&self.current_tid)
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..count {
                        id = self.stacks.parent(id);
                    }
                    self.thread_stack.insert(self.current_tid, id);
                }
                RawRecord::CodeObject(code) => {
                    self.code_objects.insert(code.id, code);
                }
                RawRecord::NativeFrame { ip, parent } => {
                    self.generation_mut().nodes.push((ip, parent));
                }
                RawRecord::SegmentsStart { .. } => {
                    self.generations.push(NativeGeneration::default());
                }
                RawRecord::ImageSegments(image) => {
                    self.generation_mut().images.push(image);
                }
                RawRecord::ThreadName(name) => {
                    self.thread_names.insert(self.current_tid, name);
                }
                RawRecord::MemoryRecord(record) => return Ok(Event::MemoryRecord(record)),
                RawRecord::PythonStackIndex(node) => {
                    // Ids are assigned densely by the writer in emission
                    // order, starting at 1.
                    if node.id as usize != self.python_index.len() + 1 {
                        return Err(ReaderError::UnknownReference {
                            what: "python stack index",
                        });
                    }
                    self.python_index.push((
                        node.parent,
                        FrameKey {
                            code_id: node.code_id,
                            offset: node.offset,
                            is_entry: node.is_entry,
                        },
                    ));
                }
                RawRecord::AggregatedAllocation(agg) => {
                    return Ok(Event::AggregatedAllocation(agg))
                }
                RawRecord::Trailer(stats) => {
                    self.saw_trailer = true;
                    self.trailer_stats = Some(stats);
                }
                RawRecord::Allocation {
                    kind,
                    address_delta,
                    size,
                    native_frame_index,
                } => {
                    let last = self.last_address.entry(self.current_tid).or_insert(0);
                    let address = last.wrapping_add(address_delta as u64);
                    *last = address;
                    let index = self.allocation_index;
                    self.allocation_index += 1;
                    return Ok(Event::Allocation(AllocationEvent {
                        index,
                        tid: self.current_tid,
                        kind,
                        address,
                        size: size.unwrap_or(0),
                        stack_id: self
                            .thread_stack
                            .get(&self.current_tid)
                            .copied()
                            .unwrap_or(0),
                        native_frame_index: native_frame_index.unwrap_or(0),
                        native_segment_generation: self.current_generation(),
                    }));
                }
            }
        }
    }

    /// The interpreted stack behind `stack_id`, outermost frame first.
    /// Works for both stream formats.
    pub fn python_stack(&self, stack_id: u32) -> Vec<PythonFrame> {
        let keys = if self.header.file_format == FileFormat::AggregatedRecords {
            let mut keys = Vec::new();
            let mut id = stack_id;
            while id != 0 {
                let Some(&(parent, frame)) = self.python_index.get(id as usize - 1) else {
                    break;
                };
                keys.push(frame);
                id = parent;
            }
            keys.reverse();
            keys
        } else {
            self.stacks.frames(stack_id)
        };
        keys.iter().map(|key| self.resolve_frame(key)).collect()
    }

    fn resolve_frame(&self, key: &FrameKey) -> PythonFrame {
        match self.code_objects.get(&key.code_id) {
            Some(code) => PythonFrame {
                function_name: code.function_name.clone(),
                filename: code.filename.clone(),
                line: code
                    .line_table
                    .line_for(key.offset)
                    .unwrap_or(code.first_line),
                is_entry: key.is_entry,
            },
            None => PythonFrame {
                function_name: "<unknown>".into(),
                filename: "<unknown>".into(),
                line: 0,
                is_entry: key.is_entry,
            },
        }
    }

    /// Raw instruction pointers of a native stack, innermost first.
    pub fn native_ips(&self, index: u32, generation: u32) -> Vec<u64> {
        let Some(gen) = generation
            .checked_sub(1)
            .and_then(|g| self.generations.get(g as usize))
        else {
            return Vec::new();
        };
        let mut ips = Vec::new();
        let mut current = index;
        while current != 0 {
            let Some(&(ip, parent)) = gen.nodes.get(current as usize - 1) else {
                break;
            };
            ips.push(ip);
            current = parent;
        }
        ips
    }

    /// Symbolized native stack, innermost first, resolved lazily against
    /// the generation's image table. The caller owns the resolver (and
    /// with it the symbol cache), so symbolization stays off this type
    /// and off the live drain thread.
    pub fn native_stack(
        &self,
        resolver: &mut SymbolResolver,
        index: u32,
        generation: u32,
    ) -> Vec<ResolvedNativeFrame> {
        let ips = self.native_ips(index, generation);
        if ips.is_empty() {
            return Vec::new();
        }
        let images = generation
            .checked_sub(1)
            .and_then(|g| self.generations.get(g as usize))
            .map(|gen| gen.images.as_slice())
            .unwrap_or(&[]);
        ips.into_iter()
            .map(|ip| resolver.resolve(ip, generation, images))
            .collect()
    }

    /// Image table of a segment generation.
    pub fn images(&self, generation: u32) -> &[ImageSegments] {
        generation
            .checked_sub(1)
            .and_then(|g| self.generations.get(g as usize))
            .map(|gen| gen.images.as_slice())
            .unwrap_or(&[])
    }

    pub fn thread_name(&self, tid: u64) -> Option<&str> {
        self.thread_names.get(&tid).map(|name| &**name)
    }

    pub fn code_object(&self, id: u64) -> Option<&CodeObject> {
        self.code_objects.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrail_format::{
        CaptureHeader, FramePush, HeaderStats, LineTable, LineTableEntry, PoolAllocatorId,
        RecordWriter, SliceSource, VecSink,
    };

    fn header(format: FileFormat) -> CaptureHeader {
        CaptureHeader {
            file_format: format,
            native_traces: false,
            trace_pool_allocator: false,
            pool_allocator: PoolAllocatorId::SystemMalloc,
            pid: 1,
            main_tid: 10,
            skipped_frames_on_main_thread: 0,
            stats: HeaderStats::default(),
            command_line: "test".to_string(),
        }
    }

    fn code(id: u64, name: &str, lines: &[(u32, u32)]) -> CodeObject {
        CodeObject {
            id,
            function_name: name.into(),
            filename: "app.py".into(),
            first_line: lines.first().map(|l| l.1).unwrap_or(1),
            line_table: LineTable::new(
                lines
                    .iter()
                    .map(|&(offset, line)| LineTableEntry { offset, line })
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_stack_replay_matches_pushes_and_pops() {
        let mut w = RecordWriter::new(VecSink::new(), header(FileFormat::AllRecords)).unwrap();
        w.write_code_object(&code(1, "outer", &[(0, 10)])).unwrap();
        w.write_code_object(&code(2, "inner", &[(0, 20), (4, 21)]))
            .unwrap();
        w.write_frame_push(10, FramePush { code_id: 1, offset: 0, is_entry: true })
            .unwrap();
        w.write_frame_push(10, FramePush { code_id: 2, offset: 4, is_entry: false })
            .unwrap();
        w.write_allocation(10, AllocatorKind::Malloc, 0x100, 32, None)
            .unwrap();
        w.write_frame_pop(10, 1).unwrap();
        w.write_allocation(10, AllocatorKind::Malloc, 0x200, 32, None)
            .unwrap();
        w.write_trailer(0).unwrap();
        let bytes = w.into_sink().into_bytes();

        let mut reader = CaptureReader::from_source(SliceSource::new(&bytes)).unwrap();
        let Event::Allocation(first) = reader.next_event().unwrap() else {
            panic!("expected allocation");
        };
        let stack = reader.python_stack(first.stack_id);
        assert_eq!(stack.len(), 2);
        assert_eq!(&*stack[0].function_name, "outer");
        assert!(stack[0].is_entry);
        assert_eq!(&*stack[1].function_name, "inner");
        assert_eq!(stack[1].line, 21);

        let Event::Allocation(second) = reader.next_event().unwrap() else {
            panic!("expected allocation");
        };
        let stack = reader.python_stack(second.stack_id);
        assert_eq!(stack.len(), 1);
        assert_eq!(&*stack[0].function_name, "outer");

        assert_eq!(reader.next_event().unwrap(), Event::Eof);
        assert!(reader.is_complete());
    }

    #[test]
    fn test_address_deltas_resolve_per_thread() {
        let mut w = RecordWriter::new(VecSink::new(), header(FileFormat::AllRecords)).unwrap();
        w.write_allocation(1, AllocatorKind::Malloc, 0x1000, 8, None)
            .unwrap();
        w.write_allocation(2, AllocatorKind::Malloc, 0x8000, 8, None)
            .unwrap();
        w.write_allocation(1, AllocatorKind::Malloc, 0x1010, 8, None)
            .unwrap();
        w.write_allocation(2, AllocatorKind::Free, 0x8000, 0, None)
            .unwrap();
        let bytes = w.into_sink().into_bytes();

        let mut reader = CaptureReader::from_source(SliceSource::new(&bytes)).unwrap();
        let mut seen = Vec::new();
        loop {
            match reader.next_event().unwrap() {
                Event::Allocation(a) => seen.push((a.tid, a.address, a.kind)),
                Event::Eof | Event::Truncated { .. } => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                (1, 0x1000, AllocatorKind::Malloc),
                (2, 0x8000, AllocatorKind::Malloc),
                (1, 0x1010, AllocatorKind::Malloc),
                (2, 0x8000, AllocatorKind::Free),
            ]
        );
    }

    #[test]
    fn test_native_tree_reconstruction() {
        let mut w = RecordWriter::new(VecSink::new(), header(FileFormat::AllRecords)).unwrap();
        w.write_segments_start(0).unwrap();
        w.write_native_frame(0xAAA, 0).unwrap(); // id 1
        w.write_native_frame(0xBBB, 1).unwrap(); // id 2
        w.write_allocation(1, AllocatorKind::Malloc, 0x100, 8, Some(2))
            .unwrap();
        let bytes = w.into_sink().into_bytes();

        let mut reader = CaptureReader::from_source(SliceSource::new(&bytes)).unwrap();
        let Event::Allocation(alloc) = reader.next_event().unwrap() else {
            panic!("expected allocation");
        };
        assert_eq!(alloc.native_segment_generation, 1);
        // Innermost first: leaf 0xBBB then its parent 0xAAA.
        assert_eq!(
            reader.native_ips(alloc.native_frame_index, alloc.native_segment_generation),
            vec![0xBBB, 0xAAA]
        );
    }

    #[test]
    fn test_truncated_stream_is_recoverable() {
        let mut w = RecordWriter::new(VecSink::new(), header(FileFormat::AllRecords)).unwrap();
        w.write_allocation(1, AllocatorKind::Malloc, 0x1000, 8, None)
            .unwrap();
        w.write_allocation(1, AllocatorKind::Malloc, 0x2000, 8, None)
            .unwrap();
        let bytes = w.into_sink().into_bytes();
        let mut reader =
            CaptureReader::from_source(SliceSource::new(&bytes[..bytes.len() - 1])).unwrap();
        assert!(matches!(reader.next_event().unwrap(), Event::Allocation(_)));
        assert!(matches!(
            reader.next_event().unwrap(),
            Event::Truncated { .. }
        ));
        // The reader stays terminal after the truncation.
        assert_eq!(reader.next_event().unwrap(), Event::Eof);
    }

    #[test]
    fn test_incomplete_aggregated_capture_is_an_error() {
        let mut w =
            RecordWriter::new(VecSink::new(), header(FileFormat::AggregatedRecords)).unwrap();
        w.write_aggregated_allocation(&AggregatedAllocation {
            tid: 1,
            kind: AllocatorKind::Malloc,
            python_stack_id: 0,
            native_frame_index: 0,
            n_allocations_in_high_water_mark: 1,
            bytes_in_high_water_mark: 100,
            n_allocations_leaked: 0,
            bytes_leaked: 0,
        })
        .unwrap();
        // No trailer: the process was SIGKILLed mid-capture.
        let bytes = w.into_sink().into_bytes();
        let mut reader = CaptureReader::from_source(SliceSource::new(&bytes)).unwrap();
        assert!(matches!(
            reader.next_event().unwrap(),
            Event::AggregatedAllocation(_)
        ));
        assert!(matches!(
            reader.next_event(),
            Err(ReaderError::IncompleteAggregatedCapture)
        ));
    }

    #[test]
    fn test_aggregated_python_stack_lookup() {
        let mut w =
            RecordWriter::new(VecSink::new(), header(FileFormat::AggregatedRecords)).unwrap();
        w.write_code_object(&code(5, "entry", &[(0, 3)])).unwrap();
        w.write_python_stack_index(memtrail_format::PythonStackIndex {
            id: 1,
            parent: 0,
            code_id: 5,
            offset: 0,
            is_entry: true,
        })
        .unwrap();
        w.write_trailer(0).unwrap();
        let bytes = w.into_sink().into_bytes();
        let mut reader = CaptureReader::from_source(SliceSource::new(&bytes)).unwrap();
        assert_eq!(reader.next_event().unwrap(), Event::Eof);
        let stack = reader.python_stack(1);
        assert_eq!(stack.len(), 1);
        assert_eq!(&*stack[0].function_name, "entry");
        assert_eq!(stack[0].line, 3);
    }

    #[test]
    fn test_thread_names() {
        let mut w = RecordWriter::new(VecSink::new(), header(FileFormat::AllRecords)).unwrap();
        w.write_thread_name(42, "worker").unwrap();
        w.write_trailer(0).unwrap();
        let bytes = w.into_sink().into_bytes();
        let mut reader = CaptureReader::from_source(SliceSource::new(&bytes)).unwrap();
        assert_eq!(reader.next_event().unwrap(), Event::Eof);
        assert_eq!(reader.thread_name(42), Some("worker"));
        assert_eq!(reader.thread_name(1), None);
    }
}
