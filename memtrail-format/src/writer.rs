// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The stateful record encoder. Each record is assembled in a scratch
//! buffer and handed to the sink in a single write so records never
//! interleave partially, which is what allows multiple threads to share
//! one writer behind a short-held mutex.
//!
//! A failed write permanently disables the writer: the capture is already
//! unusable, and the tracked process must keep running, so every later
//! record quietly becomes a no-op.

use crate::header::CaptureHeader;
use crate::records::{
    AggregatedAllocation, AllocatorKind, CodeObject, FramePush, ImageSegments, MemoryRecord,
    PythonStackIndex, RecordKind,
};
use crate::sinks::{Sink, SinkError};
use crate::varint::{put_svarint, put_varint};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub struct RecordWriter<S: Sink> {
    sink: S,
    header: CaptureHeader,
    disabled: bool,
    last_tid: Option<u64>,
    last_address: FxHashMap<u64, u64>,
    buf: Vec<u8>,
}

#[inline]
fn token(kind: RecordKind, flags: u8) -> u8 {
    debug_assert!(flags < 16);
    ((kind as u8) << 4) | flags
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

impl<S: Sink> RecordWriter<S> {
    /// Creates the writer and emits the header immediately.
    pub fn new(mut sink: S, header: CaptureHeader) -> Result<Self, WriteError> {
        sink.write_all(&header.encode())?;
        Ok(RecordWriter {
            sink,
            header,
            disabled: false,
            last_tid: None,
            last_address: FxHashMap::default(),
            buf: Vec::with_capacity(128),
        })
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// True once a write failed; every later record is dropped.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn commit(&mut self) -> Result<(), WriteError> {
        match self.sink.write_all(&self.buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.disabled = true;
                Err(e.into())
            }
        }
    }

    fn switch_thread(&mut self, tid: u64) {
        if self.last_tid != Some(tid) {
            self.buf.push(token(RecordKind::ContextSwitch, 0));
            put_varint(&mut self.buf, tid);
            self.last_tid = Some(tid);
        }
    }

    pub fn write_allocation(
        &mut self,
        tid: u64,
        kind: AllocatorKind,
        address: u64,
        size: u64,
        native_frame_index: Option<u32>,
    ) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.switch_thread(tid);
        let record_kind = if native_frame_index.is_some() {
            RecordKind::NativeAllocation
        } else {
            RecordKind::Allocation
        };
        self.buf.push(token(record_kind, kind as u8));
        let last = self.last_address.entry(tid).or_insert(0);
        let delta = address.wrapping_sub(*last) as i64;
        *last = address;
        put_svarint(&mut self.buf, delta);
        if !kind.is_deallocator() {
            put_varint(&mut self.buf, size);
        }
        if let Some(index) = native_frame_index {
            put_varint(&mut self.buf, u64::from(index));
        }
        self.header.stats.n_allocations += 1;
        self.commit()
    }

    pub fn write_frame_push(&mut self, tid: u64, push: FramePush) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.switch_thread(tid);
        self.buf
            .push(token(RecordKind::FramePush, push.is_entry as u8));
        put_varint(&mut self.buf, push.code_id);
        put_varint(&mut self.buf, u64::from(push.offset));
        self.header.stats.n_frames += 1;
        self.commit()
    }

    pub fn write_frame_pop(&mut self, tid: u64, count: u32) -> Result<(), WriteError> {
        debug_assert!(count > 0);
        if self.disabled || count == 0 {
            return Ok(());
        }
        self.buf.clear();
        self.switch_thread(tid);
        if count < 16 {
            self.buf.push(token(RecordKind::FramePop, count as u8));
        } else {
            self.buf.push(token(RecordKind::FramePop, 0));
            put_varint(&mut self.buf, u64::from(count));
        }
        self.commit()
    }

    pub fn write_code_object(&mut self, code: &CodeObject) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(token(RecordKind::CodeObject, 0));
        put_varint(&mut self.buf, code.id);
        put_string(&mut self.buf, &code.function_name);
        put_string(&mut self.buf, &code.filename);
        put_varint(&mut self.buf, u64::from(code.first_line));
        let entries = code.line_table.entries();
        put_varint(&mut self.buf, entries.len() as u64);
        let mut prev_offset = 0u32;
        let mut prev_line = code.first_line;
        for entry in entries {
            put_varint(&mut self.buf, u64::from(entry.offset - prev_offset));
            put_svarint(
                &mut self.buf,
                i64::from(entry.line) - i64::from(prev_line),
            );
            prev_offset = entry.offset;
            prev_line = entry.line;
        }
        self.commit()
    }

    pub fn write_native_frame(&mut self, ip: u64, parent: u32) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(token(RecordKind::NativeFrame, 0));
        put_varint(&mut self.buf, ip);
        put_varint(&mut self.buf, u64::from(parent));
        self.commit()
    }

    /// Starts a new segment generation. The images themselves follow, one
    /// [`write_image_segments`] each.
    ///
    /// [`write_image_segments`]: Self::write_image_segments
    pub fn write_segments_start(&mut self, image_count: u64) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(token(RecordKind::SegmentsStart, 0));
        put_varint(&mut self.buf, image_count);
        self.commit()
    }

    pub fn write_image_segments(&mut self, image: &ImageSegments) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(token(RecordKind::ImageSegments, 0));
        put_string(&mut self.buf, &image.path);
        put_varint(&mut self.buf, image.base);
        put_varint(&mut self.buf, image.segments.len() as u64);
        for segment in &image.segments {
            put_varint(&mut self.buf, segment.vaddr);
            put_varint(&mut self.buf, segment.size);
        }
        self.commit()
    }

    pub fn write_memory_record(&mut self, record: MemoryRecord) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(token(RecordKind::MemoryRecord, 0));
        put_varint(&mut self.buf, record.ms_since_epoch);
        put_varint(&mut self.buf, record.rss_bytes);
        self.commit()
    }

    pub fn write_thread_name(&mut self, tid: u64, name: &str) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.switch_thread(tid);
        self.buf.push(token(RecordKind::ThreadName, 0));
        put_string(&mut self.buf, name);
        self.commit()
    }

    pub fn write_python_stack_index(&mut self, node: PythonStackIndex) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf
            .push(token(RecordKind::PythonStackIndex, node.is_entry as u8));
        put_varint(&mut self.buf, u64::from(node.id));
        put_varint(&mut self.buf, u64::from(node.parent));
        put_varint(&mut self.buf, node.code_id);
        put_varint(&mut self.buf, u64::from(node.offset));
        self.commit()
    }

    pub fn write_aggregated_allocation(
        &mut self,
        record: &AggregatedAllocation,
    ) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(token(RecordKind::AggregatedAllocation, 0));
        put_varint(&mut self.buf, record.tid);
        self.buf.push(record.kind as u8);
        put_varint(&mut self.buf, u64::from(record.python_stack_id));
        put_varint(&mut self.buf, u64::from(record.native_frame_index));
        put_varint(&mut self.buf, record.n_allocations_in_high_water_mark);
        put_varint(&mut self.buf, record.bytes_in_high_water_mark);
        put_varint(&mut self.buf, record.n_allocations_leaked);
        put_varint(&mut self.buf, record.bytes_leaked);
        self.commit()
    }

    /// Writes the trailer with the final counters. For non-seekable sinks
    /// this is the only place the stats survive.
    pub fn write_trailer(&mut self, end_time_ms: u64) -> Result<(), WriteError> {
        if self.disabled {
            return Ok(());
        }
        self.header.stats.end_time_ms = end_time_ms;
        self.buf.clear();
        self.buf.push(token(RecordKind::Trailer, 0));
        put_varint(&mut self.buf, end_time_ms);
        put_varint(&mut self.buf, self.header.stats.n_allocations);
        put_varint(&mut self.buf, self.header.stats.n_frames);
        self.commit()
    }

    /// Stamps the final stats into the header, rewrites it in place where
    /// the sink supports seeking, and closes the sink. On a disabled
    /// writer only the close is attempted, so teardown still completes.
    pub fn finalize(&mut self, end_time_ms: u64) -> Result<(), WriteError> {
        if self.disabled {
            let _ = self.sink.close();
            return Ok(());
        }
        self.header.stats.end_time_ms = end_time_ms;
        match self.sink.seek_to_start() {
            Ok(()) => {
                self.sink.write_all(&self.header.encode())?;
            }
            // Live streams cannot rewrite their header; the trailer is
            // their end-of-capture marker.
            Err(SinkError::SeekUnsupported) => {}
            Err(e) => {
                self.disabled = true;
                let _ = self.sink.close();
                return Err(e.into());
            }
        }
        self.sink.flush()?;
        self.sink.close()?;
        Ok(())
    }

    /// Consumes the writer, returning the sink. Test-oriented.
    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::VecSink;
    use crate::header::{FileFormat, HeaderStats, PoolAllocatorId};

    fn test_header() -> CaptureHeader {
        CaptureHeader {
            file_format: FileFormat::AllRecords,
            native_traces: false,
            trace_pool_allocator: false,
            pool_allocator: PoolAllocatorId::SystemMalloc,
            pid: 1,
            main_tid: 1,
            skipped_frames_on_main_thread: 0,
            stats: HeaderStats::default(),
            command_line: String::new(),
        }
    }

    fn writer() -> RecordWriter<VecSink> {
        RecordWriter::new(VecSink::new(), test_header()).unwrap()
    }

    #[test]
    fn test_thread_context_is_elided_for_same_thread() {
        let mut w = writer();
        let header_len = w.header().encoded_len();
        w.write_allocation(7, AllocatorKind::Malloc, 0x1000, 16, None)
            .unwrap();
        let after_first = w.into_sink().into_bytes().len();

        let mut w = writer();
        w.write_allocation(7, AllocatorKind::Malloc, 0x1000, 16, None)
            .unwrap();
        w.write_allocation(7, AllocatorKind::Malloc, 0x1010, 16, None)
            .unwrap();
        let after_second = w.into_sink().into_bytes().len();

        // The second allocation on the same thread must not repeat the
        // context switch: token + 1-byte delta + 1-byte size.
        assert_eq!(after_second - after_first, 3);
        assert!(after_first > header_len);
    }

    #[test]
    fn test_thread_context_reemitted_on_switch() {
        let mut w = writer();
        w.write_allocation(1, AllocatorKind::Malloc, 0x1000, 16, None)
            .unwrap();
        w.write_allocation(2, AllocatorKind::Malloc, 0x2000, 16, None)
            .unwrap();
        w.write_allocation(1, AllocatorKind::Malloc, 0x1010, 16, None)
            .unwrap();
        let bytes = w.into_sink().into_bytes();
        let switches = bytes
            .iter()
            .filter(|&&b| b == ((RecordKind::ContextSwitch as u8) << 4))
            .count();
        // One switch per thread change; encoded tids (1, 2, 1) are never
        // the token byte value, so counting tokens is exact here.
        assert_eq!(switches, 3);
    }

    #[test]
    fn test_deallocation_has_no_size() {
        let mut w = writer();
        w.write_allocation(1, AllocatorKind::Malloc, 0x1000, 123, None)
            .unwrap();
        let alloc_len = w.into_sink().into_bytes().len();

        let mut w = writer();
        w.write_allocation(1, AllocatorKind::Free, 0x1000, 123, None)
            .unwrap();
        let free_len = w.into_sink().into_bytes().len();
        assert!(free_len < alloc_len);
    }

    #[test]
    fn test_disabled_after_sink_failure() {
        let mut w = writer();
        // Close the sink behind the writer's back; the next write fails
        // and trips the sticky disable.
        w.sink.close().unwrap();
        assert!(w
            .write_allocation(1, AllocatorKind::Malloc, 0x10, 1, None)
            .is_err());
        assert!(w.is_disabled());
        // Subsequent writes are silent no-ops.
        assert!(w
            .write_allocation(1, AllocatorKind::Malloc, 0x20, 1, None)
            .is_ok());
        // Finalize still completes so teardown can finish cleanly.
        assert!(w.finalize(1).is_ok());
    }

    #[test]
    fn test_stats_counters() {
        let mut w = writer();
        w.write_frame_push(
            1,
            FramePush {
                code_id: 1,
                offset: 0,
                is_entry: true,
            },
        )
        .unwrap();
        w.write_allocation(1, AllocatorKind::Malloc, 0x10, 1, None)
            .unwrap();
        w.write_allocation(1, AllocatorKind::Free, 0x10, 0, None)
            .unwrap();
        assert_eq!(w.header().stats.n_allocations, 2);
        assert_eq!(w.header().stats.n_frames, 1);
    }
}
