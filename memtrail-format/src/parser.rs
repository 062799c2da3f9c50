// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw record decoding. The parser is stateless with respect to thread
//! attribution and address deltas; applying those belongs to the reader,
//! which owns the replay tables.

use crate::header::{CaptureHeader, HeaderError};
use crate::records::{
    AggregatedAllocation, AllocatorKind, CodeObject, FramePush, ImageSegments, LineTable,
    LineTableEntry, MemoryRecord, PythonStackIndex, RawRecord, RecordKind, Segment, TrailerStats,
};
use crate::sources::{ReadOutcome, Source, SourceError};
use crate::varint::unzigzag;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// The stream ended inside a record. Recoverable: everything decoded
    /// before this point is valid.
    #[error("capture is truncated after {records} records")]
    Truncated { records: u64 },
    #[error("corrupt capture: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Io(SourceError),
}

pub struct RecordParser<S: Source> {
    source: S,
    records_decoded: u64,
}

impl<S: Source> RecordParser<S> {
    pub fn new(source: S) -> Self {
        RecordParser {
            source,
            records_decoded: 0,
        }
    }

    pub fn records_decoded(&self) -> u64 {
        self.records_decoded
    }

    pub fn read_header(&mut self) -> Result<CaptureHeader, ParseError> {
        Ok(CaptureHeader::decode(&mut self.source)?)
    }

    fn truncated(&self) -> ParseError {
        ParseError::Truncated {
            records: self.records_decoded,
        }
    }

    fn map_source_err(&self, e: SourceError) -> ParseError {
        match e {
            SourceError::Truncated => self.truncated(),
            e => ParseError::Io(e),
        }
    }

    /// Reads a byte that must exist (mid-record).
    fn read_u8(&mut self) -> Result<u8, ParseError> {
        let mut buf = [0u8; 1];
        match self.source.read_exact_or_eof(&mut buf) {
            Ok(ReadOutcome::Filled) => Ok(buf[0]),
            Ok(ReadOutcome::Eof) => Err(self.truncated()),
            Err(e) => Err(self.map_source_err(e)),
        }
    }

    fn read_varint(&mut self) -> Result<u64, ParseError> {
        let mut value: u64 = 0;
        for i in 0..10u32 {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ParseError::Corrupt("overlong varint"))
    }

    fn read_svarint(&mut self) -> Result<i64, ParseError> {
        Ok(unzigzag(self.read_varint()?))
    }

    fn read_u32_varint(&mut self, what: &'static str) -> Result<u32, ParseError> {
        u32::try_from(self.read_varint()?).map_err(|_| ParseError::Corrupt(what))
    }

    fn read_string(&mut self) -> Result<Box<str>, ParseError> {
        let len = self.read_varint()? as usize;
        let mut bytes = vec![0u8; len];
        if len > 0 {
            match self.source.read_exact_or_eof(&mut bytes) {
                Ok(ReadOutcome::Filled) => {}
                Ok(ReadOutcome::Eof) => return Err(self.truncated()),
                Err(e) => return Err(self.map_source_err(e)),
            }
        }
        String::from_utf8(bytes)
            .map(String::into_boxed_str)
            .map_err(|_| ParseError::Corrupt("string is not UTF-8"))
    }

    /// Decodes the next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<RawRecord>, ParseError> {
        let mut token = [0u8; 1];
        match self.source.read_exact_or_eof(&mut token) {
            Ok(ReadOutcome::Filled) => {}
            Ok(ReadOutcome::Eof) => return Ok(None),
            Err(e) => return Err(self.map_source_err(e)),
        }
        let kind = RecordKind::from_wire(token[0] >> 4)
            .ok_or(ParseError::Corrupt("unknown record kind"))?;
        let flags = token[0] & 0x0F;
        let record = match kind {
            RecordKind::Allocation | RecordKind::NativeAllocation => {
                let allocator = AllocatorKind::from_wire(flags)
                    .ok_or(ParseError::Corrupt("unknown allocator kind"))?;
                let address_delta = self.read_svarint()?;
                let size = if allocator.is_deallocator() {
                    None
                } else {
                    Some(self.read_varint()?)
                };
                let native_frame_index = if kind == RecordKind::NativeAllocation {
                    Some(self.read_u32_varint("native frame index out of range")?)
                } else {
                    None
                };
                RawRecord::Allocation {
                    kind: allocator,
                    address_delta,
                    size,
                    native_frame_index,
                }
            }
            RecordKind::FramePush => RawRecord::FramePush(FramePush {
                is_entry: flags & 1 == 1,
                code_id: self.read_varint()?,
                offset: self.read_u32_varint("frame offset out of range")?,
            }),
            RecordKind::FramePop => {
                let count = if flags != 0 {
                    u32::from(flags)
                } else {
                    let count = self.read_u32_varint("pop count out of range")?;
                    if count == 0 {
                        return Err(ParseError::Corrupt("zero frame pop count"));
                    }
                    count
                };
                RawRecord::FramePop { count }
            }
            RecordKind::CodeObject => {
                let id = self.read_varint()?;
                let function_name = self.read_string()?;
                let filename = self.read_string()?;
                let first_line = self.read_u32_varint("first line out of range")?;
                let entry_count = self.read_varint()? as usize;
                let mut entries = Vec::with_capacity(entry_count.min(1024));
                let mut prev_offset = 0u32;
                let mut prev_line = i64::from(first_line);
                for _ in 0..entry_count {
                    let offset_delta = self.read_u32_varint("line table offset out of range")?;
                    let line_delta = self.read_svarint()?;
                    let offset = prev_offset
                        .checked_add(offset_delta)
                        .ok_or(ParseError::Corrupt("line table offset overflow"))?;
                    let line = prev_line
                        .checked_add(line_delta)
                        .filter(|l| (0..=i64::from(u32::MAX)).contains(l))
                        .ok_or(ParseError::Corrupt("line table line overflow"))?;
                    entries.push(LineTableEntry {
                        offset,
                        line: line as u32,
                    });
                    prev_offset = offset;
                    prev_line = line;
                }
                RawRecord::CodeObject(CodeObject {
                    id,
                    function_name,
                    filename,
                    first_line,
                    line_table: LineTable::new(entries),
                })
            }
            RecordKind::NativeFrame => RawRecord::NativeFrame {
                ip: self.read_varint()?,
                parent: self.read_u32_varint("native frame parent out of range")?,
            },
            RecordKind::SegmentsStart => RawRecord::SegmentsStart {
                image_count: self.read_varint()?,
            },
            RecordKind::ImageSegments => {
                let path = self.read_string()?;
                let base = self.read_varint()?;
                let segment_count = self.read_varint()? as usize;
                let mut segments = Vec::with_capacity(segment_count.min(1024));
                for _ in 0..segment_count {
                    segments.push(Segment {
                        vaddr: self.read_varint()?,
                        size: self.read_varint()?,
                    });
                }
                RawRecord::ImageSegments(ImageSegments {
                    path,
                    base,
                    segments,
                })
            }
            RecordKind::MemoryRecord => RawRecord::MemoryRecord(MemoryRecord {
                ms_since_epoch: self.read_varint()?,
                rss_bytes: self.read_varint()?,
            }),
            RecordKind::ContextSwitch => RawRecord::ContextSwitch {
                tid: self.read_varint()?,
            },
            RecordKind::ThreadName => RawRecord::ThreadName(self.read_string()?),
            RecordKind::AggregatedAllocation => {
                let tid = self.read_varint()?;
                let kind_byte = self.read_u8()?;
                let allocator = AllocatorKind::from_wire(kind_byte)
                    .ok_or(ParseError::Corrupt("unknown allocator kind"))?;
                RawRecord::AggregatedAllocation(AggregatedAllocation {
                    tid,
                    kind: allocator,
                    python_stack_id: self.read_u32_varint("stack id out of range")?,
                    native_frame_index: self.read_u32_varint("native frame index out of range")?,
                    n_allocations_in_high_water_mark: self.read_varint()?,
                    bytes_in_high_water_mark: self.read_varint()?,
                    n_allocations_leaked: self.read_varint()?,
                    bytes_leaked: self.read_varint()?,
                })
            }
            RecordKind::PythonStackIndex => RawRecord::PythonStackIndex(PythonStackIndex {
                is_entry: flags & 1 == 1,
                id: self.read_u32_varint("stack index id out of range")?,
                parent: self.read_u32_varint("stack index parent out of range")?,
                code_id: self.read_varint()?,
                offset: self.read_u32_varint("stack index offset out of range")?,
            }),
            RecordKind::Trailer => RawRecord::Trailer(TrailerStats {
                end_time_ms: self.read_varint()?,
                n_allocations: self.read_varint()?,
                n_frames: self.read_varint()?,
            }),
        };
        self.records_decoded += 1;
        Ok(Some(record))
    }
}
