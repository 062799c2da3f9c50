// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! The memtrail capture format: a little-endian stream of LEB128-encoded
//! records behind a fixed rewritable header, optionally LZ4-compressed when
//! a file capture closes. The writer half runs inside allocator hooks; the
//! parser half feeds the post-mortem reader. Both halves live in this crate
//! so the bit-exact contract between them is enforced in one place.

pub mod header;
pub mod parser;
pub mod records;
pub mod sinks;
pub mod sources;
pub mod varint;
pub mod writer;

pub use header::{epoch_millis, CaptureHeader, FileFormat, HeaderStats, PoolAllocatorId};
pub use parser::{ParseError, RecordParser};
pub use records::{
    AggregatedAllocation, AllocatorKind, CodeObject, FramePush, ImageSegments, LineTable,
    LineTableEntry, MemoryRecord, PythonStackIndex, RawRecord, RecordKind, Segment, TrailerStats,
};
pub use sinks::{FileSink, NullSink, Sink, SinkError, SocketSink, VecSink};
pub use sources::{FileSource, ReadOutcome, SliceSource, SocketShutdown, SocketSource, Source, SourceError};
pub use writer::{RecordWriter, WriteError};
