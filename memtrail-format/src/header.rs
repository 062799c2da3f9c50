// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture header. Written at tracker installation and rewritten in
//! place on close with the final stats, so every field before the command
//! line is fixed-width little-endian.

use crate::sources::{ReadOutcome, Source, SourceError};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const MAGIC: [u8; 8] = *b"memtrail";
pub const FORMAT_VERSION: u32 = 1;

/// Byte length of the header up to and including `cmdline_len`.
pub const FIXED_LEN: usize = 8 + 4 + 4 + 7 * 8 + 4;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("not a memtrail capture (bad magic)")]
    BadMagic,
    #[error("unsupported capture version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },
    #[error("capture header is truncated")]
    Truncated,
    #[error("capture command line is not UTF-8")]
    BadCommandLine,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Stream layout discriminator: every event, or per-location counters only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileFormat {
    AllRecords = 0,
    AggregatedRecords = 1,
}

/// Which internal allocator the host interpreter is running with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolAllocatorId {
    Unknown = 0,
    Pool = 1,
    DebugPool = 2,
    SystemMalloc = 3,
}

impl PoolAllocatorId {
    /// Maps the name the host reports for its active allocator.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pool" => PoolAllocatorId::Pool,
            "pool_debug" => PoolAllocatorId::DebugPool,
            "malloc" | "malloc_debug" => PoolAllocatorId::SystemMalloc,
            _ => PoolAllocatorId::Unknown,
        }
    }
}

/// Counters rewritten into the header when a capture closes cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderStats {
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub n_allocations: u64,
    pub n_frames: u64,
}

/// The capture clock: milliseconds since the Unix epoch, as stamped into
/// [`HeaderStats`] and memory records. Wall-clock (not monotonic) so
/// captures from different processes line up on a shared axis.
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHeader {
    pub file_format: FileFormat,
    pub native_traces: bool,
    pub trace_pool_allocator: bool,
    pub pool_allocator: PoolAllocatorId,
    pub pid: u64,
    pub main_tid: u64,
    /// Profile-hook frames above the install point to suppress from reports
    /// on the main thread.
    pub skipped_frames_on_main_thread: u64,
    pub stats: HeaderStats,
    pub command_line: String,
}

impl CaptureHeader {
    pub fn encoded_len(&self) -> usize {
        FIXED_LEN + self.command_line.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&MAGIC);
        let mut word = [0u8; 8];
        LittleEndian::write_u32(&mut word[..4], FORMAT_VERSION);
        out.extend_from_slice(&word[..4]);
        out.push(self.file_format as u8);
        out.push(self.native_traces as u8);
        out.push(self.trace_pool_allocator as u8);
        out.push(self.pool_allocator as u8);
        for value in [
            self.pid,
            self.main_tid,
            self.skipped_frames_on_main_thread,
            self.stats.start_time_ms,
            self.stats.end_time_ms,
            self.stats.n_allocations,
            self.stats.n_frames,
        ] {
            LittleEndian::write_u64(&mut word, value);
            out.extend_from_slice(&word);
        }
        LittleEndian::write_u32(&mut word[..4], self.command_line.len() as u32);
        out.extend_from_slice(&word[..4]);
        out.extend_from_slice(self.command_line.as_bytes());
        out
    }

    pub fn decode<S: Source>(source: &mut S) -> Result<Self, HeaderError> {
        let mut fixed = [0u8; FIXED_LEN];
        match source.read_exact_or_eof(&mut fixed)? {
            ReadOutcome::Filled => {}
            ReadOutcome::Eof => return Err(HeaderError::Truncated),
        }
        if fixed[..8] != MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let version = LittleEndian::read_u32(&fixed[8..12]);
        if version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let file_format = match fixed[12] {
            0 => FileFormat::AllRecords,
            1 => FileFormat::AggregatedRecords,
            value => {
                return Err(HeaderError::InvalidField {
                    field: "file_format",
                    value,
                })
            }
        };
        let native_traces = decode_bool(fixed[13], "native_traces")?;
        let trace_pool_allocator = decode_bool(fixed[14], "trace_pool_allocator")?;
        let pool_allocator = match fixed[15] {
            0 => PoolAllocatorId::Unknown,
            1 => PoolAllocatorId::Pool,
            2 => PoolAllocatorId::DebugPool,
            3 => PoolAllocatorId::SystemMalloc,
            value => {
                return Err(HeaderError::InvalidField {
                    field: "pool_allocator",
                    value,
                })
            }
        };
        let mut words = fixed[16..].chunks_exact(8);
        let mut next = || -> u64 {
            // FIXED_LEN leaves exactly seven u64 words plus the u32 length.
            words.next().map(LittleEndian::read_u64).unwrap_or(0)
        };
        let pid = next();
        let main_tid = next();
        let skipped_frames_on_main_thread = next();
        let stats = HeaderStats {
            start_time_ms: next(),
            end_time_ms: next(),
            n_allocations: next(),
            n_frames: next(),
        };
        let cmdline_len = LittleEndian::read_u32(&fixed[FIXED_LEN - 4..]) as usize;
        let mut cmdline = vec![0u8; cmdline_len];
        if cmdline_len > 0 {
            match source.read_exact_or_eof(&mut cmdline)? {
                ReadOutcome::Filled => {}
                ReadOutcome::Eof => return Err(HeaderError::Truncated),
            }
        }
        let command_line = String::from_utf8(cmdline).map_err(|_| HeaderError::BadCommandLine)?;
        Ok(CaptureHeader {
            file_format,
            native_traces,
            trace_pool_allocator,
            pool_allocator,
            pid,
            main_tid,
            skipped_frames_on_main_thread,
            stats,
            command_line,
        })
    }
}

fn decode_bool(value: u8, field: &'static str) -> Result<bool, HeaderError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(HeaderError::InvalidField { field, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SliceSource;

    fn sample_header() -> CaptureHeader {
        CaptureHeader {
            file_format: FileFormat::AllRecords,
            native_traces: true,
            trace_pool_allocator: false,
            pool_allocator: PoolAllocatorId::Pool,
            pid: 4242,
            main_tid: 77,
            skipped_frames_on_main_thread: 2,
            stats: HeaderStats {
                start_time_ms: 1_700_000_000_000,
                end_time_ms: 0,
                n_allocations: 0,
                n_frames: 0,
            },
            command_line: "host -m app run".to_string(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(encoded.len(), header.encoded_len());
        let decoded = CaptureHeader::decode(&mut SliceSource::new(&encoded)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_rewrite_preserves_length() {
        // Header rewrite on close seeks to 0 and re-encodes; the stats are
        // fixed-width so the byte length cannot change.
        let mut header = sample_header();
        let before = header.encode().len();
        header.stats.end_time_ms = u64::MAX;
        header.stats.n_allocations = u64::MAX;
        header.stats.n_frames = u64::MAX;
        assert_eq!(header.encode().len(), before);
    }

    #[test]
    fn test_bad_magic() {
        let mut encoded = sample_header().encode();
        encoded[0] = b'X';
        assert!(matches!(
            CaptureHeader::decode(&mut SliceSource::new(&encoded)),
            Err(HeaderError::BadMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut encoded = sample_header().encode();
        encoded[8] = 0xFF;
        assert!(matches!(
            CaptureHeader::decode(&mut SliceSource::new(&encoded)),
            Err(HeaderError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let encoded = sample_header().encode();
        let result = CaptureHeader::decode(&mut SliceSource::new(&encoded[..FIXED_LEN - 1]));
        assert!(matches!(
            result,
            Err(HeaderError::Truncated) | Err(HeaderError::Source(SourceError::Truncated))
        ));
    }

    #[test]
    fn test_epoch_millis_is_plausible_and_monotone_enough() {
        // Anything after 2020-01-01, and never moving backwards across
        // two immediate samples.
        let first = epoch_millis();
        assert!(first > 1_577_836_800_000);
        assert!(epoch_millis() >= first);
    }

    #[test]
    fn test_pool_allocator_names() {
        assert_eq!(PoolAllocatorId::from_name("pool"), PoolAllocatorId::Pool);
        assert_eq!(
            PoolAllocatorId::from_name("malloc"),
            PoolAllocatorId::SystemMalloc
        );
        assert_eq!(
            PoolAllocatorId::from_name("whatever"),
            PoolAllocatorId::Unknown
        );
    }
}
