// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream inputs for the reader. A source distinguishes a clean end
//! of stream at a record boundary from mid-record truncation, which is the
//! basis for the reader's recoverable short-read reporting.

use lz4_flex::frame::FrameDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use thiserror::Error;

/// LZ4 frame magic, little-endian 0x184D2204.
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O failure reading capture: {0}")]
    Io(#[from] io::Error),
    #[error("capture ends mid-record")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Filled,
    /// No bytes were available at the first read; the stream ended on a
    /// clean boundary.
    Eof,
}

pub trait Source: Send {
    /// Fill `buf` completely, or report `Eof` when the stream ended before
    /// the first byte. A partial fill is an error, not an outcome.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SourceError>;
}

fn read_exact_or_eof_from<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<ReadOutcome, SourceError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Eof),
            Ok(0) => return Err(SourceError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SourceError::Io(e)),
        }
    }
    Ok(ReadOutcome::Filled)
}

/// A capture file on disk, decompressed transparently when the on-close
/// LZ4 step ran.
pub struct FileSource {
    inner: Box<dyn Read + Send>,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let mut file = File::open(path)?;
        let mut head = [0u8; 4];
        let mut head_len = 0;
        while head_len < head.len() {
            match file.read(&mut head[head_len..]) {
                Ok(0) => break,
                Ok(n) => head_len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SourceError::Io(e)),
            }
        }
        let chained = io::Cursor::new(head).take(head_len as u64).chain(file);
        let inner: Box<dyn Read + Send> = if head_len == 4 && head == LZ4_MAGIC {
            Box::new(FrameDecoder::new(BufReader::new(chained)))
        } else {
            Box::new(BufReader::new(chained))
        };
        Ok(FileSource { inner })
    }
}

impl Source for FileSource {
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SourceError> {
        read_exact_or_eof_from(&mut self.inner, buf)
    }
}

/// The reader end of a live capture stream. The reader listens and the
/// tracked process connects to it.
pub struct SocketSource {
    stream: TcpStream,
}

/// Clone of the live stream used to unblock a reader from another thread.
pub struct SocketShutdown {
    stream: TcpStream,
}

impl SocketShutdown {
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl SocketSource {
    /// Bind `addr` and accept a single tracker connection.
    pub fn accept<A: ToSocketAddrs>(addr: A) -> Result<Self, SourceError> {
        let listener = std::net::TcpListener::bind(addr)?;
        let (stream, _peer) = listener.accept()?;
        Ok(SocketSource { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        SocketSource { stream }
    }

    pub fn shutdown_handle(&self) -> Result<SocketShutdown, SourceError> {
        Ok(SocketShutdown {
            stream: self.stream.try_clone()?,
        })
    }
}

impl Source for SocketSource {
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SourceError> {
        read_exact_or_eof_from(&mut self.stream, buf)
    }
}

/// In-memory source over a borrowed byte slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceSource { data }
    }
}

impl Source for SliceSource<'_> {
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SourceError> {
        if self.data.is_empty() && !buf.is_empty() {
            return Ok(ReadOutcome::Eof);
        }
        if self.data.len() < buf.len() {
            self.data = &[];
            return Err(SourceError::Truncated);
        }
        let (head, rest) = self.data.split_at(buf.len());
        buf.copy_from_slice(head);
        self.data = rest;
        Ok(ReadOutcome::Filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_slice_source_boundaries() {
        let data = [1u8, 2, 3];
        let mut source = SliceSource::new(&data);
        let mut buf = [0u8; 2];
        assert!(matches!(
            source.read_exact_or_eof(&mut buf),
            Ok(ReadOutcome::Filled)
        ));
        assert_eq!(buf, [1, 2]);
        // Two bytes wanted, one available: truncation, not EOF.
        assert!(matches!(
            source.read_exact_or_eof(&mut buf),
            Err(SourceError::Truncated)
        ));
        assert!(matches!(
            source.read_exact_or_eof(&mut buf),
            Ok(ReadOutcome::Eof)
        ));
    }

    #[test]
    fn test_file_source_plain() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"memtrail-payload").unwrap();
        tmp.flush().unwrap();
        let mut source = FileSource::open(tmp.path()).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            source.read_exact_or_eof(&mut buf),
            Ok(ReadOutcome::Filled)
        ));
        assert_eq!(&buf, b"memtrail-payload");
        assert!(matches!(
            source.read_exact_or_eof(&mut buf[..1]),
            Ok(ReadOutcome::Eof)
        ));
    }

    #[test]
    fn test_file_source_lz4() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut encoder = lz4_flex::frame::FrameEncoder::new(tmp.reopen().unwrap());
        encoder.write_all(b"compressed-capture-bytes").unwrap();
        encoder.finish().unwrap();
        let mut source = FileSource::open(tmp.path()).unwrap();
        let mut buf = [0u8; 24];
        assert!(matches!(
            source.read_exact_or_eof(&mut buf),
            Ok(ReadOutcome::Filled)
        ));
        assert_eq!(&buf, b"compressed-capture-bytes");
    }

    #[test]
    fn test_file_source_shorter_than_magic() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"ab").unwrap();
        tmp.flush().unwrap();
        let mut source = FileSource::open(tmp.path()).unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(
            source.read_exact_or_eof(&mut buf),
            Ok(ReadOutcome::Filled)
        ));
        assert_eq!(&buf, b"ab");
    }
}
