// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream destinations for the writer. A sink's `close` is idempotent
//! and, for the file sink, performs the LZ4 compression step exactly once:
//! the finished file is streamed through a frame encoder into a sibling
//! temporary file which is atomically renamed over the original.

use lz4_flex::frame::FrameEncoder;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O failure writing capture: {0}")]
    Io(#[from] io::Error),
    #[error("sink does not support seeking")]
    SeekUnsupported,
    #[error("sink is closed")]
    Closed,
}

pub trait Sink: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError>;
    /// Supported only by the file sink, exclusively for the header rewrite
    /// on close.
    fn seek_to_start(&mut self) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
    /// Idempotent. Later writes fail with [`SinkError::Closed`].
    fn close(&mut self) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        (**self).write_all(buf)
    }

    fn seek_to_start(&mut self) -> Result<(), SinkError> {
        (**self).seek_to_start()
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

/// Writes the capture to a file, optionally replacing it with its LZ4
/// frame compression on close.
pub struct FileSink {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    compress_on_close: bool,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        overwrite: bool,
        compress_on_close: bool,
    ) -> Result<Self, SinkError> {
        let mut options = OpenOptions::new();
        options.write(true).read(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path.as_ref())?;
        Ok(FileSink {
            writer: Some(BufWriter::new(file)),
            path: path.as_ref().to_path_buf(),
            compress_on_close,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compress_in_place(path: &Path) -> Result<(), SinkError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut original = File::open(path)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut encoder = FrameEncoder::new(tmp);
        io::copy(&mut original, &mut encoder)?;
        let tmp = encoder
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        tmp.persist(path)
            .map_err(|e| SinkError::Io(e.error))?;
        Ok(())
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.write_all(buf)?),
            None => Err(SinkError::Closed),
        }
    }

    fn seek_to_start(&mut self) -> Result<(), SinkError> {
        match self.writer.as_mut() {
            Some(writer) => {
                writer.flush()?;
                writer.get_mut().seek(SeekFrom::Start(0))?;
                Ok(())
            }
            None => Err(SinkError::Closed),
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.flush()?),
            None => Err(SinkError::Closed),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        drop(writer);
        if self.compress_on_close {
            Self::compress_in_place(&self.path)?;
        }
        Ok(())
    }
}

/// Streams the capture to a listening live viewer. No compression; the
/// stream is terminated by the trailer record.
pub struct SocketSink {
    stream: Option<TcpStream>,
}

impl SocketSink {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, SinkError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(SocketSink {
            stream: Some(stream),
        })
    }
}

impl Sink for SocketSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.write_all(buf)?),
            None => Err(SinkError::Closed),
        }
    }

    fn seek_to_start(&mut self) -> Result<(), SinkError> {
        Err(SinkError::SeekUnsupported)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.flush()?),
            None => Err(SinkError::Closed),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
        Ok(())
    }
}

/// Discards everything. Used when the capture targets the null device.
#[derive(Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn write_all(&mut self, _buf: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }

    fn seek_to_start(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// In-memory sink, for tests and tooling that post-processes captures
/// without touching disk.
#[derive(Default)]
pub struct VecSink {
    buf: Vec<u8>,
    closed: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Sink for VecSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn seek_to_start(&mut self) -> Result<(), SinkError> {
        Err(SinkError::SeekUnsupported)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_file_sink_write_seek_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let mut sink = FileSink::create(&path, true, false).unwrap();
        sink.write_all(b"0123456789").unwrap();
        sink.seek_to_start().unwrap();
        sink.write_all(b"AB").unwrap();
        sink.close().unwrap();
        let mut contents = Vec::new();
        File::open(&path)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"AB23456789");
    }

    #[test]
    fn test_file_sink_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let mut sink = FileSink::create(&path, true, true).unwrap();
        sink.write_all(b"payload-payload-payload").unwrap();
        sink.close().unwrap();
        let compressed_once = std::fs::read(&path).unwrap();
        // Second close must not compress again.
        sink.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), compressed_once);
        assert!(matches!(sink.write_all(b"x"), Err(SinkError::Closed)));
    }

    #[test]
    fn test_file_sink_compression_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let payload = vec![7u8; 4096];
        let mut sink = FileSink::create(&path, true, true).unwrap();
        sink.write_all(&payload).unwrap();
        sink.close().unwrap();

        let compressed = std::fs::read(&path).unwrap();
        assert_eq!(&compressed[..4], &[0x04, 0x22, 0x4D, 0x18]);
        assert!(compressed.len() < payload.len());

        let mut decoder = lz4_flex::frame::FrameDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn test_file_sink_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, b"existing").unwrap();
        assert!(FileSink::create(&path, false, false).is_err());
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.write_all(b"whatever").unwrap();
        sink.seek_to_start().unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink = VecSink::new();
        sink.write_all(b"ab").unwrap();
        sink.write_all(b"cd").unwrap();
        assert!(matches!(sink.seek_to_start(), Err(SinkError::SeekUnsupported)));
        sink.close().unwrap();
        assert_eq!(sink.into_bytes(), b"abcd");
    }
}
