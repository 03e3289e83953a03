//! The opaque byte-oriented source/sink an application attaches to a
//! connection. The core never touches a filesystem itself — it only knows
//! how to read blocks out of, or write blocks into, whatever the
//! application hands it.

use std::io;

/// A random-access byte source for serving an rrq: read up to `buf.len()`
/// bytes starting at `offset`, returning the number actually read (short
/// reads signal end-of-file, exactly like `Read::read`).
pub trait ReadSource: Send + Sync {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// A streaming/asset source for serving an rrq where seeking isn't
/// meaningful (e.g. a generated or remote asset) — the application computes
/// each chunk from an offset and length instead of owning a cursor.
pub trait ChunkSource: Send + Sync {
    fn get_chunk(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>>;
}

/// The handle an application attaches during an `rrq` callback. Detected by
/// capability rather than a single trait so a positioned file and a
/// generated/remote asset can both be served without an inheritance chain.
pub enum ReadHandle {
    Positioned(Box<dyn ReadSource>),
    Chunked(Box<dyn ChunkSource>),
}

impl ReadHandle {
    /// Read at most `length` bytes starting at `offset`. A result shorter
    /// than `length` means this was the final block of the transfer.
    pub fn read(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        match self {
            ReadHandle::Positioned(src) => {
                let mut buf = vec![0u8; length];
                let n = src.read_at(offset, &mut buf)?;
                buf.truncate(n);
                Ok(buf)
            }
            ReadHandle::Chunked(src) => src.get_chunk(offset, length),
        }
    }
}

/// The handle an application attaches during a `wrq` callback: an
/// append-only sink for the bytes the client uploads.
pub trait WriteSink: Send + Sync {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// The handle attached to a connection, tagged by transfer direction. A
/// connection only ever holds the variant matching its own `Kind`.
pub enum Handle {
    Read(ReadHandle),
    Write(Box<dyn WriteSink>),
}

/// An in-memory `ReadSource`, primarily useful for tests and small
/// generated payloads.
pub struct MemoryReader {
    data: Vec<u8>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ReadSource for MemoryReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

/// An in-memory `WriteSink`, primarily useful for tests.
#[derive(Default)]
pub struct MemoryWriter {
    pub data: Vec<u8>,
}

impl WriteSink for MemoryWriter {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let offset = offset as usize;
        if self.data.len() < offset {
            self.data.resize(offset, 0);
        }
        let end = offset + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_reader_short_reads_at_eof() {
        let mut r = ReadHandle::Positioned(Box::new(MemoryReader::new(b"abcde".to_vec())));
        let first = r.read(0, 3).unwrap();
        assert_eq!(first, b"abc");
        let last = r.read(3, 3).unwrap();
        assert_eq!(last, b"de");
        let empty = r.read(5, 3).unwrap();
        assert!(empty.is_empty());
    }

    struct Chunked(Vec<u8>);
    impl ChunkSource for Chunked {
        fn get_chunk(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
            let offset = offset as usize;
            if offset >= self.0.len() {
                return Ok(Vec::new());
            }
            let end = (offset + length).min(self.0.len());
            Ok(self.0[offset..end].to_vec())
        }
    }

    #[test]
    fn chunked_source_is_detected_by_capability() {
        let mut r = ReadHandle::Chunked(Box::new(Chunked(b"xyz".to_vec())));
        assert_eq!(r.read(0, 2).unwrap(), b"xy");
    }

    #[test]
    fn memory_writer_accumulates_sequential_blocks() {
        let mut w = MemoryWriter::default();
        w.write_at(0, b"hello").unwrap();
        w.write_at(5, b" world").unwrap();
        assert_eq!(w.data, b"hello world");
    }
}
