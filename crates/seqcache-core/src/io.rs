//! Byte-stream codec used for cache state save and restore.
//!
//! All integers are little-endian. Strings are a `u32` length followed by
//! UTF-8 bytes.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{MemoryError, MemoryResult};
use crate::tensor::TensorBuf;

/// Upper bound on a serialized string.
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Sink for serialized state.
pub trait StateWrite {
    /// Append raw bytes.
    fn write(&mut self, src: &[u8]) -> MemoryResult<()>;

    /// Bytes written so far.
    fn n_bytes(&self) -> usize;

    /// Append `size` bytes of `tensor` starting at byte `offset`.
    fn write_tensor(&mut self, tensor: &TensorBuf, offset: usize, size: usize) -> MemoryResult<()> {
        let bytes = tensor.bytes();
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                MemoryError::internal(format!(
                    "tensor {} read out of range: {offset}+{size} > {}",
                    tensor.name(),
                    bytes.len()
                ))
            })?;
        self.write(&bytes[offset..end])
    }

    fn write_u32(&mut self, v: u32) -> MemoryResult<()> {
        self.write(&v.to_le_bytes())
    }

    fn write_i32(&mut self, v: i32) -> MemoryResult<()> {
        self.write(&v.to_le_bytes())
    }

    fn write_u64(&mut self, v: u64) -> MemoryResult<()> {
        self.write(&v.to_le_bytes())
    }

    fn write_string(&mut self, s: &str) -> MemoryResult<()> {
        let len = u32::try_from(s.len())
            .ok()
            .filter(|&len| len as usize <= MAX_STRING_LEN)
            .ok_or_else(|| MemoryError::state_format("string too long"))?;
        self.write_u32(len)?;
        self.write(s.as_bytes())
    }
}

/// Source of serialized state.
pub trait StateRead {
    /// Consume exactly `n` bytes.
    fn read(&mut self, n: usize) -> MemoryResult<&[u8]>;

    /// Bytes consumed so far.
    fn n_bytes(&self) -> usize;

    /// Fill `dst` completely.
    fn read_to(&mut self, dst: &mut [u8]) -> MemoryResult<()> {
        let src = self.read(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn read_u32(&mut self) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_to(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&mut self) -> MemoryResult<i32> {
        let mut buf = [0u8; 4];
        self.read_to(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> MemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_to(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_string(&mut self) -> MemoryResult<String> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(MemoryError::state_format(format!(
                "string length {len} exceeds limit"
            )));
        }
        let bytes = self.read(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| MemoryError::state_format("string is not UTF-8"))
    }
}

/// Growable in-memory sink.
#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl StateWrite for BufferWriter {
    fn write(&mut self, src: &[u8]) -> MemoryResult<()> {
        self.buf.extend_from_slice(src);
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Fixed-capacity sink over a caller buffer.
#[derive(Debug)]
pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> SliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, written: 0 }
    }
}

impl StateWrite for SliceWriter<'_> {
    fn write(&mut self, src: &[u8]) -> MemoryResult<()> {
        let end = self.written + src.len();
        if end > self.buf.len() {
            return Err(MemoryError::state_format(format!(
                "output buffer too small: need {end} bytes, have {}",
                self.buf.len()
            )));
        }
        self.buf[self.written..end].copy_from_slice(src);
        self.written = end;
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.written
    }
}

/// Sink that only counts bytes, used to size a state buffer up front.
#[derive(Debug, Default)]
pub struct SizeCounter {
    size: usize,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateWrite for SizeCounter {
    fn write(&mut self, src: &[u8]) -> MemoryResult<()> {
        self.size += src.len();
        Ok(())
    }

    fn write_tensor(&mut self, _tensor: &TensorBuf, _offset: usize, size: usize) -> MemoryResult<()> {
        self.size += size;
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.size
    }
}

/// In-memory source.
#[derive(Debug)]
pub struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl StateRead for SliceReader<'_> {
    fn read(&mut self, n: usize) -> MemoryResult<&[u8]> {
        if n > self.remaining() {
            return Err(MemoryError::state_format(format!(
                "unexpected end of state: need {n} bytes, {} left",
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    fn n_bytes(&self) -> usize {
        self.pos
    }
}

/// Buffered file sink.
#[derive(Debug)]
pub struct FileWriter {
    inner: BufWriter<File>,
    written: usize,
}

impl FileWriter {
    pub fn create(path: impl AsRef<Path>) -> MemoryResult<Self> {
        Ok(Self {
            inner: BufWriter::new(File::create(path)?),
            written: 0,
        })
    }

    /// Flush buffered bytes to disk.
    pub fn finish(mut self) -> MemoryResult<usize> {
        self.inner.flush()?;
        Ok(self.written)
    }
}

impl StateWrite for FileWriter {
    fn write(&mut self, src: &[u8]) -> MemoryResult<()> {
        self.inner.write_all(src)?;
        self.written += src.len();
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.written
    }
}

/// Buffered file source.
#[derive(Debug)]
pub struct FileReader {
    inner: BufReader<File>,
    scratch: Vec<u8>,
    consumed: usize,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> MemoryResult<Self> {
        Ok(Self {
            inner: BufReader::new(File::open(path)?),
            scratch: Vec::new(),
            consumed: 0,
        })
    }
}

impl StateRead for FileReader {
    fn read(&mut self, n: usize) -> MemoryResult<&[u8]> {
        self.scratch.resize(n, 0);
        self.inner.read_exact(&mut self.scratch).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                MemoryError::state_format(format!("unexpected end of state file reading {n} bytes"))
            } else {
                MemoryError::Io(e)
            }
        })?;
        self.consumed += n;
        Ok(&self.scratch)
    }

    fn read_to(&mut self, dst: &mut [u8]) -> MemoryResult<()> {
        let n = dst.len();
        self.inner.read_exact(dst).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                MemoryError::state_format(format!("unexpected end of state file reading {n} bytes"))
            } else {
                MemoryError::Io(e)
            }
        })?;
        self.consumed += n;
        Ok(())
    }

    fn n_bytes(&self) -> usize {
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DType;

    #[test]
    fn test_scalar_and_string_codec() {
        let mut w = BufferWriter::new();
        w.write_u32(7).unwrap();
        w.write_i32(-1).unwrap();
        w.write_u64(1 << 40).unwrap();
        w.write_string("kv-cache").unwrap();
        assert_eq!(w.n_bytes(), 4 + 4 + 8 + 4 + 8);

        let bytes = w.into_inner();
        let mut r = SliceReader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_i32().unwrap(), -1);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_string().unwrap(), "kv-cache");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_fails() {
        let bytes = [1u8, 0];
        let mut r = SliceReader::new(&bytes);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err, MemoryError::StateFormat(_)));
    }

    #[test]
    fn test_string_length_guard() {
        let mut w = BufferWriter::new();
        w.write_u32(u32::MAX).unwrap();
        let bytes = w.into_inner();
        assert!(SliceReader::new(&bytes).read_string().is_err());
    }

    #[test]
    fn test_size_counter_matches_buffer() {
        let mut tensor = TensorBuf::zeros("t", DType::F16, 4, 2);
        tensor.row_mut(1).fill(3);

        let mut counter = SizeCounter::new();
        let mut buf = BufferWriter::new();
        for w in [&mut counter as &mut dyn StateWrite, &mut buf] {
            w.write_string("x").unwrap();
            w.write_tensor(&tensor, 8, 8).unwrap();
        }
        assert_eq!(counter.n_bytes(), buf.n_bytes());
        assert_eq!(&buf.as_bytes()[5..], &[3; 8]);
    }

    #[test]
    fn test_slice_writer_overflow() {
        let mut storage = [0u8; 6];
        let mut w = SliceWriter::new(&mut storage);
        w.write_u32(1).unwrap();
        assert!(w.write_u32(2).is_err());
        assert_eq!(w.n_bytes(), 4);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let mut w = FileWriter::create(&path).unwrap();
        w.write_string("recurrent").unwrap();
        w.write_u32(42).unwrap();
        assert_eq!(w.finish().unwrap(), 4 + 9 + 4);

        let mut r = FileReader::open(&path).unwrap();
        assert_eq!(r.read_string().unwrap(), "recurrent");
        assert_eq!(r.read_u32().unwrap(), 42);
        assert!(r.read_u32().is_err());
    }
}
