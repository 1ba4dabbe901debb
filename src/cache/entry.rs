//! Cache Entry Contract
//!
//! Entries carry their own 64-bit content hash and know how to marshal
//! themselves into and out of a raw storage segment. Marshalling code only
//! ever sees a [`SegmentWriter`] or [`SegmentReader`]; neither type offers a
//! route back into the cache, so entry implementations cannot re-enter the
//! tile allocator while its lock is held.

use bytes::Bytes;

use crate::error::{Error, Result};

/// 64-bit content hash identifying an entry. The top 8 bits select the
/// owning bucket.
pub type ContentHash = u64;

/// Index of a fixed-size tile inside the tile pool.
pub type TileIndex = u32;

/// Contract implemented by anything stored in the cache.
///
/// `size_bytes` feeds capacity accounting and should include payload bytes
/// held outside the tile pool. `tile_indices` lists the tiles the entry owns;
/// they are released back to the pool when the entry is destroyed.
///
/// The marshalling pair is only required for entries inserted into a
/// persistent cache. The default implementations report the entry as
/// memory-only.
pub trait CacheEntry: Send + Sync + 'static {
    /// Content hash of this entry's key
    fn content_hash(&self) -> ContentHash;

    /// Approximate byte footprint, for capacity accounting
    fn size_bytes(&self) -> usize;

    /// Identity of the producer, for per-plugin reporting
    fn plugin_id(&self) -> &str {
        ""
    }

    /// Tiles owned by this entry, released when the entry is destroyed
    fn tile_indices(&self) -> Vec<TileIndex> {
        Vec::new()
    }

    /// Serialize the entry payload into a storage segment
    fn to_memory_segment(&self, writer: &mut SegmentWriter) -> Result<()> {
        let _ = writer;
        Err(Error::NotSupported("entry does not support serialization"))
    }

    /// Reconstruct the entry payload from a storage segment
    fn from_memory_segment(&mut self, reader: &mut SegmentReader<'_>) -> Result<()> {
        let _ = reader;
        Err(Error::NotSupported("entry does not support deserialization"))
    }
}

/// Write half of the segment marshalling capability.
///
/// Little-endian fixed-width integers plus raw byte runs. Entries do their
/// own framing on top.
#[derive(Debug, Default)]
pub struct SegmentWriter {
    buf: Vec<u8>,
}

impl SegmentWriter {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Raw byte run, no length prefix
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// Read half of the segment marshalling capability.
#[derive(Debug)]
pub struct SegmentReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SegmentReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Serialization(format!(
                "segment underflow: wanted {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Raw byte run of exactly `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_round_trip() {
        let mut writer = SegmentWriter::new();
        writer.write_u8(0xAB);
        writer.write_u16(0x1234);
        writer.write_u32(0xDEADBEEF);
        writer.write_u64(0x0123_4567_89AB_CDEF);
        writer.write_f64(std::f64::consts::PI);
        writer.write_bytes(b"payload");

        let bytes = writer.into_bytes();
        let mut reader = SegmentReader::new(&bytes);

        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(reader.read_f64().unwrap(), std::f64::consts::PI);
        assert_eq!(reader.read_bytes(7).unwrap(), b"payload");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_underflow() {
        let buf = [0u8; 3];
        let mut reader = SegmentReader::new(&buf);
        assert!(reader.read_u64().is_err());
        // Position is untouched by a failed read
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn test_default_marshalling_unsupported() {
        struct Opaque;
        impl CacheEntry for Opaque {
            fn content_hash(&self) -> ContentHash {
                1
            }
            fn size_bytes(&self) -> usize {
                0
            }
        }

        let entry = Opaque;
        let mut writer = SegmentWriter::new();
        assert!(entry.to_memory_segment(&mut writer).is_err());
    }
}
