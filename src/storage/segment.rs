//! Bucket Segment Store
//!
//! Append-only record log for one cache bucket, memory-mapped for
//! persistence. Each record carries the entry's hash, accounting size,
//! plugin identity, owned tile indices and the marshalled payload, so a
//! bucket index can be rebuilt by scanning the log on reopen.
//!
//! Records are never rewritten in place; removal flips a liveness flag and
//! the space is reclaimed when the store is reset.

use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::entry::TileIndex;
use crate::error::{Error, Result};
use crate::storage::mapped::MappedRegion;

const MAGIC: u32 = 0x5443_5347;
const VERSION: u32 = 1;
/// magic + version + logical append offset
const HEADER_SIZE: usize = 16;

const FLAG_DEAD: u8 = 0;
const FLAG_LIVE: u8 = 1;

/// Index entry rebuilt from a segment scan
#[derive(Debug, Clone)]
pub(crate) struct RecoveredRecord {
    pub hash: u64,
    pub size: u64,
    pub plugin_id: String,
    pub tiles: Vec<TileIndex>,
    /// Record start offset, used for later reads and dead-marking
    pub offset: u64,
}

struct StoreState {
    region: MappedRegion,
    append: usize,
}

/// Append-only mapped record log for one bucket
pub(crate) struct SegmentStore {
    state: Mutex<StoreState>,
    bucket: usize,
}

impl SegmentStore {
    /// Open or create the store, returning the live records found in it
    pub fn open(path: &Path, bucket: usize) -> Result<(Self, Vec<RecoveredRecord>)> {
        let mut region = MappedRegion::open(path, HEADER_SIZE)?;

        let (append, records) = if read_u32(region.as_slice(), 0) == Some(MAGIC) {
            let append = read_u64(region.as_slice(), 8).unwrap_or(HEADER_SIZE as u64) as usize;
            let append = append.clamp(HEADER_SIZE, region.len());
            let (records, good_end) = scan(region.as_slice(), append, bucket);
            (good_end, records)
        } else {
            // Fresh or foreign file: initialize the header
            write_u32(region.as_mut_slice(), 0, MAGIC);
            write_u32(region.as_mut_slice(), 4, VERSION);
            write_u64(region.as_mut_slice(), 8, HEADER_SIZE as u64);
            (HEADER_SIZE, Vec::new())
        };

        debug!(bucket, entries = records.len(), "segment store opened");
        Ok((
            Self {
                state: Mutex::new(StoreState { region, append }),
                bucket,
            },
            records,
        ))
    }

    /// Append a record, growing the backing file as needed.
    /// Returns the record's start offset.
    pub fn append(
        &self,
        hash: u64,
        size: u64,
        plugin_id: &str,
        tiles: &[TileIndex],
        payload: &[u8],
    ) -> Result<u64> {
        let plugin = plugin_id.as_bytes();
        if plugin.len() > u16::MAX as usize {
            return Err(Error::Serialization("plugin id too long".to_string()));
        }
        let record_len =
            1 + 8 + 8 + 2 + plugin.len() + 4 + tiles.len() * 4 + 4 + payload.len();

        let mut state = self.state.lock();
        let offset = state.append;
        let needed = offset + record_len;
        if needed > state.region.len() {
            let new_len = needed.max(state.region.len() * 2);
            state.region.grow(new_len)?;
        }

        let buf = state.region.as_mut_slice();
        let mut pos = offset;
        buf[pos] = FLAG_LIVE;
        pos += 1;
        write_u64(buf, pos, hash);
        pos += 8;
        write_u64(buf, pos, size);
        pos += 8;
        write_u16(buf, pos, plugin.len() as u16);
        pos += 2;
        buf[pos..pos + plugin.len()].copy_from_slice(plugin);
        pos += plugin.len();
        write_u32(buf, pos, tiles.len() as u32);
        pos += 4;
        for &tile in tiles {
            write_u32(buf, pos, tile);
            pos += 4;
        }
        write_u32(buf, pos, payload.len() as u32);
        pos += 4;
        buf[pos..pos + payload.len()].copy_from_slice(payload);
        pos += payload.len();

        state.append = pos;
        write_u64(state.region.as_mut_slice(), 8, pos as u64);
        Ok(offset as u64)
    }

    /// Copy out the payload of the record starting at `offset`
    pub fn read_payload(&self, offset: u64) -> Result<Bytes> {
        let state = self.state.lock();
        let buf = state.region.as_slice();
        let parsed = parse_record(buf, offset as usize, state.append).ok_or_else(|| {
            Error::CorruptSegment {
                bucket: self.bucket,
                reason: format!("unreadable record at offset {}", offset),
            }
        })?;
        if parsed.flag != FLAG_LIVE {
            return Err(Error::CorruptSegment {
                bucket: self.bucket,
                reason: format!("record at offset {} is dead", offset),
            });
        }
        Ok(Bytes::copy_from_slice(
            &buf[parsed.payload_start..parsed.payload_start + parsed.payload_len],
        ))
    }

    /// Flip the record at `offset` to dead so a reopen skips it
    pub fn mark_dead(&self, offset: u64) {
        let mut state = self.state.lock();
        let offset = offset as usize;
        if offset < state.append {
            state.region.as_mut_slice()[offset] = FLAG_DEAD;
        }
    }

    /// Drop all records, keeping the file and header
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.append = HEADER_SIZE;
        write_u64(state.region.as_mut_slice(), 8, HEADER_SIZE as u64);
    }

    pub fn flush(&self) -> Result<()> {
        self.state.lock().region.flush()
    }

    pub fn flush_async(&self) -> Result<()> {
        self.state.lock().region.flush_async()
    }
}

struct ParsedRecord {
    flag: u8,
    hash: u64,
    size: u64,
    plugin_end: usize,
    plugin_start: usize,
    tiles_start: usize,
    tile_count: usize,
    payload_start: usize,
    payload_len: usize,
    end: usize,
}

fn parse_record(buf: &[u8], offset: usize, append: usize) -> Option<ParsedRecord> {
    let mut pos = offset;
    if pos + 1 + 8 + 8 + 2 > append {
        return None;
    }
    let flag = buf[pos];
    pos += 1;
    let hash = read_u64(buf, pos)?;
    pos += 8;
    let size = read_u64(buf, pos)?;
    pos += 8;
    let plugin_len = read_u16(buf, pos)? as usize;
    pos += 2;
    let plugin_start = pos;
    pos += plugin_len;
    if pos + 4 > append {
        return None;
    }
    let plugin_end = pos;
    let tile_count = read_u32(buf, pos)? as usize;
    pos += 4;
    let tiles_start = pos;
    pos += tile_count * 4;
    if pos + 4 > append {
        return None;
    }
    let payload_len = read_u32(buf, pos)? as usize;
    pos += 4;
    let payload_start = pos;
    pos += payload_len;
    if pos > append {
        return None;
    }
    Some(ParsedRecord {
        flag,
        hash,
        size,
        plugin_start,
        plugin_end,
        tiles_start,
        tile_count,
        payload_start,
        payload_len,
        end: pos,
    })
}

/// Walk records up to `append`, collecting live ones. Returns the records
/// and the end of the last record that parsed cleanly; a torn tail is
/// discarded.
fn scan(buf: &[u8], append: usize, bucket: usize) -> (Vec<RecoveredRecord>, usize) {
    let mut records = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos < append {
        match parse_record(buf, pos, append) {
            Some(parsed) => {
                if parsed.flag == FLAG_LIVE {
                    let plugin_id =
                        String::from_utf8_lossy(&buf[parsed.plugin_start..parsed.plugin_end])
                            .into_owned();
                    let tiles = (0..parsed.tile_count)
                        .filter_map(|i| read_u32(buf, parsed.tiles_start + i * 4))
                        .collect();
                    records.push(RecoveredRecord {
                        hash: parsed.hash,
                        size: parsed.size,
                        plugin_id,
                        tiles,
                        offset: pos as u64,
                    });
                }
                pos = parsed.end;
            }
            None => {
                warn!(bucket, offset = pos, "discarding torn segment tail");
                break;
            }
        }
    }
    (records, pos)
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    buf.get(pos..pos + 2).map(|b| u16::from_le_bytes(b.try_into().unwrap()))
}

fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    buf.get(pos..pos + 4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: usize) -> Option<u64> {
    buf.get(pos..pos + 8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn write_u16(buf: &mut [u8], pos: usize, v: u16) {
    buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut [u8], pos: usize, v: u64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

// =============================================================================
// Tests
// =============================================================================
