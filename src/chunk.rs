//! Chunk descriptors: on-disk binary header and meta-map text form.

use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::varint::{read_var_u32, read_var_u64, write_var_u32, write_var_u64};
use crate::{StoreError, BLOCK_SIZE};

/// Chunk header is reserved on disk at `chunk.start`. spec.md §6 frames the
/// header's exact binary form as "opaque to the spec beyond" containing at
/// minimum id/metaRootPos/length/pageCount, so the reserved size is an
/// implementation choice, not a wire-compatibility constant.
///
/// The varint-encoded `id`/`pageCount`/`maxLength`/`maxLengthLive` fields
/// are not bounded to one byte each in practice: `maxLength`/`maxLengthLive`
/// are running sums over every page in a chunk (including the meta map's
/// own leaf, which alone typically exceeds 127 bytes once a chunk holds
/// more than a couple of keys), so they commonly need two or more varint
/// bytes well before a chunk is "large" by any real measure. 64 bytes
/// leaves headroom for that in the common case while still being far
/// smaller than `BLOCK_SIZE`; `encode_header` still checks the budget and
/// returns an error rather than assuming it always fits.
pub const CHUNK_HEADER_SIZE: usize = 64;

/// A chunk is always rounded up to a whole number of blocks.
pub fn round_up_to_block(len: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (len + block - 1) / block * block
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    pub start: u64,
    pub length: u64,
    pub meta_root_pos: u64,
    pub version: u64,
    pub time: u64,
    pub page_count: u32,
    pub max_length: u64,
    pub max_length_live: u64,
}

impl Chunk {
    /// A chunk's own `start`/`length` aren't known until the allocator runs
    /// (spec.md §4.2 step 9), after this chunk's meta entry has already been
    /// serialized into the meta map (step 3) — so this placeholder's text
    /// form is baked into this very chunk's own `maxLength` accounting. `0`
    /// is deliberately used rather than a large sentinel like `u64::MAX`:
    /// the placeholder only needs to give meta a stable *key* to update
    /// next commit (see `Store::store`'s meta-lag correction), not a
    /// realistic value, and a short placeholder keeps this chunk's own
    /// footprint close to what it would be without the sentinel at all.
    pub fn new_placeholder(id: u32, version: u64, time: u64) -> Self {
        Self {
            id,
            start: 0,
            length: 0,
            meta_root_pos: 0,
            version,
            time,
            page_count: 0,
            max_length: 0,
            max_length_live: 0,
        }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.start..self.start + self.length
    }

    /// `true` once every live byte has been superseded.
    pub fn is_dead(&self) -> bool {
        self.max_length_live == 0
    }

    pub fn fill_rate_percent(&self) -> u32 {
        if self.max_length == 0 {
            return 100;
        }
        ((100 * self.max_length_live) / self.max_length) as u32
    }

    /// Encode the fixed binary chunk header written at `chunk.start` on disk.
    /// Always `CHUNK_HEADER_SIZE` bytes, zero-padded.
    ///
    /// Returns an error rather than panicking if the varint-encoded fields
    /// don't fit the reserved budget: an oversized chunk (or one with an
    /// unexpectedly large `maxLength`) is a caller-visible condition, not an
    /// invariant violation that should abort the process.
    pub fn encode_header(&self) -> crate::Result<[u8; CHUNK_HEADER_SIZE]> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE);
        write_var_u32(&mut buf, self.id).unwrap();
        write_var_u32(&mut buf, self.page_count).unwrap();
        write_var_u64(&mut buf, self.max_length).unwrap();
        write_var_u64(&mut buf, self.max_length_live).unwrap();
        buf.write_u64::<LE>(self.meta_root_pos).unwrap();
        buf.write_u64::<LE>(self.start).unwrap();
        buf.write_u32::<LE>(self.length as u32).unwrap();
        buf.write_u64::<LE>(self.version).unwrap();
        buf.write_u64::<LE>(self.time).unwrap();
        if buf.len() > CHUNK_HEADER_SIZE {
            return Err(StoreError::illegal_state(format!(
                "chunk {} header needs {} bytes, more than the {CHUNK_HEADER_SIZE}-byte reserved budget",
                self.id,
                buf.len()
            )));
        }
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[..buf.len()].copy_from_slice(&buf);
        Ok(out)
    }

    pub fn decode_header(buf: &[u8; CHUNK_HEADER_SIZE]) -> crate::Result<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let read_io = |_: std::io::Error| StoreError::DataCorruption {
            offset: 0,
            len: CHUNK_HEADER_SIZE,
        };
        let id = read_var_u32(&mut cursor).map_err(read_io)?;
        let page_count = read_var_u32(&mut cursor).map_err(read_io)?;
        let max_length = read_var_u64(&mut cursor).map_err(read_io)?;
        let max_length_live = read_var_u64(&mut cursor).map_err(read_io)?;

        let meta_root_pos = cursor.read_u64::<LE>().map_err(read_io)?;
        let start = cursor.read_u64::<LE>().map_err(read_io)?;
        let length = cursor.read_u32::<LE>().map_err(read_io)? as u64;
        let version = cursor.read_u64::<LE>().map_err(read_io)?;
        let time = cursor.read_u64::<LE>().map_err(read_io)?;

        if max_length_live > max_length {
            return Err(StoreError::illegal_state(format!(
                "chunk {id}: maxLengthLive {max_length_live} exceeds maxLength {max_length}"
            )));
        }

        Ok(Chunk {
            id,
            start,
            length,
            meta_root_pos,
            version,
            time,
            page_count,
            max_length,
            max_length_live,
        })
    }

    /// Serialize to the `key=value,...` text form stored as the meta map's
    /// `chunk.<id>` value.
    pub fn to_meta_value(&self) -> String {
        format!(
            "id={},start={},length={},metaRoot={},version={},time={},pageCount={},maxLen={},maxLenLive={}",
            self.id, self.start, self.length, self.meta_root_pos, self.version, self.time,
            self.page_count, self.max_length, self.max_length_live,
        )
    }

    pub fn from_meta_value(value: &str) -> crate::Result<Self> {
        let bad = || StoreError::illegal_state(format!("malformed chunk metadata: {value}"));
        let mut fields = std::collections::HashMap::new();
        for kv in value.split(',') {
            let (k, v) = kv.split_once('=').ok_or_else(bad)?;
            fields.insert(k, v);
        }
        let get = |k: &str| fields.get(k).copied().ok_or_else(bad);
        let parse = |k: &str| get(k)?.parse().map_err(|_| bad());
        Ok(Chunk {
            id: parse("id")?,
            start: parse("start")?,
            length: parse("length")?,
            meta_root_pos: parse("metaRoot")?,
            version: parse("version")?,
            time: parse("time")?,
            page_count: parse("pageCount")?,
            max_length: parse("maxLen")?,
            max_length_live: parse("maxLenLive")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_header_round_trips() {
        let chunk = Chunk {
            id: 7,
            start: 2 * BLOCK_SIZE as u64,
            length: 5 * BLOCK_SIZE as u64,
            meta_root_pos: 123_456,
            version: 42,
            time: 1000,
            page_count: 300,
            max_length: 9000,
            max_length_live: 4500,
        };
        let header = chunk.encode_header().unwrap();
        let decoded = Chunk::decode_header(&header).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn meta_value_round_trips() {
        let chunk = Chunk::new_placeholder(1, 1, 0);
        let text = chunk.to_meta_value();
        let decoded = Chunk::from_meta_value(&text).unwrap();
        // new_placeholder's start/length sentinel round-trips too.
        assert_eq!(decoded.id, chunk.id);
        assert_eq!(decoded.start, chunk.start);
    }

    #[test]
    fn rejects_live_exceeding_max() {
        let mut chunk = Chunk::new_placeholder(1, 1, 0);
        chunk.max_length = 10;
        chunk.max_length_live = 20;
        let header = chunk.encode_header().unwrap();
        assert!(Chunk::decode_header(&header).is_err());
    }

    #[test]
    fn encode_header_errors_rather_than_panics_when_oversized() {
        let chunk = Chunk {
            id: u32::MAX,
            start: u64::MAX,
            length: u64::MAX,
            meta_root_pos: u64::MAX,
            version: u64::MAX,
            time: u64::MAX,
            page_count: u32::MAX,
            max_length: u64::MAX,
            max_length_live: u64::MAX,
        };
        assert!(chunk.encode_header().is_err());
    }
}
