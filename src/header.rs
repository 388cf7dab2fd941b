//! The two-copy file header.
//!
//! A header is a human-readable `key:value,key:value,...` map, UTF-8,
//! padded with trailing spaces to exactly [`crate::BLOCK_SIZE`] bytes, with
//! a trailing `fletcher:<hex>` entry covering everything written before it
//! (plus one space placeholder).

use std::collections::BTreeMap;

use crate::fletcher::fletcher32;
use crate::{StoreError, BLOCK_SIZE};

/// Current on-disk format tag (`H`).
pub const FORMAT_TAG: &str = "3";
/// Newest write format this implementation produces.
pub const FORMAT_WRITE: u32 = 1;
/// Newest read format this implementation understands.
pub const FORMAT_READ: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub format: u32,
    pub format_read: Option<u32>,
    pub block_size: usize,
    pub creation_time: u64,
    pub version: u64,
    pub root_chunk: u64,
    pub last_map_id: u32,
}

impl FileHeader {
    pub fn new_for_empty_store(now: u64) -> Self {
        Self {
            format: FORMAT_WRITE,
            format_read: None,
            block_size: BLOCK_SIZE,
            creation_time: now,
            version: 0,
            root_chunk: 0,
            last_map_id: 0,
        }
    }

    /// Serialize into a `BLOCK_SIZE`-byte buffer, checksummed and padded.
    pub fn serialize(&self) -> crate::Result<[u8; BLOCK_SIZE]> {
        let mut preamble = format!(
            "H:{tag},blockSize:{bs},format:{fmt},creationTime:{ct},version:{ver},rootChunk:{rc},lastMapId:{lmi}",
            tag = FORMAT_TAG,
            bs = self.block_size,
            fmt = self.format,
            ct = self.creation_time,
            ver = self.version,
            rc = self.root_chunk,
            lmi = self.last_map_id,
        );
        if let Some(fr) = self.format_read {
            preamble.push_str(&format!(",formatRead:{fr}"));
        }
        preamble.push(',');

        // Fletcher-32 operates on whole 16-bit words; pad the preamble with
        // one placeholder space before checksumming.
        let mut to_checksum = preamble.clone().into_bytes();
        to_checksum.push(b' ');
        let checksum = fletcher32(&to_checksum);

        let mut out = preamble.into_bytes();
        out.extend_from_slice(format!("fletcher:{checksum:08x}").as_bytes());

        if out.len() > BLOCK_SIZE {
            return Err(StoreError::illegal_argument(format!(
                "file header ({} bytes) does not fit in one block of {BLOCK_SIZE} bytes",
                out.len()
            )));
        }
        let mut block = [b' '; BLOCK_SIZE];
        block[..out.len()].copy_from_slice(&out);
        Ok(block)
    }

    /// Parse and checksum-validate one candidate header block.
    ///
    /// Returns `None` rather than erroring if the fletcher checksum does not
    /// match: a failed candidate is simply discarded, not fatal, unless
    /// every candidate fails.
    pub fn parse(block: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(block).ok()?;
        let trimmed_end = text.trim_end_matches(' ');

        let fletcher_marker = "fletcher:";
        let fletcher_pos = trimmed_end.rfind(fletcher_marker)?;
        let (preamble_with_comma, fletcher_field) = trimmed_end.split_at(fletcher_pos);
        let claimed: u32 = u32::from_str_radix(&fletcher_field[fletcher_marker.len()..], 16).ok()?;

        let mut to_checksum = preamble_with_comma.as_bytes().to_vec();
        to_checksum.push(b' ');
        if fletcher32(&to_checksum) != claimed {
            return None;
        }

        let preamble = preamble_with_comma.trim_end_matches(',');
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for kv in preamble.split(',') {
            let (k, v) = kv.split_once(':')?;
            fields.insert(k, v);
        }

        if *fields.get("H")? != FORMAT_TAG {
            return None;
        }

        Some(FileHeader {
            format: fields.get("format")?.parse().ok()?,
            format_read: fields.get("formatRead").and_then(|s| s.parse().ok()),
            block_size: fields.get("blockSize")?.parse().ok()?,
            creation_time: fields.get("creationTime")?.parse().ok()?,
            version: fields.get("version")?.parse().ok()?,
            root_chunk: fields.get("rootChunk")?.parse().ok()?,
            last_map_id: fields.get("lastMapId")?.parse().ok()?,
        })
    }

    /// Pick the authoritative header among up to three candidate blocks
    /// (block 0, block 1, and the last block of the file): the valid one
    /// with the largest `version` wins.
    pub fn pick_newest(candidates: &[Option<&[u8]>]) -> crate::Result<Self> {
        candidates
            .iter()
            .flatten()
            .filter_map(|block| Self::parse(block))
            .max_by_key(|h| h.version)
            .ok_or(StoreError::HeaderCorrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = FileHeader {
            format: 1,
            format_read: None,
            block_size: BLOCK_SIZE,
            creation_time: 1_700_000_000,
            version: 17,
            root_chunk: 2 * BLOCK_SIZE as u64,
            last_map_id: 3,
        };
        let block = header.serialize().unwrap();
        let parsed = FileHeader::parse(&block).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_flipped_byte() {
        let header = FileHeader::new_for_empty_store(0);
        let mut block = header.serialize().unwrap();
        block[5] ^= 0x01;
        assert!(FileHeader::parse(&block).is_none());
    }

    #[test]
    fn pick_newest_prefers_highest_version() {
        let old = FileHeader { version: 1, ..FileHeader::new_for_empty_store(0) };
        let new = FileHeader { version: 2, ..FileHeader::new_for_empty_store(0) };
        let old_block = old.serialize().unwrap();
        let new_block = new.serialize().unwrap();
        let picked = FileHeader::pick_newest(&[Some(&old_block), Some(&new_block), None]).unwrap();
        assert_eq!(picked.version, 2);
    }

    #[test]
    fn all_corrupt_is_fatal() {
        let mut block = FileHeader::new_for_empty_store(0).serialize().unwrap();
        block[0] ^= 0xFF;
        let err = FileHeader::pick_newest(&[Some(&block), None, None]).unwrap_err();
        assert!(matches!(err, StoreError::HeaderCorrupt));
    }
}
