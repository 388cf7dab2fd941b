//! In-memory B-tree pages.
//!
//! A page is an ordered node: a leaf holds keys and values directly, an
//! internal node holds separator keys plus one more child than it has keys.
//! Pages are immutable values; any logical mutation produces a *new* `Page`
//! and the caller threads the new reference up to a new root
//! (copy-on-write). Structural sharing across versions falls out of using
//! `Arc<Page>` for children: an untouched subtree is simply cloned by
//! reference, never by value.

use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use xxhash_rust::xxh3::xxh3_64;

use crate::varint::{read_var_u32, read_var_u64, write_var_u32, write_var_u64};
use crate::{position, StoreError};

/// Pages are split once their serialized payload would exceed this many
/// bytes. A soft target rather than a hard on-disk page size: B-tree nodes
/// here are variable length.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 4096;

/// Fixed per-entry bookkeeping overhead counted toward a page's memory
/// estimate, on top of actual key/value bytes. Keeps the cache's cost
/// estimate cheap to maintain incrementally without calling into an
/// allocator.
const ENTRY_OVERHEAD: usize = 16;

#[derive(Debug, Clone)]
pub enum Child {
    /// Already durably persisted; must be resolved through the store/cache
    /// to get at its content.
    Saved(u64),
    /// Created or modified since the last commit; not yet written anywhere.
    Unsaved(Arc<Page>),
}

impl Child {
    pub fn position(&self) -> u64 {
        match self {
            Child::Saved(pos) => *pos,
            Child::Unsaved(_) => position::EMPTY,
        }
    }

    pub fn is_unsaved(&self) -> bool {
        matches!(self, Child::Unsaved(_))
    }
}

/// Callback the page layer uses to pull a page into memory given its
/// position, going through the store's page cache. Kept as a trait so
/// `page.rs` has no dependency on `store.rs`.
pub trait PageSource {
    fn load(&mut self, pos: u64) -> crate::Result<Arc<Page>>;

    /// Called whenever a previously-saved page at `pos` has just been
    /// superseded by a newer version. A no-op for `pos == 0` (never-saved
    /// pages carry no chunk accounting).
    fn note_freed(&mut self, pos: u64);
}

#[derive(Debug, Clone)]
pub enum PageKind {
    Leaf(Vec<Box<[u8]>>),
    Node { children: Vec<Child>, counts: Vec<u64> },
}

#[derive(Debug, Clone)]
pub struct Page {
    pub map_id: u32,
    pub keys: Vec<Box<[u8]>>,
    pub kind: PageKind,
}

/// Outcome of inserting into a subtree: either it still fits in one page, or
/// it had to split into two siblings joined by a separator key.
pub enum PutOutcome {
    Single(Arc<Page>),
    Split { left: Arc<Page>, separator: Box<[u8]>, right: Arc<Page> },
}

impl Page {
    pub fn new_leaf(map_id: u32, keys: Vec<Box<[u8]>>, values: Vec<Box<[u8]>>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        Self { map_id, keys, kind: PageKind::Leaf(values) }
    }

    pub fn new_node(map_id: u32, keys: Vec<Box<[u8]>>, children: Vec<Child>, counts: Vec<u64>) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        debug_assert_eq!(children.len(), counts.len());
        Self { map_id, keys, kind: PageKind::Node { children, counts } }
    }

    pub fn empty_leaf(map_id: u32) -> Self {
        Self::new_leaf(map_id, Vec::new(), Vec::new())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, PageKind::Leaf(_))
    }

    /// Number of key/value entries in this subtree.
    pub fn entry_count(&self) -> u64 {
        match &self.kind {
            PageKind::Leaf(values) => values.len() as u64,
            PageKind::Node { counts, .. } => counts.iter().sum(),
        }
    }

    /// Rough in-memory footprint, used both for cache accounting and as
    /// the page-split trigger.
    pub fn memory_estimate(&self) -> usize {
        let keys_bytes: usize = self.keys.iter().map(|k| k.len() + ENTRY_OVERHEAD).sum();
        let body_bytes = match &self.kind {
            PageKind::Leaf(values) => values.iter().map(|v| v.len()).sum(),
            PageKind::Node { children, .. } => children.len() * 8,
        };
        keys_bytes + body_bytes + 32
    }

    fn find_child_index(&self, key: &[u8]) -> usize {
        // keys[i] is the smallest key reachable through children[i + 1].
        self.keys.partition_point(|k| k.as_ref() <= key)
    }

    pub fn get(&self, map_id: u32, key: &[u8], source: &mut dyn PageSource) -> crate::Result<Option<Box<[u8]>>> {
        match &self.kind {
            PageKind::Leaf(values) => {
                Ok(self.keys.binary_search_by(|k| k.as_ref().cmp(key)).ok().map(|i| values[i].clone()))
            }
            PageKind::Node { children, .. } => {
                let idx = self.find_child_index(key);
                let child = resolve(&children[idx], source)?;
                child.get(map_id, key, source)
            }
        }
    }

    pub fn put(
        self: &Arc<Self>,
        key: Box<[u8]>,
        value: Box<[u8]>,
        source: &mut dyn PageSource,
        max_page_size: usize,
    ) -> crate::Result<(PutOutcome, Option<Box<[u8]>>)> {
        match &self.kind {
            PageKind::Leaf(values) => {
                let mut keys = self.keys.clone();
                let mut values = values.clone();
                let old = match keys.binary_search_by(|k| k.as_ref().cmp(&key)) {
                    Ok(i) => {
                        let old = std::mem::replace(&mut values[i], value);
                        Some(old)
                    }
                    Err(i) => {
                        keys.insert(i, key);
                        values.insert(i, value);
                        None
                    }
                };
                let page = Page::new_leaf(self.map_id, keys, values);
                Ok((split_leaf_if_needed(self.map_id, page, max_page_size), old))
            }
            PageKind::Node { children, counts } => {
                let idx = self.find_child_index(&key);
                let old_pos = children[idx].position();
                let child = resolve(&children[idx], source)?;
                let (outcome, old) = child.put(key, value, source, max_page_size)?;
                if old_pos != position::EMPTY {
                    source.note_freed(old_pos);
                }

                let mut keys = self.keys.clone();
                let mut new_children = children.clone();
                let mut new_counts = counts.clone();
                match outcome {
                    PutOutcome::Single(new_child) => {
                        new_counts[idx] = new_child.entry_count();
                        new_children[idx] = Child::Unsaved(new_child);
                    }
                    PutOutcome::Split { left, separator, right } => {
                        new_counts[idx] = left.entry_count();
                        new_children[idx] = Child::Unsaved(left);
                        keys.insert(idx, separator);
                        new_children.insert(idx + 1, Child::Unsaved(Arc::clone(&right)));
                        new_counts.insert(idx + 1, right.entry_count());
                    }
                }
                let page = Page::new_node(self.map_id, keys, new_children, new_counts);
                Ok((split_node_if_needed(self.map_id, page, max_page_size), old))
            }
        }
    }

    /// Remove a key. Unlike `put`, never merges underfull siblings back
    /// together; MVCC B-trees of this style rely on compaction, not
    /// merge-on-remove, to reclaim space from sparse pages.
    pub fn remove(
        self: &Arc<Self>,
        key: &[u8],
        source: &mut dyn PageSource,
    ) -> crate::Result<(Arc<Page>, Option<Box<[u8]>>)> {
        match &self.kind {
            PageKind::Leaf(values) => match self.keys.binary_search_by(|k| k.as_ref().cmp(key)) {
                Ok(i) => {
                    let mut keys = self.keys.clone();
                    let mut values = values.clone();
                    keys.remove(i);
                    let old = values.remove(i);
                    Ok((Arc::new(Page::new_leaf(self.map_id, keys, values)), Some(old)))
                }
                Err(_) => Ok((Arc::clone(self), None)),
            },
            PageKind::Node { children, counts } => {
                let idx = self.find_child_index(key);
                let old_pos = children[idx].position();
                let child = resolve(&children[idx], source)?;
                let (new_child, old) = child.remove(key, source)?;
                if old.is_none() {
                    return Ok((Arc::clone(self), None));
                }
                if old_pos != position::EMPTY {
                    source.note_freed(old_pos);
                }
                let mut new_children = children.clone();
                let mut new_counts = counts.clone();
                new_counts[idx] = new_child.entry_count();
                new_children[idx] = Child::Unsaved(new_child);
                let page = Page::new_node(self.map_id, self.keys.clone(), new_children, new_counts);
                Ok((Arc::new(page), old))
            }
        }
    }

    /// Recursively persist every unsaved descendant, then this page itself,
    /// appending serialized bytes to `buf` and returning this page's final
    /// position. Children are written before parents, so a parent always
    /// embeds the real position of an already-serialized child.
    ///
    /// `max_length_acc` accumulates `class_length(class)` for every page
    /// written, not the raw serialized byte count: a chunk's `maxLength` is
    /// the nominal sum of all page max-lengths, i.e. the same rounded-class
    /// basis `note_freed` later subtracts from `maxLengthLive`. Keeping both
    /// sides of that ledger on the same basis is what lets `maxLengthLive`
    /// ever reach exactly zero.
    pub fn write_unsaved_recursive(
        &self,
        chunk_id: u32,
        buf: &mut Vec<u8>,
        cache: &mut crate::cache::PageCache,
        pages_written: &mut u32,
        max_length_acc: &mut u64,
    ) -> crate::Result<u64> {
        let resolved_kind = match &self.kind {
            PageKind::Leaf(values) => PageKind::Leaf(values.clone()),
            PageKind::Node { children, counts } => {
                let mut resolved = Vec::with_capacity(children.len());
                for child in children {
                    match child {
                        Child::Saved(pos) => resolved.push(Child::Saved(*pos)),
                        Child::Unsaved(page) => {
                            let pos =
                                page.write_unsaved_recursive(chunk_id, buf, cache, pages_written, max_length_acc)?;
                            resolved.push(Child::Saved(pos));
                        }
                    }
                }
                PageKind::Node { children: resolved, counts: counts.clone() }
            }
        };
        let resolved_page = Page { map_id: self.map_id, keys: self.keys.clone(), kind: resolved_kind };

        let payload = resolved_page.serialize();
        let offset = buf.len() as u32;
        write_var_u32(buf, payload.len() as u32).expect("writing to Vec<u8> cannot fail");
        buf.extend_from_slice(&payload);

        let class = position::length_class(payload.len());
        let pos = position::encode(chunk_id, offset, class, resolved_page.is_leaf());
        log::trace!("serialized page at chunk {chunk_id} offset {offset}, {} bytes", payload.len());
        cache.insert(pos, Arc::new(resolved_page));
        *pages_written += 1;
        *max_length_acc += position::class_length(class) as u64;
        Ok(pos)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.memory_estimate());
        out.push(if self.is_leaf() { 0u8 } else { 1u8 });
        write_var_u32(&mut out, self.map_id).unwrap();
        write_var_u32(&mut out, self.keys.len() as u32).unwrap();
        for key in &self.keys {
            write_var_u32(&mut out, key.len() as u32).unwrap();
            out.extend_from_slice(key);
        }
        match &self.kind {
            PageKind::Leaf(values) => {
                for value in values {
                    write_var_u32(&mut out, value.len() as u32).unwrap();
                    out.extend_from_slice(value);
                }
            }
            PageKind::Node { children, counts } => {
                write_var_u32(&mut out, children.len() as u32).unwrap();
                for (child, count) in children.iter().zip(counts) {
                    let pos = match child {
                        Child::Saved(pos) => *pos,
                        Child::Unsaved(_) => unreachable!("children must be resolved before serializing"),
                    };
                    out.write_u64::<LE>(pos).unwrap();
                    write_var_u64(&mut out, *count).unwrap();
                }
            }
        }
        let checksum = xxh3_64(&out);
        out.write_u64::<LE>(checksum).unwrap();
        out
    }

    /// Parse a page payload previously produced by [`Page::serialize`].
    pub fn deserialize(payload: &[u8]) -> crate::Result<Self> {
        if payload.len() < 8 {
            return Err(StoreError::DataCorruption { offset: 0, len: payload.len() });
        }
        let (body, mut checksum_bytes) = payload.split_at(payload.len() - 8);
        let expected = checksum_bytes.read_u64::<LE>().expect("exactly 8 bytes");
        if xxh3_64(body) != expected {
            log::warn!("page checksum mismatch over {} bytes", body.len());
            return Err(StoreError::DataCorruption { offset: 0, len: payload.len() });
        }

        let mut cursor = std::io::Cursor::new(body);
        let mut one_byte = [0u8; 1];
        std::io::Read::read_exact(&mut cursor, &mut one_byte)
            .map_err(|_| StoreError::DataCorruption { offset: 0, len: payload.len() })?;
        let is_leaf = one_byte[0] == 0;

        let corrupt = |_| StoreError::DataCorruption { offset: 0, len: payload.len() };
        let map_id = read_var_u32(&mut cursor).map_err(corrupt)?;
        let key_count = read_var_u32(&mut cursor).map_err(corrupt)? as usize;

        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let len = read_var_u32(&mut cursor).map_err(corrupt)? as usize;
            let mut buf = vec![0u8; len];
            std::io::Read::read_exact(&mut cursor, &mut buf).map_err(corrupt)?;
            keys.push(buf.into_boxed_slice());
        }

        let kind = if is_leaf {
            let mut values = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                let len = read_var_u32(&mut cursor).map_err(corrupt)? as usize;
                let mut buf = vec![0u8; len];
                std::io::Read::read_exact(&mut cursor, &mut buf).map_err(corrupt)?;
                values.push(buf.into_boxed_slice());
            }
            PageKind::Leaf(values)
        } else {
            let child_count = read_var_u32(&mut cursor).map_err(corrupt)? as usize;
            let mut children = Vec::with_capacity(child_count);
            let mut counts = Vec::with_capacity(child_count);
            for _ in 0..child_count {
                let pos = cursor.read_u64::<LE>().map_err(corrupt)?;
                children.push(Child::Saved(pos));
                counts.push(read_var_u64(&mut cursor).map_err(corrupt)?);
            }
            PageKind::Node { children, counts }
        };

        Ok(Page { map_id, keys, kind })
    }
}

fn resolve(child: &Child, source: &mut dyn PageSource) -> crate::Result<Arc<Page>> {
    match child {
        Child::Saved(pos) => source.load(*pos),
        Child::Unsaved(page) => Ok(Arc::clone(page)),
    }
}

fn split_leaf_if_needed(map_id: u32, page: Page, max_page_size: usize) -> PutOutcome {
    if page.memory_estimate() <= max_page_size || page.keys.len() < 2 {
        return PutOutcome::Single(Arc::new(page));
    }
    let PageKind::Leaf(values) = page.kind else { unreachable!() };
    let mid = page.keys.len() / 2;
    let mut keys = page.keys;
    let right_keys = keys.split_off(mid);
    let mut values = values;
    let right_values = values.split_off(mid);
    let separator = right_keys[0].clone();
    PutOutcome::Split {
        left: Arc::new(Page::new_leaf(map_id, keys, values)),
        separator,
        right: Arc::new(Page::new_leaf(map_id, right_keys, right_values)),
    }
}

fn split_node_if_needed(map_id: u32, page: Page, max_page_size: usize) -> PutOutcome {
    if page.memory_estimate() <= max_page_size || page.keys.len() < 2 {
        return PutOutcome::Single(Arc::new(page));
    }
    let PageKind::Node { children, counts } = page.kind else { unreachable!() };
    let mid = (page.keys.len() + 1) / 2;
    let mut keys = page.keys;
    // The key promoted to the parent is pulled out of the middle, not
    // duplicated into either child (standard B-tree internal-node split).
    let separator = keys.remove(mid);
    let right_keys = keys.split_off(mid);

    let mut children = children;
    let right_children = children.split_off(mid + 1);
    let mut counts = counts;
    let right_counts = counts.split_off(mid + 1);

    PutOutcome::Split {
        left: Arc::new(Page::new_node(map_id, keys, children, counts)),
        separator,
        right: Arc::new(Page::new_node(map_id, right_keys, right_children, right_counts)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDiskSource;
    impl PageSource for NoDiskSource {
        fn load(&mut self, pos: u64) -> crate::Result<Arc<Page>> {
            Err(StoreError::ChunkNotFound(position::chunk_id(pos)))
        }
        fn note_freed(&mut self, _pos: u64) {}
    }

    #[test]
    fn leaf_get_put_roundtrip() {
        let page = Arc::new(Page::empty_leaf(0));
        let mut source = NoDiskSource;
        let (outcome, old) = page.put(b"a".to_vec().into(), b"1".to_vec().into(), &mut source, 4096).unwrap();
        assert!(old.is_none());
        let PutOutcome::Single(page) = outcome else { panic!("unexpected split") };
        assert_eq!(page.get(0, b"a", &mut source).unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(page.get(0, b"missing", &mut source).unwrap(), None);
    }

    #[test]
    fn overwrite_returns_old_value() {
        let mut page = Arc::new(Page::empty_leaf(0));
        let mut source = NoDiskSource;
        let (outcome, _) = page.put(b"a".to_vec().into(), b"1".to_vec().into(), &mut source, 4096).unwrap();
        let PutOutcome::Single(p) = outcome else { panic!() };
        page = p;
        let (_, old) = page.put(b"a".to_vec().into(), b"2".to_vec().into(), &mut source, 4096).unwrap();
        assert_eq!(old.as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn splits_once_oversized() {
        let mut page = Arc::new(Page::empty_leaf(0));
        let mut source = NoDiskSource;
        let mut split_happened = false;
        for i in 0..200u32 {
            let key = format!("key-{i:06}").into_bytes().into_boxed_slice();
            let value = vec![0xAB; 64].into_boxed_slice();
            let (outcome, _) = page.put(key, value, &mut source, 512).unwrap();
            match outcome {
                PutOutcome::Single(p) => page = p,
                PutOutcome::Split { left, separator: _, right } => {
                    split_happened = true;
                    // A bare top-level split result can't be directly re-wrapped
                    // as a page; the caller (MVMap) would build a new root node.
                    page = left;
                    let _ = right;
                }
            }
        }
        assert!(split_happened);
    }

    #[test]
    fn remove_then_get_returns_none() {
        let page = Arc::new(Page::empty_leaf(0));
        let mut source = NoDiskSource;
        let (outcome, _) = page.put(b"a".to_vec().into(), b"1".to_vec().into(), &mut source, 4096).unwrap();
        let PutOutcome::Single(page) = outcome else { panic!() };
        let (page, old) = page.remove(b"a", &mut source).unwrap();
        assert_eq!(old.as_deref(), Some(&b"1"[..]));
        assert_eq!(page.get(0, b"a", &mut source).unwrap(), None);
    }

    #[test]
    fn serialize_deserialize_round_trip_leaf() {
        let page = Page::new_leaf(
            3,
            vec![b"a".to_vec().into(), b"b".to_vec().into()],
            vec![b"1".to_vec().into(), b"2".to_vec().into()],
        );
        let bytes = page.serialize();
        let back = Page::deserialize(&bytes).unwrap();
        assert_eq!(back.map_id, 3);
        assert_eq!(back.keys, page.keys);
        assert!(back.is_leaf());
    }

    #[test]
    fn deserialize_rejects_corrupted_payload() {
        let page = Page::new_leaf(0, vec![b"a".to_vec().into()], vec![b"1".to_vec().into()]);
        let mut bytes = page.serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(Page::deserialize(&bytes).is_err());
    }
}
