//! `Store`: owns the backing file, the chunk table, the open-maps table, and
//! the meta map; drives commit, compaction, rollback, and recovery.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backend::{self, FileBackend};
use crate::builder::OpenMode;
use crate::chunk::{round_up_to_block, Chunk, CHUNK_HEADER_SIZE};
use crate::header::{FileHeader, FORMAT_READ, FORMAT_WRITE};
use crate::meta;
use crate::mvmap::{MVMap, META_MAP_ID};
use crate::page::{Child, Page, PageSource};
use crate::position;
use crate::varint::read_var_u32;
use crate::{alloc, BLOCK_SIZE, Result, StoreError};

fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// How many blocks `scan_for_trailing_header` will walk backward past the
/// literal last block before giving up. Bounds recovery cost on a file
/// that is corrupt or truncated arbitrarily deep; large enough to cross a
/// few chunks' worth of allocator gap/padding blocks in the common case.
const MAX_HEADER_SCAN_BLOCKS: u64 = 4096;

/// Find the newest valid trailing header block reachable from the end of
/// the file.
///
/// The literal "last block of the file" is only a valid header when the
/// store's most recent chunk is itself intact. An append-mostly store
/// (the common case: every commit lands past the current end of file, so
/// the leading pair is never rewritten) has no other cross-check once that
/// single trailing block is lost to truncation or corruption, even though
/// an older chunk's own trailing header is still sitting a few blocks
/// earlier. Chunks are always written back rounded to full blocks, so
/// walking backward one block at a time is guaranteed to eventually land
/// exactly on an earlier chunk's trailing header, not skip over it.
fn scan_for_trailing_header(backend: &FileBackend, file_len: u64) -> Option<Vec<u8>> {
    let block = BLOCK_SIZE as u64;
    if file_len < block {
        return None;
    }
    let last_block_index = file_len / block - 1;
    let floor = last_block_index.saturating_sub(MAX_HEADER_SCAN_BLOCKS).max(2);
    let mut index = last_block_index;
    loop {
        if let Ok(bytes) = backend.read_at(index * block, BLOCK_SIZE) {
            if FileHeader::parse(&bytes).is_some() {
                return Some(bytes);
            }
        }
        if index <= floor {
            return None;
        }
        index -= 1;
    }
}

pub struct Store {
    backend: FileBackend,
    cache: crate::cache::PageCache,
    chunks: BTreeMap<u32, Chunk>,
    maps: HashMap<u32, MVMap>,
    /// Name/createVersion for every map known from meta, whether or not it is
    /// currently resident in `maps` (maps are opened lazily).
    map_descriptors: HashMap<u32, (String, u64)>,
    name_to_id: HashMap<String, u32>,
    last_map_id: u32,
    last_chunk_id: u32,
    current_version: u64,
    creation_time: u64,
    retention_time_secs: u64,
    reuse_space: bool,
    /// Pending `removePage` decrements not yet folded into `chunks`. Keyed
    /// by chunk id; a `version → (chunkId → delta)` mapping collapses to a
    /// single bucket here because it is always drained at the very next
    /// commit, and `rollback_to` clears it outright rather than replaying it.
    pending_frees: HashMap<u32, u64>,
    /// Set when the on-disk format is newer than this build can write;
    /// falls back to read-only rather than refusing to open outright.
    force_read_only: bool,
    closed: bool,
}

impl Store {
    pub fn open(
        path: &Path,
        open_mode: OpenMode,
        filter: Arc<dyn crate::ByteFilter>,
        cache_size_bytes: usize,
        retention_time_secs: u64,
        reuse_space: bool,
        extra_settings: BTreeMap<String, String>,
    ) -> Result<Self> {
        let backend_mode = match open_mode {
            OpenMode::ReadWrite => backend::OpenMode::ReadWrite,
            OpenMode::ReadOnly => backend::OpenMode::ReadOnly,
        };
        let backend = FileBackend::open(path, backend_mode, filter)?;
        let len = backend.len()?;

        let mut store = if len == 0 {
            Self::initialize_empty(backend, cache_size_bytes, retention_time_secs, reuse_space)?
        } else {
            Self::recover(backend, cache_size_bytes, retention_time_secs, reuse_space, len)?
        };

        for (k, v) in extra_settings {
            store.meta_put_if_changed(meta::setting_key(&k), v)?;
        }
        store.meta_put_if_changed(
            meta::setting_key(meta::STORE_VERSION_SETTING),
            meta::CURRENT_STORE_VERSION.to_string(),
        )?;
        log::info!(
            "opened {} at version {} ({} chunks)",
            path.display(),
            store.current_version,
            store.chunks.len()
        );
        Ok(store)
    }

    fn initialize_empty(
        backend: FileBackend,
        cache_size_bytes: usize,
        retention_time_secs: u64,
        reuse_space: bool,
    ) -> Result<Self> {
        let now = now_epoch_secs();
        let header = FileHeader::new_for_empty_store(now);
        let block = header.serialize()?;
        backend.set_len(2 * BLOCK_SIZE as u64)?;
        backend.write_at(0, &block)?;
        backend.write_at(BLOCK_SIZE as u64, &block)?;

        let mut maps = HashMap::new();
        maps.insert(META_MAP_ID, MVMap::new(META_MAP_ID, "$meta", 0));

        Ok(Self {
            backend,
            cache: crate::cache::PageCache::new(cache_size_bytes),
            chunks: BTreeMap::new(),
            maps,
            map_descriptors: HashMap::new(),
            name_to_id: HashMap::new(),
            last_map_id: 0,
            last_chunk_id: 0,
            current_version: 0,
            creation_time: now,
            retention_time_secs,
            reuse_space,
            pending_frees: HashMap::new(),
            force_read_only: false,
            closed: false,
        })
    }

    /// Read the leading pair of header blocks plus the newest reachable
    /// trailing chunk header (see [`scan_for_trailing_header`]), pick the
    /// newest valid candidate, then rebuild the chunk table and map
    /// directory from the meta map it names.
    fn recover(
        backend: FileBackend,
        cache_size_bytes: usize,
        retention_time_secs: u64,
        reuse_space: bool,
        file_len: u64,
    ) -> Result<Self> {
        let block0 = backend.read_at(0, BLOCK_SIZE).ok();
        let block1 = backend.read_at(BLOCK_SIZE as u64, BLOCK_SIZE).ok();
        let trailing = scan_for_trailing_header(&backend, file_len);
        let candidates = [block0.as_deref(), block1.as_deref(), trailing.as_deref()];
        let header = FileHeader::pick_newest(&candidates)?;

        if let Some(format_read) = header.format_read {
            if format_read > FORMAT_READ {
                return Err(StoreError::UnsupportedFormat { found: format_read, supported: FORMAT_READ });
            }
        }
        let force_read_only = header.format > FORMAT_WRITE && backend.mode() == backend::OpenMode::ReadWrite;
        if force_read_only {
            log::warn!(
                "store format {} is newer than this build's write format {FORMAT_WRITE}; opening read-only",
                header.format
            );
        }

        let mut maps = HashMap::new();
        let mut chunks = BTreeMap::new();
        let mut last_chunk_id = 0;

        if header.root_chunk != 0 {
            let header_bytes = backend.read_at(header.root_chunk, CHUNK_HEADER_SIZE)?;
            let header_array: [u8; CHUNK_HEADER_SIZE] =
                header_bytes.try_into().map_err(|_| StoreError::HeaderCorrupt)?;
            let newest_chunk = Chunk::decode_header(&header_array)?;
            last_chunk_id = newest_chunk.id;
            let meta_root = Child::Saved(newest_chunk.meta_root_pos);
            chunks.insert(newest_chunk.id, newest_chunk);
            maps.insert(META_MAP_ID, MVMap::with_root(META_MAP_ID, "$meta", 0, meta_root, false));
        } else {
            maps.insert(META_MAP_ID, MVMap::new(META_MAP_ID, "$meta", 0));
        }

        let mut store = Self {
            backend,
            cache: crate::cache::PageCache::new(cache_size_bytes),
            chunks,
            maps,
            map_descriptors: HashMap::new(),
            name_to_id: HashMap::new(),
            last_map_id: header.last_map_id,
            last_chunk_id,
            current_version: header.version,
            creation_time: header.creation_time,
            retention_time_secs,
            reuse_space,
            pending_frees: HashMap::new(),
            force_read_only,
            closed: false,
        };

        // Rebuild the chunk table. The newest chunk is already authoritative
        // from the header above; any meta entry for it is potentially stale
        // by one commit (see DESIGN.md, "meta-lag for chunk descriptors"), so
        // `entry().or_insert()` here never overwrites it.
        for (key, value) in store.meta_iterate_prefix("chunk.")? {
            let chunk = Chunk::from_meta_value(&value)?;
            store.chunks.entry(chunk.id).or_insert(chunk);
            let _ = key;
        }

        for (key, value) in store.meta_iterate_prefix("map.")? {
            let id: u32 = key["map.".len()..]
                .parse()
                .map_err(|_| StoreError::illegal_state(format!("malformed meta key {key}")))?;
            let (name, create_version) = meta::decode_map_descriptor(&value)?;
            store.last_map_id = store.last_map_id.max(id);
            store.name_to_id.insert(name.clone(), id);
            store.map_descriptors.insert(id, (name, create_version));
        }

        Ok(store)
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::illegal_state("store is closed"));
        }
        if self.backend.mode() == backend::OpenMode::ReadOnly {
            return Err(StoreError::illegal_state("store was opened read-only"));
        }
        if self.force_read_only {
            return Err(StoreError::illegal_state("store format is newer than this build's write format"));
        }
        Ok(())
    }

    // ---- meta map helpers --------------------------------------------

    /// Run `f` against the map `id`, temporarily removed from `self.maps` so
    /// `self` can simultaneously serve as that map's `PageSource`.
    fn with_map_mut<F, R>(&mut self, id: u32, f: F) -> Result<R>
    where
        F: FnOnce(&mut MVMap, &mut Store) -> Result<R>,
    {
        if !self.maps.contains_key(&id) {
            self.instantiate_map(id)?;
        }
        let mut map = self.maps.remove(&id).ok_or_else(|| StoreError::illegal_argument(format!("no open map {id}")))?;
        let result = f(&mut map, self);
        self.maps.insert(id, map);
        result
    }

    fn meta_put(&mut self, key: String, value: String) -> Result<()> {
        self.with_map_mut(META_MAP_ID, |map, store| {
            map.put(key.into_bytes().into_boxed_slice(), value.into_bytes().into_boxed_slice(), store)?;
            Ok(())
        })
    }

    /// Like `meta_put`, but skips the write when the key already holds this
    /// exact value. Used for settings re-asserted on every `open()`, so that
    /// reopening an already-consistent store doesn't mark the meta map dirty
    /// (and force a commit) when nothing actually changed.
    fn meta_put_if_changed(&mut self, key: String, value: String) -> Result<()> {
        if self.meta_get(&key)?.as_deref() == Some(value.as_str()) {
            return Ok(());
        }
        self.meta_put(key, value)
    }

    fn meta_get(&mut self, key: &str) -> Result<Option<String>> {
        self.with_map_mut(META_MAP_ID, |map, store| {
            Ok(map.get(key.as_bytes(), store)?.map(|v| String::from_utf8_lossy(&v).into_owned()))
        })
    }

    fn meta_remove(&mut self, key: &str) -> Result<()> {
        self.with_map_mut(META_MAP_ID, |map, store| {
            map.remove(key.as_bytes(), store)?;
            Ok(())
        })
    }

    fn meta_iterate_prefix(&mut self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.with_map_mut(META_MAP_ID, |map, store| {
            let prefix = prefix.to_string();
            Ok(map
                .iterate(store)?
                .into_iter()
                .filter_map(|(k, v)| {
                    let k = String::from_utf8_lossy(&k).into_owned();
                    k.starts_with(&prefix).then(|| (k, String::from_utf8_lossy(&v).into_owned()))
                })
                .collect())
        })
    }

    fn instantiate_map(&mut self, id: u32) -> Result<()> {
        if self.maps.contains_key(&id) {
            return Ok(());
        }
        let (name, create_version) = self
            .map_descriptors
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::illegal_argument(format!("no such map id {id}")))?;
        let root_str = self.meta_get(&meta::root_key(id))?;
        let root = match root_str.and_then(|s| s.parse::<u64>().ok()) {
            Some(pos) if pos != position::EMPTY => Child::Saved(pos),
            _ => Child::Unsaved(Arc::new(Page::empty_leaf(id))),
        };
        self.maps.insert(id, MVMap::with_root(id, name, create_version, root, false));
        Ok(())
    }

    // ---- map directory -------------------------------------------------

    /// Open (or create) a named map, returning its id: creating a new map
    /// is an atomic reserve of a new id.
    pub fn open_map(&mut self, name: &str) -> Result<u32> {
        if let Some(&id) = self.name_to_id.get(name) {
            if !self.maps.contains_key(&id) {
                self.instantiate_map(id)?;
            }
            return Ok(id);
        }
        self.check_writable()?;
        let id = self.last_map_id + 1;
        self.last_map_id = id;
        let create_version = self.current_version + 1;
        self.name_to_id.insert(name.to_string(), id);
        self.map_descriptors.insert(id, (name.to_string(), create_version));
        self.maps.insert(id, MVMap::new(id, name, create_version));
        self.meta_put(meta::map_key(id), meta::encode_map_descriptor(name, create_version))?;
        self.meta_put(meta::name_key(name), id.to_string())?;
        Ok(id)
    }

    /// Destroy a map by id. The meta map (id 0) can never be removed.
    pub fn remove_map(&mut self, id: u32) -> Result<()> {
        if id == META_MAP_ID {
            return Err(StoreError::illegal_argument("cannot remove the meta map"));
        }
        self.check_writable()?;
        self.maps.remove(&id);
        if let Some((name, _)) = self.map_descriptors.remove(&id) {
            self.name_to_id.remove(&name);
            self.meta_remove(&meta::name_key(&name))?;
        }
        self.meta_remove(&meta::map_key(id))?;
        self.meta_remove(&meta::root_key(id))?;
        Ok(())
    }

    pub fn map_exists(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
    }

    // ---- byte-level map operations (the typed API is external) --------

    pub fn get(&mut self, map_id: u32, key: &[u8]) -> Result<Option<Box<[u8]>>> {
        self.with_map_mut(map_id, |map, store| map.get(key, store))
    }

    pub fn put(&mut self, map_id: u32, key: Box<[u8]>, value: Box<[u8]>) -> Result<Option<Box<[u8]>>> {
        self.check_writable()?;
        self.with_map_mut(map_id, |map, store| map.put(key, value, store))
    }

    pub fn remove(&mut self, map_id: u32, key: &[u8]) -> Result<Option<Box<[u8]>>> {
        self.check_writable()?;
        self.with_map_mut(map_id, |map, store| map.remove(key, store))
    }

    pub fn iterate(&mut self, map_id: u32) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        self.with_map_mut(map_id, |map, store| map.iterate(store))
    }

    /// Materialize `map_id` as of historical version `v`. Since `store()`
    /// only ever allocates a chunk when there are real unsaved changes
    /// (commits are idempotent when nothing changed), each committed
    /// version maps 1:1 onto the chunk whose `version` field equals it, so
    /// the historical meta root can be recovered without a separate "meta
    /// as of version" round trip: walk to the chunk with that version and
    /// read its `metaRootPos` directly.
    pub fn open_map_version(&mut self, map_id: u32, version: u64) -> Result<MVMap> {
        if version > self.current_version {
            return Err(StoreError::UnknownVersion(version));
        }
        if let Some(map) = self.maps.get(&map_id) {
            if let Some(root) = map.in_session_root_at(version) {
                let (name, create_version) = (map.name.clone(), map.create_version);
                return Ok(MVMap::with_root(map_id, name, create_version, root, true));
            }
        }

        let chunk = self
            .chunks
            .values()
            .find(|c| c.version == version)
            .cloned()
            .ok_or(StoreError::UnknownVersion(version))?;
        let historical_meta = MVMap::with_root(META_MAP_ID, "$meta", 0, Child::Saved(chunk.meta_root_pos), true);
        let root_str = {
            let mut meta = historical_meta;
            let value = meta.get(meta::root_key(map_id).as_bytes(), self)?;
            value
        };
        let (name, create_version) = self
            .map_descriptors
            .get(&map_id)
            .cloned()
            .or_else(|| self.maps.get(&map_id).map(|m| (m.name.clone(), m.create_version)))
            .ok_or_else(|| StoreError::illegal_argument(format!("no such map id {map_id}")))?;
        let root = match root_str.and_then(|s| String::from_utf8_lossy(&s).parse::<u64>().ok()) {
            Some(pos) if pos != position::EMPTY => Child::Saved(pos),
            _ => Child::Unsaved(Arc::new(Page::empty_leaf(map_id))),
        };
        Ok(MVMap::with_root(map_id, name, create_version, root, true))
    }

    // ---- diagnostics -----------------------------------------------------

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn file_length(&self) -> Result<u64> {
        self.backend.len()
    }

    /// `getFileLengthUsed`: end of the furthest live chunk, i.e. what the
    /// file could shrink to.
    pub fn file_length_used(&self) -> u64 {
        self.chunks.values().map(|c| c.start + c.length).max().unwrap_or(2 * BLOCK_SIZE as u64)
    }

    /// Aggregate fill rate across every known chunk.
    pub fn fill_rate(&self) -> u32 {
        let (live, max): (u64, u64) = self.chunks.values().fold((0, 0), |(l, m), c| (l + c.max_length_live, m + c.max_length));
        if max == 0 {
            100
        } else {
            ((100 * live) / max) as u32
        }
    }

    pub fn retention_time_secs(&self) -> u64 {
        self.retention_time_secs
    }

    /// Truncate the file to `file_length_used()` if at least `min_percent`
    /// of it is trailing dead space. Returns whether a truncation happened.
    pub fn shrink_file_if_possible(&mut self, min_percent: u8) -> Result<bool> {
        self.check_writable()?;
        let file_len = self.backend.len()?;
        let used_len = self.file_length_used();
        if !alloc::should_shrink(file_len, used_len, min_percent) {
            return Ok(false);
        }
        self.backend.set_len(used_len)?;
        Ok(true)
    }

    // ---- commit ---------------------------------------------------------

    /// Drive a full commit. Returns the resulting `currentVersion`,
    /// unchanged if nothing was dirty.
    pub fn store(&mut self) -> Result<u64> {
        self.check_writable()?;

        // Meta is counted too: spec.md §3 treats the meta map as persisted
        // like any other map, so a meta-only change (e.g. `open_map`
        // registering a new map's `map.<id>`/`name.<name>` entries with no
        // user data written yet) must still force a real commit rather than
        // silently reporting success while leaving the new map unsaved.
        let any_dirty = self.maps.values().any(|m| m.has_unsaved_changes());
        if !any_dirty {
            return Ok(self.current_version);
        }

        let elapsed = now_epoch_secs().saturating_sub(self.creation_time);
        let last_chunk_time = self.chunks.values().map(|c| c.time).max().unwrap_or(0);
        let time = elapsed.max(last_chunk_time);

        let new_version = self.current_version + 1;
        let chunk_id = self.last_chunk_id + 1;
        log::debug!("committing chunk {chunk_id} as version {new_version}");

        // Fix up the previous chunk's meta entry: it was written with
        // placeholder start/length last time, since its real destination
        // wasn't known until after its own meta page was already
        // serialized. Correct it now that it's known.
        if self.last_chunk_id != 0 {
            if let Some(prev) = self.chunks.get(&self.last_chunk_id).cloned() {
                self.meta_put(meta::chunk_key(prev.id), prev.to_meta_value())?;
            }
        }

        let placeholder = Chunk::new_placeholder(chunk_id, new_version, time);
        self.chunks.insert(chunk_id, placeholder.clone());
        self.meta_put(meta::chunk_key(chunk_id), placeholder.to_meta_value())?;

        // Step 4: provisional root placeholders.
        let changed_ids: Vec<u32> = self
            .maps
            .iter()
            .filter(|(id, m)| **id != META_MAP_ID && m.has_unsaved_changes())
            .map(|(id, _)| *id)
            .collect();
        for id in &changed_ids {
            self.meta_put(meta::root_key(*id), u64::MAX.to_string())?;
        }

        // Step 5: freed-chunks ledger + collectible chunks.
        self.apply_freed_chunks();
        self.collect_dead_chunks(time, chunk_id)?;

        // Step 6/7: serialize changed maps, then the meta map, into one buffer.
        let mut buf = vec![0u8; CHUNK_HEADER_SIZE];
        let mut pages_written: u32 = 0;
        let mut max_length_acc: u64 = 0;
        for id in &changed_ids {
            let root_child = self.maps.get(id).expect("changed map must be open").root_child();
            if let Child::Unsaved(page) = root_child {
                let pos = page.write_unsaved_recursive(
                    chunk_id,
                    &mut buf,
                    &mut self.cache,
                    &mut pages_written,
                    &mut max_length_acc,
                )?;
                self.meta_put(meta::root_key(*id), pos.to_string())?;
                self.maps.get_mut(id).unwrap().set_root_pos(pos, new_version);
            }
        }

        let meta_root_child = self.maps.get(&META_MAP_ID).unwrap().root_child();
        let meta_pos = match meta_root_child {
            Child::Unsaved(page) => page.write_unsaved_recursive(
                chunk_id,
                &mut buf,
                &mut self.cache,
                &mut pages_written,
                &mut max_length_acc,
            )?,
            Child::Saved(pos) => pos,
        };

        self.maps.get_mut(&META_MAP_ID).unwrap().set_root_pos(meta_pos, new_version);

        let mut chunk = placeholder;
        chunk.meta_root_pos = meta_pos;
        chunk.page_count = pages_written;
        // Same rounded-class basis `note_freed` uses, not the raw
        // serialized byte count, so `maxLengthLive` can reach 0.
        chunk.max_length = max_length_acc;
        chunk.max_length_live = chunk.max_length;

        // Step 8: pad to a block, append trailing header image.
        let padded_len = round_up_to_block(buf.len() as u64);
        buf.resize(padded_len as usize, 0);

        // Step 9: choose destination.
        let destination = if self.reuse_space {
            let live: Vec<&Chunk> = self
                .chunks
                .values()
                .filter(|c| c.id != chunk_id && !self.is_overwritable(c, time))
                .collect();
            alloc::allocate_chunk(&live, padded_len)
        } else {
            self.backend.len()?
        };
        chunk.start = destination;
        chunk.length = padded_len + BLOCK_SIZE as u64;

        let header_bytes = chunk.encode_header()?;
        buf[..CHUNK_HEADER_SIZE].copy_from_slice(&header_bytes);

        let file_header = FileHeader {
            format: FORMAT_WRITE,
            format_read: None,
            block_size: BLOCK_SIZE,
            creation_time: self.creation_time,
            version: new_version,
            root_chunk: chunk.start,
            last_map_id: self.last_map_id,
        };
        let trailing_block = file_header.serialize()?;
        buf.extend_from_slice(&trailing_block);
        debug_assert_eq!(buf.len() as u64, chunk.length);

        let required_len = chunk.start + chunk.length;
        if self.backend.len()? < required_len {
            self.backend.set_len(required_len)?;
        }
        self.backend.write_at(chunk.start, &buf)?;

        // Step 10: leading headers only need rewriting off-EOF; the
        // trailing block of the newest valid chunk is always cross-checked
        // on open regardless.
        let at_eof = chunk.start + chunk.length == self.backend.len()?;
        if !at_eof {
            self.backend.write_at(0, &trailing_block)?;
            self.backend.write_at(BLOCK_SIZE as u64, &trailing_block)?;
        }

        self.chunks.insert(chunk_id, chunk.clone());
        self.last_chunk_id = chunk_id;
        self.current_version = new_version;
        log::trace!("chunk {chunk_id} written at offset {}, {} bytes, {} pages", chunk.start, chunk.length, chunk.page_count);
        Ok(new_version)
    }

    /// Merge pending per-chunk decrements into `maxLengthLive`.
    fn apply_freed_chunks(&mut self) {
        for (chunk_id, delta) in self.pending_frees.drain() {
            if let Some(chunk) = self.chunks.get_mut(&chunk_id) {
                chunk.max_length_live = chunk.max_length_live.saturating_sub(delta);
            }
        }
    }

    /// Chunks with zero live bytes past `retentionTime` are removed from
    /// meta and the in-memory table; repeat, since removing a chunk can
    /// itself free further pages. In this design no page ever references a
    /// *chunk descriptor*, only page positions within it, so removing a dead
    /// chunk's own bookkeeping entry cannot cascade into freeing more pages
    /// in the current design; the loop is kept because a future compaction
    /// pass may populate more frees per commit.
    fn collect_dead_chunks(&mut self, now: u64, exclude_id: u32) -> Result<()> {
        loop {
            let dead: Vec<u32> = self
                .chunks
                .values()
                .filter(|c| c.id != exclude_id && c.is_dead() && c.time + self.retention_time_secs <= now)
                .map(|c| c.id)
                .collect();
            if dead.is_empty() {
                break;
            }
            for id in dead {
                self.chunks.remove(&id);
                self.meta_remove(&meta::chunk_key(id))?;
            }
            self.apply_freed_chunks();
        }
        Ok(())
    }

    fn is_overwritable(&self, chunk: &Chunk, now: u64) -> bool {
        chunk.is_dead() && chunk.time + self.retention_time_secs <= now
    }

    // ---- rollback ---------------------------------------------------------

    /// Discard every committed version newer than `v` and reinstall the
    /// historical root for every still-open map.
    pub fn rollback_to(&mut self, v: u64) -> Result<()> {
        self.check_writable()?;
        if v > self.current_version {
            return Err(StoreError::UnknownVersion(v));
        }

        self.pending_frees.clear();

        let removed_chunks: Vec<u32> = self.chunks.values().filter(|c| c.version > v).map(|c| c.id).collect();
        for id in &removed_chunks {
            self.chunks.remove(id);
        }
        if let Some(max_remaining) = self.chunks.keys().max().copied() {
            self.last_chunk_id = max_remaining;
        } else {
            self.last_chunk_id = 0;
        }

        let stale_maps: Vec<u32> =
            self.map_descriptors.iter().filter(|(_, (_, create_version))| *create_version > v).map(|(id, _)| *id).collect();
        for id in stale_maps {
            if let Some((name, _)) = self.map_descriptors.remove(&id) {
                self.name_to_id.remove(&name);
            }
            self.maps.remove(&id);
        }

        let ids: Vec<u32> = self.maps.keys().copied().collect();
        for id in ids {
            if let Some(map) = self.maps.get_mut(&id) {
                map.forget_versions_after(v);
            }
            if let Some(root) = self.maps.get(&id).and_then(|m| m.in_session_root_at(v)) {
                if let Some(map) = self.maps.get_mut(&id) {
                    let (name, create_version) = (map.name.clone(), map.create_version);
                    *map = MVMap::with_root(id, name, create_version, root, false);
                }
            } else if id == META_MAP_ID {
                // Meta's own history is only tracked in-session too; if we
                // don't have it (e.g. rollback targets a version from a
                // previous process), fall back to the chunk whose version
                // equals `v` for the meta root, same as `open_map_version`.
                if v == 0 {
                    self.maps.insert(META_MAP_ID, MVMap::new(META_MAP_ID, "$meta", 0));
                } else if let Some(chunk) = self.chunks.values().find(|c| c.version == v).cloned() {
                    self.maps.insert(
                        META_MAP_ID,
                        MVMap::with_root(META_MAP_ID, "$meta", 0, Child::Saved(chunk.meta_root_pos), false),
                    );
                }
            }
        }

        self.current_version = v;
        Ok(())
    }

    // ---- compaction ---------------------------------------------------------

    /// Force copy-on-write rewrites of live keys out of cold, under-filled
    /// chunks, then commit once.
    pub fn compact(&mut self, target_fill_percent: u32) -> Result<bool> {
        self.check_writable()?;
        if self.fill_rate() >= target_fill_percent {
            return Ok(false);
        }

        let now = now_epoch_secs().saturating_sub(self.creation_time);
        let mut candidates: Vec<Chunk> = self
            .chunks
            .values()
            .filter(|c| c.time + self.retention_time_secs <= now)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }
        candidates.sort_by(|a, b| {
            let pa = a.fill_rate_percent() as f64 / (now.saturating_sub(a.time) + 1) as f64;
            let pb = b.fill_rate_percent() as f64 / (now.saturating_sub(b.time) + 1) as f64;
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let average_chunk_live: u64 = {
            let total: u64 = self.chunks.values().map(|c| c.max_length_live).sum();
            let count = self.chunks.len().max(1) as u64;
            total / count
        };

        let mut selected = Vec::new();
        let mut accumulated = 0u64;
        for chunk in candidates {
            if accumulated >= average_chunk_live.max(1) {
                break;
            }
            accumulated += chunk.max_length_live;
            selected.push(chunk);
        }
        if selected.is_empty() {
            return Ok(false);
        }
        log::info!("compacting {} chunk(s), current fill rate {}%", selected.len(), self.fill_rate());
        let selected_ids: std::collections::HashSet<u32> = selected.iter().map(|c| c.id).collect();

        for chunk in &selected {
            let raw = self.backend.read_at(chunk.start, chunk.length as usize)?;
            for (map_id, key) in entries_in_chunk(&raw)? {
                if !self.maps.contains_key(&map_id) && !self.map_descriptors.contains_key(&map_id) {
                    continue;
                }
                let current_pos = self.with_map_mut(map_id, |map, store| {
                    // Re-resolve where this key currently lives by walking
                    // from the root; if that position's chunk is one of the
                    // selected cold chunks, force a rewrite.
                    map.current_position_of(&key, store)
                })?;
                if let Some(pos) = current_pos {
                    if selected_ids.contains(&position::chunk_id(pos)) {
                        if let Some(value) = self.get(map_id, &key)? {
                            self.remove(map_id, &key)?;
                            self.put(map_id, key.clone(), value)?;
                        }
                    }
                }
            }
        }

        self.store()?;
        // Best-effort: reclaim trailing dead space now that cold chunks have
        // been rewritten away and, if fully drained, removed.
        self.shrink_file_if_possible(10)?;
        Ok(true)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        log::info!("closing store at version {}", self.current_version);
        self.cache.clear();
        self.closed = true;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl PageSource for Store {
    fn load(&mut self, pos: u64) -> Result<Arc<Page>> {
        if pos == position::EMPTY {
            return Ok(Arc::new(Page::empty_leaf(0)));
        }
        if let Some(page) = self.cache.get(pos) {
            return Ok(page);
        }
        let (chunk_id, offset, _, _) = position::decode(pos);
        let chunk = self.chunks.get(&chunk_id).ok_or(StoreError::ChunkNotFound(chunk_id))?;
        let absolute = chunk.start + offset as u64;

        let prefix = self.backend.read_at(absolute, 5)?;
        let mut cursor = std::io::Cursor::new(&prefix[..]);
        let payload_len = read_var_u32(&mut cursor)
            .map_err(|_| StoreError::DataCorruption { offset: absolute, len: prefix.len() })?
            as usize;
        let prefix_len = cursor.position() as usize;

        let whole = self.backend.read_at(absolute, prefix_len + payload_len)?;
        let page = Page::deserialize(&whole[prefix_len..])?;
        let arc = Arc::new(page);
        self.cache.insert(pos, Arc::clone(&arc));
        Ok(arc)
    }

    fn note_freed(&mut self, pos: u64) {
        if pos == position::EMPTY {
            return;
        }
        self.cache.remove(pos);
        let (chunk_id, _, class, _) = position::decode(pos);
        *self.pending_frees.entry(chunk_id).or_insert(0) += position::class_length(class) as u64;
    }
}

/// Scan a whole chunk's raw bytes, skipping its `CHUNK_HEADER_SIZE`-byte header, collecting
/// every `(mapId, key)` pair from the pages it contains in buffer order, for
/// `compact`'s "iterate its pages in buffer order" step.
fn entries_in_chunk(raw: &[u8]) -> Result<Vec<(u32, Box<[u8]>)>> {
    let mut out = Vec::new();
    let mut offset = CHUNK_HEADER_SIZE;
    while offset + 1 <= raw.len() {
        let mut cursor = std::io::Cursor::new(&raw[offset..]);
        let payload_len = match read_var_u32(&mut cursor) {
            Ok(v) => v as usize,
            Err(_) => break,
        };
        let prefix_len = cursor.position() as usize;
        let payload_start = offset + prefix_len;
        let payload_end = payload_start + payload_len;
        if payload_end > raw.len() || payload_len == 0 {
            break;
        }
        if let Ok(page) = Page::deserialize(&raw[payload_start..payload_end]) {
            if page.is_leaf() {
                for key in &page.keys {
                    out.push((page.map_id, key.clone()));
                }
            }
        }
        offset = payload_end;
    }
    Ok(out)
}
