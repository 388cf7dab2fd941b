//! `MVMap`: a single ordered map backed by a root [`Page`].
//!
//! This is the byte-level core: keys and values are opaque `Box<[u8]>`.
//! Typed convenience wrappers live in [`crate::codec`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::page::{Child, Page, PageSource, PutOutcome};
use crate::{StoreError, DEFAULT_MAX_PAGE_SIZE};

/// The meta map is always id 0.
pub const META_MAP_ID: u32 = 0;

pub struct MVMap {
    pub id: u32,
    pub name: String,
    pub create_version: u64,
    root: Child,
    /// Reading-only historical view; mutation methods refuse to run.
    readonly: bool,
    max_page_size: usize,
    /// Root position as of each version committed while this map has been
    /// open in this session, oldest first. Lets `Store::rollback_to` and
    /// in-session historical reads avoid round-tripping through meta.
    version_history: BTreeMap<u64, Child>,
}

impl MVMap {
    pub fn new(id: u32, name: impl Into<String>, create_version: u64) -> Self {
        Self {
            id,
            name: name.into(),
            create_version,
            root: Child::Unsaved(Arc::new(Page::empty_leaf(id))),
            readonly: false,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            version_history: BTreeMap::new(),
        }
    }

    /// Reconstruct a map whose root is already known (on reopen, or when
    /// materializing a historical view).
    pub fn with_root(id: u32, name: impl Into<String>, create_version: u64, root: Child, readonly: bool) -> Self {
        Self {
            id,
            name: name.into(),
            create_version,
            root,
            readonly,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            version_history: BTreeMap::new(),
        }
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.root.is_unsaved()
    }

    pub fn root_pos(&self) -> u64 {
        self.root.position()
    }

    pub fn root_child(&self) -> Child {
        self.root.clone()
    }

    pub fn entry_count(&self, source: &mut dyn PageSource) -> crate::Result<u64> {
        Ok(resolve(&self.root, source)?.entry_count())
    }

    pub fn get(&self, key: &[u8], source: &mut dyn PageSource) -> crate::Result<Option<Box<[u8]>>> {
        resolve(&self.root, source)?.get(self.id, key, source)
    }

    pub fn put(&mut self, key: Box<[u8]>, value: Box<[u8]>, source: &mut dyn PageSource) -> crate::Result<Option<Box<[u8]>>> {
        self.check_writable()?;
        let old_root_pos = self.root.position();
        let root = resolve(&self.root, source)?;
        let (outcome, old) = root.put(key, value, source, self.max_page_size)?;
        self.root = Child::Unsaved(wrap_outcome(self.id, outcome));
        if old_root_pos != crate::position::EMPTY {
            source.note_freed(old_root_pos);
        }
        Ok(old)
    }

    pub fn remove(&mut self, key: &[u8], source: &mut dyn PageSource) -> crate::Result<Option<Box<[u8]>>> {
        self.check_writable()?;
        let old_root_pos = self.root.position();
        let root = resolve(&self.root, source)?;
        let (new_root, old) = root.remove(key, source)?;
        self.root = Child::Unsaved(new_root);
        if old.is_some() && old_root_pos != crate::position::EMPTY {
            source.note_freed(old_root_pos);
        }
        Ok(old)
    }

    pub fn iterate(&self, source: &mut dyn PageSource) -> crate::Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut out = Vec::new();
        let root = resolve(&self.root, source)?;
        collect(&root, source, &mut out)?;
        Ok(out)
    }

    /// Called after a successful commit: records the real on-disk position
    /// for the current root, and remembers it under `version` for cheap
    /// in-session historical reads.
    pub fn set_root_pos(&mut self, pos: u64, version: u64) {
        self.root = Child::Saved(pos);
        self.version_history.insert(version, self.root.clone());
    }

    /// Drop any recorded versions newer than `version`; the caller is
    /// responsible for reinstalling whichever root corresponds to
    /// `version`.
    pub fn forget_versions_after(&mut self, version: u64) {
        self.version_history.retain(|&v, _| v <= version);
    }

    pub fn in_session_root_at(&self, version: u64) -> Option<Child> {
        self.version_history.get(&version).cloned()
    }

    /// The position of the on-disk leaf page that currently holds `key`, if
    /// any (`None` if the key is absent, or if the leaf holding it hasn't
    /// been committed yet). Used by compaction to tell whether a key's
    /// current page lives in one of the chunks targeted for collection.
    pub fn current_position_of(&self, key: &[u8], source: &mut dyn PageSource) -> crate::Result<Option<u64>> {
        let mut child = self.root.clone();
        loop {
            let pos = child.position();
            let page = resolve(&child, source)?;
            match &page.kind {
                crate::page::PageKind::Leaf(_) => {
                    if pos == crate::position::EMPTY {
                        return Ok(None);
                    }
                    return Ok(page.keys.iter().any(|k| k.as_ref() == key).then_some(pos));
                }
                crate::page::PageKind::Node { children, .. } => {
                    let idx = page.keys.partition_point(|k| k.as_ref() <= key);
                    child = children[idx].clone();
                }
            }
        }
    }

    fn check_writable(&self) -> crate::Result<()> {
        if self.readonly {
            return Err(StoreError::illegal_state(format!(
                "map '{}' is a read-only historical view", self.name
            )));
        }
        Ok(())
    }
}

fn resolve(child: &Child, source: &mut dyn PageSource) -> crate::Result<Arc<Page>> {
    match child {
        Child::Saved(pos) => source.load(*pos),
        Child::Unsaved(page) => Ok(Arc::clone(page)),
    }
}

fn wrap_outcome(map_id: u32, outcome: PutOutcome) -> Arc<Page> {
    match outcome {
        PutOutcome::Single(page) => page,
        PutOutcome::Split { left, separator, right } => {
            let counts = vec![left.entry_count(), right.entry_count()];
            Arc::new(Page::new_node(map_id, vec![separator], vec![Child::Unsaved(left), Child::Unsaved(right)], counts))
        }
    }
}

fn collect(page: &Arc<Page>, source: &mut dyn PageSource, out: &mut Vec<(Box<[u8]>, Box<[u8]>)>) -> crate::Result<()> {
    match &page.kind {
        crate::page::PageKind::Leaf(values) => {
            for (k, v) in page.keys.iter().zip(values.iter()) {
                out.push((k.clone(), v.clone()));
            }
            Ok(())
        }
        crate::page::PageKind::Node { children, .. } => {
            for child in children {
                let resolved = resolve(child, source)?;
                collect(&resolved, source, out)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;
    impl PageSource for Empty {
        fn load(&mut self, pos: u64) -> crate::Result<Arc<Page>> {
            Err(StoreError::ChunkNotFound(crate::position::chunk_id(pos)))
        }
        fn note_freed(&mut self, _pos: u64) {}
    }

    #[test]
    fn put_get_remove() {
        let mut map = MVMap::new(1, "x", 0);
        let mut source = Empty;
        assert_eq!(map.get(b"a", &mut source).unwrap(), None);
        map.put(b"a".to_vec().into(), b"1".to_vec().into(), &mut source).unwrap();
        assert_eq!(map.get(b"a", &mut source).unwrap().as_deref(), Some(&b"1"[..]));
        assert!(map.has_unsaved_changes());
        map.remove(b"a", &mut source).unwrap();
        assert_eq!(map.get(b"a", &mut source).unwrap(), None);
    }

    #[test]
    fn iterate_is_sorted() {
        let mut map = MVMap::new(1, "x", 0);
        let mut source = Empty;
        for k in [b"c".to_vec(), b"a".to_vec(), b"b".to_vec()] {
            map.put(k.clone().into(), k.into(), &mut source).unwrap();
        }
        let all = map.iterate(&mut source).unwrap();
        let keys: Vec<_> = all.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn readonly_view_rejects_writes() {
        let map = MVMap::with_root(1, "x", 0, Child::Unsaved(Arc::new(Page::empty_leaf(1))), true);
        let mut source = Empty;
        let mut map = map;
        let err = map.put(b"a".to_vec().into(), b"1".to_vec().into(), &mut source).unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
    }
}
