//! Pluggable key/value codecs: a small capability bundle injected at map
//! construction.
//!
//! The core ([`crate::mvmap::MVMap`]) only ever sees `Box<[u8]>`; codecs are
//! a convenience layer at the API boundary, opaque byte serializers supplied
//! by the caller.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::mvmap::MVMap;
use crate::page::PageSource;

/// Capability bundle a caller supplies for one type used as a key or value.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Box<[u8]>;
    fn decode(&self, bytes: &[u8]) -> T;
    /// Estimated in-memory footprint of `value`, used only for diagnostics;
    /// the authoritative cost used by the cache and page splitter is always
    /// the encoded byte length.
    fn estimate_memory(&self, value: &T) -> usize {
        std::mem::size_of_val(value)
    }
}

/// A `Codec<String>` that stores strings as their UTF-8 bytes, preserving
/// lexicographic byte order (so the core's raw byte comparisons stay
/// consistent with `String`'s own `Ord`). Used for the meta map.
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Box<[u8]> {
        value.clone().into_bytes().into_boxed_slice()
    }

    fn decode(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn estimate_memory(&self, value: &String) -> usize {
        value.len()
    }
}

/// A thin typed view over a byte-level [`MVMap`], the map user-facing API
/// layered outside the core.
pub struct TypedMap<K, V> {
    inner: MVMap,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> TypedMap<K, V> {
    pub fn new(inner: MVMap, key_codec: Arc<dyn Codec<K>>, value_codec: Arc<dyn Codec<V>>) -> Self {
        Self { inner, key_codec, value_codec, _marker: PhantomData }
    }

    pub fn inner(&self) -> &MVMap {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut MVMap {
        &mut self.inner
    }

    pub fn get(&self, key: &K, source: &mut dyn PageSource) -> crate::Result<Option<V>> {
        let bytes = self.key_codec.encode(key);
        Ok(self.inner.get(&bytes, source)?.map(|v| self.value_codec.decode(&v)))
    }

    pub fn put(&mut self, key: K, value: V, source: &mut dyn PageSource) -> crate::Result<Option<V>> {
        let key_bytes = self.key_codec.encode(&key);
        let value_bytes = self.value_codec.encode(&value);
        Ok(self.inner.put(key_bytes, value_bytes, source)?.map(|v| self.value_codec.decode(&v)))
    }

    pub fn remove(&mut self, key: &K, source: &mut dyn PageSource) -> crate::Result<Option<V>> {
        let bytes = self.key_codec.encode(key);
        Ok(self.inner.remove(&bytes, source)?.map(|v| self.value_codec.decode(&v)))
    }

    pub fn iterate(&self, source: &mut dyn PageSource) -> crate::Result<Vec<(K, V)>> {
        Ok(self
            .inner
            .iterate(source)?
            .into_iter()
            .map(|(k, v)| (self.key_codec.decode(&k), self.value_codec.decode(&v)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;
    impl PageSource for Empty {
        fn load(&mut self, _pos: u64) -> crate::Result<Arc<crate::page::Page>> {
            Err(crate::StoreError::ChunkNotFound(0))
        }
        fn note_freed(&mut self, _pos: u64) {}
    }

    #[test]
    fn typed_string_map_round_trips() {
        let mut map = TypedMap::new(MVMap::new(0, "meta", 0), Arc::new(StringCodec), Arc::new(StringCodec));
        let mut source = Empty;
        map.put("chunk.1".to_string(), "id=1".to_string(), &mut source).unwrap();
        assert_eq!(map.get(&"chunk.1".to_string(), &mut source).unwrap(), Some("id=1".to_string()));
    }
}
