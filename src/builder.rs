//! Builder-style configuration surface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{ByteFilter, Identity};
use crate::store::Store;

const DEFAULT_CACHE_SIZE_MIB: usize = 16;
const DEFAULT_RETENTION_SECS: u64 = 45;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// Configuration options: `fileName`, `openMode`, `encrypt`, `cacheSize`,
/// `compress`, plus the retention window. Unknown settings are retained
/// rather than rejected.
pub struct StoreBuilder {
    file_name: Option<PathBuf>,
    open_mode: OpenMode,
    encrypt: Option<Arc<dyn ByteFilter>>,
    compress: Option<Arc<dyn ByteFilter>>,
    cache_size_mib: usize,
    retention_time_secs: u64,
    reuse_space: bool,
    extra_settings: BTreeMap<String, String>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            file_name: None,
            open_mode: OpenMode::ReadWrite,
            encrypt: None,
            compress: None,
            cache_size_mib: DEFAULT_CACHE_SIZE_MIB,
            retention_time_secs: DEFAULT_RETENTION_SECS,
            reuse_space: true,
            extra_settings: BTreeMap::new(),
        }
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_name = Some(path.into());
        self
    }

    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    /// Install a caller-supplied byte-stream filter wrapping the file.
    /// Encryption itself is an external collaborator, not implemented here.
    pub fn encrypt(mut self, filter: Arc<dyn ByteFilter>) -> Self {
        self.encrypt = Some(filter);
        self
    }

    /// Install a caller-supplied compression filter, called as a plain
    /// byte-in/byte-out function (e.g. LZF).
    pub fn compress(mut self, filter: Arc<dyn ByteFilter>) -> Self {
        self.compress = Some(filter);
        self
    }

    pub fn cache_size_mib(mut self, mib: usize) -> Self {
        self.cache_size_mib = mib;
        self
    }

    pub fn retention_time_secs(mut self, secs: u64) -> Self {
        self.retention_time_secs = secs;
        self
    }

    /// When `false`, every commit is written at end-of-file instead of
    /// reusing free extents; useful for diagnosing recovery behavior
    /// without the allocator in the mix.
    pub fn reuse_space(mut self, reuse: bool) -> Self {
        self.reuse_space = reuse;
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_settings.insert(key.into(), value.into());
        self
    }

    pub fn open(self) -> crate::Result<Store> {
        let file_name = self
            .file_name
            .clone()
            .ok_or_else(|| crate::StoreError::illegal_argument("fileName must be set"))?;

        let filter: Arc<dyn ByteFilter> = match (self.encrypt.clone(), self.compress.clone()) {
            (None, None) => Arc::new(Identity),
            (Some(f), None) | (None, Some(f)) => f,
            (Some(enc), Some(comp)) => Arc::new(ChainedFilter { outer: enc, inner: comp }),
        };

        Store::open(
            &file_name,
            self.open_mode,
            filter,
            self.cache_size_mib * 1024 * 1024,
            self.retention_time_secs,
            self.reuse_space,
            self.extra_settings,
        )
    }
}

/// Composes two filters: encoding runs inner-then-outer, decoding the
/// reverse, so `encrypt(compress(plain))` on disk becomes
/// `decompress(decrypt(bytes))` on read.
struct ChainedFilter {
    outer: Arc<dyn ByteFilter>,
    inner: Arc<dyn ByteFilter>,
}

impl ByteFilter for ChainedFilter {
    fn encode(&self, plain: &[u8]) -> Vec<u8> {
        self.outer.encode(&self.inner.encode(plain))
    }

    fn decode(&self, encoded: &[u8]) -> crate::Result<Vec<u8>> {
        self.inner.decode(&self.outer.decode(encoded)?)
    }
}
