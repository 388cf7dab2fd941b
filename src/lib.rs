//! `crab-store`: a single-file, append-mostly, copy-on-write key-value store
//! organized as versioned B-trees.
//!
//! Each top-level commit ([`Store::store`]) produces a new immutable chunk
//! holding every page rewritten since the last commit, plus an updated meta
//! map; the chunk's root is recorded in a two-copy file header for crash
//! safety. The store supports many named maps sharing one file, multi-version
//! reads via [`Store::open_map_version`], explicit [`Store::rollback_to`], and
//! background [`Store::compact`].

pub mod alloc;
pub mod backend;
pub mod builder;
pub mod cache;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod fletcher;
pub mod header;
pub mod meta;
pub mod mvmap;
pub mod page;
pub mod position;
pub mod store;
pub mod varint;

pub use backend::ByteFilter;
pub use builder::{OpenMode, StoreBuilder};
pub use codec::{Codec, StringCodec, TypedMap};
pub use error::{Result, StoreError};
pub use page::DEFAULT_MAX_PAGE_SIZE;
pub use store::Store;

/// Every chunk and file header is block-aligned to this many bytes.
pub const BLOCK_SIZE: usize = 4096;
