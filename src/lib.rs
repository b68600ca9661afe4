//! assetfs: an embedded virtual file system for caching binary assets.
//!
//! Many logical assets, each addressed by a (UUID, type) pair, are packed
//! into two host files: a flat data file holding the payload bytes and an
//! index file of fixed-size records describing every extent. Free space is
//! tracked in twin ordered indexes and defragmented incrementally as
//! extents are released; when nothing fits, unlocked assets are evicted in
//! least-recently-used order. The index is rewritten record-by-record on
//! every change, so a hard crash costs at most the record in flight, and a
//! crash marker lets a cache that prefers loss over corruption start blank.

pub mod alloc;
pub mod asset;
pub mod block;
pub mod error;
pub mod host;
pub mod vfs;

pub use asset::{AssetId, AssetType, LockKind};
pub use error::VfsError;
pub use vfs::{OpenOptions, Vfs};
