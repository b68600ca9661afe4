//! Error type shared by store operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::asset::AssetId;

/// Failures surfaced by [`crate::Vfs::open`] and the few operations that
/// refuse outright instead of clamping.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A read-only open could not find or lock the backing files.
    #[error("cannot open read-only store: {0}")]
    CannotOpenReadOnly(PathBuf),

    /// The writer could not create or lock a data file, even after trying
    /// the numbered alternates.
    #[error("cannot create store file: {0}")]
    CannotCreate(PathBuf),

    /// Index replay found unrecoverable damage; both files were deleted.
    #[error("store index corrupt, files removed: {0}")]
    Corrupt(PathBuf),

    /// Renaming over an asset that still holds locks would strand the lock
    /// holders.
    #[error("rename target {0} is locked")]
    LockedTarget(AssetId),

    #[error(transparent)]
    Io(#[from] io::Error),
}
