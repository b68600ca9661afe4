//! Host-file plumbing.
//!
//! The store lives in two plain OS files guarded by advisory locks: the
//! writer takes exclusive locks, a read-only opener takes shared ones. The
//! locks are released when the handles close.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Open an existing file read-write and take the exclusive lock.
pub fn open_rw(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    file.try_lock_exclusive()?;
    Ok(file)
}

/// Create (or take over) a file read-write, exclusively locked and empty.
/// Truncation happens only after the lock is held so a live store held by
/// another process is never clobbered.
pub fn create_rw(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.try_lock_exclusive()?;
    file.set_len(0)?;
    Ok(file)
}

/// Open an existing file read-only with a shared lock.
pub fn open_ro(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new().read(true).open(path)?;
    file.try_lock_shared()?;
    Ok(file)
}

/// Grow a freshly created data file to its target capacity.
pub fn presize(file: &File, size: u32) -> io::Result<()> {
    file.set_len(u64::from(size))
}

/// Path of the marker whose presence flags an unclean shutdown.
pub fn marker_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(".open");
    PathBuf::from(name)
}

/// Path of the numbered sibling tried when the canonical name is taken.
pub fn numbered_sibling(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_and_sibling_names() {
        assert_eq!(marker_path(Path::new("/tmp/cache.dat")), Path::new("/tmp/cache.dat.open"));
        assert_eq!(
            numbered_sibling(Path::new("/tmp/cache.dat"), 7),
            Path::new("/tmp/cache.dat.7")
        );
    }

    #[test]
    fn test_exclusive_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked");
        let held = create_rw(&path).expect("first open");

        assert!(open_rw(&path).is_err());
        assert!(open_ro(&path).is_err());

        drop(held);
        open_rw(&path).expect("reopen after release");
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared");
        drop(create_rw(&path).unwrap());

        let first = open_ro(&path).expect("first reader");
        let second = open_ro(&path).expect("second reader");
        drop((first, second));
    }
}
