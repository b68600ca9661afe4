//! The store proper.
//!
//! Responsibilities:
//! - Own the asset directory (key → [`FileBlock`]) and the free-space
//!   indexes, guarded by one state mutex.
//! - Allocate, grow, shrink and relocate extents; evict unlocked assets in
//!   access-time order when the free indexes come up empty.
//! - Persist every directory change as a fixed-size record in the index
//!   file, immediately, so a hard crash loses at most the in-flight record.
//! - Drive the host-file lifecycle: locking, numbered fallbacks, presizing
//!   and the crash marker.
//!
//! Locking discipline: every operation computes under the state mutex and
//! performs long payload I/O with it released; index records are prepared
//! under the state mutex and written through a separate file mutex (lock
//! order is always state → file).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use crate::alloc::FreeSpace;
use crate::asset::{AssetId, AssetType, LockKind};
use crate::block::{
    round_to_granularity, FileBlock, FreeBlock, IndexRecord, RecordClass, BLOCK_LENGTH_INVALID,
    INDEX_RECORD_SIZE,
};
use crate::error::VfsError;
use crate::host;

mod stats;

/// Capacity seeded for a brand-new data file that was not presized: 1 GiB.
pub const DEFAULT_CAPACITY: u32 = 0x4000_0000;

/// An aggressive eviction sweep frees at least this much in one stroke.
pub const EVICTION_SWEEP_BYTES: u32 = 5 * 1024 * 1024;

/// Numbered sibling names tried when the canonical data file is taken.
const ALTERNATE_LIMIT: u32 = 256;

/// Free-space hunts longer than this get logged.
const SLOW_HUNT: Duration = Duration::from_millis(500);

/// Open-time knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Shared-lock opener: no writes, no recovery actions.
    pub read_only: bool,
    /// Size a freshly created data file up front (bytes); 0 leaves it empty
    /// with a [`DEFAULT_CAPACITY`] virtual free extent.
    pub presize: u32,
    /// Delete both files at open when the crash marker from a previous run
    /// is still present.
    pub remove_after_crash: bool,
}

/// Everything the state mutex guards.
struct State {
    blocks: BTreeMap<AssetId, FileBlock>,
    free: FreeSpace,
    /// Reusable zero-filled slots in the index file, by byte offset.
    index_holes: VecDeque<u32>,
    /// End of the index file; appends allocate from here.
    index_eof: u32,
    /// Global per-kind lock counters, for diagnostics only.
    lock_counts: [i32; LockKind::COUNT],
}

/// An embedded virtual file system packing many assets into one data file
/// plus one index file.
pub struct Vfs {
    state: Mutex<State>,
    data_file: Mutex<File>,
    index_file: Mutex<File>,
    data_path: PathBuf,
    index_path: PathBuf,
    read_only: bool,
    remove_after_crash: bool,
}

struct IndexCorrupt;

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn apply_presize(file: &File, size: u32, path: &Path) {
    if size == 0 {
        return;
    }
    match host::presize(file, size) {
        Ok(()) => info!("pre-sized store data file {} to {size} bytes", path.display()),
        Err(e) => warn!("failed to pre-size {}: {e}", path.display()),
    }
}

fn log_lock_counts(st: &State) {
    for kind in LockKind::ALL {
        info!("lock type {kind:?}: {}", st.lock_counts[kind.index()]);
    }
}

fn read_fill(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn zero_slot(file: &mut File, slot: u32) {
    let zeros = [0u8; INDEX_RECORD_SIZE];
    let res = file
        .seek(SeekFrom::Start(slot.into()))
        .and_then(|_| file.write_all(&zeros));
    if let Err(e) = res {
        warn!("failed to clear index slot {slot}: {e}");
    }
}

impl Vfs {
    /// Open or create the store backed by `index_path` + `data_path`.
    pub fn open(
        index_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
        opts: OpenOptions,
    ) -> Result<Vfs, VfsError> {
        Vfs::open_inner(index_path.as_ref(), data_path.as_ref(), opts)
    }

    fn open_inner(index_path: &Path, data_path: &Path, opts: OpenOptions) -> Result<Vfs, VfsError> {
        let mut index_path = index_path.to_path_buf();
        let mut data_path = data_path.to_path_buf();

        let mut data_file = if opts.read_only {
            match host::open_ro(&data_path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("can't find {} to open read-only store: {e}", data_path.display());
                    return Err(VfsError::CannotOpenReadOnly(data_path));
                }
            }
        } else {
            match host::open_rw(&data_path) {
                Ok(file) => file,
                Err(_) => Vfs::create_data_file(&mut index_path, &mut data_path, opts.presize)?,
            }
        };

        // A marker left behind by a previous run means an unclean shutdown:
        // prefer losing the cache to trusting it.
        if !opts.read_only && opts.remove_after_crash {
            let marker = host::marker_path(&data_path);
            if marker.exists() {
                warn!(
                    "store {} was left open by a previous run, removing it",
                    data_path.display()
                );
                drop(data_file);
                let _ = fs::remove_file(&index_path);
                let _ = fs::remove_file(&data_path);
                let _ = fs::remove_file(&marker);

                data_file = match host::create_rw(&data_path) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!("can't recreate store data file after crash: {e}");
                        return Err(VfsError::CannotCreate(data_path));
                    }
                };
                apply_presize(&data_file, opts.presize, &data_path);
            }
        }

        let data_size = data_file
            .metadata()
            .map(|m| m.len())?
            .min(u64::from(u32::MAX)) as u32;

        let mut st = State {
            blocks: BTreeMap::new(),
            free: FreeSpace::new(),
            index_holes: VecDeque::new(),
            index_eof: 0,
            lock_counts: [0; LockKind::COUNT],
        };

        // An index shorter than one record is treated as absent: the store
        // starts blank.
        let index_len = fs::metadata(&index_path).map(|m| m.len()).unwrap_or(0);
        let existing_index = if index_len >= INDEX_RECORD_SIZE as u64 {
            if opts.read_only {
                host::open_ro(&index_path).ok()
            } else {
                host::open_rw(&index_path).ok()
            }
        } else {
            None
        };

        let index_file = match existing_index {
            Some(mut file) => {
                let mut raw = Vec::with_capacity(index_len as usize);
                file.read_to_end(&mut raw)?;
                match Vfs::replay_index(&mut st, &raw, data_size, &mut file, opts.read_only) {
                    Ok(()) => file,
                    Err(IndexCorrupt) => {
                        warn!(
                            "store has bad index data, removing {} and {}",
                            index_path.display(),
                            data_path.display()
                        );
                        drop(file);
                        drop(data_file);
                        let _ = fs::remove_file(&index_path);
                        let _ = fs::remove_file(&data_path);
                        return Err(VfsError::Corrupt(index_path));
                    }
                }
            }
            None => {
                if opts.read_only {
                    warn!("can't find {} to open read-only store", index_path.display());
                    return Err(VfsError::CannotOpenReadOnly(index_path));
                }
                let file = match host::create_rw(&index_path) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(
                            "couldn't create index {} ({e}), probably a sharing violation",
                            index_path.display()
                        );
                        drop(data_file);
                        let _ = fs::remove_file(&data_path);
                        return Err(VfsError::CannotCreate(index_path));
                    }
                };
                st.free.add(FreeBlock {
                    location: 0,
                    length: if data_size > 0 { data_size } else { DEFAULT_CAPACITY },
                });
                file
            }
        };

        if !opts.read_only && opts.remove_after_crash {
            if let Err(e) = File::create(host::marker_path(&data_path)) {
                warn!("can't write crash marker for {}: {e}", data_path.display());
            }
        }

        info!(
            "store open: index {} data {} ({data_size} bytes)",
            index_path.display(),
            data_path.display()
        );

        Ok(Vfs {
            state: Mutex::new(st),
            data_file: Mutex::new(data_file),
            index_file: Mutex::new(index_file),
            data_path,
            index_path,
            read_only: opts.read_only,
            remove_after_crash: opts.remove_after_crash,
        })
    }

    // The canonical data file could not be opened read-write: create it, or
    // fall back to up to ALTERNATE_LIMIT numbered siblings.
    fn create_data_file(
        index_path: &mut PathBuf,
        data_path: &mut PathBuf,
        presize: u32,
    ) -> Result<File, VfsError> {
        if let Ok(file) = host::create_rw(data_path) {
            // brand-new data file: any surviving index is stale
            let _ = fs::remove_file(&index_path);
            apply_presize(&file, presize, data_path);
            return Ok(file);
        }

        warn!(
            "can't open store data file {}, trying alternates",
            data_path.display()
        );
        for n in 0..ALTERNATE_LIMIT {
            let alt_data = host::numbered_sibling(data_path, n);
            let alt_index = host::numbered_sibling(index_path, n);
            if let Ok(file) = host::open_rw(&alt_data) {
                *data_path = alt_data;
                *index_path = alt_index;
                return Ok(file);
            }
            if let Ok(file) = host::create_rw(&alt_data) {
                let _ = fs::remove_file(&alt_index);
                apply_presize(&file, presize, &alt_data);
                *data_path = alt_data;
                *index_path = alt_index;
                return Ok(file);
            }
        }

        warn!("couldn't open a store data file after trying every alternate");
        Err(VfsError::CannotCreate(data_path.clone()))
    }

    // Rebuild the in-memory state from the raw index image. An error means
    // the caller must delete both files.
    fn replay_index(
        st: &mut State,
        raw: &[u8],
        data_size: u32,
        index_file: &mut File,
        read_only: bool,
    ) -> Result<(), IndexCorrupt> {
        let mut scratch: Vec<(u32, IndexRecord)> = Vec::new();

        for (i, chunk) in raw.chunks_exact(INDEX_RECORD_SIZE).enumerate() {
            let offset = (i * INDEX_RECORD_SIZE) as u32;
            let rec = IndexRecord::decode(chunk);
            match rec.classify(data_size) {
                RecordClass::Live(ty) => {
                    // first record wins a contested key; the extent sweep
                    // below still sees every record
                    st.blocks
                        .entry(AssetId::new(rec.uuid, ty))
                        .or_insert(FileBlock {
                            location: rec.location,
                            length: rec.length,
                            size: rec.size,
                            access_time: rec.access_time,
                            index_location: offset as i32,
                            locks: [0; LockKind::COUNT],
                        });
                    scratch.push((offset, rec));
                }
                RecordClass::Hole => st.index_holes.push_back(offset),
                RecordClass::Corrupt => {
                    warn!(
                        "index corruption: {} ({}) at slot {offset}, data size {data_size}",
                        rec.uuid, rec.type_code
                    );
                    warn!(
                        "length: {}\tlocation: {}\tsize: {}",
                        rec.length, rec.location, rec.size
                    );
                    return Err(IndexCorrupt);
                }
            }
        }
        st.index_eof = (raw.len() - raw.len() % INDEX_RECORD_SIZE) as u32;

        if scratch.is_empty() {
            if data_size > 0 {
                st.free.add(FreeBlock { location: 0, length: data_size });
            }
            return Ok(());
        }
        scratch.sort_by_key(|&(_, rec)| (rec.location, rec.length));

        // Sweep the location-sorted records: every gap becomes a free
        // extent, duplicates are purged, overlap is unrecoverable.
        let mut freed: BTreeSet<(u32, i32)> = BTreeSet::new();
        let mut holed: BTreeSet<u32> = BTreeSet::new();
        let (mut prev_slot, mut prev) = scratch[0];
        if prev.location > 0 {
            st.free.add(FreeBlock { location: 0, length: prev.location });
        }
        for &(slot, cur) in &scratch[1..] {
            if cur.location == prev.location && cur.length == prev.length {
                warn!(
                    "removing duplicate entry at {} length {} size {} id {} type {}",
                    cur.location, cur.length, cur.size, cur.uuid, cur.type_code
                );
                // nuke both records for safety
                for rec in [&prev, &cur] {
                    if let Some(ty) = AssetType::from_code(rec.type_code) {
                        st.blocks.remove(&AssetId::new(rec.uuid, ty));
                    }
                }
                if !read_only {
                    for s in [prev_slot, slot] {
                        if holed.insert(s) {
                            zero_slot(index_file, s);
                            st.index_holes.push_back(s);
                        }
                    }
                }
                if cur.length > 0 && freed.insert((cur.location, cur.length)) {
                    st.free.add(FreeBlock {
                        location: cur.location,
                        length: cur.length as u32,
                    });
                }
                prev_slot = slot;
                prev = cur;
                continue;
            }

            let end = u64::from(prev.location) + prev.length as u64;
            if u64::from(cur.location) < end || end > u64::from(data_size) {
                warn!(
                    "overlapping entries at {} length {} id {} type {}",
                    cur.location, cur.length, cur.uuid, cur.type_code
                );
                return Err(IndexCorrupt);
            }
            let gap = u64::from(cur.location) - end;
            if gap > 0 {
                st.free.add(FreeBlock { location: end as u32, length: gap as u32 });
            }
            prev_slot = slot;
            prev = cur;
        }
        let end = u64::from(prev.location) + prev.length as u64;
        if u64::from(data_size) > end {
            st.free.add(FreeBlock {
                location: end as u32,
                length: (u64::from(data_size) - end) as u32,
            });
        }
        Ok(())
    }

    /// True if the asset exists with a live extent. Refreshes the LRU stamp.
    pub fn exists(&self, id: AssetId) -> bool {
        let mut st = self.state.lock().unwrap();
        let stamp = now();
        match st.blocks.get_mut(&id) {
            Some(block) => {
                block.access_time = stamp;
                block.length > 0
            }
            None => false,
        }
    }

    /// Stored byte count, or 0 when absent. Refreshes the LRU stamp.
    pub fn size(&self, id: AssetId) -> i32 {
        let mut st = self.state.lock().unwrap();
        let stamp = now();
        match st.blocks.get_mut(&id) {
            Some(block) => {
                block.access_time = stamp;
                block.size
            }
            None => 0,
        }
    }

    /// Reserved extent length: `-1` for a lock-only dummy, 0 when absent.
    /// Refreshes the LRU stamp.
    pub fn max_size(&self, id: AssetId) -> i32 {
        let mut st = self.state.lock().unwrap();
        let stamp = now();
        match st.blocks.get_mut(&id) {
            Some(block) => {
                block.access_time = stamp;
                block.length
            }
            None => 0,
        }
    }

    /// Whether any single free extent can hold `size` bytes right now,
    /// without evicting anything.
    pub fn check_available(&self, size: u32) -> bool {
        self.state.lock().unwrap().free.check_available(size)
    }

    /// Reserve `max_size` bytes for the asset, creating, growing or
    /// shrinking its extent. Returns false when no extent can be found even
    /// after eviction has done its best.
    pub fn set_max_size(&self, id: AssetId, max_size: i32) -> bool {
        if self.read_only {
            warn!("store is read-only, ignoring resize of {id}");
            return false;
        }
        if max_size <= 0 {
            warn!("attempt to assign size {max_size} to asset {id}");
            return false;
        }
        let max_size = round_to_granularity(max_size);
        let need = max_size as u32;
        let stamp = now();

        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        let current = match st.blocks.get_mut(&id) {
            Some(block) if block.length > 0 => {
                block.access_time = stamp;
                Some((block.location, block.length))
            }
            _ => None,
        };

        if let Some((location, length)) = current {
            if max_size == length {
                return true;
            }

            if max_size < length {
                // shrinking: give the tail back to the allocator
                st.free.add(FreeBlock {
                    location: location + need,
                    length: (length - max_size) as u32,
                });
                if let Some(block) = st.blocks.get_mut(&id) {
                    block.length = max_size;
                    if block.size > block.length {
                        error!("truncating asset {id} to {max_size} bytes");
                        block.size = block.length;
                    }
                }
                let sync = self.prepare_sync(st, &id, false);
                drop(guard);
                if let Some((pos, rec)) = sync {
                    self.write_index(pos, &rec);
                }
                return true;
            }

            // growing: prefer extending into an adjacent free extent, which
            // spares the copy in the common append-heavy case
            let increase = (max_size - length) as u32;
            let adjacent = st
                .free
                .next_after(location)
                .filter(|f| f.location == location + length as u32 && f.length >= increase);
            if let Some(free) = adjacent {
                st.free.use_leading(free, increase);
                if let Some(block) = st.blocks.get_mut(&id) {
                    block.length = max_size;
                }
                let sync = self.prepare_sync(st, &id, false);
                drop(guard);
                if let Some((pos, rec)) = sync {
                    self.write_index(pos, &rec);
                }
                return true;
            }

            // relocate to a fresh extent, carrying the used bytes
            let Some(found) = self.find_free_block(st, need, Some(id)) else {
                warn!("no space ({max_size}) to resize asset {id}");
                drop(guard);
                self.dump_statistics();
                return false;
            };
            let used = st.blocks.get(&id).map_or(0, |b| b.size);
            st.free.add(FreeBlock { location, length: length as u32 });
            // the old extent may just have merged into the extent we found
            let Some(free) = st.free.containing(found.location) else {
                warn!("free index lost extent at {}", found.location);
                return false;
            };
            if used > 0 && free.location != location {
                self.copy_region(location, free.location, used as usize);
            }
            if let Some(block) = st.blocks.get_mut(&id) {
                block.location = free.location;
                block.length = max_size;
            }
            st.free.use_leading(free, need);
            let sync = self.prepare_sync(st, &id, false);
            drop(guard);
            if let Some((pos, rec)) = sync {
                self.write_index(pos, &rec);
            }
            return true;
        }

        // new asset, or a lock-only dummy gaining an extent
        let Some(free) = self.find_free_block(st, need, None) else {
            warn!("no space ({max_size}) for new asset {id}");
            drop(guard);
            self.dump_statistics();
            return false;
        };
        let block = st
            .blocks
            .entry(id)
            .or_insert_with(|| FileBlock::new(0, 0, stamp));
        block.location = free.location;
        block.length = max_size;
        block.access_time = stamp;
        st.free.use_leading(free, need);
        let sync = self.prepare_sync(st, &id, false);
        drop(guard);
        if let Some((pos, rec)) = sync {
            self.write_index(pos, &rec);
        }
        true
    }

    /// Move an asset to a new identity, carrying its locks along. Any
    /// record already at the target is purged first; a locked target is
    /// refused outright.
    pub fn rename(&self, id: AssetId, new_id: AssetId) -> Result<(), VfsError> {
        if self.read_only {
            warn!("store is read-only, ignoring rename of {id}");
            return Ok(());
        }
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        if !st.blocks.contains_key(&id) {
            warn!("attempt to rename nonexistent asset {id}");
            return Ok(());
        }
        if st.blocks.contains_key(&new_id) {
            // free the occupant's extent; what remains is a lock-carrying
            // dummy
            self.remove_file_block(st, &new_id);
            if st.blocks.get(&new_id).is_some_and(|b| b.is_locked()) {
                return Err(VfsError::LockedTarget(new_id));
            }
            st.blocks.remove(&new_id);
        }
        let Some(mut block) = st.blocks.remove(&id) else {
            return Ok(());
        };
        block.access_time = now();
        st.blocks.insert(new_id, block);
        let sync = self.prepare_sync(st, &new_id, false);
        drop(guard);
        if let Some((pos, rec)) = sync {
            self.write_index(pos, &rec);
        }
        Ok(())
    }

    /// Release the asset's extent. A record that still holds locks collapses
    /// to a dummy; removing a record that is already a dummy destroys it.
    pub fn remove(&self, id: AssetId) {
        if self.read_only {
            warn!("store is read-only, ignoring removal of {id}");
            return;
        }
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        match st.blocks.get(&id) {
            Some(block) if block.length == BLOCK_LENGTH_INVALID => {
                st.blocks.remove(&id);
            }
            Some(_) => self.remove_file_block(st, &id),
            None => warn!("attempt to remove nonexistent asset {id}"),
        }
    }

    /// Read payload bytes starting at `offset` into `buf`; returns the
    /// count actually read, clamped to the stored size.
    pub fn get_data(&self, id: AssetId, offset: u32, buf: &mut [u8]) -> io::Result<usize> {
        let (file_location, take) = {
            let mut st = self.state.lock().unwrap();
            let Some(block) = st.blocks.get_mut(&id) else {
                return Ok(0);
            };
            block.access_time = now();
            if i64::from(offset) > i64::from(block.size) {
                warn!(
                    "attempt to read at {offset} in asset {id} of size {}",
                    block.size
                );
                return Ok(0);
            }
            let take = buf.len().min((block.size - offset as i32) as usize);
            (u64::from(block.location) + u64::from(offset), take)
        };

        // payload transfer with the state mutex released
        let mut file = self.data_file.lock().unwrap();
        file.seek(SeekFrom::Start(file_location))?;
        read_fill(&mut file, &mut buf[..take])
    }

    /// Write `buf` at `offset` (`None` appends at the current size) and
    /// return the byte count written. Writes are clamped to the reservation;
    /// writes to a removed (dummy) record are swallowed but reported as
    /// complete so upstream pipelines keep draining.
    pub fn store_data(&self, id: AssetId, offset: Option<u32>, buf: &[u8]) -> io::Result<usize> {
        if self.read_only {
            warn!("store is read-only, dropping write to {id}");
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let (file_location, location, take) = {
            let mut st = self.state.lock().unwrap();
            let Some(block) = st.blocks.get_mut(&id) else {
                return Ok(0);
            };
            let location = offset.unwrap_or(block.size as u32);
            block.access_time = now();

            if block.length == BLOCK_LENGTH_INVALID {
                warn!(
                    "attempt to write {} bytes at {location} to removed asset {id}",
                    buf.len()
                );
                return Ok(buf.len());
            }
            if i64::from(location) > i64::from(block.length) {
                warn!(
                    "attempt to write at {location} in asset {id} of length {}",
                    block.length
                );
                return Ok(buf.len());
            }
            let mut take = buf.len();
            if take as i64 > i64::from(block.length) - i64::from(location) {
                warn!("truncating write to asset {id}");
                take = (block.length as u32 - location) as usize;
            }
            (u64::from(block.location) + u64::from(location), location, take)
        };

        // payload transfer with the state mutex released
        let written = {
            let mut file = self.data_file.lock().unwrap();
            file.seek(SeekFrom::Start(file_location))?;
            let mut written = 0;
            let res = loop {
                if written == take {
                    break Ok(());
                }
                match file.write(&buf[written..take]) {
                    Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            };
            if let Err(e) = res {
                warn!("store write error: {written} != {take}: {e}");
            }
            written
        };

        // publish the new size and persist the record if the write grew it
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let grew = match st.blocks.get_mut(&id) {
            Some(block) if (location as i64 + take as i64) > i64::from(block.size) => {
                block.size = location as i32 + written as i32;
                true
            }
            _ => false,
        };
        let sync = if grew { self.prepare_sync(st, &id, false) } else { None };
        drop(guard);
        if let Some((pos, rec)) = sync {
            self.write_index(pos, &rec);
        }

        Ok(written)
    }

    /// Take one `kind` reference on the asset, creating a lock-only dummy
    /// record when the asset does not exist yet.
    pub fn inc_lock(&self, id: AssetId, kind: LockKind) {
        let mut st = self.state.lock().unwrap();
        let stamp = now();
        let block = st.blocks.entry(id).or_insert_with(|| FileBlock::dummy(stamp));
        block.locks[kind.index()] += 1;
        st.lock_counts[kind.index()] += 1;
    }

    /// Drop one `kind` reference. Going below zero is a warning, not a
    /// crash.
    pub fn dec_lock(&self, id: AssetId, kind: LockKind) {
        let mut st = self.state.lock().unwrap();
        if let Some(block) = st.blocks.get_mut(&id) {
            if block.locks[kind.index()] > 0 {
                block.locks[kind.index()] -= 1;
            } else {
                warn!("decrementing zero-value {kind:?} lock on {id}");
            }
            st.lock_counts[kind.index()] -= 1;
        }
    }

    pub fn is_locked(&self, id: AssetId, kind: LockKind) -> bool {
        let st = self.state.lock().unwrap();
        st.blocks
            .get(&id)
            .map_or(false, |block| block.locks[kind.index()] > 0)
    }

    /// Touch the first word of both host files to prove the filesystem is
    /// still answering. Failures are warnings.
    pub fn poke_files(&self) {
        Vfs::poke(&self.data_file, &self.data_path);
        Vfs::poke(&self.index_file, &self.index_path);
    }

    fn poke(file: &Mutex<File>, path: &Path) {
        let mut file = file.lock().unwrap();
        let res = (|| -> io::Result<()> {
            let mut word = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            // only write back what was actually read, never garbage
            if read_fill(&mut file, &mut word)? == 4 {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&word)?;
                file.flush()?;
            }
            Ok(())
        })();
        if let Err(e) = res {
            warn!("poke of {} failed: {e}", path.display());
        }
    }

    // Free the extent and reduce the record to a lock-holding dummy.
    // State lock held by the caller.
    fn remove_file_block(&self, st: &mut State, id: &AssetId) {
        if let Some((pos, rec)) = self.prepare_sync(st, id, true) {
            self.write_index(pos, &rec);
        }
        if let Some(block) = st.blocks.get_mut(id) {
            let extent = (block.length > 0).then(|| FreeBlock {
                location: block.location,
                length: block.length as u32,
            });
            block.location = 0;
            block.size = 0;
            block.length = BLOCK_LENGTH_INVALID;
            block.index_location = -1;
            if let Some(extent) = extent {
                st.free.add(extent);
            }
        }
    }

    // Locate a free extent of at least `size` bytes, evicting unlocked
    // assets in access-time order when nothing fits. State lock held by the
    // caller; `immune` survives even when it is the LRU candidate.
    fn find_free_block(&self, st: &mut State, size: u32, immune: Option<AssetId>) -> Option<FreeBlock> {
        let started = Instant::now();
        let mut lru: Option<BTreeSet<(u32, AssetId)>> = None;

        let found = loop {
            if let Some(block) = st.free.find(size) {
                break Some(block);
            }

            let candidates = lru.get_or_insert_with(|| {
                st.blocks
                    .iter()
                    .filter(|&(key, block)| {
                        Some(*key) != immune && block.length > 0 && !block.is_locked()
                    })
                    .map(|(key, block)| (block.access_time, *key))
                    .collect()
            });
            if candidates.is_empty() {
                warn!("can't make {size} bytes of free space, giving up");
                break None;
            }

            let Some(&(stamp, head)) = candidates.iter().next() else {
                break None;
            };
            if st.blocks.get(&head).map_or(0, |b| b.length) >= size as i32 {
                // the oldest file alone covers the request
                info!("evicting {head}");
                candidates.remove(&(stamp, head));
                self.remove_file_block(st, &head);
                continue;
            }

            // Aggressive sweep: free several files in one stroke so the
            // next allocations don't each pay for their own eviction.
            info!("aggressive eviction, {} candidates remain", candidates.len());
            log_lock_counts(st);
            let target = u64::from(size.max(EVICTION_SWEEP_BYTES));
            let mut cleaned = 0u64;
            while cleaned < target && !st.free.check_available(size) {
                let Some(&(stamp, key)) = candidates.iter().next() else {
                    break;
                };
                candidates.remove(&(stamp, key));
                cleaned += st.blocks.get(&key).map_or(0, |b| b.length.max(0)) as u64;
                self.remove_file_block(st, &key);
            }
        };

        let elapsed = started.elapsed();
        if elapsed > SLOW_HUNT {
            warn!(
                "spent {:.2}s hunting for {size} bytes of free space",
                elapsed.as_secs_f32()
            );
        }
        found
    }

    // Allocate or reuse the record's index slot and build its on-disk
    // image. State lock held by the caller; the returned image may be
    // written after the lock is released.
    fn prepare_sync(
        &self,
        st: &mut State,
        id: &AssetId,
        remove: bool,
    ) -> Option<(u32, [u8; INDEX_RECORD_SIZE])> {
        if self.read_only {
            warn!("attempt to sync read-only store");
            return None;
        }
        let block = st.blocks.get_mut(id)?;
        if block.length == BLOCK_LENGTH_INVALID {
            // lock-only dummy, never persisted
            return None;
        }
        if block.length == 0 {
            error!("syncing zero-length block for {id}");
            return None;
        }

        let slot = if block.index_location >= 0 {
            block.index_location as u32
        } else if let Some(hole) = st.index_holes.pop_front() {
            hole
        } else {
            let slot = st.index_eof;
            st.index_eof += INDEX_RECORD_SIZE as u32;
            slot
        };
        block.index_location = slot as i32;

        if remove {
            st.index_holes.push_back(slot);
            return Some((slot, [0u8; INDEX_RECORD_SIZE]));
        }
        let rec = IndexRecord::for_block(id, block);
        Some((slot, rec.encode()))
    }

    fn write_index(&self, pos: u32, buf: &[u8; INDEX_RECORD_SIZE]) {
        let mut file = self.index_file.lock().unwrap();
        let res = file
            .seek(SeekFrom::Start(pos.into()))
            .and_then(|_| file.write_all(buf));
        if let Err(e) = res {
            warn!("index write at {pos} failed: {e}");
        }
    }

    // Move payload bytes between data-file extents (relocation). Errors are
    // warnings; the extent bookkeeping has already moved on.
    fn copy_region(&self, from: u32, to: u32, len: usize) {
        let mut buf = vec![0u8; len];
        let res = (|| -> io::Result<()> {
            let mut file = self.data_file.lock().unwrap();
            file.seek(SeekFrom::Start(from.into()))?;
            read_fill(&mut file, &mut buf)?;
            file.seek(SeekFrom::Start(to.into()))?;
            file.write_all(&buf)
        })();
        if let Err(e) = res {
            warn!("relocation copy {from} -> {to} failed: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: AssetId, access_time: u32) {
        if let Some(block) = self.state.lock().unwrap().blocks.get_mut(&id) {
            block.access_time = access_time;
        }
    }
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs")
            .field("index", &self.index_path)
            .field("data", &self.data_path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        // the advisory locks die with the handles; only the marker needs
        // explicit cleanup
        if !self.read_only && self.remove_after_crash {
            let _ = fs::remove_file(host::marker_path(&self.data_path));
        }
    }
}
