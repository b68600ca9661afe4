//! Diagnostic verbs: slow, loud, and the only way subtle on-disk damage
//! ever gets investigated.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::{info, warn};

use crate::asset::{AssetId, AssetType};
use crate::block::{IndexRecord, BLOCK_LENGTH_INVALID, INDEX_RECORD_SIZE};

use super::{log_lock_counts, now, Vfs};

impl Vfs {
    /// Log the global per-kind lock counters.
    pub fn dump_lock_counts(&self) {
        let st = self.state.lock().unwrap();
        log_lock_counts(&st);
    }

    /// Log every file block and every free extent.
    pub fn dump_map(&self) {
        let st = self.state.lock().unwrap();
        info!("files:");
        for (key, block) in &st.blocks {
            info!(
                "location: {}\tlength: {}\t{key}",
                block.location, block.length
            );
        }
        info!("free blocks:");
        for free in st.free.iter() {
            info!("location: {}\tlength: {}", free.location, free.length);
        }
    }

    /// Log usage totals, histograms and the free-index agreement check.
    pub fn dump_statistics(&self) {
        let st = self.state.lock().unwrap();

        let mut invalid_count = 0usize;
        let mut max_file = 0i64;
        let mut total_file = 0i64;
        let mut per_type: BTreeMap<AssetType, (usize, i64)> = BTreeMap::new();
        for (key, block) in &st.blocks {
            if block.length == BLOCK_LENGTH_INVALID {
                invalid_count += 1;
            } else if block.length <= 0 {
                info!(
                    "bad file block at {} length {} ({key})",
                    block.location, block.length
                );
            } else {
                total_file += i64::from(block.length);
            }
            max_file = max_file.max(i64::from(block.length));
            let entry = per_type.entry(key.ty).or_default();
            entry.0 += 1;
            entry.1 += i64::from(block.length.max(0));
        }

        let mut max_free = 0u64;
        let mut total_free = 0u64;
        let mut free_hist: BTreeMap<u32, usize> = BTreeMap::new();
        for free in st.free.iter() {
            total_free += u64::from(free.length);
            max_free = max_free.max(u64::from(free.length));
            *free_hist.entry(free.length).or_default() += 1;
        }
        for (length, count) in &free_hist {
            info!("free length {length} count {count}");
        }

        info!("invalid blocks: {invalid_count}");
        info!("file blocks:    {}", st.blocks.len());
        if st.free.indexes_agree() {
            info!("free indexes agree, free blocks: {}", st.free.len());
        } else {
            warn!("free indexes do not agree!");
        }
        info!("max file: {}K", max_file / 1024);
        info!("max free: {}K", max_free / 1024);
        info!("total file size: {}K", total_file / 1024);
        info!("total free size: {}K", total_free / 1024);
        info!("sum: {} bytes", total_file as u64 + total_free);
        let total = total_file as f64 + total_free as f64;
        if total > 0.0 {
            info!("{:.0}% full", total_file as f64 / total * 100.0);
        }
        for (ty, (count, bytes)) in &per_type {
            info!("type: {ty:?} count: {count} bytes: {} MB", bytes >> 20);
        }

        // adjacency scan: incremental merging should leave nothing here
        let mut prev: Option<(u32, u32)> = None;
        for free in st.free.iter() {
            if let Some((location, length)) = prev {
                if location + length == free.location {
                    info!("potential merge at {location}");
                }
            }
            prev = Some((free.location, free.length));
        }
    }

    /// Verify the index file against the in-memory directory. Very slow; do
    /// not call routinely. Returns whether everything matched.
    pub fn audit(&self) -> bool {
        let st = self.state.lock().unwrap();

        let mut raw = Vec::new();
        {
            let mut file = self.index_file.lock().unwrap();
            let res = file
                .seek(SeekFrom::Start(0))
                .and_then(|_| file.read_to_end(&mut raw));
            if let Err(e) = res {
                warn!("audit: cannot read index: {e}");
                return false;
            }
        }

        let cur_time = now();
        let mut ok = true;
        let mut found: BTreeMap<AssetId, (u32, IndexRecord)> = BTreeMap::new();

        for (i, chunk) in raw.chunks_exact(INDEX_RECORD_SIZE).enumerate() {
            let slot = (i * INDEX_RECORD_SIZE) as u32;
            let rec = IndexRecord::decode(chunk);
            let ty = AssetType::from_code(rec.type_code);
            let sane = rec.length >= 0
                && rec.size >= 0
                && rec.size <= rec.length
                && ty.is_some()
                && rec.access_time <= cur_time
                && !rec.uuid.is_nil();
            if !sane {
                if rec.length != 0 {
                    warn!("audit: asset {} ({}) corrupt on disk", rec.uuid, rec.type_code);
                    ok = false;
                }
                // else: just a hole
                continue;
            }
            let Some(ty) = ty else { continue };
            let key = AssetId::new(rec.uuid, ty);
            if !st.blocks.contains_key(&key) {
                warn!("audit: asset {key} on disk, not in memory, slot {slot}");
                ok = false;
            } else if let Some((dup_slot, _)) = found.get(&key) {
                warn!("audit: duplicate records for {key} at slots {dup_slot} and {slot}");
                warn!("audit: INDEX CORRUPT");
                return false;
            } else {
                found.insert(key, (slot, rec));
            }
        }

        for (key, block) in &st.blocks {
            if block.size <= 0 {
                continue;
            }
            if let Some((_, rec)) = found.remove(key) {
                if rec.location != block.location
                    || rec.length != block.length
                    || rec.size != block.size
                {
                    warn!("audit: asset {key} stale on disk ({:?})", rec);
                    ok = false;
                }
            } else {
                warn!(
                    "audit: asset {key} in memory, not on disk, slot {}",
                    block.index_location
                );
                if block.index_location >= 0 {
                    let at = block.index_location as usize;
                    if at + INDEX_RECORD_SIZE <= raw.len() {
                        let rec = IndexRecord::decode(&raw[at..at + INDEX_RECORD_SIZE]);
                        warn!("audit: instead found {} ({})", rec.uuid, rec.type_code);
                    }
                }
                ok = false;
            }
        }
        for (key, _) in found {
            warn!("audit: asset {key} on disk is a leftover");
            ok = false;
        }

        if ok {
            info!("store: audit OK");
        }
        ok
    }

    /// Quick sanity pass over the in-memory directory. Slow; debugging
    /// only. Returns whether everything checked out.
    pub fn check_mem(&self) -> bool {
        let st = self.state.lock().unwrap();
        let mut ok = true;
        for (key, block) in &st.blocks {
            if key.uuid.is_nil() {
                warn!("block {key} has a nil id");
                ok = false;
            }
            if block.index_location >= 0
                && st.index_holes.contains(&(block.index_location as u32))
            {
                warn!("block {key} is marked as a hole");
                ok = false;
            }
        }
        if ok {
            info!("store: mem check OK");
        }
        ok
    }

    /// Write every live payload out as `<uuid>.<ext>` under `dir`; returns
    /// how many were written.
    pub fn dump_files(&self, dir: &Path) -> std::io::Result<u32> {
        fs::create_dir_all(dir)?;
        let snapshot: Vec<(AssetId, i32)> = {
            let st = self.state.lock().unwrap();
            st.blocks
                .iter()
                .filter(|&(_, b)| b.length != BLOCK_LENGTH_INVALID && b.size > 0)
                .map(|(key, b)| (*key, b.size))
                .collect()
        };

        let mut written = 0;
        for (key, size) in snapshot {
            let mut buf = vec![0u8; size as usize];
            match self.get_data(key, 0, &mut buf) {
                Ok(n) => {
                    let path = dir.join(format!("{}.{}", key.uuid, key.ty.extension()));
                    info!("writing {}", path.display());
                    if let Err(e) = fs::write(&path, &buf[..n]) {
                        warn!("cannot write {}: {e}", path.display());
                        continue;
                    }
                    written += 1;
                }
                Err(e) => warn!("cannot read {key}: {e}"),
            }
        }
        Ok(written)
    }
}
