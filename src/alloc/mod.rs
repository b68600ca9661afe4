//! Free-space bookkeeping for the data file.
//!
//! The same extent set is kept in two ordered indexes: by location (unique)
//! and by (length, location), so allocation is a range query and adjacency
//! is a neighbor lookup. Inserting an extent merges it with any extent that
//! ends exactly where it begins or begins exactly where it ends; no
//! free/free boundary survives a call.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::block::FreeBlock;

#[derive(Debug, Default)]
pub struct FreeSpace {
    by_location: BTreeMap<u32, u32>,
    by_length: BTreeSet<(u32, u32)>,
}

impl FreeSpace {
    pub fn new() -> FreeSpace {
        FreeSpace::default()
    }

    /// Number of tracked free extents.
    pub fn len(&self) -> usize {
        self.by_location.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }

    /// Smallest extent able to hold `size` bytes; ties break on ascending
    /// location.
    pub fn find(&self, size: u32) -> Option<FreeBlock> {
        self.by_length
            .range((size, 0)..)
            .next()
            .map(|&(length, location)| FreeBlock { location, length })
    }

    pub fn check_available(&self, size: u32) -> bool {
        self.find(size).is_some()
    }

    /// Nearest extent starting strictly after `location`.
    pub fn next_after(&self, location: u32) -> Option<FreeBlock> {
        self.by_location
            .range((Bound::Excluded(location), Bound::Unbounded))
            .next()
            .map(|(&location, &length)| FreeBlock { location, length })
    }

    /// The extent covering `location`, if that byte is free.
    pub fn containing(&self, location: u32) -> Option<FreeBlock> {
        self.by_location
            .range(..=location)
            .next_back()
            .map(|(&start, &length)| FreeBlock { location: start, length })
            .filter(|block| location < block.location + block.length)
    }

    /// Insert a free extent, merging with the previous and/or next extent
    /// when the locations are exactly adjacent.
    pub fn add(&mut self, block: FreeBlock) {
        debug_assert!(block.length > 0);
        debug_assert!(
            !self.by_location.contains_key(&block.location),
            "free extent already tracked"
        );

        let prev = self
            .by_location
            .range(..block.location)
            .next_back()
            .map(|(&location, &length)| FreeBlock { location, length })
            .filter(|p| p.location + p.length == block.location);
        let next = self
            .by_location
            .range(block.location..)
            .next()
            .map(|(&location, &length)| FreeBlock { location, length })
            .filter(|n| block.location + block.length == n.location);

        match (prev, next) {
            (Some(p), Some(n)) => {
                // both neighbors collapse into one extended predecessor
                self.erase(n);
                self.by_length.remove(&(p.length, p.location));
                let merged = p.length + block.length + n.length;
                self.by_location.insert(p.location, merged);
                self.by_length.insert((merged, p.location));
            }
            (Some(p), None) => {
                // predecessor keeps its location, only its length changes
                self.by_length.remove(&(p.length, p.location));
                let merged = p.length + block.length;
                self.by_location.insert(p.location, merged);
                self.by_length.insert((merged, p.location));
            }
            (None, Some(n)) => {
                // successor extends leftward: both of its keys change
                self.erase(n);
                self.insert_raw(FreeBlock {
                    location: block.location,
                    length: block.length + n.length,
                });
            }
            (None, None) => self.insert_raw(block),
        }
    }

    /// Insert a free extent into both indexes without any merge logic.
    fn insert_raw(&mut self, block: FreeBlock) {
        self.by_location.insert(block.location, block.length);
        self.by_length.insert((block.length, block.location));
    }

    /// Drop a tracked extent from both indexes.
    pub fn erase(&mut self, block: FreeBlock) {
        let removed = self.by_location.remove(&block.location);
        debug_assert_eq!(removed, Some(block.length));
        let was_present = self.by_length.remove(&(block.length, block.location));
        debug_assert!(was_present, "length index out of step with location index");
    }

    /// Consume the leading `n` bytes of a tracked extent.
    pub fn use_leading(&mut self, block: FreeBlock, n: u32) {
        self.erase(block);
        if n < block.length {
            self.add(FreeBlock {
                location: block.location + n,
                length: block.length - n,
            });
        }
    }

    /// Extents in location order.
    pub fn iter(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        self.by_location
            .iter()
            .map(|(&location, &length)| FreeBlock { location, length })
    }

    /// Both indexes must describe the same extent set.
    pub fn indexes_agree(&self) -> bool {
        self.by_location.len() == self.by_length.len()
            && self
                .by_location
                .iter()
                .all(|(&location, &length)| self.by_length.contains(&(length, location)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(free: &FreeSpace) -> Vec<(u32, u32)> {
        free.iter().map(|b| (b.location, b.length)).collect()
    }

    #[test]
    fn test_add_plain_insert() {
        let mut free = FreeSpace::new();
        free.add(FreeBlock { location: 0, length: 1024 });
        free.add(FreeBlock { location: 4096, length: 2048 });
        assert_eq!(blocks(&free), vec![(0, 1024), (4096, 2048)]);
        assert!(free.indexes_agree());
    }

    #[test]
    fn test_add_merges_with_previous() {
        let mut free = FreeSpace::new();
        free.add(FreeBlock { location: 0, length: 1024 });
        free.add(FreeBlock { location: 1024, length: 1024 });
        assert_eq!(blocks(&free), vec![(0, 2048)]);
        assert!(free.indexes_agree());
    }

    #[test]
    fn test_add_merges_with_next() {
        let mut free = FreeSpace::new();
        free.add(FreeBlock { location: 2048, length: 1024 });
        free.add(FreeBlock { location: 1024, length: 1024 });
        assert_eq!(blocks(&free), vec![(1024, 2048)]);
        assert!(free.indexes_agree());
    }

    #[test]
    fn test_add_merges_both_neighbors() {
        let mut free = FreeSpace::new();
        free.add(FreeBlock { location: 0, length: 1024 });
        free.add(FreeBlock { location: 2048, length: 1024 });
        free.add(FreeBlock { location: 1024, length: 1024 });
        assert_eq!(blocks(&free), vec![(0, 3072)]);
        assert_eq!(free.len(), 1);
        assert!(free.indexes_agree());
    }

    #[test]
    fn test_find_prefers_smallest_then_lowest_location() {
        let mut free = FreeSpace::new();
        free.add(FreeBlock { location: 0, length: 4096 });
        free.add(FreeBlock { location: 8192, length: 1024 });
        free.add(FreeBlock { location: 16384, length: 4096 });

        assert_eq!(free.find(1024), Some(FreeBlock { location: 8192, length: 1024 }));
        assert_eq!(free.find(2048), Some(FreeBlock { location: 0, length: 4096 }));
        assert_eq!(free.find(8192), None);
        assert!(free.check_available(4096));
        assert!(!free.check_available(4097));
    }

    #[test]
    fn test_use_leading_consumes_or_shortens() {
        let mut free = FreeSpace::new();
        let block = FreeBlock { location: 1024, length: 4096 };
        free.add(block);
        free.use_leading(block, 1024);
        assert_eq!(blocks(&free), vec![(2048, 3072)]);

        let rest = FreeBlock { location: 2048, length: 3072 };
        free.use_leading(rest, 3072);
        assert!(free.is_empty());
        assert!(free.indexes_agree());
    }

    #[test]
    fn test_neighbor_lookups() {
        let mut free = FreeSpace::new();
        free.add(FreeBlock { location: 1024, length: 1024 });
        free.add(FreeBlock { location: 8192, length: 1024 });

        assert_eq!(free.next_after(0).map(|b| b.location), Some(1024));
        assert_eq!(free.next_after(1024).map(|b| b.location), Some(8192));
        assert_eq!(free.next_after(8192), None);

        assert_eq!(free.containing(1500).map(|b| b.location), Some(1024));
        assert_eq!(free.containing(2048), None);
        assert_eq!(free.containing(0), None);
    }
}
