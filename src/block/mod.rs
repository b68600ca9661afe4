//! Block records: the in-memory state per asset, free extents, and the
//! fixed-size record each asset owns in the index file.
//!
//! The index file is a flat sequence of [`INDEX_RECORD_SIZE`]-byte records,
//! all integers little-endian regardless of host. A zero-filled record is a
//! reusable hole; the file only ever grows.

use uuid::Uuid;

use crate::asset::{AssetId, AssetType, LockKind};

/// Reservation granularity: every live extent length is a multiple of this.
pub const BLOCK_GRANULARITY: i32 = 1024;

/// `length` value for a directory entry that holds locks but owns no extent.
pub const BLOCK_LENGTH_INVALID: i32 = -1;

/// Serialized record width. The index file length is always a multiple of
/// this.
pub const INDEX_RECORD_SIZE: usize = 34;

/// Round a requested reservation up to the block granularity.
pub fn round_to_granularity(n: i32) -> i32 {
    let mask = BLOCK_GRANULARITY - 1;
    n.saturating_add(mask) & !mask
}

/// Per-asset directory record. Identity lives in the directory key, not
/// here.
#[derive(Clone, Debug)]
pub struct FileBlock {
    /// Absolute byte offset of the extent in the data file.
    pub location: u32,
    /// Reserved extent length; [`BLOCK_LENGTH_INVALID`] for a lock-only
    /// dummy.
    pub length: i32,
    /// Bytes actually stored, `0 <= size <= length`.
    pub size: i32,
    /// Wall-clock seconds of the last read, write or existence query; the
    /// eviction order.
    pub access_time: u32,
    /// Byte offset of this record in the index file, `-1` before the first
    /// sync.
    pub index_location: i32,
    /// Outstanding references per [`LockKind`].
    pub locks: [u32; LockKind::COUNT],
}

impl FileBlock {
    pub fn new(location: u32, length: i32, access_time: u32) -> FileBlock {
        FileBlock {
            location,
            length,
            size: 0,
            access_time,
            index_location: -1,
            locks: [0; LockKind::COUNT],
        }
    }

    /// A record that exists only to carry lock counts.
    pub fn dummy(access_time: u32) -> FileBlock {
        FileBlock::new(0, BLOCK_LENGTH_INVALID, access_time)
    }

    pub fn is_locked(&self) -> bool {
        self.locks.iter().any(|&count| count > 0)
    }
}

/// A free extent in the data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    pub location: u32,
    pub length: u32,
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_i32(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_i16(b: &[u8]) -> i16 {
    i16::from_le_bytes([b[0], b[1]])
}

/// One index record as it appears on disk.
///
/// Layout: location u32 | length i32 | access_time u32 | uuid 16 raw bytes |
/// type i16 | size i32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub location: u32,
    pub length: i32,
    pub access_time: u32,
    pub uuid: Uuid,
    pub type_code: i16,
    pub size: i32,
}

/// What index replay should do with a decoded record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordClass {
    /// Bounds check out: the record enters the directory.
    Live(AssetType),
    /// Empty or healed-over slot, reusable for a future record.
    Hole,
    /// A nonzero record that fails its bounds: the store cannot be trusted.
    Corrupt,
}

impl IndexRecord {
    pub fn for_block(id: &AssetId, block: &FileBlock) -> IndexRecord {
        IndexRecord {
            location: block.location,
            length: block.length,
            access_time: block.access_time,
            uuid: id.uuid,
            type_code: id.ty.code(),
            size: block.size,
        }
    }

    pub fn encode(&self) -> [u8; INDEX_RECORD_SIZE] {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.location.to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.access_time.to_le_bytes());
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        buf[28..30].copy_from_slice(&self.type_code.to_le_bytes());
        buf[30..34].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode one record. `buf` must hold at least [`INDEX_RECORD_SIZE`]
    /// bytes.
    pub fn decode(buf: &[u8]) -> IndexRecord {
        debug_assert!(buf.len() >= INDEX_RECORD_SIZE);
        let mut raw_uuid = [0u8; 16];
        raw_uuid.copy_from_slice(&buf[12..28]);
        IndexRecord {
            location: le_u32(&buf[0..4]),
            length: le_i32(&buf[4..8]),
            access_time: le_u32(&buf[8..12]),
            uuid: Uuid::from_bytes(raw_uuid),
            type_code: le_i16(&buf[28..30]),
            size: le_i32(&buf[30..34]),
        }
    }

    /// Replay classification against the data file size at open.
    ///
    /// Zero-size records are deliberately demoted to holes; that lets the
    /// store heal past records that were reserved but never written.
    pub fn classify(&self, data_size: u32) -> RecordClass {
        match AssetType::from_code(self.type_code) {
            Some(ty)
                if self.length > 0
                    && self.length as u32 <= data_size
                    && self.location < data_size
                    && self.size > 0
                    && self.size <= self.length =>
            {
                RecordClass::Live(ty)
            }
            _ if self.length != 0 && self.size > 0 => RecordClass::Corrupt,
            _ => RecordClass::Hole,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_is_fixed() {
        let rec = IndexRecord {
            location: 0x11223344,
            length: 0x1000,
            access_time: 0x55667788,
            uuid: Uuid::from_bytes([0xAB; 16]),
            type_code: AssetType::Sound.code(),
            size: 0x0F00,
        };
        let buf = rec.encode();
        assert_eq!(&buf[0..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[4..8], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(&buf[8..12], &[0x88, 0x77, 0x66, 0x55]);
        assert_eq!(&buf[12..28], &[0xAB; 16]);
        assert_eq!(&buf[28..30], &[0x01, 0x00]);
        assert_eq!(&buf[30..34], &[0x00, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn test_record_codec_round_trip() {
        let rec = IndexRecord {
            location: 4096,
            length: 2048,
            access_time: 1_700_000_000,
            uuid: Uuid::from_u128(0xDEADBEEF),
            type_code: AssetType::Texture.code(),
            size: 1500,
        };
        assert_eq!(IndexRecord::decode(&rec.encode()), rec);
    }

    #[test]
    fn test_negative_length_survives_the_codec() {
        let rec = IndexRecord {
            location: 0,
            length: BLOCK_LENGTH_INVALID,
            access_time: 0,
            uuid: Uuid::nil(),
            type_code: AssetType::None.code(),
            size: 0,
        };
        assert_eq!(IndexRecord::decode(&rec.encode()), rec);
    }

    #[test]
    fn test_classify() {
        let base = IndexRecord {
            location: 0,
            length: 1024,
            access_time: 1,
            uuid: Uuid::from_u128(1),
            type_code: AssetType::Texture.code(),
            size: 100,
        };
        assert_eq!(base.classify(4096), RecordClass::Live(AssetType::Texture));

        // zero-filled slot
        let hole = IndexRecord::decode(&[0u8; INDEX_RECORD_SIZE]);
        assert_eq!(hole.classify(4096), RecordClass::Hole);

        // reserved but never written: healed to a hole
        assert_eq!(IndexRecord { size: 0, ..base }.classify(4096), RecordClass::Hole);

        // used bytes exceeding the reservation
        assert_eq!(IndexRecord { size: 2048, ..base }.classify(4096), RecordClass::Corrupt);

        // extent beyond the data file
        assert_eq!(IndexRecord { length: 8192, ..base }.classify(4096), RecordClass::Corrupt);
        assert_eq!(IndexRecord { location: 9999, ..base }.classify(4096), RecordClass::Corrupt);

        // unknown asset type
        assert_eq!(IndexRecord { type_code: 99, ..base }.classify(4096), RecordClass::Corrupt);
    }

    #[test]
    fn test_round_to_granularity() {
        assert_eq!(round_to_granularity(1), 1024);
        assert_eq!(round_to_granularity(1024), 1024);
        assert_eq!(round_to_granularity(1025), 2048);
    }
}
