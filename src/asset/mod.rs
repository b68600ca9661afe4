//! Asset identity.
//!
//! Every stored object is addressed by a (UUID, type) pair; the pair is the
//! directory key and part of every on-disk index record. Lock kinds are
//! reference counters that exempt an asset from eviction, not mutexes.

use std::fmt;

use uuid::Uuid;

/// Coarse classification of stored payloads. The on-disk index encodes the
/// discriminant as a little-endian i16, so the set is append-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i16)]
pub enum AssetType {
    None = -1,
    Texture = 0,
    Sound = 1,
    Animation = 2,
    Gesture = 3,
    Clothing = 4,
    BodyPart = 5,
    Notecard = 6,
    Script = 7,
    Object = 8,
    Landmark = 9,
    Snapshot = 10,
}

/// Exclusive upper bound on valid type codes.
pub const ASSET_TYPE_COUNT: i16 = 11;

impl AssetType {
    /// Decode an on-disk type code. Codes outside `[-1, ASSET_TYPE_COUNT)`
    /// are rejected so index replay can classify the record instead of
    /// trusting it.
    pub fn from_code(code: i16) -> Option<AssetType> {
        match code {
            -1 => Some(AssetType::None),
            0 => Some(AssetType::Texture),
            1 => Some(AssetType::Sound),
            2 => Some(AssetType::Animation),
            3 => Some(AssetType::Gesture),
            4 => Some(AssetType::Clothing),
            5 => Some(AssetType::BodyPart),
            6 => Some(AssetType::Notecard),
            7 => Some(AssetType::Script),
            8 => Some(AssetType::Object),
            9 => Some(AssetType::Landmark),
            10 => Some(AssetType::Snapshot),
            _ => None,
        }
    }

    pub fn code(self) -> i16 {
        self as i16
    }

    /// File extension used when payloads are exported individually.
    pub fn extension(self) -> &'static str {
        match self {
            AssetType::Texture => "jp2",
            _ => "data",
        }
    }
}

/// Directory key. Ordering is lexicographic: UUID bytes first, then type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId {
    pub uuid: Uuid,
    pub ty: AssetType,
}

impl AssetId {
    pub fn new(uuid: Uuid, ty: AssetType) -> AssetId {
        AssetId { uuid, ty }
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.uuid, self.ty)
    }
}

/// Usage marks held by callers. A nonzero counter of any kind keeps the
/// asset out of the eviction candidate set; nothing else is gated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    Read = 0,
    Append = 1,
    Open = 2,
}

impl LockKind {
    pub const COUNT: usize = 3;
    pub const ALL: [LockKind; Self::COUNT] = [LockKind::Read, LockKind::Append, LockKind::Open];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_round_trip() {
        for code in -1..ASSET_TYPE_COUNT {
            let ty = AssetType::from_code(code).expect("valid code");
            assert_eq!(ty.code(), code);
        }
        assert_eq!(AssetType::from_code(ASSET_TYPE_COUNT), None);
        assert_eq!(AssetType::from_code(-2), None);
    }

    #[test]
    fn test_key_order_is_uuid_first() {
        let small = AssetId::new(Uuid::from_u128(1), AssetType::Snapshot);
        let large = AssetId::new(Uuid::from_u128(2), AssetType::None);
        assert!(small < large);

        let a = AssetId::new(Uuid::from_u128(7), AssetType::Texture);
        let b = AssetId::new(Uuid::from_u128(7), AssetType::Sound);
        assert!(a < b);
    }
}
