//! Core type definitions for the VDisk skeleton
//!
//! This module defines the identity, sequence-number, index-partition and
//! status types shared by the skeleton and the subsystems it coordinates.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign, RangeInclusive};

/// Position in the durable recovery log
pub type Lsn = u64;

/// A contiguous range `[first, last]` of log sequence numbers reserved for
/// one logical write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LsnSeg {
    pub first: Lsn,
    pub last: Lsn,
}

impl LsnSeg {
    /// Create a segment. Panics if `first > last`.
    #[must_use]
    pub fn new(first: Lsn, last: Lsn) -> Self {
        assert!(first <= last, "invalid lsn segment [{first}, {last}]");
        Self { first, last }
    }

    /// A segment covering exactly one sequence number
    #[must_use]
    pub const fn point(lsn: Lsn) -> Self {
        Self {
            first: lsn,
            last: lsn,
        }
    }

    /// Number of sequence numbers in the segment
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.last - self.first + 1
    }

    #[must_use]
    pub fn range(&self) -> RangeInclusive<Lsn> {
        self.first..=self.last
    }
}

impl fmt::Display for LsnSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

/// Identity of one storage unit within its group
///
/// Replaced wholesale on group reconfiguration, never mutated in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VDiskId {
    pub group_id: u32,
    pub group_generation: u32,
    pub ring: u8,
    pub fail_domain: u8,
    pub vdisk: u8,
}

impl VDiskId {
    #[must_use]
    pub const fn new(group_id: u32, group_generation: u32, ring: u8, fail_domain: u8, vdisk: u8) -> Self {
        Self {
            group_id,
            group_generation,
            ring,
            fail_domain,
            vdisk,
        }
    }

    /// Same group, same generation and same position in the group
    #[must_use]
    pub fn same_disk(&self, other: &Self) -> bool {
        self == other
    }

    /// Same group and position, generation ignored
    #[must_use]
    pub const fn same_except_generation(&self, other: &Self) -> bool {
        self.group_id == other.group_id
            && self.ring == other.ring
            && self.fail_domain == other.fail_domain
            && self.vdisk == other.vdisk
    }

    /// Copy of this id moved to another group generation
    #[must_use]
    pub const fn with_generation(self, group_generation: u32) -> Self {
        Self {
            group_generation,
            ..self
        }
    }
}

impl fmt::Display for VDiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:x}:{}:{}:{}:{}]",
            self.group_id, self.group_generation, self.ring, self.fail_domain, self.vdisk
        )
    }
}

/// Erasure scheme of a group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErasureSpecies {
    /// Single copy, one part
    #[default]
    None,
    /// Three full replicas
    Mirror3,
    /// Four data parts plus two parity parts
    Block4Plus2,
}

impl ErasureSpecies {
    /// Total number of parts (data and parity) a blob is split into
    #[must_use]
    pub const fn total_part_count(self) -> u8 {
        match self {
            Self::None => 1,
            Self::Mirror3 => 3,
            Self::Block4Plus2 => 6,
        }
    }

    /// Number of data parts the blob payload is divided between
    #[must_use]
    pub const fn data_part_count(self) -> u32 {
        match self {
            Self::None | Self::Mirror3 => 1,
            Self::Block4Plus2 => 4,
        }
    }

    /// Expected payload size of the part named by `id`, or `None` when the
    /// part id is outside `1..=total_part_count`
    #[must_use]
    pub fn part_size(self, id: &LogoBlobId) -> Option<u32> {
        if id.part_id == 0 || id.part_id > self.total_part_count() {
            return None;
        }
        Some(id.blob_size.div_ceil(self.data_part_count()))
    }
}

/// Group membership and erasure scheme as seen by one storage unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: u32,
    pub generation: u32,
    pub erasure: ErasureSpecies,
}

impl GroupInfo {
    #[must_use]
    pub const fn new(group_id: u32, generation: u32, erasure: ErasureSpecies) -> Self {
        Self {
            group_id,
            generation,
            erasure,
        }
    }
}

/// Identity of a stored blob part
///
/// Ordering follows field order, so all parts of one tablet are contiguous
/// and sorted by generation and step.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogoBlobId {
    pub tablet_id: u64,
    pub generation: u32,
    pub step: u32,
    pub channel: u8,
    pub cookie: u32,
    pub blob_size: u32,
    pub part_id: u8,
}

impl LogoBlobId {
    /// Create a full blob id (part 0)
    #[must_use]
    pub const fn new(tablet_id: u64, generation: u32, step: u32, channel: u8, blob_size: u32, cookie: u32) -> Self {
        Self {
            tablet_id,
            generation,
            step,
            channel,
            cookie,
            blob_size,
            part_id: 0,
        }
    }

    /// Copy of this id naming a specific part
    #[must_use]
    pub const fn with_part(self, part_id: u8) -> Self {
        Self { part_id, ..self }
    }

    /// The id with the part stripped
    #[must_use]
    pub const fn full_id(self) -> Self {
        self.with_part(0)
    }
}

impl fmt::Debug for LogoBlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogoBlobId({self})")
    }
}

impl fmt::Display for LogoBlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}:{}:{}:{}:{}]",
            self.tablet_id,
            self.generation,
            self.step,
            self.channel,
            self.cookie,
            self.blob_size,
            self.part_id
        )
    }
}

/// Placement of a huge blob inside the large-object keeper's chunks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskPart {
    pub chunk_idx: u32,
    pub offset: u32,
    pub size: u32,
}

impl DiskPart {
    #[must_use]
    pub const fn new(chunk_idx: u32, offset: u32, size: u32) -> Self {
        Self {
            chunk_idx,
            offset,
            size,
        }
    }

    /// True for the placeholder placement of an empty huge blob
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.chunk_idx == 0 && self.offset == 0 && self.size == 0
    }
}

/// Index partitions maintained by the index store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
pub enum HullDbType {
    #[display("LogoBlobs")]
    LogoBlobs,
    #[display("Blocks")]
    Blocks,
    #[display("Barriers")]
    Barriers,
}

impl HullDbType {
    pub const ALL: [Self; 3] = [Self::LogoBlobs, Self::Blocks, Self::Barriers];

    #[must_use]
    pub const fn mask(self) -> HullDbMask {
        match self {
            Self::LogoBlobs => HullDbMask::LOGO_BLOBS,
            Self::Blocks => HullDbMask::BLOCKS,
            Self::Barriers => HullDbMask::BARRIERS,
        }
    }
}

/// A set of index partitions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HullDbMask(u8);

impl HullDbMask {
    pub const EMPTY: Self = Self(0);
    pub const LOGO_BLOBS: Self = Self(1);
    pub const BLOCKS: Self = Self(2);
    pub const BARRIERS: Self = Self(4);
    pub const ALL: Self = Self(7);

    #[must_use]
    pub const fn contains(self, db: HullDbType) -> bool {
        self.0 & db.mask().0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn without(self, db: HullDbType) -> Self {
        Self(self.0 & !db.mask().0)
    }

    /// Partitions in the mask, in `HullDbType::ALL` order
    pub fn iter(self) -> impl Iterator<Item = HullDbType> {
        HullDbType::ALL.into_iter().filter(move |db| self.contains(*db))
    }
}

impl BitOr for HullDbMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for HullDbMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Free-space pressure tiers derived from [`OutOfSpaceFlags`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum SpaceColor {
    #[display("GREEN")]
    Green,
    #[display("YELLOW")]
    Yellow,
    #[display("ORANGE")]
    Orange,
    #[display("RED")]
    Red,
}

/// Free-space pressure flags reported by the space tracker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutOfSpaceFlags(u32);

impl OutOfSpaceFlags {
    pub const NONE: Self = Self(0);
    /// Soft limit: everything still admitted
    pub const YELLOW: Self = Self(1);
    /// Client puts rejected, maintenance writes admitted
    pub const ORANGE: Self = Self(2);
    /// Every write rejected
    pub const RED: Self = Self(4);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Most severe tier present in the flags
    #[must_use]
    pub const fn color(self) -> SpaceColor {
        if self.contains(Self::RED) {
            SpaceColor::Red
        } else if self.contains(Self::ORANGE) {
            SpaceColor::Orange
        } else if self.contains(Self::YELLOW) {
            SpaceColor::Yellow
        } else {
            SpaceColor::Green
        }
    }
}

impl BitOr for OutOfSpaceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Status code carried by every protocol reply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ReplyStatus {
    #[display("OK")]
    Ok,
    #[display("ERROR")]
    Error,
    /// Generation mismatch, the client must refresh topology
    #[display("RACE")]
    Race,
    #[display("OUT_OF_SPACE")]
    OutOfSpace,
    #[display("NODATA")]
    NoData,
    #[display("NOTREADY")]
    NotReady,
    /// Duplicate of a command that has already been applied
    #[display("ALREADY")]
    Already,
    /// Target generation is blocked
    #[display("BLOCKED")]
    Blocked,
}

impl ReplyStatus {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Externally visible readiness of a storage unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VDiskStatus {
    /// Still recovering, not serving clients
    #[display("INIT_PENDING")]
    InitPending,
    #[display("REPLICATING")]
    Replicating,
    #[display("READY")]
    Ready,
    #[display("ERROR")]
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_seg() {
        let seg = LsnSeg::new(5, 7);
        assert_eq!(seg.count(), 3);
        assert_eq!(seg.range().collect::<Vec<_>>(), vec![5, 6, 7]);
        assert_eq!(LsnSeg::point(9).count(), 1);
        assert_eq!(seg.to_string(), "[5, 7]");
    }

    #[test]
    #[should_panic(expected = "invalid lsn segment")]
    fn test_lsn_seg_inverted() {
        let _ = LsnSeg::new(8, 7);
    }

    #[test]
    fn test_vdisk_id_comparison() {
        let a = VDiskId::new(0x10, 3, 0, 1, 0);
        assert!(a.same_disk(&a));
        let next = a.with_generation(4);
        assert!(!a.same_disk(&next));
        assert!(a.same_except_generation(&next));
        assert!(!a.same_except_generation(&VDiskId::new(0x10, 3, 0, 2, 0)));
        assert_eq!(a.to_string(), "[10:3:0:1:0]");
    }

    #[test]
    fn test_part_size() {
        let id = LogoBlobId::new(1, 2, 3, 0, 1000, 0);
        assert_eq!(ErasureSpecies::None.part_size(&id), None);
        assert_eq!(ErasureSpecies::None.part_size(&id.with_part(1)), Some(1000));
        assert_eq!(ErasureSpecies::Mirror3.part_size(&id.with_part(3)), Some(1000));
        assert_eq!(ErasureSpecies::Mirror3.part_size(&id.with_part(4)), None);
        assert_eq!(ErasureSpecies::Block4Plus2.part_size(&id.with_part(6)), Some(250));
        assert_eq!(ErasureSpecies::Block4Plus2.part_size(&id.with_part(7)), None);
    }

    #[test]
    fn test_logo_blob_id_order() {
        let a = LogoBlobId::new(1, 2, 3, 0, 10, 0);
        let b = LogoBlobId::new(1, 2, 4, 0, 10, 0);
        let c = LogoBlobId::new(2, 1, 1, 0, 10, 0);
        assert!(a < b && b < c);
        assert_eq!(a.with_part(2).full_id(), a);
    }

    #[test]
    fn test_db_mask() {
        let mask = HullDbMask::LOGO_BLOBS | HullDbMask::BARRIERS;
        assert!(mask.contains(HullDbType::LogoBlobs));
        assert!(!mask.contains(HullDbType::Blocks));
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            vec![HullDbType::LogoBlobs, HullDbType::Barriers]
        );
        assert!(mask.without(HullDbType::LogoBlobs).without(HullDbType::Barriers).is_empty());
        assert_eq!(HullDbMask::ALL.iter().count(), 3);
    }

    #[test]
    fn test_space_color() {
        assert_eq!(OutOfSpaceFlags::NONE.color(), SpaceColor::Green);
        assert_eq!(OutOfSpaceFlags::YELLOW.color(), SpaceColor::Yellow);
        let flags = OutOfSpaceFlags::YELLOW | OutOfSpaceFlags::ORANGE;
        assert_eq!(flags.color(), SpaceColor::Orange);
        assert_eq!((flags | OutOfSpaceFlags::RED).color(), SpaceColor::Red);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ReplyStatus::OutOfSpace.to_string(), "OUT_OF_SPACE");
        assert_eq!(VDiskStatus::Replicating.to_string(), "REPLICATING");
    }
}
