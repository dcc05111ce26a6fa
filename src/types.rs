use serde::{Deserialize, Serialize};

/// Identifier of one fixed-size block in the serializer's id space.
///
/// Ids at or above [`AUX_BLOCK_ID_THRESHOLD`] designate aux blocks, which
/// carry no recency and never participate in the metadata ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// Sentinel meaning "no block".
pub const NULL_BLOCK_ID: BlockId = BlockId(u64::MAX);

/// Ids at or above this value are aux blocks.
pub const AUX_BLOCK_ID_THRESHOLD: u64 = 1 << 63;

/// Low ids reserved for the superblock and friends; these bypass the write
/// shard so the serializer's bootstrap blocks stay in the primary map.
pub const RESERVED_BLOCK_COUNT: u64 = 4;

impl BlockId {
    pub fn is_null(self) -> bool {
        self == NULL_BLOCK_ID
    }

    pub fn is_aux(self) -> bool {
        !self.is_null() && self.0 >= AUX_BLOCK_ID_THRESHOLD
    }

    pub fn is_reserved(self) -> bool {
        self.0 < RESERVED_BLOCK_COUNT
    }

    /// Index of an aux block within the aux id space.
    pub fn aux_index(self) -> u64 {
        debug_assert!(self.is_aux());
        self.0 - AUX_BLOCK_ID_THRESHOLD
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-block write version. Strictly increasing across the write acquirers
/// of one block; zero is reserved for "unassigned" so freshly constructed
/// acquirers are distinguishable from ones that observed a version.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct BlockVersion(u64);

impl BlockVersion {
    pub const ZERO: BlockVersion = BlockVersion(0);
    /// The version a current-page starts at, so that version zero stays
    /// reserved.
    pub const FIRST: BlockVersion = BlockVersion(1);

    pub fn next(self) -> BlockVersion {
        BlockVersion(self.0 + 1)
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Recency timestamp carried per block. `INVALID` marks deleted or
/// never-created blocks; `DISTANT_PAST` is the recency of a block created
/// but not yet touched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Recency(pub u64);

impl Recency {
    pub const INVALID: Recency = Recency(u64::MAX);
    pub const DISTANT_PAST: Recency = Recency(0);

    pub fn is_valid(self) -> bool {
        self != Recency::INVALID
    }
}

/// The later of two recencies, treating `INVALID` as absent.
pub fn superceding_recency(a: Recency, b: Recency) -> Recency {
    match (a.is_valid(), b.is_valid()) {
        (true, true) => Recency(a.0.max(b.0)),
        (true, false) => a,
        (false, true) => b,
        (false, false) => Recency::INVALID,
    }
}

/// Number of entries in every metadata ring. Fixed so that peers can read
/// each other's rings with a single bounded one-sided operation.
pub const MAX_METADATA_BLOCKS: usize = 100_000;

/// Leading node-type tag of a serialized B-tree node buffer. The cache only
/// inspects this one byte; everything else about the node layout belongs to
/// the tree above us.
pub const INTERNAL_NODE_TAG: u8 = 0xF7;
pub const LEAF_NODE_TAG: u8 = 0xF8;

/// True when a block buffer starts with the internal-node tag.
pub fn buffer_is_internal_node(buf: &[u8]) -> bool {
    buf.first() == Some(&INTERNAL_NODE_TAG)
}

/// Disk reads of one block within a single admission window after which the
/// block is admitted regardless of what the cost model says.
pub const MAX_DISK_READ_BEFORE_ADMIT: u64 = 100;

/// Which id space a newly created block draws from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockType {
    Normal,
    Aux,
}
