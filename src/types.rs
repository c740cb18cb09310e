//! Identifier newtypes and engine-wide constants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unit of file I/O, caching, and WAL logging.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of entries a value vector holds.
pub const VECTOR_CAPACITY: usize = 2048;

/// Number of bound nodes per CSR list chunk (2^9).
pub const LISTS_CHUNK_SIZE: u64 = 512;
pub const LISTS_CHUNK_SIZE_LOG2: u64 = 9;

/// Sentinel page index meaning "no page".
pub const NULL_PAGE_IDX: PageIdx = PageIdx(u32::MAX);

/// Index of a page within one file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageIdx(pub u32);

/// Handle-scoped identifier of an open file in the buffer pool registry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u16);

/// Monotonically increasing transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

/// Catalog identifier of a node or rel table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TableId(pub u32);

/// Catalog identifier of a property within a table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PropertyId(pub u32);

/// Dense offset of a node within its table.
pub type NodeOffset = u64;

/// Dense offset of a rel within its table.
pub type RelOffset = u64;

/// Fully qualified node identity: table plus dense offset.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId {
    pub table: TableId,
    pub offset: NodeOffset,
}

/// Fully qualified rel identity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelId {
    pub table: TableId,
    pub offset: RelOffset,
}

impl NodeId {
    pub fn new(table: TableId, offset: NodeOffset) -> Self {
        Self { table, offset }
    }
}

impl RelId {
    pub fn new(table: TableId, offset: RelOffset) -> Self {
        Self { table, offset }
    }
}

/// Direction of a rel relative to a bound node.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum Direction {
    Fwd,
    Bwd,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Fwd, Direction::Bwd];

    pub fn reverse(self) -> Self {
        match self {
            Direction::Fwd => Direction::Bwd,
            Direction::Bwd => Direction::Fwd,
        }
    }
}

impl fmt::Display for PageIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table.0, self.offset)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Fwd => write!(f, "fwd"),
            Direction::Bwd => write!(f, "bwd"),
        }
    }
}
