//! Persistent storage structures: disk arrays, columns, CSR lists, and
//! the node/rel tables assembled from them.

use std::sync::Arc;

use crate::pager::wal::Wal;
use crate::pager::{BufferPool, FileHandle};

pub mod column;
pub mod disk_array;
pub mod lists;
pub mod node_table;
pub mod rel_table;

pub use column::Column;
pub use disk_array::{DiskArray, DiskArrayElement, RawDiskArray};
pub use lists::{ListEntry, Lists};
pub use node_table::NodeTable;
pub use rel_table::RelTable;

/// Shared handles every storage structure needs: the data file, the
/// buffer pool, and the WAL.
#[derive(Clone)]
pub struct StorageContext {
    pub file: Arc<FileHandle>,
    pub pool: Arc<BufferPool>,
    pub wal: Arc<Wal>,
}

impl StorageContext {
    pub fn new(file: Arc<FileHandle>, pool: Arc<BufferPool>, wal: Arc<Wal>) -> Self {
        Self { file, pool, wal }
    }
}

/// Open table instances, shared between the database handle and running
/// queries.
#[derive(Default)]
pub struct TableSet {
    nodes: parking_lot::RwLock<std::collections::HashMap<crate::types::TableId, Arc<NodeTable>>>,
    rels: parking_lot::RwLock<std::collections::HashMap<crate::types::TableId, Arc<RelTable>>>,
}

impl TableSet {
    pub fn insert_node_table(&self, table: Arc<NodeTable>) {
        self.nodes.write().insert(table.id(), table);
    }

    pub fn insert_rel_table(&self, table: Arc<RelTable>) {
        self.rels.write().insert(table.id(), table);
    }

    pub fn node_table(&self, id: crate::types::TableId) -> crate::error::Result<Arc<NodeTable>> {
        self.nodes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| crate::error::QuiverError::Binder(format!("unknown node table {id}")))
    }

    pub fn rel_table(&self, id: crate::types::TableId) -> crate::error::Result<Arc<RelTable>> {
        self.rels
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| crate::error::QuiverError::Binder(format!("unknown rel table {id}")))
    }

    pub fn node_tables(&self) -> Vec<Arc<NodeTable>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn rel_tables(&self) -> Vec<Arc<RelTable>> {
        self.rels.read().values().cloned().collect()
    }
}
