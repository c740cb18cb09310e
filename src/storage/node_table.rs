//! Node tables: dense property columns plus the primary-key hash index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::catalog::NodeTableDef;
use crate::error::{QuiverError, Result};
use crate::statistics::Statistics;
use crate::storage::{Column, StorageContext};
use crate::transaction::{Transaction, TransactionKind, TransactionalResource};
use crate::types::{NodeOffset, TableId};
use crate::vector::Value;

/// Hashable form of a primary-key value.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PkKey {
    Int(i64),
    Str(String),
}

impl PkKey {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int64(v) => Ok(PkKey::Int(*v)),
            Value::String(s) => Ok(PkKey::Str(s.clone())),
            other => Err(QuiverError::Runtime(format!(
                "unsupported primary key value {other:?}"
            ))),
        }
    }
}

/// In-memory primary-key hash index: committed map plus writer-staged
/// inserts. Rebuilt from the key column at open.
pub struct PrimaryKeyIndex {
    canonical: RwLock<HashMap<PkKey, NodeOffset>>,
    staged: Mutex<HashMap<PkKey, NodeOffset>>,
}

impl PrimaryKeyIndex {
    pub fn new(entries: HashMap<PkKey, NodeOffset>) -> Self {
        Self {
            canonical: RwLock::new(entries),
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, key: &PkKey, kind: TransactionKind) -> Option<NodeOffset> {
        if kind == TransactionKind::Write {
            if let Some(offset) = self.staged.lock().get(key) {
                return Some(*offset);
            }
        }
        self.canonical.read().get(key).copied()
    }

    /// Stages an insert; a duplicate key is a runtime error.
    pub fn insert(&self, key: PkKey, offset: NodeOffset) -> Result<()> {
        if self.canonical.read().contains_key(&key) || self.staged.lock().contains_key(&key) {
            return Err(QuiverError::Runtime(format!(
                "duplicate primary key {key:?}"
            )));
        }
        self.staged.lock().insert(key, offset);
        Ok(())
    }

    fn install(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        self.canonical.write().extend(staged);
    }

    fn discard(&self) {
        self.staged.lock().clear();
    }
}

/// A node table: one column per property, addressed by dense offset.
pub struct NodeTable {
    def: NodeTableDef,
    columns: Vec<Column>,
    pk_column: usize,
    pk_index: PrimaryKeyIndex,
    stats: Arc<Statistics>,
}

impl NodeTable {
    /// Creates the table's storage under a write transaction. The caller
    /// records the resulting column locators in the catalog definition.
    pub fn create(
        ctx: &StorageContext,
        tx: &Transaction,
        mut def: NodeTableDef,
        stats: Arc<Statistics>,
    ) -> Result<Self> {
        let mut columns = Vec::with_capacity(def.properties.len());
        for property in &def.properties {
            columns.push(Column::create(ctx, tx, property.ty.clone())?);
        }
        def.columns = columns.iter().map(Column::locator).collect();
        let pk_column = def
            .properties
            .iter()
            .position(|p| p.id == def.pk_property)
            .ok_or_else(|| QuiverError::Binder("primary key property not in table".into()))?;
        stats.register_node_table(def.id);
        Ok(Self {
            def,
            columns,
            pk_column,
            pk_index: PrimaryKeyIndex::new(HashMap::new()),
            stats,
        })
    }

    /// Opens the table and rebuilds the primary-key index from its key
    /// column.
    pub fn open(ctx: &StorageContext, def: NodeTableDef, stats: Arc<Statistics>) -> Result<Self> {
        let mut columns = Vec::with_capacity(def.properties.len());
        for (property, locator) in def.properties.iter().zip(&def.columns) {
            columns.push(Column::open(ctx, property.ty.clone(), *locator)?);
        }
        let pk_column = def
            .properties
            .iter()
            .position(|p| p.id == def.pk_property)
            .ok_or_else(|| QuiverError::Corruption("primary key property missing".into()))?;

        let mut entries = HashMap::new();
        let count = stats.num_nodes(def.id, TransactionKind::ReadOnly);
        for offset in 0..count {
            let value = columns[pk_column].get_value(offset, TransactionKind::ReadOnly)?;
            if !value.is_null() {
                entries.insert(PkKey::from_value(&value)?, offset);
            }
        }
        Ok(Self {
            def,
            columns,
            pk_column,
            pk_index: PrimaryKeyIndex::new(entries),
            stats,
        })
    }

    pub fn id(&self) -> TableId {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &NodeTableDef {
        &self.def
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn num_nodes(&self, kind: TransactionKind) -> u64 {
        self.stats.num_nodes(self.def.id, kind)
    }

    /// Column resources in commit order (table first, then columns).
    pub fn storage_resources(&self) -> Vec<Arc<crate::storage::RawDiskArray>> {
        self.columns.iter().flat_map(Column::resources).collect()
    }

    /// Inserts one node; `values` is parallel to the table's properties.
    /// Returns the node's dense offset.
    pub fn insert(&self, tx: &Transaction, values: &[Value]) -> Result<NodeOffset> {
        if values.len() != self.columns.len() {
            return Err(QuiverError::Binder(format!(
                "expected {} property values, got {}",
                self.columns.len(),
                values.len()
            )));
        }
        let pk = PkKey::from_value(&values[self.pk_column])?;
        let offset = self.stats.allocate_node_offset(self.def.id);
        self.pk_index.insert(pk, offset)?;
        for (column, value) in self.columns.iter().zip(values) {
            column.set_value(tx, offset, value)?;
        }
        Ok(offset)
    }

    pub fn lookup_pk(&self, key: &PkKey, kind: TransactionKind) -> Option<NodeOffset> {
        self.pk_index.lookup(key, kind)
    }
}

impl TransactionalResource for NodeTable {
    fn prepare_commit(&self, _tx: &Transaction) -> Result<()> {
        // Column pages are WAL-logged by their own disk arrays; the pk
        // index is derivable from the key column.
        Ok(())
    }

    fn checkpoint_in_memory(&self) {
        self.pk_index.install();
    }

    fn rollback_in_memory(&self) {
        self.pk_index.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PropertyDef;
    use crate::pager::{wal::Wal, BufferPool, FileHandle};
    use crate::statistics::StatisticsData;
    use crate::transaction::TransactionManager;
    use crate::types::{FileId, PropertyId};
    use crate::vector::LogicalType;
    use tempfile::tempdir;

    fn person_def() -> NodeTableDef {
        NodeTableDef {
            id: TableId(0),
            name: "Person".into(),
            properties: vec![
                PropertyDef {
                    id: PropertyId(0),
                    name: "name".into(),
                    ty: LogicalType::String,
                },
                PropertyDef {
                    id: PropertyId(1),
                    name: "age".into(),
                    ty: LogicalType::Int64,
                },
            ],
            pk_property: PropertyId(0),
            columns: Vec::new(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: StorageContext,
        mgr: TransactionManager,
        stats: Arc<Statistics>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let file =
            Arc::new(FileHandle::open(dir.path().join("data.db"), FileId(0)).expect("file"));
        let pool = Arc::new(BufferPool::new(256));
        let wal = Arc::new(Wal::open(dir.path().join("wal.log")).expect("wal"));
        pool.set_wal(Arc::clone(&wal));
        let mgr = TransactionManager::new(Arc::clone(&wal), Arc::clone(&pool));
        mgr.register_file(Arc::clone(&file));
        Fixture {
            _dir: dir,
            ctx: StorageContext::new(file, pool, wal),
            mgr,
            stats: Arc::new(Statistics::new(StatisticsData::default())),
        }
    }

    fn create_table(fx: &Fixture) -> Arc<NodeTable> {
        let tx = fx.mgr.begin_write().expect("writer");
        let table = Arc::new(
            NodeTable::create(&fx.ctx, &tx, person_def(), Arc::clone(&fx.stats)).expect("create"),
        );
        fx.mgr.register_resource(Arc::clone(&table) as Arc<dyn TransactionalResource>);
        for resource in table.storage_resources() {
            fx.mgr.register_resource(resource);
        }
        fx.mgr.commit(&tx).expect("commit");
        fx.stats.install_shadow();
        table
    }

    #[test]
    fn insert_and_read_back() {
        let fx = fixture();
        let table = create_table(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        let offset = table
            .insert(&tx, &[Value::String("ada".into()), Value::Int64(36)])
            .expect("insert");
        fx.mgr.commit(&tx).expect("commit");
        fx.stats.install_shadow();

        assert_eq!(offset, 0);
        assert_eq!(
            table.column(0).get_value(0, TransactionKind::ReadOnly).expect("name"),
            Value::String("ada".into())
        );
        assert_eq!(
            table.column(1).get_value(0, TransactionKind::ReadOnly).expect("age"),
            Value::Int64(36)
        );
        assert_eq!(
            table.lookup_pk(&PkKey::Str("ada".into()), TransactionKind::ReadOnly),
            Some(0)
        );
    }

    #[test]
    fn duplicate_pk_rejected_and_rollback_clears_staged() {
        let fx = fixture();
        let table = create_table(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        table
            .insert(&tx, &[Value::String("ada".into()), Value::Int64(36)])
            .expect("insert");
        let err = table
            .insert(&tx, &[Value::String("ada".into()), Value::Int64(9)])
            .unwrap_err();
        assert!(matches!(err, QuiverError::Runtime(_)));
        fx.mgr.rollback(&tx).expect("rollback");
        fx.stats.discard_shadow();

        assert_eq!(
            table.lookup_pk(&PkKey::Str("ada".into()), TransactionKind::ReadOnly),
            None
        );
        assert_eq!(table.num_nodes(TransactionKind::ReadOnly), 0);
    }
}
