//! Rel tables: per-direction CSR adjacency lists plus property columns
//! addressed by dense rel offset.

use std::sync::Arc;

use crate::catalog::RelTableDef;
use crate::error::{QuiverError, Result};
use crate::statistics::Statistics;
use crate::storage::lists::ListEntry;
use crate::storage::{Column, Lists, StorageContext};
use crate::transaction::{Transaction, TransactionKind, TransactionalResource};
use crate::types::{Direction, NodeOffset, RelOffset, TableId};
use crate::vector::Value;

pub struct RelTable {
    def: RelTableDef,
    columns: Vec<Column>,
    fwd: Arc<Lists>,
    bwd: Arc<Lists>,
    stats: Arc<Statistics>,
}

impl RelTable {
    pub fn create(
        ctx: &StorageContext,
        tx: &Transaction,
        mut def: RelTableDef,
        stats: Arc<Statistics>,
    ) -> Result<Self> {
        let mut columns = Vec::with_capacity(def.properties.len());
        for property in &def.properties {
            columns.push(Column::create(ctx, tx, property.ty.clone())?);
        }
        def.columns = columns.iter().map(Column::locator).collect();
        let fwd = Arc::new(Lists::create(ctx, tx)?);
        let bwd = Arc::new(Lists::create(ctx, tx)?);
        def.fwd_lists = fwd.locator();
        def.bwd_lists = bwd.locator();
        stats.register_rel_table(def.id);
        Ok(Self {
            def,
            columns,
            fwd,
            bwd,
            stats,
        })
    }

    pub fn open(ctx: &StorageContext, def: RelTableDef, stats: Arc<Statistics>) -> Result<Self> {
        let mut columns = Vec::with_capacity(def.properties.len());
        for (property, locator) in def.properties.iter().zip(&def.columns) {
            columns.push(Column::open(ctx, property.ty.clone(), *locator)?);
        }
        let fwd = Arc::new(Lists::open(ctx, def.fwd_lists)?);
        let bwd = Arc::new(Lists::open(ctx, def.bwd_lists)?);
        Ok(Self {
            def,
            columns,
            fwd,
            bwd,
            stats,
        })
    }

    pub fn id(&self) -> TableId {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &RelTableDef {
        &self.def
    }

    pub fn src_table(&self) -> TableId {
        self.def.src_table
    }

    pub fn dst_table(&self) -> TableId {
        self.def.dst_table
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn num_rels(&self, kind: TransactionKind) -> u64 {
        self.stats.num_rels(self.def.id, kind)
    }

    /// Lists resources, ordered so each lists structure precedes the
    /// metadata arrays it mutates during `prepare_commit`.
    pub fn list_resources(&self) -> Vec<Arc<dyn TransactionalResource>> {
        let mut resources: Vec<Arc<dyn TransactionalResource>> = Vec::new();
        for lists in [&self.fwd, &self.bwd] {
            resources.push(Arc::clone(lists) as Arc<dyn TransactionalResource>);
            for array in lists.resources() {
                resources.push(array as Arc<dyn TransactionalResource>);
            }
        }
        resources
    }

    pub fn column_resources(&self) -> Vec<Arc<crate::storage::RawDiskArray>> {
        self.columns.iter().flat_map(Column::resources).collect()
    }

    /// Inserts one rel between already-resolved node offsets; returns the
    /// rel's dense offset.
    pub fn insert(
        &self,
        tx: &Transaction,
        src: NodeOffset,
        dst: NodeOffset,
        values: &[Value],
    ) -> Result<RelOffset> {
        if values.len() != self.columns.len() {
            return Err(QuiverError::Binder(format!(
                "expected {} rel property values, got {}",
                self.columns.len(),
                values.len()
            )));
        }
        let rel = self.stats.allocate_rel_offset(self.def.id);
        for (column, value) in self.columns.iter().zip(values) {
            column.set_value(tx, rel, value)?;
        }
        self.fwd.append(src, (dst, rel));
        self.bwd.append(dst, (src, rel));
        Ok(rel)
    }

    /// Adjacency of `node` in `direction`: `(neighbor offset, rel offset)`
    /// pairs.
    pub fn adjacency(
        &self,
        node: NodeOffset,
        direction: Direction,
        kind: TransactionKind,
    ) -> Result<Vec<ListEntry>> {
        match direction {
            Direction::Fwd => self.fwd.read_list(node, kind),
            Direction::Bwd => self.bwd.read_list(node, kind),
        }
    }

    pub fn degree(&self, node: NodeOffset, direction: Direction, kind: TransactionKind) -> Result<u64> {
        match direction {
            Direction::Fwd => self.fwd.list_len(node, kind),
            Direction::Bwd => self.bwd.list_len(node, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PropertyDef;
    use crate::pager::{wal::Wal, BufferPool, FileHandle};
    use crate::statistics::StatisticsData;
    use crate::storage::lists::ListsLocator;
    use crate::transaction::TransactionManager;
    use crate::types::{FileId, PropertyId};
    use crate::vector::LogicalType;
    use tempfile::tempdir;

    fn knows_def() -> RelTableDef {
        let empty = ListsLocator {
            headers: 0,
            lengths: 0,
            chunk_heads: 0,
            large_heads: 0,
            page_lists: 0,
        };
        RelTableDef {
            id: TableId(1),
            name: "Knows".into(),
            src_table: TableId(0),
            dst_table: TableId(0),
            properties: vec![PropertyDef {
                id: PropertyId(0),
                name: "since".into(),
                ty: LogicalType::Int64,
            }],
            columns: Vec::new(),
            fwd_lists: empty,
            bwd_lists: empty,
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

    fn create_table(fx: &Fixture) -> Arc<RelTable> {
        let tx = fx.mgr.begin_write().expect("writer");
        let table = Arc::new(
            RelTable::create(&fx.ctx, &tx, knows_def(), Arc::clone(&fx.stats)).expect("create"),
        );
        for resource in table.list_resources() {
            fx.mgr.register_resource(resource);
        }
        for resource in table.column_resources() {
            fx.mgr.register_resource(resource);
        }
        fx.mgr.commit(&tx).expect("commit");
        fx.stats.install_shadow();
        table
    }

    #[test]
    fn insert_builds_both_directions() {
        let fx = fixture();
        let table = create_table(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        let r0 = table.insert(&tx, 0, 1, &[Value::Int64(1999)]).expect("insert");
        let r1 = table.insert(&tx, 0, 2, &[Value::Int64(2004)]).expect("insert");
        let r2 = table.insert(&tx, 2, 1, &[Value::Int64(2011)]).expect("insert");
        fx.mgr.commit(&tx).expect("commit");
        fx.stats.install_shadow();

        let kind = TransactionKind::ReadOnly;
        assert_eq!(
            table.adjacency(0, Direction::Fwd, kind).expect("fwd"),
            vec![(1, r0), (2, r1)]
        );
        let mut incoming_1 = table.adjacency(1, Direction::Bwd, kind).expect("bwd");
        incoming_1.sort_unstable();
        assert_eq!(incoming_1, vec![(0, r0), (2, r2)]);
        assert_eq!(
            table.column(0).get_value(r2, kind).expect("since"),
            Value::Int64(2011)
        );
        assert_eq!(table.num_rels(kind), 3);
    }
}
