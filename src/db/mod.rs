//! Database handle and connections.
//!
//! A database lives in one directory: `data.db` (all paged storage),
//! `wal.log`, `catalog.db`, and `statistics.db`. Opening replays the
//! WAL, settles the data file, and rebuilds the in-memory table set.
//! Connections run statements in auto-commit mode or under a manual
//! transaction; a connection dropped with an open transaction rolls it
//! back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogData, NodeTableDef, PropertyDef, RelTableDef};
use crate::error::{QuiverError, Result};
use crate::exec::plan::BoundPlan;
use crate::exec::{ExecContext, QueryResult};
use crate::function::FunctionRegistry;
use crate::pager::wal::Wal;
use crate::pager::{BufferPool, FileHandle};
use crate::statistics::{Statistics, StatisticsData};
use crate::storage::lists::ListsLocator;
use crate::storage::node_table::PkKey;
use crate::storage::{NodeTable, RelTable, StorageContext, TableSet};
use crate::transaction::{
    Transaction, TransactionKind, TransactionManager, TransactionalResource,
};
use crate::types::{FileId, PageIdx, PropertyId, TableId, PAGE_SIZE};
use crate::vector::{LogicalType, Value};

mod meta;

pub use meta::MetaEnvelope;

const DB_MAGIC: &[u8; 8] = b"QUIVERDB";
const DB_VERSION: u16 = 1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyncMode {
    /// fsync the WAL at every commit.
    Full,
    /// No fsync; durability only at checkpoint. For bulk loads and tests.
    Off,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub buffer_pool_frames: usize,
    pub num_threads: usize,
    /// WAL size that triggers an automatic checkpoint after commit.
    pub checkpoint_wal_bytes: u64,
    pub wal_sync_mode: SyncMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_pool_frames: 4096,
            num_threads: 4,
            checkpoint_wal_bytes: 16 * 1024 * 1024,
            wal_sync_mode: SyncMode::Full,
        }
    }
}

impl Config {
    pub fn bulk_load() -> Self {
        Self {
            wal_sync_mode: SyncMode::Off,
            checkpoint_wal_bytes: 256 * 1024 * 1024,
            ..Self::default()
        }
    }
}

pub struct Database {
    path: PathBuf,
    config: Config,
    ctx: StorageContext,
    txn: TransactionManager,
    catalog: Arc<Catalog>,
    statistics: Arc<Statistics>,
    tables: Arc<TableSet>,
    registry: Arc<FunctionRegistry>,
    /// Set on corruption; every further statement is refused.
    poisoned: AtomicBool,
}

/// Commits the catalog and statistics shadows alongside the data pages.
struct MetaResource {
    catalog: Arc<Catalog>,
    statistics: Arc<Statistics>,
    wal: Arc<Wal>,
}

impl TransactionalResource for MetaResource {
    fn prepare_commit(&self, tx: &Transaction) -> Result<()> {
        if !self.catalog.has_shadow() && !self.statistics.has_shadow() {
            return Ok(());
        }
        let envelope = MetaEnvelope {
            catalog: self.catalog.current(),
            statistics: self.statistics.current(),
        };
        self.wal.append_catalog_update(tx.id(), &envelope.to_blob()?)
    }

    fn checkpoint_in_memory(&self) {
        self.catalog.install_shadow();
        self.statistics.install_shadow();
    }

    fn rollback_in_memory(&self) {
        self.catalog.discard_shadow();
        self.statistics.discard_shadow();
    }
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let wal = Arc::new(Wal::open_with_sync(
            path.join("wal.log"),
            config.wal_sync_mode == SyncMode::Full,
        )?);
        let file = Arc::new(FileHandle::open(path.join("data.db"), FileId(0))?);

        // Recovery: replay committed transactions straight into the data
        // file, settle the metadata files, then truncate the log.
        let summary = wal.replay(|file_id, page, image| {
            if file_id != file.id() {
                return Err(QuiverError::Corruption(format!(
                    "WAL references unknown file {}",
                    file_id.0
                )));
            }
            file.write_page(page, image)
        })?;
        if summary.transactions_replayed > 0 {
            info!(
                transactions = summary.transactions_replayed,
                pages = summary.pages_applied,
                "recovered committed transactions from WAL"
            );
        }
        file.sync()?;
        if let Some(blob) = &summary.catalog {
            let envelope = MetaEnvelope::from_blob(blob)?;
            meta::write_meta_file(&path.join("catalog.db"), &envelope.catalog)?;
            meta::write_meta_file(&path.join("statistics.db"), &envelope.statistics)?;
        }
        wal.reset()?;

        let pool = Arc::new(BufferPool::new(config.buffer_pool_frames.max(16)));
        pool.set_wal(Arc::clone(&wal));
        let ctx = StorageContext::new(Arc::clone(&file), Arc::clone(&pool), Arc::clone(&wal));

        // Database header on page 0.
        if file.num_pages() == 0 {
            let (page, pinned) = pool.insert_new_page(&file, |buf| {
                buf[..8].copy_from_slice(DB_MAGIC);
                buf[8..10].copy_from_slice(&DB_VERSION.to_le_bytes());
                buf[10..14].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
            })?;
            drop(pinned);
            pool.flush_page(&file, page)?;
            file.sync()?;
        } else {
            let pinned = pool.pin(&file, PageIdx(0))?;
            pinned.read(|buf| {
                if &buf[..8] != DB_MAGIC {
                    return Err(QuiverError::Corruption("bad database magic".into()));
                }
                let version = u16::from_le_bytes([buf[8], buf[9]]);
                if version != DB_VERSION {
                    return Err(QuiverError::Corruption(format!(
                        "unsupported database version {version}"
                    )));
                }
                Ok(())
            })?;
        }

        let catalog_data: CatalogData =
            meta::read_meta_file(&path.join("catalog.db"))?.unwrap_or_default();
        let statistics_data: StatisticsData =
            meta::read_meta_file(&path.join("statistics.db"))?.unwrap_or_default();
        let catalog = Arc::new(Catalog::new(catalog_data.clone()));
        let statistics = Arc::new(Statistics::new(statistics_data));

        let txn = TransactionManager::new(Arc::clone(&wal), Arc::clone(&pool));
        txn.register_file(Arc::clone(&file));
        txn.register_resource(Arc::new(MetaResource {
            catalog: Arc::clone(&catalog),
            statistics: Arc::clone(&statistics),
            wal: Arc::clone(&wal),
        }));

        let tables = Arc::new(TableSet::default());
        for def in &catalog_data.node_tables {
            let table = Arc::new(NodeTable::open(&ctx, def.clone(), Arc::clone(&statistics))?);
            txn.register_resource(Arc::clone(&table) as Arc<dyn TransactionalResource>);
            for resource in table.storage_resources() {
                txn.register_resource(resource);
            }
            tables.insert_node_table(table);
        }
        for def in &catalog_data.rel_tables {
            let table = Arc::new(RelTable::open(&ctx, def.clone(), Arc::clone(&statistics))?);
            for resource in table.list_resources() {
                txn.register_resource(resource);
            }
            for resource in table.column_resources() {
                txn.register_resource(resource);
            }
            tables.insert_rel_table(table);
        }

        debug!(path = %path.display(), "database opened");
        Ok(Arc::new(Self {
            path,
            config,
            ctx,
            txn,
            catalog,
            statistics,
            tables,
            registry: Arc::new(FunctionRegistry::standard()),
            poisoned: AtomicBool::new(false),
        }))
    }

    pub fn connect(self: &Arc<Self>) -> Connection {
        Connection {
            db: Arc::clone(self),
            active: Mutex::new(None),
            tainted: AtomicBool::new(false),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub fn tables(&self) -> &Arc<TableSet> {
        &self.tables
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(QuiverError::Corruption(
                "database is read-only after a corruption error".into(),
            ));
        }
        Ok(())
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        warn!("database marked read-only after corruption");
    }

    /// Flushes committed pages, persists metadata, and truncates the WAL.
    /// Refused while a write transaction is active.
    pub fn checkpoint(&self) -> Result<()> {
        if self.txn.has_active_write() {
            return Err(QuiverError::WriteConflict);
        }
        self.ctx.wal.append_checkpoint_begin()?;
        self.ctx.wal.flush()?;
        self.ctx.pool.flush_all(&self.ctx.file)?;
        self.ctx.file.sync()?;
        meta::write_meta_file(&self.path.join("catalog.db"), &self.catalog.current())?;
        meta::write_meta_file(
            &self.path.join("statistics.db"),
            &self.statistics.current(),
        )?;
        self.ctx.wal.append_checkpoint_end()?;
        self.ctx.wal.flush()?;
        self.ctx.wal.reset()?;
        debug!("checkpoint complete");
        Ok(())
    }

    fn maybe_checkpoint(&self) {
        let size = match self.ctx.wal.size() {
            Ok(size) => size,
            Err(_) => return,
        };
        if size > self.config.checkpoint_wal_bytes {
            if let Err(err) = self.checkpoint() {
                warn!(error = %err, "automatic checkpoint failed");
            }
        }
    }

    /// Structural integrity check: metadata file checksums, disk-array
    /// geometry, and the invariant that every array page is referenced
    /// by exactly one PIP slot.
    pub fn verify(&self) -> Result<()> {
        let _: Option<CatalogData> = meta::read_meta_file(&self.path.join("catalog.db"))?;
        let _: Option<StatisticsData> = meta::read_meta_file(&self.path.join("statistics.db"))?;

        let catalog = self.catalog.snapshot(TransactionKind::ReadOnly);
        let mut headers: Vec<(u32, usize)> = Vec::new();
        for def in &catalog.node_tables {
            for (property, locator) in def.properties.iter().zip(&def.columns) {
                headers.push((locator.data_header, 1 + property.ty.cell_size()));
                if let Some(overflow) = locator.overflow_header {
                    headers.push((overflow, 8));
                }
            }
        }
        for def in &catalog.rel_tables {
            for (property, locator) in def.properties.iter().zip(&def.columns) {
                headers.push((locator.data_header, 1 + property.ty.cell_size()));
                if let Some(overflow) = locator.overflow_header {
                    headers.push((overflow, 8));
                }
            }
            for lists in [&def.fwd_lists, &def.bwd_lists] {
                for header in [
                    lists.headers,
                    lists.lengths,
                    lists.chunk_heads,
                    lists.large_heads,
                    lists.page_lists,
                ] {
                    headers.push((header, 4));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for (header, element_size) in headers {
            let array = crate::storage::RawDiskArray::open(
                Arc::clone(&self.ctx.file),
                Arc::clone(&self.ctx.pool),
                Arc::clone(&self.ctx.wal),
                PageIdx(header),
                element_size,
            )?;
            for page in array.referenced_pages() {
                if page.0 >= self.ctx.file.num_pages() {
                    return Err(QuiverError::Corruption(format!(
                        "array at page {header} references page {page} past end of file"
                    )));
                }
                if !seen.insert(page) {
                    return Err(QuiverError::Corruption(format!(
                        "page {page} is referenced by more than one PIP slot"
                    )));
                }
            }
        }
        Ok(())
    }

    fn execute_in(
        &self,
        tx: &Arc<Transaction>,
        plan: &BoundPlan,
        params: &HashMap<String, Value>,
        interrupt: &Arc<AtomicBool>,
    ) -> Result<QueryResult> {
        let ctx = ExecContext {
            tx: Arc::clone(tx),
            tables: Arc::clone(&self.tables),
            registry: Arc::clone(&self.registry),
            interrupt: Arc::clone(interrupt),
        };
        crate::exec::execute(plan, &ctx, self.config.num_threads, params)
    }
}

/// A prepared statement: a bound plan awaiting parameter values.
pub struct PreparedStatement {
    plan: BoundPlan,
}

impl PreparedStatement {
    pub fn plan(&self) -> &BoundPlan {
        &self.plan
    }
}

pub struct Connection {
    db: Arc<Database>,
    active: Mutex<Option<Arc<Transaction>>>,
    /// A runtime error under a manual transaction leaves it unusable
    /// until rolled back.
    tainted: AtomicBool,
    interrupt: Arc<AtomicBool>,
}

impl Connection {
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Handle for cancelling the running statement from another thread.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn begin_read(&self) -> Result<()> {
        self.ensure_no_active()?;
        *self.active.lock() = Some(self.db.txn.begin_read_only());
        Ok(())
    }

    pub fn begin_write(&self) -> Result<()> {
        self.db.check_poisoned()?;
        self.ensure_no_active()?;
        *self.active.lock() = Some(self.db.txn.begin_write()?);
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let tx = self.take_active()?;
        self.tainted.store(false, Ordering::Release);
        self.db.txn.commit(&tx)?;
        self.db.maybe_checkpoint();
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        let tx = self.take_active()?;
        self.tainted.store(false, Ordering::Release);
        self.db.txn.rollback(&tx)
    }

    pub fn prepare(&self, plan: BoundPlan) -> PreparedStatement {
        PreparedStatement { plan }
    }

    /// Runs a read plan under the active transaction, or an auto-commit
    /// read-only transaction when none is open.
    pub fn execute(&self, plan: &BoundPlan) -> Result<QueryResult> {
        self.execute_with_params(plan, &HashMap::new())
    }

    pub fn execute_prepared(
        &self,
        stmt: &PreparedStatement,
        params: &HashMap<String, Value>,
    ) -> Result<QueryResult> {
        self.execute_with_params(&stmt.plan, params)
    }

    pub fn execute_with_params(
        &self,
        plan: &BoundPlan,
        params: &HashMap<String, Value>,
    ) -> Result<QueryResult> {
        self.db.check_poisoned()?;
        self.check_tainted()?;
        self.interrupt.store(false, Ordering::Release);
        let active = self.active.lock().clone();
        match active {
            Some(tx) => {
                let result = self.db.execute_in(&tx, plan, params, &self.interrupt);
                self.note_statement_error(&result);
                result
            }
            None => {
                let tx = self.db.txn.begin_read_only();
                let result = self.db.execute_in(&tx, plan, params, &self.interrupt);
                match &result {
                    Ok(_) => self.db.txn.commit(&tx)?,
                    Err(_) => {
                        let _ = self.db.txn.rollback(&tx);
                    }
                }
                result
            }
        }
    }

    /// Creates a node table. Auto-commit only: runs its own write
    /// transaction.
    pub fn create_node_table(
        &self,
        name: &str,
        properties: &[(&str, LogicalType)],
        primary_key: &str,
    ) -> Result<TableId> {
        self.db.check_poisoned()?;
        if self.active.lock().is_some() {
            return Err(QuiverError::Binder(
                "CREATE NODE TABLE cannot run inside a manual transaction".into(),
            ));
        }
        let pk_position = properties
            .iter()
            .position(|(n, _)| *n == primary_key)
            .ok_or_else(|| {
                QuiverError::Binder(format!("primary key {primary_key} is not a property"))
            })?;

        let tx = self.db.txn.begin_write()?;
        let result = (|| -> Result<Arc<NodeTable>> {
            let id = self.db.catalog.allocate_table_id();
            let def = NodeTableDef {
                id,
                name: name.to_string(),
                properties: properties
                    .iter()
                    .enumerate()
                    .map(|(i, (n, ty))| PropertyDef {
                        id: PropertyId(i as u32),
                        name: (*n).to_string(),
                        ty: ty.clone(),
                    })
                    .collect(),
                pk_property: PropertyId(pk_position as u32),
                columns: Vec::new(),
            };
            let table = Arc::new(NodeTable::create(
                &self.db.ctx,
                &tx,
                def,
                Arc::clone(&self.db.statistics),
            )?);
            self.db.catalog.add_node_table(table.def().clone())?;
            self.db
                .txn
                .register_resource(Arc::clone(&table) as Arc<dyn TransactionalResource>);
            for resource in table.storage_resources() {
                self.db.txn.register_resource(resource);
            }
            Ok(table)
        })();
        match result {
            Ok(table) => {
                let id = table.id();
                self.db.txn.commit(&tx)?;
                self.db.tables.insert_node_table(table);
                info!(table = name, "node table created");
                Ok(id)
            }
            Err(err) => {
                let _ = self.db.txn.rollback(&tx);
                Err(err)
            }
        }
    }

    /// Creates a rel table between two node tables. Auto-commit only.
    pub fn create_rel_table(
        &self,
        name: &str,
        src_table: &str,
        dst_table: &str,
        properties: &[(&str, LogicalType)],
    ) -> Result<TableId> {
        self.db.check_poisoned()?;
        if self.active.lock().is_some() {
            return Err(QuiverError::Binder(
                "CREATE REL TABLE cannot run inside a manual transaction".into(),
            ));
        }
        let catalog = self.db.catalog.snapshot(TransactionKind::ReadOnly);
        let src = catalog
            .node_table(src_table)
            .ok_or_else(|| QuiverError::Binder(format!("unknown node table {src_table}")))?
            .id;
        let dst = catalog
            .node_table(dst_table)
            .ok_or_else(|| QuiverError::Binder(format!("unknown node table {dst_table}")))?
            .id;

        let tx = self.db.txn.begin_write()?;
        let result = (|| -> Result<Arc<RelTable>> {
            let id = self.db.catalog.allocate_table_id();
            let empty = ListsLocator {
                headers: 0,
                lengths: 0,
                chunk_heads: 0,
                large_heads: 0,
                page_lists: 0,
            };
            let def = RelTableDef {
                id,
                name: name.to_string(),
                src_table: src,
                dst_table: dst,
                properties: properties
                    .iter()
                    .enumerate()
                    .map(|(i, (n, ty))| PropertyDef {
                        id: PropertyId(i as u32),
                        name: (*n).to_string(),
                        ty: ty.clone(),
                    })
                    .collect(),
                columns: Vec::new(),
                fwd_lists: empty,
                bwd_lists: empty,
            };
            let table = Arc::new(RelTable::create(
                &self.db.ctx,
                &tx,
                def,
                Arc::clone(&self.db.statistics),
            )?);
            self.db.catalog.add_rel_table(table.def().clone())?;
            for resource in table.list_resources() {
                self.db.txn.register_resource(resource);
            }
            for resource in table.column_resources() {
                self.db.txn.register_resource(resource);
            }
            Ok(table)
        })();
        match result {
            Ok(table) => {
                let id = table.id();
                self.db.txn.commit(&tx)?;
                self.db.tables.insert_rel_table(table);
                info!(table = name, "rel table created");
                Ok(id)
            }
            Err(err) => {
                let _ = self.db.txn.rollback(&tx);
                Err(err)
            }
        }
    }

    /// Inserts one node; uses the active write transaction or
    /// auto-commits its own.
    pub fn insert_node(&self, table_name: &str, values: &[Value]) -> Result<u64> {
        self.with_write(|tx| {
            let catalog = self.db.catalog.snapshot(TransactionKind::Write);
            let def = catalog
                .node_table(table_name)
                .ok_or_else(|| QuiverError::Binder(format!("unknown node table {table_name}")))?;
            let table = self.db.tables.node_table(def.id)?;
            table.insert(tx, values)
        })
    }

    /// Inserts one rel, resolving endpoints by primary key.
    pub fn insert_rel(
        &self,
        rel_table: &str,
        src_key: &Value,
        dst_key: &Value,
        values: &[Value],
    ) -> Result<u64> {
        self.with_write(|tx| {
            let catalog = self.db.catalog.snapshot(TransactionKind::Write);
            let def = catalog
                .rel_table(rel_table)
                .ok_or_else(|| QuiverError::Binder(format!("unknown rel table {rel_table}")))?;
            let src_table = self.db.tables.node_table(def.src_table)?;
            let dst_table = self.db.tables.node_table(def.dst_table)?;
            let src = src_table
                .lookup_pk(&PkKey::from_value(src_key)?, TransactionKind::Write)
                .ok_or_else(|| {
                    QuiverError::Runtime(format!("no {} node with key {src_key}", src_table.name()))
                })?;
            let dst = dst_table
                .lookup_pk(&PkKey::from_value(dst_key)?, TransactionKind::Write)
                .ok_or_else(|| {
                    QuiverError::Runtime(format!("no {} node with key {dst_key}", dst_table.name()))
                })?;
            let table = self.db.tables.rel_table(def.id)?;
            table.insert(tx, src, dst, values)
        })
    }

    fn with_write<T>(&self, f: impl FnOnce(&Arc<Transaction>) -> Result<T>) -> Result<T> {
        self.db.check_poisoned()?;
        self.check_tainted()?;
        let active = self.active.lock().clone();
        match active {
            Some(tx) => {
                if !tx.is_write() {
                    return Err(QuiverError::Binder(
                        "cannot mutate data in a read-only transaction".into(),
                    ));
                }
                let result = f(&tx);
                self.note_statement_error(&result);
                result
            }
            None => {
                let tx = self.db.txn.begin_write()?;
                match f(&tx) {
                    Ok(value) => {
                        self.db.txn.commit(&tx)?;
                        self.db.maybe_checkpoint();
                        Ok(value)
                    }
                    Err(err) => {
                        let _ = self.db.txn.rollback(&tx);
                        Err(err)
                    }
                }
            }
        }
    }

    fn note_statement_error<T>(&self, result: &Result<T>) {
        if let Err(err) = result {
            match err {
                QuiverError::Runtime(_) => {
                    // Manual mode: the transaction stays open but rejects
                    // further statements until rolled back.
                    self.tainted.store(true, Ordering::Release);
                }
                QuiverError::Corruption(_) => self.db.poison(),
                _ => {}
            }
        }
    }

    fn check_tainted(&self) -> Result<()> {
        if self.tainted.load(Ordering::Acquire) && self.active.lock().is_some() {
            return Err(QuiverError::Runtime(
                "transaction aborted by a previous error; roll it back first".into(),
            ));
        }
        Ok(())
    }

    fn ensure_no_active(&self) -> Result<()> {
        if self.active.lock().is_some() {
            return Err(QuiverError::Binder(
                "a transaction is already active on this connection".into(),
            ));
        }
        Ok(())
    }

    fn take_active(&self) -> Result<Arc<Transaction>> {
        self.active.lock().take().ok_or(QuiverError::NotActive)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(tx) = self.active.lock().take() {
            warn!(tx_id = tx.id().0, "connection dropped with open transaction");
            let _ = self.db.txn.rollback(&tx);
        }
    }
}
