//! Transaction lifecycle: single writer, many readers.
//!
//! Readers observe the canonical (committed) state captured at begin;
//! the writer sees its own uncommitted changes through the shadow state
//! of each storage structure. Commit drives the two-step resource
//! protocol: `prepare_commit` (shadow state flushed into WAL-logged
//! pages) before the commit record is forced, `checkpoint_in_memory`
//! (shadow installed as canonical) after.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{QuiverError, Result};
use crate::pager::wal::Wal;
use crate::pager::BufferPool;
use crate::types::{FileId, PageIdx, TxId};

/// How long a committing writer waits for concurrent readers.
const READER_DRAIN_TIMEOUT_MS: u64 = 10_000;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransactionKind {
    ReadOnly,
    Write,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A transaction handle. Created by [`TransactionManager::begin_read_only`]
/// or [`TransactionManager::begin_write`]; terminated exactly once through
/// the manager.
pub struct Transaction {
    id: TxId,
    kind: TransactionKind,
    state: Mutex<TransactionState>,
    /// WAL tail captured at begin; rollback truncates back to it.
    wal_tail: u64,
    dirty_pages: Mutex<Vec<(FileId, PageIdx)>>,
}

impl Transaction {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_write(&self) -> bool {
        self.kind == TransactionKind::Write
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Records a page the transaction dirtied. Storage mutation paths call
    /// this right after appending the matching WAL record.
    pub fn record_dirty(&self, file: FileId, page: PageIdx) {
        self.dirty_pages.lock().push((file, page));
    }

    fn take_dirty(&self) -> Vec<(FileId, PageIdx)> {
        let mut pages = std::mem::take(&mut *self.dirty_pages.lock());
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

/// A storage structure participating in commit/rollback.
pub trait TransactionalResource: Send + Sync {
    /// Flush shadow state into WAL-logged buffer pages. Runs before the
    /// commit record is forced; failure aborts the commit.
    fn prepare_commit(&self, tx: &Transaction) -> Result<()>;
    /// Install the shadow state as canonical. Runs after the commit
    /// record is durable; must not fail.
    fn checkpoint_in_memory(&self);
    /// Discard the shadow state.
    fn rollback_in_memory(&self);
}

struct ManagerState {
    active_write: Option<TxId>,
    active_read_only: HashSet<TxId>,
    next_id: u64,
}

pub struct TransactionManager {
    wal: Arc<Wal>,
    pool: Arc<BufferPool>,
    state: Mutex<ManagerState>,
    resources: Mutex<Vec<Arc<dyn TransactionalResource>>>,
    files: Mutex<Vec<Arc<crate::pager::FileHandle>>>,
}

impl TransactionManager {
    pub fn new(wal: Arc<Wal>, pool: Arc<BufferPool>) -> Self {
        Self {
            wal,
            pool,
            state: Mutex::new(ManagerState {
                active_write: None,
                active_read_only: HashSet::new(),
                next_id: 1,
            }),
            resources: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
        }
    }

    /// Registers a data file so rollback can restore before-images of
    /// dirty pages that were evicted to it mid-transaction.
    pub fn register_file(&self, file: Arc<crate::pager::FileHandle>) {
        self.files.lock().push(file);
    }

    /// Registers a structure for the commit/rollback protocol. Called once
    /// per disk array / statistics table / index at open time.
    pub fn register_resource(&self, resource: Arc<dyn TransactionalResource>) {
        self.resources.lock().push(resource);
    }

    pub fn begin_read_only(&self) -> Arc<Transaction> {
        let mut state = self.state.lock();
        let id = TxId(state.next_id);
        state.next_id += 1;
        state.active_read_only.insert(id);
        debug!(tx_id = id.0, "read-only transaction started");
        Arc::new(Transaction {
            id,
            kind: TransactionKind::ReadOnly,
            state: Mutex::new(TransactionState::Active),
            wal_tail: 0,
            dirty_pages: Mutex::new(Vec::new()),
        })
    }

    pub fn begin_write(&self) -> Result<Arc<Transaction>> {
        let mut state = self.state.lock();
        if state.active_write.is_some() {
            return Err(QuiverError::WriteConflict);
        }
        let id = TxId(state.next_id);
        state.next_id += 1;
        state.active_write = Some(id);
        debug!(tx_id = id.0, "write transaction started");
        Ok(Arc::new(Transaction {
            id,
            kind: TransactionKind::Write,
            state: Mutex::new(TransactionState::Active),
            wal_tail: self.wal.tail(),
            dirty_pages: Mutex::new(Vec::new()),
        }))
    }

    pub fn has_active_write(&self) -> bool {
        self.state.lock().active_write.is_some()
    }

    pub fn active_read_only_count(&self) -> usize {
        self.state.lock().active_read_only.len()
    }

    pub fn commit(&self, tx: &Transaction) -> Result<()> {
        match tx.kind {
            TransactionKind::ReadOnly => {
                let mut state = self.state.lock();
                self.ensure_active(tx)?;
                state.active_read_only.remove(&tx.id);
                *tx.state.lock() = TransactionState::Committed;
                Ok(())
            }
            TransactionKind::Write => self.commit_write(tx),
        }
    }

    /// Installing the shadows would move the canonical state under
    /// concurrent readers, so the commit waits until every read-only
    /// transaction begun before it has finished. New transactions are
    /// held out by the manager mutex while the install runs, which gives
    /// the visibility guarantee: anything begun after commit returns
    /// observes all of its writes.
    fn commit_write(&self, tx: &Transaction) -> Result<()> {
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(READER_DRAIN_TIMEOUT_MS);
        loop {
            {
                let mut state = self.state.lock();
                self.ensure_active(tx)?;
                if state.active_read_only.is_empty() {
                    return self.commit_write_locked(&mut state, tx);
                }
            }
            if std::time::Instant::now() >= deadline {
                warn!(tx_id = tx.id.0, "commit timed out waiting for readers");
                return Err(QuiverError::CheckpointWaitTimeout);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn commit_write_locked(&self, state: &mut ManagerState, tx: &Transaction) -> Result<()> {
        let resources: Vec<_> = self.resources.lock().clone();
        for resource in &resources {
            if let Err(err) = resource.prepare_commit(tx) {
                warn!(tx_id = tx.id.0, error = %err, "prepare-commit failed, rolling back");
                self.rollback_write_locked(state, tx, &resources)?;
                return Err(err);
            }
        }
        self.wal.append_commit(tx.id)?;
        self.wal.flush()?;
        // Durable from here on: effects must install.
        self.pool.mark_committed(&tx.take_dirty());
        for resource in &resources {
            resource.checkpoint_in_memory();
        }
        state.active_write = None;
        *tx.state.lock() = TransactionState::Committed;
        info!(tx_id = tx.id.0, "transaction committed");
        Ok(())
    }

    pub fn rollback(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_active(tx)?;
        match tx.kind {
            TransactionKind::ReadOnly => {
                state.active_read_only.remove(&tx.id);
                *tx.state.lock() = TransactionState::RolledBack;
                Ok(())
            }
            TransactionKind::Write => {
                let resources: Vec<_> = self.resources.lock().clone();
                self.rollback_write_locked(&mut state, tx, &resources)
            }
        }
    }

    fn rollback_write_locked(
        &self,
        state: &mut ManagerState,
        tx: &Transaction,
        resources: &[Arc<dyn TransactionalResource>],
    ) -> Result<()> {
        for resource in resources {
            resource.rollback_in_memory();
        }
        self.pool.discard_dirty(&tx.take_dirty())?;
        // Undo dirty pages that eviction already pushed to disk. Writing
        // a before-image for a page that never left the pool is a no-op
        // (its on-disk bytes are that image already).
        let images = self.wal.before_images_since(tx.wal_tail, tx.id)?;
        if !images.is_empty() {
            let files = self.files.lock();
            for (file_id, page, before) in images {
                if let Some(file) = files.iter().find(|f| f.id() == file_id) {
                    file.write_page(page, &before)?;
                }
            }
        }
        self.wal.truncate_to(tx.wal_tail)?;
        state.active_write = None;
        *tx.state.lock() = TransactionState::RolledBack;
        info!(tx_id = tx.id.0, "transaction rolled back");
        Ok(())
    }

    fn ensure_active(&self, tx: &Transaction) -> Result<()> {
        if tx.state() != TransactionState::Active {
            // Multiple commit/rollback is an error for write transactions;
            // tolerated for read-only ones.
            if tx.kind == TransactionKind::Write {
                return Err(QuiverError::TransactionFinalized(tx.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &tempfile::TempDir) -> TransactionManager {
        let wal = Arc::new(Wal::open(dir.path().join("wal.log")).expect("wal"));
        let pool = Arc::new(BufferPool::new(8));
        TransactionManager::new(wal, pool)
    }

    #[test]
    fn second_writer_conflicts() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(&dir);
        let t1 = mgr.begin_write().expect("first writer");
        assert!(matches!(mgr.begin_write(), Err(QuiverError::WriteConflict)));
        mgr.rollback(&t1).expect("rollback");
        mgr.begin_write().expect("writer after rollback");
    }

    #[test]
    fn ids_increase_across_kinds() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(&dir);
        let t1 = mgr.begin_read_only();
        let t2 = mgr.begin_write().expect("writer");
        let t3 = mgr.begin_read_only();
        assert_eq!(t1.id().0 + 1, t2.id().0);
        assert_eq!(t2.id().0 + 1, t3.id().0);
        assert_eq!(mgr.active_read_only_count(), 2);
        mgr.commit(&t1).expect("commit reader");
        mgr.rollback(&t3).expect("rollback reader");
        assert_eq!(mgr.active_read_only_count(), 0);
        mgr.commit(&t2).expect("commit writer");
        assert!(!mgr.has_active_write());
    }

    #[test]
    fn writer_commit_waits_for_reader_to_drain() {
        let dir = tempdir().expect("tempdir");
        let mgr = Arc::new(manager(&dir));
        let reader = mgr.begin_read_only();
        let writer = mgr.begin_write().expect("writer");

        let mgr2 = Arc::clone(&mgr);
        let handle = std::thread::spawn(move || mgr2.commit(&writer));
        // Give the committer time to reach its wait loop, then release it.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(mgr.has_active_write());
        mgr.commit(&reader).expect("commit reader");
        handle.join().expect("join").expect("commit writer");
        assert!(!mgr.has_active_write());
    }

    #[test]
    fn double_commit_of_writer_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(&dir);
        let tx = mgr.begin_write().expect("writer");
        mgr.commit(&tx).expect("first commit");
        assert!(matches!(
            mgr.commit(&tx),
            Err(QuiverError::TransactionFinalized(_))
        ));
        assert!(matches!(
            mgr.rollback(&tx),
            Err(QuiverError::TransactionFinalized(_))
        ));
    }

    #[test]
    fn read_only_tolerates_repeated_finalize() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(&dir);
        let tx = mgr.begin_read_only();
        mgr.commit(&tx).expect("commit");
        mgr.rollback(&tx).expect("second finalize is a no-op");
    }
}
