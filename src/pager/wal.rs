//! Sequential redo log with CRC-framed records.
//!
//! Policy is redo-only, force-at-commit: a transaction's `PageUpdate`
//! records plus its `Commit` record are fsynced before the commit is
//! reported. Recovery replays after-images of committed transactions and
//! discards records of transactions without a terminating commit.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{QuiverError, Result};
use crate::types::{FileId, PageIdx, TxId, PAGE_SIZE};

const WAL_MAGIC: &[u8; 8] = b"QVRWAL\0\0";
const WAL_VERSION_MAJOR: u16 = 1;
const WAL_VERSION_MINOR: u16 = 0;
pub const WAL_HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 9;

const KIND_PAGE_UPDATE: u8 = 1;
const KIND_COMMIT: u8 = 2;
const KIND_CHECKPOINT_BEGIN: u8 = 3;
const KIND_CHECKPOINT_END: u8 = 4;
const KIND_CATALOG_UPDATE: u8 = 5;

const PAGE_UPDATE_BODY_SIZE: usize = 8 + 2 + 4 + 2 * PAGE_SIZE;

/// One decoded log record.
pub enum WalRecord {
    PageUpdate {
        tx: TxId,
        file: FileId,
        page: PageIdx,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Commit {
        tx: TxId,
    },
    CheckpointBegin,
    CheckpointEnd,
    CatalogUpdate {
        tx: TxId,
        blob: Vec<u8>,
    },
}

struct WalInner {
    file: File,
    /// Byte offset one past the last durable record.
    tail: u64,
}

pub struct Wal {
    inner: Mutex<WalInner>,
    sync_enabled: bool,
}

/// Outcome of a recovery scan.
#[derive(Default)]
pub struct ReplaySummary {
    pub pages_applied: u32,
    pub transactions_replayed: u32,
    /// Latest committed catalog blob, if any transaction rewrote it.
    pub catalog: Option<Vec<u8>>,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync(path, true)
    }

    /// `sync_enabled: false` skips every fsync; durability then only
    /// comes from checkpoints. Bulk-load configuration.
    pub fn open_with_sync(path: impl AsRef<Path>, sync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let mut inner = WalInner { file, tail: len };
        if len == 0 {
            inner.write_header()?;
            inner.tail = WAL_HEADER_SIZE as u64;
        } else {
            inner.validate_header()?;
        }
        Ok(Self {
            inner: Mutex::new(inner),
            sync_enabled,
        })
    }

    /// Current end-of-log offset; a write transaction records this at
    /// begin so rollback can truncate its own records.
    pub fn tail(&self) -> u64 {
        self.inner.lock().tail
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.inner.lock().file.metadata()?.len())
    }

    pub fn append_page_update(
        &self,
        tx: TxId,
        file: FileId,
        page: PageIdx,
        before: &[u8],
        after: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(before.len(), PAGE_SIZE);
        debug_assert_eq!(after.len(), PAGE_SIZE);
        let mut body = Vec::with_capacity(PAGE_UPDATE_BODY_SIZE);
        body.extend_from_slice(&tx.0.to_le_bytes());
        body.extend_from_slice(&file.0.to_le_bytes());
        body.extend_from_slice(&page.0.to_le_bytes());
        body.extend_from_slice(before);
        body.extend_from_slice(after);
        self.inner.lock().append(KIND_PAGE_UPDATE, &body)
    }

    pub fn append_commit(&self, tx: TxId) -> Result<()> {
        self.inner.lock().append(KIND_COMMIT, &tx.0.to_le_bytes())
    }

    pub fn append_checkpoint_begin(&self) -> Result<()> {
        self.inner.lock().append(KIND_CHECKPOINT_BEGIN, &[])
    }

    pub fn append_checkpoint_end(&self) -> Result<()> {
        self.inner.lock().append(KIND_CHECKPOINT_END, &[])
    }

    pub fn append_catalog_update(&self, tx: TxId, blob: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(8 + blob.len());
        body.extend_from_slice(&tx.0.to_le_bytes());
        body.extend_from_slice(blob);
        self.inner.lock().append(KIND_CATALOG_UPDATE, &body)
    }

    pub fn flush(&self) -> Result<()> {
        if self.sync_enabled {
            self.inner.lock().file.sync_data()?;
        }
        Ok(())
    }

    /// Discards records past `offset`. Rollback path for the write
    /// transaction that began at that tail.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(offset)?;
        inner.file.seek(SeekFrom::End(0))?;
        inner.tail = offset;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Truncates the whole log back to its header. Checkpoint epilogue.
    pub fn reset(&self) -> Result<()> {
        self.truncate_to(WAL_HEADER_SIZE as u64)
    }

    /// Replays the log into `apply`, which receives `(file, page, image)`.
    ///
    /// Committed transactions have their after-images applied in log
    /// order. Transactions without a terminating commit are discarded at
    /// the effects level: the first (canonical) before-image of every page
    /// they touched is written back, undoing any uncommitted page that
    /// reached its data file through dirty eviction. A torn or unreadable
    /// tail ends the scan and is truncated away. Idempotent.
    pub fn replay<F>(&self, mut apply: F) -> Result<ReplaySummary>
    where
        F: FnMut(FileId, PageIdx, &[u8]) -> Result<()>,
    {
        let mut inner = self.inner.lock();
        let mut offset = WAL_HEADER_SIZE as u64;
        let mut summary = ReplaySummary::default();
        let mut pending: Vec<PendingTx> = Vec::new();

        loop {
            match inner.read_record_at(offset)? {
                None => break,
                Some((record, next)) => {
                    match record {
                        WalRecord::PageUpdate {
                            tx,
                            file,
                            page,
                            before,
                            after,
                        } => {
                            pending_entry(&mut pending, tx)
                                .updates
                                .push((file, page, before, after));
                        }
                        WalRecord::CatalogUpdate { tx, blob } => {
                            pending_entry(&mut pending, tx).catalog = Some(blob);
                        }
                        WalRecord::Commit { tx } => {
                            if let Some(pos) = pending.iter().position(|p| p.tx == tx) {
                                let done = pending.remove(pos);
                                for (file, page, _, after) in &done.updates {
                                    apply(*file, *page, after)?;
                                    summary.pages_applied += 1;
                                }
                                if done.catalog.is_some() {
                                    summary.catalog = done.catalog;
                                }
                                summary.transactions_replayed += 1;
                            }
                        }
                        WalRecord::CheckpointBegin | WalRecord::CheckpointEnd => {}
                    }
                    offset = next;
                }
            }
        }

        if !pending.is_empty() {
            debug!(
                transactions = pending.len(),
                "restoring before-images of uncommitted transactions"
            );
            let mut restored: Vec<(FileId, PageIdx)> = Vec::new();
            for tx in &pending {
                for (file, page, before, _) in &tx.updates {
                    if restored.contains(&(*file, *page)) {
                        continue;
                    }
                    apply(*file, *page, before)?;
                    restored.push((*file, *page));
                }
            }
        }
        if offset < inner.tail {
            warn!(
                good = offset,
                tail = inner.tail,
                "truncating torn WAL tail"
            );
        }
        inner.file.set_len(offset)?;
        inner.file.seek(SeekFrom::End(0))?;
        inner.tail = offset;
        Ok(summary)
    }

    /// First before-image per page appended by `tx` at or after `offset`.
    /// Rollback writes these back to undo dirty pages that were evicted
    /// to disk mid-transaction.
    pub fn before_images_since(
        &self,
        offset: u64,
        tx: TxId,
    ) -> Result<Vec<(FileId, PageIdx, Vec<u8>)>> {
        let mut inner = self.inner.lock();
        let mut at = offset.max(WAL_HEADER_SIZE as u64);
        let mut images: Vec<(FileId, PageIdx, Vec<u8>)> = Vec::new();
        while let Some((record, next)) = inner.read_record_at(at)? {
            if let WalRecord::PageUpdate {
                tx: record_tx,
                file,
                page,
                before,
                ..
            } = record
            {
                if record_tx == tx && !images.iter().any(|(f, p, _)| *f == file && *p == page) {
                    images.push((file, page, before));
                }
            }
            at = next;
        }
        Ok(images)
    }
}

struct PendingTx {
    tx: TxId,
    updates: Vec<(FileId, PageIdx, Vec<u8>, Vec<u8>)>,
    catalog: Option<Vec<u8>>,
}

fn pending_entry(pending: &mut Vec<PendingTx>, tx: TxId) -> &mut PendingTx {
    if let Some(pos) = pending.iter().position(|p| p.tx == tx) {
        &mut pending[pos]
    } else {
        pending.push(PendingTx {
            tx,
            updates: Vec::new(),
            catalog: None,
        });
        let last = pending.len() - 1;
        &mut pending[last]
    }
}

impl WalInner {
    fn append(&mut self, kind: u8, body: &[u8]) -> Result<()> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0] = kind;
        header[1..5].copy_from_slice(&(body.len() as u32).to_le_bytes());
        header[5..9].copy_from_slice(&checksum(body).to_le_bytes());
        self.file.seek(SeekFrom::Start(self.tail))?;
        self.file.write_all(&header)?;
        self.file.write_all(body)?;
        self.tail += (RECORD_HEADER_SIZE + body.len()) as u64;
        Ok(())
    }

    /// Reads the record at `offset`. Returns `None` on a clean or torn
    /// end of log.
    fn read_record_at(&mut self, offset: u64) -> Result<Option<(WalRecord, u64)>> {
        let len = self.file.metadata()?.len();
        if offset + RECORD_HEADER_SIZE as u64 > len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let kind = header[0];
        let body_len = u32::from_le_bytes(header[1..5].try_into().expect("4 bytes")) as usize;
        let stored_crc = u32::from_le_bytes(header[5..9].try_into().expect("4 bytes"));
        if offset + (RECORD_HEADER_SIZE + body_len) as u64 > len {
            return Ok(None);
        }
        let mut body = vec![0u8; body_len];
        self.file.read_exact(&mut body)?;
        if checksum(&body) != stored_crc {
            warn!(offset, "WAL record checksum mismatch, treating as torn tail");
            return Ok(None);
        }
        let next = offset + (RECORD_HEADER_SIZE + body_len) as u64;
        let record = match kind {
            KIND_PAGE_UPDATE => {
                if body_len != PAGE_UPDATE_BODY_SIZE {
                    return Err(QuiverError::Corruption(
                        "page-update record has wrong body size".into(),
                    ));
                }
                let tx = TxId(u64::from_le_bytes(body[0..8].try_into().expect("8 bytes")));
                let file = FileId(u16::from_le_bytes(body[8..10].try_into().expect("2 bytes")));
                let page = PageIdx(u32::from_le_bytes(body[10..14].try_into().expect("4 bytes")));
                let before = body[14..14 + PAGE_SIZE].to_vec();
                let after = body[14 + PAGE_SIZE..].to_vec();
                WalRecord::PageUpdate {
                    tx,
                    file,
                    page,
                    before,
                    after,
                }
            }
            KIND_COMMIT => {
                if body_len != 8 {
                    return Err(QuiverError::Corruption(
                        "commit record has wrong body size".into(),
                    ));
                }
                WalRecord::Commit {
                    tx: TxId(u64::from_le_bytes(body[0..8].try_into().expect("8 bytes"))),
                }
            }
            KIND_CHECKPOINT_BEGIN => WalRecord::CheckpointBegin,
            KIND_CHECKPOINT_END => WalRecord::CheckpointEnd,
            KIND_CATALOG_UPDATE => {
                if body_len < 8 {
                    return Err(QuiverError::Corruption(
                        "catalog record has wrong body size".into(),
                    ));
                }
                let tx = TxId(u64::from_le_bytes(body[0..8].try_into().expect("8 bytes")));
                WalRecord::CatalogUpdate {
                    tx,
                    blob: body[8..].to_vec(),
                }
            }
            other => {
                return Err(QuiverError::Corruption(format!(
                    "unknown WAL record kind {other}"
                )))
            }
        };
        Ok(Some((record, next)))
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[..8].copy_from_slice(WAL_MAGIC);
        header[8..10].copy_from_slice(&WAL_VERSION_MAJOR.to_le_bytes());
        header[10..12].copy_from_slice(&WAL_VERSION_MINOR.to_le_bytes());
        header[12..16].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;
        if &header[..8] != WAL_MAGIC {
            return Err(QuiverError::Corruption("invalid WAL magic".into()));
        }
        let major = u16::from_le_bytes([header[8], header[9]]);
        if major != WAL_VERSION_MAJOR {
            return Err(QuiverError::Corruption(format!(
                "unsupported WAL version {major}"
            )));
        }
        let page_size = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if page_size as usize != PAGE_SIZE {
            return Err(QuiverError::Corruption(
                "WAL page size differs from engine page size".into(),
            ));
        }
        Ok(())
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn replay_applies_only_committed_transactions() {
        let dir = tempdir().expect("tempdir");
        let wal = Wal::open(dir.path().join("wal.log")).expect("open");

        wal.append_page_update(TxId(1), FileId(0), PageIdx(0), &page_of(0), &page_of(1))
            .expect("t1 update");
        wal.append_commit(TxId(1)).expect("t1 commit");
        wal.append_page_update(TxId(2), FileId(0), PageIdx(1), &page_of(4), &page_of(2))
            .expect("t2 update");
        // No commit for t2.
        wal.flush().expect("flush");

        let mut applied = HashMap::new();
        let summary = wal
            .replay(|_, page, image| {
                applied.insert(page, image[0]);
                Ok(())
            })
            .expect("replay");
        assert_eq!(summary.transactions_replayed, 1);
        // t1's after-image is applied; t2 is undone back to its
        // before-image.
        assert_eq!(applied.get(&PageIdx(0)), Some(&1));
        assert_eq!(applied.get(&PageIdx(1)), Some(&4));
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let wal = Wal::open(dir.path().join("wal.log")).expect("open");
        wal.append_page_update(TxId(1), FileId(0), PageIdx(3), &page_of(0), &page_of(9))
            .expect("update");
        wal.append_commit(TxId(1)).expect("commit");
        wal.flush().expect("flush");

        for _ in 0..2 {
            let mut count = 0;
            wal.replay(|_, _, _| {
                count += 1;
                Ok(())
            })
            .expect("replay");
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn torn_tail_is_truncated_and_prior_commits_survive() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).expect("open");
            wal.append_page_update(TxId(1), FileId(0), PageIdx(0), &page_of(0), &page_of(5))
                .expect("update");
            wal.append_commit(TxId(1)).expect("commit");
            wal.append_page_update(TxId(2), FileId(0), PageIdx(1), &page_of(0), &page_of(6))
                .expect("second update");
            wal.flush().expect("flush");
        }
        // Tear the last record in half.
        let len = std::fs::metadata(&path).expect("meta").len();
        let file = OpenOptions::new().write(true).open(&path).expect("open raw");
        file.set_len(len - PAGE_SIZE as u64).expect("tear");

        let wal = Wal::open(&path).expect("reopen");
        let mut applied = Vec::new();
        wal.replay(|_, page, _| {
            applied.push(page);
            Ok(())
        })
        .expect("replay");
        assert_eq!(applied, vec![PageIdx(0)]);
    }

    #[test]
    fn rollback_truncates_to_recorded_tail() {
        let dir = tempdir().expect("tempdir");
        let wal = Wal::open(dir.path().join("wal.log")).expect("open");
        let tail = wal.tail();
        wal.append_page_update(TxId(7), FileId(0), PageIdx(0), &page_of(0), &page_of(1))
            .expect("update");
        wal.truncate_to(tail).expect("truncate");
        assert_eq!(wal.size().expect("size"), WAL_HEADER_SIZE as u64);

        let summary = wal.replay(|_, _, _| Ok(())).expect("replay");
        assert_eq!(summary.pages_applied, 0);
    }

    #[test]
    fn catalog_blob_surfaces_from_committed_transaction() {
        let dir = tempdir().expect("tempdir");
        let wal = Wal::open(dir.path().join("wal.log")).expect("open");
        wal.append_catalog_update(TxId(1), b"catalog-v2").expect("catalog");
        wal.append_commit(TxId(1)).expect("commit");
        let summary = wal.replay(|_, _, _| Ok(())).expect("replay");
        assert_eq!(summary.catalog.as_deref(), Some(&b"catalog-v2"[..]));
    }
}
