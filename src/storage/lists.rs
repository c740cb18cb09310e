//! CSR-style adjacency lists.
//!
//! Each bound (source) node has a 32-bit header: MSB clear means a
//! *small* list whose payload is the CSR start offset of the list inside
//! its chunk (2^9 bound nodes per chunk, all small lists concatenated);
//! MSB set means a *large* list whose payload indexes a per-list page
//! chain. List lengths live in a parallel array. Chunk and large-list
//! page chains are tracked in metadata disk arrays as fixed groups of
//! page indices linked by a next-group slot.
//!
//! Inserts accumulate in a writer-private pending map. `prepare_commit`
//! rewrites each affected chunk onto fresh pages (copy-on-write at chunk
//! granularity), so concurrent readers keep seeing the old pages through
//! the canonical metadata until the commit installs the shadow.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{QuiverError, Result};
use crate::storage::disk_array::{DiskArray, RawDiskArray};
use crate::storage::StorageContext;
use crate::transaction::{Transaction, TransactionKind, TransactionalResource};
use crate::types::{NodeOffset, PageIdx, LISTS_CHUNK_SIZE, LISTS_CHUNK_SIZE_LOG2, PAGE_SIZE};

/// Lists longer than this leave their chunk and get their own page chain.
pub const LARGE_LIST_THRESHOLD: u64 = LISTS_CHUNK_SIZE;

/// Adjacency element: destination node offset plus rel offset.
pub type ListEntry = (u64, u64);

const ENTRY_SIZE: usize = 16;
const ENTRIES_PER_PAGE: usize = PAGE_SIZE / ENTRY_SIZE;

/// Page-list group shape: three page slots plus the next-group link.
const GROUP_PAGES: usize = 3;
const GROUP_SIZE: usize = GROUP_PAGES + 1;

const NULL_U32: u32 = u32::MAX;
const LARGE_FLAG: u32 = 1 << 31;

/// Header pages of one lists structure; recorded in the catalog.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ListsLocator {
    pub headers: u32,
    pub lengths: u32,
    pub chunk_heads: u32,
    pub large_heads: u32,
    pub page_lists: u32,
}

/// One direction's adjacency lists for a rel table.
pub struct Lists {
    ctx: StorageContext,
    /// Per-node CSR header (small offset or large-list index).
    headers: DiskArray<u32>,
    /// Per-node list length.
    lengths: DiskArray<u32>,
    /// Per-chunk head group index into `page_lists`.
    chunk_heads: DiskArray<u32>,
    /// Per-large-list head group index into `page_lists`.
    large_heads: DiskArray<u32>,
    /// Shared group storage: `GROUP_PAGES` page indices plus a next link.
    page_lists: DiskArray<u32>,
    /// Writer-private rel inserts, keyed by bound node offset.
    pending: Mutex<HashMap<NodeOffset, Vec<ListEntry>>>,
}

impl Lists {
    pub fn create(ctx: &StorageContext, tx: &Transaction) -> Result<Self> {
        let make = || -> Result<DiskArray<u32>> {
            DiskArray::<u32>::create(
                Arc::clone(&ctx.file),
                Arc::clone(&ctx.pool),
                Arc::clone(&ctx.wal),
                tx,
            )
        };
        Ok(Self {
            ctx: ctx.clone(),
            headers: make()?,
            lengths: make()?,
            chunk_heads: make()?,
            large_heads: make()?,
            page_lists: make()?,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn open(ctx: &StorageContext, locator: ListsLocator) -> Result<Self> {
        let open = |page: u32| -> Result<DiskArray<u32>> {
            DiskArray::<u32>::open(
                Arc::clone(&ctx.file),
                Arc::clone(&ctx.pool),
                Arc::clone(&ctx.wal),
                PageIdx(page),
            )
        };
        Ok(Self {
            ctx: ctx.clone(),
            headers: open(locator.headers)?,
            lengths: open(locator.lengths)?,
            chunk_heads: open(locator.chunk_heads)?,
            large_heads: open(locator.large_heads)?,
            page_lists: open(locator.page_lists)?,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn locator(&self) -> ListsLocator {
        ListsLocator {
            headers: self.headers.header_page().0,
            lengths: self.lengths.header_page().0,
            chunk_heads: self.chunk_heads.header_page().0,
            large_heads: self.large_heads.header_page().0,
            page_lists: self.page_lists.header_page().0,
        }
    }

    /// Metadata arrays, to be registered with the transaction manager
    /// after the lists structure itself.
    pub fn resources(&self) -> Vec<Arc<RawDiskArray>> {
        vec![
            self.headers.resource(),
            self.lengths.resource(),
            self.chunk_heads.resource(),
            self.large_heads.resource(),
            self.page_lists.resource(),
        ]
    }

    /// Stages one rel for the bound node. Materialized at commit.
    pub fn append(&self, node: NodeOffset, entry: ListEntry) {
        self.pending.lock().entry(node).or_default().push(entry);
    }

    /// List length as seen by the transaction kind.
    pub fn list_len(&self, node: NodeOffset, kind: TransactionKind) -> Result<u64> {
        let committed = self.committed_len(node)?;
        if kind == TransactionKind::Write {
            let pending = self.pending.lock();
            let staged = pending.get(&node).map_or(0, |v| v.len() as u64);
            return Ok(committed + staged);
        }
        Ok(committed)
    }

    fn committed_len(&self, node: NodeOffset) -> Result<u64> {
        if node >= self.lengths.len(TransactionKind::ReadOnly) {
            return Ok(0);
        }
        Ok(u64::from(self.lengths.get(node, TransactionKind::ReadOnly)?))
    }

    /// Reads the full adjacency list of `node`. The write transaction
    /// sees its own staged inserts appended after the committed entries.
    pub fn read_list(&self, node: NodeOffset, kind: TransactionKind) -> Result<Vec<ListEntry>> {
        let mut entries = self.read_committed_list(node)?;
        if kind == TransactionKind::Write {
            if let Some(staged) = self.pending.lock().get(&node) {
                entries.extend_from_slice(staged);
            }
        }
        Ok(entries)
    }

    fn read_committed_list(&self, node: NodeOffset) -> Result<Vec<ListEntry>> {
        let len = self.committed_len(node)? as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let header = self.headers.get(node, TransactionKind::ReadOnly)?;
        if header & LARGE_FLAG != 0 {
            let large_idx = u64::from(header & !LARGE_FLAG);
            let head = self.large_heads.get(large_idx, TransactionKind::ReadOnly)?;
            self.read_chain(head, 0, len)
        } else {
            let chunk = node >> LISTS_CHUNK_SIZE_LOG2;
            let head = self.chunk_heads.get(chunk, TransactionKind::ReadOnly)?;
            self.read_chain(head, header as usize, len)
        }
    }

    /// Reads `len` entries starting at element offset `start` from the
    /// page chain rooted at group `head`.
    fn read_chain(&self, head: u32, start: usize, len: usize) -> Result<Vec<ListEntry>> {
        let pages = self.chain_pages(head, TransactionKind::ReadOnly)?;
        let mut out = Vec::with_capacity(len);
        let mut element = start;
        while out.len() < len {
            let page_pos = element / ENTRIES_PER_PAGE;
            let in_page = element % ENTRIES_PER_PAGE;
            let page = *pages.get(page_pos).ok_or_else(|| {
                QuiverError::Corruption("list chain shorter than list length".into())
            })?;
            let take = (ENTRIES_PER_PAGE - in_page).min(len - out.len());
            let pinned = self.ctx.pool.pin(&self.ctx.file, page)?;
            pinned.read(|buf| {
                for i in 0..take {
                    let at = (in_page + i) * ENTRY_SIZE;
                    let dst = u64::from_le_bytes(buf[at..at + 8].try_into().expect("8 bytes"));
                    let rel =
                        u64::from_le_bytes(buf[at + 8..at + 16].try_into().expect("8 bytes"));
                    out.push((dst, rel));
                }
            });
            element += take;
        }
        Ok(out)
    }

    /// Resolves a group chain into the ordered physical pages it lists.
    fn chain_pages(&self, head: u32, kind: TransactionKind) -> Result<Vec<PageIdx>> {
        let mut pages = Vec::new();
        let mut group = head;
        while group != NULL_U32 {
            let base = u64::from(group) * GROUP_SIZE as u64;
            for slot in 0..GROUP_PAGES {
                let page = self.page_lists.get(base + slot as u64, kind)?;
                if page != NULL_U32 {
                    pages.push(PageIdx(page));
                }
            }
            group = self.page_lists.get(base + GROUP_PAGES as u64, kind)?;
        }
        Ok(pages)
    }

    /// Allocates a fresh group chain covering `num_pages` new pages and
    /// returns `(head_group_idx, pages)`.
    fn alloc_chain(&self, num_pages: usize) -> Result<(u32, Vec<PageIdx>)> {
        if num_pages == 0 {
            return Ok((NULL_U32, Vec::new()));
        }
        let mut pages = Vec::with_capacity(num_pages);
        let mut head = NULL_U32;
        let mut prev_link_slot: Option<u64> = None;
        let mut allocated = 0usize;
        while allocated < num_pages {
            let group_idx = (self.page_lists.len(TransactionKind::Write) / GROUP_SIZE as u64) as u32;
            let base = self.page_lists.len(TransactionKind::Write);
            for slot in 0..GROUP_PAGES {
                let page = if allocated < num_pages {
                    allocated += 1;
                    let page = self.ctx.file.append_page();
                    pages.push(page);
                    page.0
                } else {
                    NULL_U32
                };
                debug_assert_eq!(base + slot as u64, self.page_lists.len(TransactionKind::Write));
                self.page_lists.push_back(page)?;
            }
            self.page_lists.push_back(NULL_U32)?;
            if let Some(link) = prev_link_slot {
                self.page_lists.update(link, group_idx)?;
            } else {
                head = group_idx;
            }
            prev_link_slot = Some(base + GROUP_PAGES as u64);
        }
        Ok((head, pages))
    }

    /// Writes `entries` packed onto `pages`, WAL-logging each page.
    fn write_entries(&self, tx: &Transaction, pages: &[PageIdx], entries: &[ListEntry]) -> Result<()> {
        for (page_pos, page) in pages.iter().enumerate() {
            let from = page_pos * ENTRIES_PER_PAGE;
            let to = entries.len().min(from + ENTRIES_PER_PAGE);
            let pinned = self.ctx.pool.pin(&self.ctx.file, *page)?;
            let before = pinned.read(|buf| buf.to_vec());
            let after = pinned.write(|buf| {
                for (i, (dst, rel)) in entries[from..to].iter().enumerate() {
                    let at = i * ENTRY_SIZE;
                    buf[at..at + 8].copy_from_slice(&dst.to_le_bytes());
                    buf[at + 8..at + 16].copy_from_slice(&rel.to_le_bytes());
                }
                buf.to_vec()
            });
            self.ctx
                .wal
                .append_page_update(tx.id(), self.ctx.file.id(), *page, &before, &after)?;
            tx.record_dirty(self.ctx.file.id(), *page);
        }
        Ok(())
    }

    /// Grows the per-node arrays to cover `num_nodes` bound nodes.
    fn ensure_node_capacity(&self, num_nodes: u64) -> Result<()> {
        if self.headers.len(TransactionKind::Write) < num_nodes {
            self.headers.resize(num_nodes, 0)?;
            self.lengths.resize(num_nodes, 0)?;
        }
        let num_chunks = if num_nodes == 0 {
            0
        } else {
            ((num_nodes - 1) >> LISTS_CHUNK_SIZE_LOG2) + 1
        };
        if self.chunk_heads.len(TransactionKind::Write) < num_chunks {
            self.chunk_heads.resize(num_chunks, NULL_U32)?;
        }
        Ok(())
    }

    fn materialize_pending(&self, tx: &Transaction) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let max_node = pending.keys().copied().max().unwrap_or(0);
        let needed = max_node + 1;
        self.ensure_node_capacity(needed.max(self.headers.len(TransactionKind::Write)))?;

        let mut chunks: HashMap<u64, Vec<NodeOffset>> = HashMap::new();
        for node in pending.keys() {
            chunks.entry(node >> LISTS_CHUNK_SIZE_LOG2).or_default().push(*node);
        }
        let mut chunk_ids: Vec<u64> = chunks.keys().copied().collect();
        chunk_ids.sort_unstable();

        for chunk in chunk_ids {
            self.rewrite_chunk(tx, chunk, &pending)?;
        }
        trace!(chunks = chunks.len(), "materialized staged rel inserts");
        Ok(())
    }

    /// Rewrites one chunk: merges staged inserts into its small lists,
    /// promotes lists crossing the large threshold, and lays the result
    /// out on fresh pages.
    fn rewrite_chunk(
        &self,
        tx: &Transaction,
        chunk: u64,
        pending: &HashMap<NodeOffset, Vec<ListEntry>>,
    ) -> Result<()> {
        let first = chunk << LISTS_CHUNK_SIZE_LOG2;
        let node_count = self
            .headers
            .len(TransactionKind::Write)
            .min(first + LISTS_CHUNK_SIZE);

        // Merge each node's committed entries with its staged inserts.
        let mut small_concat: Vec<ListEntry> = Vec::new();
        let mut new_headers: Vec<(NodeOffset, u32, u32)> = Vec::new();
        for node in first..node_count {
            // Untouched large lists keep their page chain; untouched
            // small lists still move with the chunk's new concatenation.
            if !pending.contains_key(&node) && node < self.lengths.len(TransactionKind::ReadOnly) {
                let header = self.headers.get(node, TransactionKind::ReadOnly)?;
                if header & LARGE_FLAG != 0 {
                    continue;
                }
            }
            let mut entries = self.read_committed_list(node)?;
            if let Some(staged) = pending.get(&node) {
                entries.extend_from_slice(staged);
            }
            let len = entries.len() as u64;
            if len == 0 {
                new_headers.push((node, 0, 0));
                continue;
            }
            if len > LARGE_LIST_THRESHOLD {
                let large_idx = self.write_large_list(tx, node, &entries)?;
                new_headers.push((node, LARGE_FLAG | large_idx, len as u32));
            } else {
                let start = small_concat.len() as u32;
                small_concat.extend_from_slice(&entries);
                new_headers.push((node, start, len as u32));
            }
        }

        // Fresh pages for the chunk's concatenation; old pages stay for
        // concurrent readers of the canonical metadata.
        let num_pages = small_concat.len().div_ceil(ENTRIES_PER_PAGE);
        let (head, pages) = self.alloc_chain(num_pages)?;
        self.write_entries(tx, &pages, &small_concat)?;
        self.chunk_heads.update(chunk, head)?;

        for (node, header, len) in new_headers {
            self.headers.update(node, header)?;
            self.lengths.update(node, len)?;
        }
        Ok(())
    }

    /// Writes one large list onto its own fresh chain; reuses the node's
    /// existing large-list slot when it already had one.
    fn write_large_list(&self, tx: &Transaction, node: NodeOffset, entries: &[ListEntry]) -> Result<u32> {
        let num_pages = entries.len().div_ceil(ENTRIES_PER_PAGE);
        let (head, pages) = self.alloc_chain(num_pages)?;
        self.write_entries(tx, &pages, entries)?;

        let existing = if node < self.headers.len(TransactionKind::ReadOnly) {
            let header = self.headers.get(node, TransactionKind::ReadOnly)?;
            (header & LARGE_FLAG != 0).then_some(header & !LARGE_FLAG)
        } else {
            None
        };
        match existing {
            Some(idx) => {
                self.large_heads.update(u64::from(idx), head)?;
                Ok(idx)
            }
            None => {
                let idx = self.large_heads.push_back(head)? as u32;
                Ok(idx)
            }
        }
    }
}

impl TransactionalResource for Lists {
    fn prepare_commit(&self, tx: &Transaction) -> Result<()> {
        self.materialize_pending(tx)
    }

    fn checkpoint_in_memory(&self) {
        self.pending.lock().clear();
    }

    fn rollback_in_memory(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{wal::Wal, BufferPool, FileHandle};
    use crate::transaction::TransactionManager;
    use crate::types::FileId;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: StorageContext,
        mgr: TransactionManager,
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
        }
    }

    fn create_lists(fx: &Fixture) -> Arc<Lists> {
        let tx = fx.mgr.begin_write().expect("writer");
        let lists = Arc::new(Lists::create(&fx.ctx, &tx).expect("create"));
        fx.mgr.register_resource(Arc::clone(&lists) as Arc<dyn TransactionalResource>);
        for resource in lists.resources() {
            fx.mgr.register_resource(resource);
        }
        fx.mgr.commit(&tx).expect("commit");
        lists
    }

    #[test]
    fn reader_equals_inserted_multiset() {
        let fx = fixture();
        let lists = create_lists(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        let inserted = vec![(5u64, 0u64), (9, 1), (5, 2), (7, 3)];
        for (dst, rel) in &inserted {
            lists.append(3, (*dst, *rel));
        }
        // The writer sees staged entries before commit.
        assert_eq!(lists.read_list(3, TransactionKind::Write).expect("read"), inserted);
        assert!(lists.read_list(3, TransactionKind::ReadOnly).expect("read").is_empty());
        fx.mgr.commit(&tx).expect("commit");

        let mut got = lists.read_list(3, TransactionKind::ReadOnly).expect("read");
        let mut want = inserted;
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want);
    }

    #[test]
    fn appends_across_transactions_accumulate() {
        let fx = fixture();
        let lists = create_lists(&fx);

        for round in 0..3u64 {
            let tx = fx.mgr.begin_write().expect("writer");
            for i in 0..4u64 {
                lists.append(0, (round * 10 + i, round * 4 + i));
            }
            fx.mgr.commit(&tx).expect("commit");
        }
        let entries = lists.read_list(0, TransactionKind::ReadOnly).expect("read");
        assert_eq!(entries.len(), 12);
        assert_eq!(lists.list_len(0, TransactionKind::ReadOnly).expect("len"), 12);
        assert_eq!(entries[0], (0, 0));
        assert_eq!(entries[11], (23, 11));
    }

    #[test]
    fn rollback_discards_staged_entries() {
        let fx = fixture();
        let lists = create_lists(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        lists.append(1, (2, 0));
        fx.mgr.rollback(&tx).expect("rollback");
        assert!(lists.read_list(1, TransactionKind::ReadOnly).expect("read").is_empty());
        assert_eq!(lists.list_len(1, TransactionKind::Write).expect("len"), 0);
    }

    #[test]
    fn long_list_promotes_to_large() {
        let fx = fixture();
        let lists = create_lists(&fx);

        let count = LARGE_LIST_THRESHOLD + 300;
        let tx = fx.mgr.begin_write().expect("writer");
        for i in 0..count {
            lists.append(2, (i, i));
        }
        // A neighbor in the same chunk keeps its small list intact.
        lists.append(3, (1, count));
        fx.mgr.commit(&tx).expect("commit");

        let entries = lists.read_list(2, TransactionKind::ReadOnly).expect("read");
        assert_eq!(entries.len(), count as usize);
        assert_eq!(entries[0], (0, 0));
        assert_eq!(entries[count as usize - 1], (count - 1, count - 1));
        assert_eq!(
            lists.read_list(3, TransactionKind::ReadOnly).expect("read"),
            vec![(1, count)]
        );
    }

    #[test]
    fn many_nodes_across_chunks() {
        let fx = fixture();
        let lists = create_lists(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        for node in 0..(LISTS_CHUNK_SIZE * 2 + 30) {
            lists.append(node, (node + 1, node));
        }
        fx.mgr.commit(&tx).expect("commit");

        for node in [0, 511, 512, 1023, 1024, LISTS_CHUNK_SIZE * 2 + 29] {
            assert_eq!(
                lists.read_list(node, TransactionKind::ReadOnly).expect("read"),
                vec![(node + 1, node)],
                "node {node}"
            );
        }
    }
}
