//! Growable on-disk vector anchored on a stable header page.
//!
//! The header page points at the first page-indices page (PIP); each PIP
//! lists the physical pages of up to [`PAGE_IDXS_PER_PIP`] array pages and
//! the next PIP in the chain. Element placement is purely arithmetic:
//!
//! ```text
//! ap              = i >> elements_per_page_log2
//! byte offset     = (i & offset_mask) << aligned_element_size_log2
//! ```
//!
//! Mutations live in a writer-private shadow (element values plus a
//! cloned header/PIP vector) until `prepare_commit` materializes them
//! into WAL-logged buffer pages; `checkpoint_in_memory` installs the
//! shadow as canonical, `rollback_in_memory` drops it. Readers only ever
//! see the canonical header and PIPs, so array growth is invisible to
//! them until commit. Growth never rewrites existing array pages.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{QuiverError, Result};
use crate::pager::wal::Wal;
use crate::pager::{BufferPool, FileHandle};
use crate::transaction::{Transaction, TransactionKind, TransactionalResource};
use crate::types::{PageIdx, NULL_PAGE_IDX, PAGE_SIZE};

/// Page indices per PIP: one slot is reserved for the next-PIP pointer.
pub const PAGE_IDXS_PER_PIP: u64 = (PAGE_SIZE as u64 - 4) / 4;

const HEADER_SIZE: usize = 8 * 5 + 4;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DiskArrayHeader {
    pub aligned_element_size_log2: u64,
    pub elements_per_page_log2: u64,
    pub offset_mask: u64,
    pub first_pip: PageIdx,
    pub num_elements: u64,
    pub num_aps: u64,
}

impl DiskArrayHeader {
    fn new(element_size: usize) -> Result<Self> {
        if element_size == 0 || element_size > PAGE_SIZE {
            return Err(QuiverError::Internal(format!(
                "disk array element size {element_size} out of range"
            )));
        }
        let aligned = element_size.next_power_of_two() as u64;
        let aligned_log2 = aligned.trailing_zeros() as u64;
        let elements_per_page_log2 = (PAGE_SIZE as u64).trailing_zeros() as u64 - aligned_log2;
        Ok(Self {
            aligned_element_size_log2: aligned_log2,
            elements_per_page_log2,
            offset_mask: (1 << elements_per_page_log2) - 1,
            first_pip: NULL_PAGE_IDX,
            num_elements: 0,
            num_aps: 0,
        })
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.aligned_element_size_log2.to_le_bytes());
        buf[8..16].copy_from_slice(&self.elements_per_page_log2.to_le_bytes());
        buf[16..24].copy_from_slice(&self.offset_mask.to_le_bytes());
        buf[24..32].copy_from_slice(&self.num_elements.to_le_bytes());
        buf[32..40].copy_from_slice(&self.num_aps.to_le_bytes());
        buf[40..44].copy_from_slice(&self.first_pip.0.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(QuiverError::Corruption("short disk array header".into()));
        }
        let header = Self {
            aligned_element_size_log2: u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
            elements_per_page_log2: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
            offset_mask: u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")),
            num_elements: u64::from_le_bytes(buf[24..32].try_into().expect("8 bytes")),
            num_aps: u64::from_le_bytes(buf[32..40].try_into().expect("8 bytes")),
            first_pip: PageIdx(u32::from_le_bytes(buf[40..44].try_into().expect("4 bytes"))),
        };
        if header.aligned_element_size_log2 + header.elements_per_page_log2
            != (PAGE_SIZE as u64).trailing_zeros() as u64
            || header.offset_mask != (1 << header.elements_per_page_log2) - 1
        {
            return Err(QuiverError::Corruption(
                "inconsistent disk array header geometry".into(),
            ));
        }
        Ok(header)
    }
}

/// In-memory copy of one PIP plus the physical page it lives on.
#[derive(Clone, Debug)]
pub struct PipWrapper {
    pub page: PageIdx,
    pub next: PageIdx,
    pub entries: Vec<PageIdx>,
}

impl PipWrapper {
    fn empty(page: PageIdx) -> Self {
        Self {
            page,
            next: NULL_PAGE_IDX,
            entries: vec![NULL_PAGE_IDX; PAGE_IDXS_PER_PIP as usize],
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.next.0.to_le_bytes());
        for (slot, idx) in self.entries.iter().enumerate() {
            let at = 4 + slot * 4;
            buf[at..at + 4].copy_from_slice(&idx.0.to_le_bytes());
        }
    }

    fn read_from(page: PageIdx, buf: &[u8]) -> Self {
        let next = PageIdx(u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")));
        let mut entries = Vec::with_capacity(PAGE_IDXS_PER_PIP as usize);
        for slot in 0..PAGE_IDXS_PER_PIP as usize {
            let at = 4 + slot * 4;
            entries.push(PageIdx(u32::from_le_bytes(
                buf[at..at + 4].try_into().expect("4 bytes"),
            )));
        }
        Self { page, next, entries }
    }
}

/// Writer-private state: value overlays plus a cloned header/PIP vector
/// that `prepare_commit` finalizes.
struct Shadow {
    header: DiskArrayHeader,
    pips: Vec<PipWrapper>,
    /// Overlay for updates to the committed region, keyed by element index.
    updates: HashMap<u64, Vec<u8>>,
    /// Elements appended past the canonical length, in order.
    appends: Vec<Vec<u8>>,
    /// Logical indices of PIPs whose contents changed.
    touched_pips: Vec<usize>,
    /// Physical pages of PIPs inserted by this transaction.
    inserted_pip_pages: Vec<PageIdx>,
}

struct Inner {
    header: DiskArrayHeader,
    pips: Vec<PipWrapper>,
    shadow: Option<Shadow>,
}

/// Untyped disk array; see [`DiskArray`] for the element-typed facade.
pub struct RawDiskArray {
    file: Arc<FileHandle>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    header_page: PageIdx,
    element_size: usize,
    inner: RwLock<Inner>,
}

impl RawDiskArray {
    /// Creates a fresh array: allocates and WAL-logs its header page under
    /// the given write transaction.
    pub fn create(
        file: Arc<FileHandle>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        tx: &Transaction,
        element_size: usize,
    ) -> Result<Self> {
        let header = DiskArrayHeader::new(element_size)?;
        let (header_page, pinned) = pool.insert_new_page(&file, |buf| header.write_to(buf))?;
        let before = vec![0u8; PAGE_SIZE];
        let after = pinned.read(|buf| buf.to_vec());
        wal.append_page_update(tx.id(), file.id(), header_page, &before, &after)?;
        tx.record_dirty(file.id(), header_page);
        drop(pinned);
        Ok(Self {
            file,
            pool,
            wal,
            header_page,
            element_size,
            inner: RwLock::new(Inner {
                header,
                pips: Vec::new(),
                shadow: None,
            }),
        })
    }

    /// Loads an existing array from its stable header page and caches the
    /// PIP chain.
    pub fn open(
        file: Arc<FileHandle>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        header_page: PageIdx,
        element_size: usize,
    ) -> Result<Self> {
        let pinned = pool.pin(&file, header_page)?;
        let header = pinned.read(DiskArrayHeader::read_from)?;
        drop(pinned);
        let aligned = element_size.next_power_of_two() as u64;
        if aligned.trailing_zeros() as u64 != header.aligned_element_size_log2 {
            return Err(QuiverError::Corruption(format!(
                "disk array at page {} has element size log2 {}, expected {}",
                header_page,
                header.aligned_element_size_log2,
                aligned.trailing_zeros()
            )));
        }
        let mut pips = Vec::new();
        let mut pip_page = header.first_pip;
        while pip_page != NULL_PAGE_IDX {
            let pinned = pool.pin(&file, pip_page)?;
            let pip = pinned.read(|buf| PipWrapper::read_from(pip_page, buf));
            pip_page = pip.next;
            pips.push(pip);
        }
        Ok(Self {
            file,
            pool,
            wal,
            header_page,
            element_size,
            inner: RwLock::new(Inner {
                header,
                pips,
                shadow: None,
            }),
        })
    }

    pub fn header_page(&self) -> PageIdx {
        self.header_page
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Every physical page the canonical header reaches: the PIP pages
    /// plus the occupied array-page slots. Integrity checks assert each
    /// one is referenced exactly once.
    pub fn referenced_pages(&self) -> Vec<PageIdx> {
        let inner = self.inner.read();
        let mut pages = Vec::new();
        let mut remaining_aps = inner.header.num_aps;
        for pip in &inner.pips {
            pages.push(pip.page);
            for &entry in pip.entries.iter().take(remaining_aps.min(PAGE_IDXS_PER_PIP) as usize) {
                if entry != NULL_PAGE_IDX {
                    pages.push(entry);
                }
            }
            remaining_aps = remaining_aps.saturating_sub(PAGE_IDXS_PER_PIP);
        }
        pages
    }

    pub fn len(&self, kind: TransactionKind) -> u64 {
        let inner = self.inner.read();
        match (kind, &inner.shadow) {
            (TransactionKind::Write, Some(shadow)) => shadow.header.num_elements,
            _ => inner.header.num_elements,
        }
    }

    pub fn is_empty(&self, kind: TransactionKind) -> bool {
        self.len(kind) == 0
    }

    pub fn get(&self, idx: u64, kind: TransactionKind, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.element_size);
        let inner = self.inner.read();
        if let (TransactionKind::Write, Some(shadow)) = (kind, &inner.shadow) {
            if idx >= shadow.header.num_elements {
                return Err(out_of_bounds(idx, shadow.header.num_elements));
            }
            if idx >= inner.header.num_elements {
                let appended = &shadow.appends[(idx - inner.header.num_elements) as usize];
                out.copy_from_slice(appended);
                return Ok(());
            }
            if let Some(value) = shadow.updates.get(&idx) {
                out.copy_from_slice(value);
                return Ok(());
            }
        } else if idx >= inner.header.num_elements {
            return Err(out_of_bounds(idx, inner.header.num_elements));
        }
        self.read_committed(&inner, idx, out)
    }

    /// Sequential fast path: copies `count` consecutive elements starting
    /// at `start` into `out`, pinning each covered page exactly once,
    /// then overlays the write transaction's shadow values if any.
    pub fn read_range(&self, start: u64, count: u64, kind: TransactionKind, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), (count as usize) * self.element_size);
        if count == 0 {
            return Ok(());
        }
        let inner = self.inner.read();
        let len = match (kind, &inner.shadow) {
            (TransactionKind::Write, Some(shadow)) => shadow.header.num_elements,
            _ => inner.header.num_elements,
        };
        if start + count > len {
            return Err(out_of_bounds(start + count - 1, len));
        }
        let header = &inner.header;
        let committed_len = header.num_elements;

        // Committed region, one pin per page.
        let committed_count = count.min(committed_len.saturating_sub(start));
        let mut idx = start;
        let mut written = 0usize;
        while idx < start + committed_count {
            let ap = idx >> header.elements_per_page_log2;
            let in_page = idx & header.offset_mask;
            let available = (1 << header.elements_per_page_log2) - in_page;
            let take = available.min(start + committed_count - idx) as usize;
            let offset = (in_page << header.aligned_element_size_log2) as usize;
            let bytes = take * self.element_size;
            let page = pip_lookup(&inner.pips, ap)?;
            let pinned = self.pool.pin(&self.file, page)?;
            pinned.read(|buf| {
                out[written..written + bytes].copy_from_slice(&buf[offset..offset + bytes])
            });
            written += bytes;
            idx += take as u64;
        }

        if let (TransactionKind::Write, Some(shadow)) = (kind, &inner.shadow) {
            // Shadow overlay: updated elements, then the appended region.
            for i in 0..committed_count {
                if let Some(value) = shadow.updates.get(&(start + i)) {
                    let at = (i as usize) * self.element_size;
                    out[at..at + self.element_size].copy_from_slice(value);
                }
            }
            for i in committed_count..count {
                let appended = &shadow.appends[(start + i - committed_len) as usize];
                let at = (i as usize) * self.element_size;
                out[at..at + self.element_size].copy_from_slice(appended);
            }
        }
        Ok(())
    }

    fn read_committed(&self, inner: &Inner, idx: u64, out: &mut [u8]) -> Result<()> {
        let header = &inner.header;
        let ap = idx >> header.elements_per_page_log2;
        let offset = ((idx & header.offset_mask) << header.aligned_element_size_log2) as usize;
        let page = pip_lookup(&inner.pips, ap)?;
        let pinned = self.pool.pin(&self.file, page)?;
        pinned.read(|buf| out.copy_from_slice(&buf[offset..offset + self.element_size]));
        Ok(())
    }

    /// Overwrites the element at `idx` in the write transaction's shadow.
    pub fn update(&self, idx: u64, value: &[u8]) -> Result<()> {
        debug_assert_eq!(value.len(), self.element_size);
        let mut inner = self.inner.write();
        let committed_len = inner.header.num_elements;
        let shadow = self.shadow_mut(&mut inner);
        if idx >= shadow.header.num_elements {
            return Err(out_of_bounds(idx, shadow.header.num_elements));
        }
        if idx >= committed_len {
            shadow.appends[(idx - committed_len) as usize] = value.to_vec();
        } else {
            shadow.updates.insert(idx, value.to_vec());
        }
        Ok(())
    }

    /// Appends an element in the shadow; returns its index.
    pub fn push_back(&self, value: &[u8]) -> Result<u64> {
        debug_assert_eq!(value.len(), self.element_size);
        let mut inner = self.inner.write();
        let shadow = self.shadow_mut(&mut inner);
        let idx = shadow.header.num_elements;
        shadow.appends.push(value.to_vec());
        shadow.header.num_elements += 1;
        Ok(idx)
    }

    /// Grows the array to `new_len` elements, filling with `default`.
    /// Shrinking is not supported.
    pub fn resize(&self, new_len: u64, default: &[u8]) -> Result<()> {
        debug_assert_eq!(default.len(), self.element_size);
        let mut inner = self.inner.write();
        let shadow = self.shadow_mut(&mut inner);
        while shadow.header.num_elements < new_len {
            shadow.appends.push(default.to_vec());
            shadow.header.num_elements += 1;
        }
        Ok(())
    }

    fn shadow_mut<'i>(&self, inner: &'i mut Inner) -> &'i mut Shadow {
        if inner.shadow.is_none() {
            inner.shadow = Some(Shadow {
                header: inner.header,
                pips: inner.pips.clone(),
                updates: HashMap::new(),
                appends: Vec::new(),
                touched_pips: Vec::new(),
                inserted_pip_pages: Vec::new(),
            });
        }
        inner.shadow.as_mut().expect("shadow just installed")
    }

    /// Lays the shadow out on physical pages: allocates array pages and
    /// PIPs for the appended region, writes every touched page through the
    /// buffer pool, and WAL-logs each one.
    fn prepare_commit_internal(&self, tx: &Transaction) -> Result<()> {
        let mut inner = self.inner.write();
        let committed_len = inner.header.num_elements;
        let Some(mut shadow) = inner.shadow.take() else {
            return Ok(());
        };

        // Group every changed element by array page.
        let eppl2 = shadow.header.elements_per_page_log2;
        let mask = shadow.header.offset_mask;
        let size_log2 = shadow.header.aligned_element_size_log2;
        let mut by_ap: HashMap<u64, Vec<(usize, Vec<u8>)>> = HashMap::new();
        for (idx, value) in shadow.updates.drain() {
            let offset = ((idx & mask) << size_log2) as usize;
            by_ap.entry(idx >> eppl2).or_default().push((offset, value));
        }
        for (i, value) in shadow.appends.drain(..).enumerate() {
            let idx = committed_len + i as u64;
            let offset = ((idx & mask) << size_log2) as usize;
            by_ap.entry(idx >> eppl2).or_default().push((offset, value));
        }

        // Allocate array pages (and PIP slots) for the grown region.
        let needed_aps = if shadow.header.num_elements == 0 {
            0
        } else {
            ((shadow.header.num_elements - 1) >> eppl2) + 1
        };
        for ap in shadow.header.num_aps..needed_aps {
            let page = self.file.append_page();
            let pip_idx = (ap / PAGE_IDXS_PER_PIP) as usize;
            let slot = (ap % PAGE_IDXS_PER_PIP) as usize;
            if pip_idx == shadow.pips.len() {
                let pip_page = self.file.append_page();
                let pip = PipWrapper::empty(pip_page);
                if let Some(prev) = shadow.pips.last_mut() {
                    prev.next = pip_page;
                    let prev_idx = shadow.pips.len() - 1;
                    shadow.touched_pips.push(prev_idx);
                } else {
                    shadow.header.first_pip = pip_page;
                }
                shadow.inserted_pip_pages.push(pip_page);
                shadow.pips.push(pip);
            }
            shadow.pips[pip_idx].entries[slot] = page;
            shadow.touched_pips.push(pip_idx);
        }
        shadow.header.num_aps = needed_aps;
        shadow.touched_pips.sort_unstable();
        shadow.touched_pips.dedup();

        // Element pages.
        let mut aps: Vec<u64> = by_ap.keys().copied().collect();
        aps.sort_unstable();
        for ap in aps {
            let page = pip_lookup(&shadow.pips, ap)?;
            let pinned = self.pool.pin(&self.file, page)?;
            let before = pinned.read(|buf| buf.to_vec());
            let after = pinned.write(|buf| {
                for (offset, value) in &by_ap[&ap] {
                    buf[*offset..*offset + self.element_size].copy_from_slice(value);
                }
                buf.to_vec()
            });
            self.wal
                .append_page_update(tx.id(), self.file.id(), page, &before, &after)?;
            tx.record_dirty(self.file.id(), page);
        }

        // PIP pages.
        for &pip_idx in &shadow.touched_pips {
            let pip = &shadow.pips[pip_idx];
            let pinned = self.pool.pin(&self.file, pip.page)?;
            let before = pinned.read(|buf| buf.to_vec());
            let after = pinned.write(|buf| {
                pip.write_to(buf);
                buf.to_vec()
            });
            self.wal
                .append_page_update(tx.id(), self.file.id(), pip.page, &before, &after)?;
            tx.record_dirty(self.file.id(), pip.page);
        }
        shadow.touched_pips.clear();

        // Header page last.
        let pinned = self.pool.pin(&self.file, self.header_page)?;
        let before = pinned.read(|buf| buf.to_vec());
        let after = pinned.write(|buf| {
            shadow.header.write_to(buf);
            buf.to_vec()
        });
        self.wal
            .append_page_update(tx.id(), self.file.id(), self.header_page, &before, &after)?;
        tx.record_dirty(self.file.id(), self.header_page);

        trace!(
            header_page = self.header_page.0,
            elements = shadow.header.num_elements,
            aps = shadow.header.num_aps,
            "disk array prepared for commit"
        );
        inner.shadow = Some(shadow);
        Ok(())
    }
}

fn pip_lookup(pips: &[PipWrapper], ap: u64) -> Result<PageIdx> {
    let pip_idx = (ap / PAGE_IDXS_PER_PIP) as usize;
    let slot = (ap % PAGE_IDXS_PER_PIP) as usize;
    let pip = pips.get(pip_idx).ok_or_else(|| {
        QuiverError::Corruption(format!("array page {ap} points past the PIP chain"))
    })?;
    let page = pip.entries[slot];
    if page == NULL_PAGE_IDX {
        return Err(QuiverError::Corruption(format!(
            "array page {ap} has no physical page"
        )));
    }
    Ok(page)
}

fn out_of_bounds(idx: u64, len: u64) -> QuiverError {
    QuiverError::Internal(format!("disk array index {idx} out of bounds (len {len})"))
}

impl TransactionalResource for RawDiskArray {
    fn prepare_commit(&self, tx: &Transaction) -> Result<()> {
        self.prepare_commit_internal(tx)
    }

    fn checkpoint_in_memory(&self) {
        let mut inner = self.inner.write();
        if let Some(shadow) = inner.shadow.take() {
            inner.header = shadow.header;
            inner.pips = shadow.pips;
        }
    }

    fn rollback_in_memory(&self) {
        self.inner.write().shadow = None;
    }
}

/// Element-typed facade over [`RawDiskArray`].
pub struct DiskArray<T: DiskArrayElement> {
    raw: Arc<RawDiskArray>,
    _marker: std::marker::PhantomData<T>,
}

/// Fixed-size element storable in a disk array.
pub trait DiskArrayElement: Copy {
    const SIZE: usize;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

impl DiskArrayElement for u32 {
    const SIZE: usize = 4;
    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }
    fn read_from(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().expect("4 bytes"))
    }
}

impl DiskArrayElement for u64 {
    const SIZE: usize = 8;
    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }
    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().expect("8 bytes"))
    }
}

impl<T: DiskArrayElement> DiskArray<T> {
    pub fn create(
        file: Arc<FileHandle>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        tx: &Transaction,
    ) -> Result<Self> {
        Ok(Self {
            raw: Arc::new(RawDiskArray::create(file, pool, wal, tx, T::SIZE)?),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn open(
        file: Arc<FileHandle>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        header_page: PageIdx,
    ) -> Result<Self> {
        Ok(Self {
            raw: Arc::new(RawDiskArray::open(file, pool, wal, header_page, T::SIZE)?),
            _marker: std::marker::PhantomData,
        })
    }

    /// The resource handle to register with the transaction manager.
    pub fn resource(&self) -> Arc<RawDiskArray> {
        Arc::clone(&self.raw)
    }

    pub fn header_page(&self) -> PageIdx {
        self.raw.header_page()
    }

    pub fn len(&self, kind: TransactionKind) -> u64 {
        self.raw.len(kind)
    }

    pub fn is_empty(&self, kind: TransactionKind) -> bool {
        self.raw.is_empty(kind)
    }

    pub fn get(&self, idx: u64, kind: TransactionKind) -> Result<T> {
        let mut buf = vec![0u8; T::SIZE];
        self.raw.get(idx, kind, &mut buf)?;
        Ok(T::read_from(&buf))
    }

    pub fn update(&self, idx: u64, value: T) -> Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        value.write_to(&mut buf);
        self.raw.update(idx, &buf)
    }

    pub fn push_back(&self, value: T) -> Result<u64> {
        let mut buf = vec![0u8; T::SIZE];
        value.write_to(&mut buf);
        self.raw.push_back(&buf)
    }

    pub fn resize(&self, new_len: u64, default: T) -> Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        default.write_to(&mut buf);
        self.raw.resize(new_len, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionManager;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        file: Arc<FileHandle>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        mgr: TransactionManager,
    }

    fn fixture(frames: usize) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let file = Arc::new(
            FileHandle::open(dir.path().join("data.db"), crate::types::FileId(0)).expect("file"),
        );
        let pool = Arc::new(BufferPool::new(frames));
        let wal = Arc::new(Wal::open(dir.path().join("wal.log")).expect("wal"));
        pool.set_wal(Arc::clone(&wal));
        let mgr = TransactionManager::new(Arc::clone(&wal), Arc::clone(&pool));
        mgr.register_file(Arc::clone(&file));
        Fixture {
            _dir: dir,
            file,
            pool,
            wal,
            mgr,
        }
    }

    fn new_array(fx: &Fixture) -> DiskArray<u64> {
        let tx = fx.mgr.begin_write().expect("writer");
        let array = DiskArray::<u64>::create(
            Arc::clone(&fx.file),
            Arc::clone(&fx.pool),
            Arc::clone(&fx.wal),
            &tx,
        )
        .expect("create");
        fx.mgr.register_resource(array.resource());
        fx.mgr.commit(&tx).expect("commit create");
        array
    }

    #[test]
    fn writer_sees_own_appends_readers_do_not() {
        let fx = fixture(64);
        let array = new_array(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        for i in 0..10u64 {
            array.push_back(i * 3).expect("push");
        }
        assert_eq!(array.len(TransactionKind::Write), 10);
        assert_eq!(array.len(TransactionKind::ReadOnly), 0);
        assert_eq!(array.get(4, TransactionKind::Write).expect("get"), 12);

        fx.mgr.commit(&tx).expect("commit");
        assert_eq!(array.len(TransactionKind::ReadOnly), 10);
        assert_eq!(array.get(4, TransactionKind::ReadOnly).expect("get"), 12);
    }

    #[test]
    fn rollback_discards_appends_and_updates() {
        let fx = fixture(64);
        let array = new_array(&fx);

        let tx = fx.mgr.begin_write().expect("writer");
        array.push_back(1).expect("push");
        fx.mgr.commit(&tx).expect("commit");

        let tx = fx.mgr.begin_write().expect("writer");
        array.update(0, 99).expect("update");
        array.push_back(2).expect("push");
        assert_eq!(array.get(0, TransactionKind::Write).expect("get"), 99);
        fx.mgr.rollback(&tx).expect("rollback");

        assert_eq!(array.len(TransactionKind::ReadOnly), 1);
        assert_eq!(array.get(0, TransactionKind::ReadOnly).expect("get"), 1);
    }

    #[test]
    fn growth_across_array_pages() {
        let fx = fixture(256);
        let array = new_array(&fx);

        let count = 512 * 3 + 17;
        let tx = fx.mgr.begin_write().expect("writer");
        for i in 0..count {
            array.push_back(i as u64).expect("push");
        }
        fx.mgr.commit(&tx).expect("commit");

        for &probe in &[0usize, 511, 512, 1024, count - 1] {
            assert_eq!(
                array.get(probe as u64, TransactionKind::ReadOnly).expect("get"),
                probe as u64
            );
        }
    }

    #[test]
    fn growth_across_pip_boundary_allocates_second_pip() {
        let fx = fixture(128);
        let array = new_array(&fx);

        // One PIP maps PAGE_IDXS_PER_PIP array pages of 512 u64s each;
        // push ten elements past it so the chain grows a second PIP.
        let count = (PAGE_IDXS_PER_PIP * 512 + 10) as usize;
        let tx = fx.mgr.begin_write().expect("writer");
        for i in 0..count {
            array.push_back(i as u64).expect("push");
        }
        fx.mgr.commit(&tx).expect("commit");

        assert_eq!(array.len(TransactionKind::ReadOnly), count as u64);
        for &probe in &[
            0usize,
            511,
            (PAGE_IDXS_PER_PIP * 512 - 1) as usize,
            (PAGE_IDXS_PER_PIP * 512) as usize,
            count - 1,
        ] {
            assert_eq!(
                array.get(probe as u64, TransactionKind::ReadOnly).expect("get"),
                probe as u64,
                "index {probe}"
            );
        }
        // Every array page and both PIP pages are referenced exactly once.
        let pages = array.resource().referenced_pages();
        let mut dedup = pages.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(pages.len(), dedup.len());
        assert_eq!(pages.len() as u64, PAGE_IDXS_PER_PIP + 1 + 2);
    }

    #[test]
    fn persists_across_reopen_via_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let header_page;
        {
            let file = Arc::new(
                FileHandle::open(dir.path().join("data.db"), crate::types::FileId(0))
                    .expect("file"),
            );
            let pool = Arc::new(BufferPool::new(64));
            let wal = Arc::new(Wal::open(dir.path().join("wal.log")).expect("wal"));
            let mgr = TransactionManager::new(Arc::clone(&wal), Arc::clone(&pool));

            let tx = mgr.begin_write().expect("writer");
            let array =
                DiskArray::<u64>::create(Arc::clone(&file), Arc::clone(&pool), Arc::clone(&wal), &tx)
                    .expect("create");
            mgr.register_resource(array.resource());
            for i in 0..1000u64 {
                array.push_back(i * 7).expect("push");
            }
            mgr.commit(&tx).expect("commit");
            header_page = array.header_page();

            // Checkpoint: committed frames to disk.
            pool.flush_all(&file).expect("flush");
            file.sync().expect("sync");
            wal.reset().expect("reset");
        }
        {
            let file = Arc::new(
                FileHandle::open(dir.path().join("data.db"), crate::types::FileId(0))
                    .expect("file"),
            );
            let pool = Arc::new(BufferPool::new(64));
            let wal = Arc::new(Wal::open(dir.path().join("wal.log")).expect("wal"));
            let array = DiskArray::<u64>::open(file, pool, wal, header_page).expect("open");
            assert_eq!(array.len(TransactionKind::ReadOnly), 1000);
            assert_eq!(array.get(999, TransactionKind::ReadOnly).expect("get"), 999 * 7);
        }
    }

    #[test]
    fn resize_fills_with_default() {
        let fx = fixture(64);
        let array = new_array(&fx);
        let tx = fx.mgr.begin_write().expect("writer");
        array.resize(100, 5).expect("resize");
        array.update(42, 8).expect("update");
        fx.mgr.commit(&tx).expect("commit");
        assert_eq!(array.get(0, TransactionKind::ReadOnly).expect("get"), 5);
        assert_eq!(array.get(42, TransactionKind::ReadOnly).expect("get"), 8);
        assert_eq!(array.len(TransactionKind::ReadOnly), 100);
    }
}
