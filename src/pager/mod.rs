//! Paged file access and the bounded buffer pool.
//!
//! All storage reads go through [`BufferPool::pin`]; mutations mark the
//! frame dirty and stay in memory until the owning transaction commits
//! (pending checkpoint) or rolls back (discarded). Uncommitted pages are
//! never written to their data file, which keeps the WAL redo-only.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{QuiverError, Result};
use crate::types::{FileId, PageIdx, PAGE_SIZE};

mod frame;
pub mod wal;

pub use frame::{Frame, FrameMeta, FrameOwner};

/// A named file plus the set of pages currently present in it.
pub struct FileHandle {
    id: FileId,
    path: PathBuf,
    file: Mutex<File>,
    num_pages: AtomicU32,
}

impl FileHandle {
    pub fn open(path: impl AsRef<Path>, id: FileId) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(QuiverError::Corruption(format!(
                "file {} length {} is not page aligned",
                path.display(),
                len
            )));
        }
        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            num_pages: AtomicU32::new((len / PAGE_SIZE as u64) as u32),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// Reserves the next page index. The page materializes on disk when a
    /// frame holding it is flushed.
    pub fn append_page(&self) -> PageIdx {
        PageIdx(self.num_pages.fetch_add(1, Ordering::AcqRel))
    }

    /// Reads one page into `buf`, zero-filling past end-of-file.
    pub fn read_page(&self, page: PageIdx, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let offset = page_offset(page)?;
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                buf[read..].fill(0);
                break;
            }
            read += n;
        }
        Ok(())
    }

    pub fn write_page(&self, page: PageIdx, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let offset = page_offset(page)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

fn page_offset(page: PageIdx) -> Result<u64> {
    u64::from(page.0)
        .checked_mul(PAGE_SIZE as u64)
        .ok_or_else(|| QuiverError::Internal("page offset overflow".into()))
}

struct PoolState {
    table: HashMap<(FileId, PageIdx), usize>,
    meta: Vec<FrameMeta>,
    clock: usize,
}

/// Bounded frame pool with clock (second-chance) eviction.
pub struct BufferPool {
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    /// Flushed before any transaction-dirty frame is written back, so
    /// page flushes never overtake their log records.
    wal: Mutex<Option<Arc<wal::Wal>>>,
}

impl BufferPool {
    pub fn new(num_frames: usize) -> Self {
        let mut meta = Vec::with_capacity(num_frames);
        let mut frames = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            frames.push(Frame::new());
            meta.push(FrameMeta::default());
        }
        Self {
            frames,
            state: Mutex::new(PoolState {
                table: HashMap::new(),
                meta,
                clock: 0,
            }),
            wal: Mutex::new(None),
        }
    }

    /// Attaches the WAL so transaction-dirty frames become evictable
    /// under the WAL rule. Without it only clean and committed frames
    /// are eviction candidates.
    pub fn set_wal(&self, wal: Arc<wal::Wal>) {
        *self.wal.lock() = Some(wal);
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Pins the frame holding `(file, page)`, reading the page in first if
    /// it is not resident. Concurrent pins of the same page share a frame.
    pub fn pin<'p>(&'p self, file: &Arc<FileHandle>, page: PageIdx) -> Result<PinnedPage<'p>> {
        let mut state = self.state.lock();
        if let Some(&idx) = state.table.get(&(file.id(), page)) {
            self.frames[idx].pin_count.fetch_add(1, Ordering::AcqRel);
            self.frames[idx].referenced.store(true, Ordering::Release);
            drop(state);
            return Ok(PinnedPage {
                pool: self,
                frame_idx: idx,
                page,
            });
        }
        let idx = self.claim_frame(&mut state, file, page)?;
        // Read in under the write latch; other pinners of this page block
        // on the latch until contents are valid.
        let mut latch = self.frames[idx].buf.write();
        drop(state);
        if let Err(err) = file.read_page(page, &mut latch) {
            drop(latch);
            let mut state = self.state.lock();
            state.table.remove(&(file.id(), page));
            state.meta[idx] = FrameMeta::default();
            self.frames[idx].pin_count.store(0, Ordering::Release);
            return Err(err);
        }
        drop(latch);
        Ok(PinnedPage {
            pool: self,
            frame_idx: idx,
            page,
        })
    }

    /// Re-obtains a page that must already be resident (the caller still
    /// holds a pin on it somewhere up the stack).
    pub fn get<'p>(&'p self, file: &Arc<FileHandle>, page: PageIdx) -> Result<PinnedPage<'p>> {
        let state = self.state.lock();
        let idx = *state.table.get(&(file.id(), page)).ok_or_else(|| {
            QuiverError::Internal(format!(
                "get on non-resident page {} of file {}",
                page,
                file.id().0
            ))
        })?;
        self.frames[idx].pin_count.fetch_add(1, Ordering::AcqRel);
        Ok(PinnedPage {
            pool: self,
            frame_idx: idx,
            page,
        })
    }

    /// Allocates a page at the end of `file`, pins it, runs `init` on the
    /// zeroed frame, and marks it dirty.
    pub fn insert_new_page<'p, F>(
        &'p self,
        file: &Arc<FileHandle>,
        init: F,
    ) -> Result<(PageIdx, PinnedPage<'p>)>
    where
        F: FnOnce(&mut [u8]),
    {
        let page = file.append_page();
        let mut state = self.state.lock();
        let idx = self.claim_frame(&mut state, file, page)?;
        state.meta[idx].dirty = true;
        let mut latch = self.frames[idx].buf.write();
        drop(state);
        latch.fill(0);
        init(&mut latch);
        drop(latch);
        trace!(file = file.id().0, page = page.0, "inserted new page");
        Ok((
            page,
            PinnedPage {
                pool: self,
                frame_idx: idx,
                page,
            },
        ))
    }

    /// Marks transaction-dirty frames as committed (pending checkpoint).
    /// Called after the owning transaction's WAL records are durable.
    pub fn mark_committed(&self, pages: &[(FileId, PageIdx)]) {
        let mut state = self.state.lock();
        for key in pages {
            if let Some(&idx) = state.table.get(key) {
                let meta = &mut state.meta[idx];
                if meta.dirty {
                    meta.dirty = false;
                    meta.pending_checkpoint = true;
                }
            }
        }
    }

    /// Drops uncommitted contents of the given pages so the next pin
    /// re-reads the canonical bytes from disk.
    pub fn discard_dirty(&self, pages: &[(FileId, PageIdx)]) -> Result<()> {
        let mut state = self.state.lock();
        for key in pages {
            if let Some(idx) = state.table.get(key).copied() {
                if self.frames[idx].pins() > 0 {
                    return Err(QuiverError::Internal(format!(
                        "rollback with pinned dirty page {}",
                        key.1
                    )));
                }
                state.table.remove(key);
                state.meta[idx] = FrameMeta::default();
            }
        }
        Ok(())
    }

    /// Writes one resident page back to its file and clears its flags.
    ///
    /// Callers own the WAL rule: records describing the page must be
    /// durable first.
    pub fn flush_page(&self, file: &Arc<FileHandle>, page: PageIdx) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(&idx) = state.table.get(&(file.id(), page)) {
            let meta = &mut state.meta[idx];
            if meta.dirty || meta.pending_checkpoint {
                meta.dirty = false;
                meta.pending_checkpoint = false;
                let latch = self.frames[idx].buf.read();
                file.write_page(page, &latch)?;
            }
        }
        Ok(())
    }

    /// Writes every dirty or pending frame of `file` back. Checkpoint path.
    pub fn flush_all(&self, file: &Arc<FileHandle>) -> Result<()> {
        let mut state = self.state.lock();
        let mut flushed = 0usize;
        for idx in 0..state.meta.len() {
            let Some(owner) = state.meta[idx].owner else {
                continue;
            };
            if owner.file != file.id() {
                continue;
            }
            let meta = &mut state.meta[idx];
            if meta.dirty || meta.pending_checkpoint {
                meta.dirty = false;
                meta.pending_checkpoint = false;
                let latch = self.frames[idx].buf.read();
                file.write_page(owner.page, &latch)?;
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!(file = file.id().0, pages = flushed, "flushed dirty frames");
        }
        Ok(())
    }

    fn unpin(&self, frame_idx: usize) {
        self.frames[frame_idx].pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn mark_dirty(&self, frame_idx: usize) {
        let mut state = self.state.lock();
        state.meta[frame_idx].dirty = true;
    }

    /// Finds a free or evictable frame, evicting its current owner if
    /// needed, and assigns it to `(file, page)` with one pin.
    fn claim_frame(
        &self,
        state: &mut PoolState,
        file: &Arc<FileHandle>,
        page: PageIdx,
    ) -> Result<usize> {
        let idx = self.find_victim(state)?;
        if let Some(old) = state.meta[idx].owner {
            if state.meta[idx].dirty || state.meta[idx].pending_checkpoint {
                // The victim's file handle is not at hand here; dirty
                // eviction only happens for the shared data file, which
                // is the handle being pinned against.
                if old.file != file.id() {
                    return Err(QuiverError::Internal(
                        "cross-file eviction of a dirty page".into(),
                    ));
                }
                if state.meta[idx].dirty {
                    // WAL rule: the update records describing this page
                    // must be durable before the page itself is.
                    let wal = self.wal.lock();
                    let wal = wal.as_ref().ok_or(QuiverError::BufferFull)?;
                    wal.flush()?;
                }
                let latch = self.frames[idx].buf.read();
                file.write_page(old.page, &latch)?;
            }
            state.table.remove(&(old.file, old.page));
        }
        state.meta[idx] = FrameMeta {
            owner: Some(FrameOwner {
                file: file.id(),
                page,
            }),
            dirty: false,
            pending_checkpoint: false,
        };
        state.table.insert((file.id(), page), idx);
        self.frames[idx].pin_count.store(1, Ordering::Release);
        self.frames[idx].referenced.store(true, Ordering::Release);
        Ok(idx)
    }

    fn find_victim(&self, state: &mut PoolState) -> Result<usize> {
        let n = self.frames.len();
        // First sweep prefers clean and committed victims; the second
        // admits transaction-dirty frames, which eviction will push
        // through the WAL rule.
        for allow_dirty in [false, true] {
            if allow_dirty && self.wal.lock().is_none() {
                break;
            }
            for _ in 0..2 * n {
                let idx = state.clock;
                state.clock = (state.clock + 1) % n;
                if self.frames[idx].pins() != 0 {
                    continue;
                }
                if state.meta[idx].dirty && !allow_dirty {
                    continue;
                }
                if self.frames[idx].referenced.swap(false, Ordering::AcqRel) {
                    continue;
                }
                return Ok(idx);
            }
        }
        Err(QuiverError::BufferFull)
    }
}

/// Pinned access to one page. Unpins on drop.
pub struct PinnedPage<'p> {
    pool: &'p BufferPool,
    frame_idx: usize,
    page: PageIdx,
}

impl<'p> std::fmt::Debug for PinnedPage<'p> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("frame_idx", &self.frame_idx)
            .field("page", &self.page)
            .finish()
    }
}

impl<'p> PinnedPage<'p> {
    pub fn page_idx(&self) -> PageIdx {
        self.page
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let latch = self.pool.frames[self.frame_idx].buf.read();
        f(&latch)
    }

    /// Mutates the page contents and marks the frame dirty.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let out = {
            let mut latch = self.pool.frames[self.frame_idx].buf.write();
            f(&mut latch)
        };
        self.pool.mark_dirty(self.frame_idx);
        out
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn data_file(dir: &tempfile::TempDir) -> Arc<FileHandle> {
        Arc::new(FileHandle::open(dir.path().join("data.db"), FileId(0)).expect("open file"))
    }

    #[test]
    fn pin_reads_back_written_page() {
        let dir = tempdir().expect("tempdir");
        let file = data_file(&dir);
        let pool = BufferPool::new(4);

        let page = {
            let (page, pinned) = pool.insert_new_page(&file, |data| data[0..4].copy_from_slice(&[1, 2, 3, 4])).expect("insert");
            drop(pinned);
            page
        };
        pool.flush_page(&file, page).expect("flush");

        let pinned = pool.pin(&file, page).expect("pin");
        pinned.read(|data| assert_eq!(&data[0..4], &[1, 2, 3, 4]));
    }

    #[test]
    fn same_page_shares_one_frame() {
        let dir = tempdir().expect("tempdir");
        let file = data_file(&dir);
        let pool = BufferPool::new(4);

        let (page, first) = pool.insert_new_page(&file, |_| {}).expect("insert");
        let second = pool.pin(&file, page).expect("second pin");
        assert_eq!(first.frame_idx, second.frame_idx);
        assert_eq!(pool.frames[first.frame_idx].pins(), 2);
        drop(first);
        drop(second);
        assert_eq!(pool.frames[0].pins(), 0);
    }

    #[test]
    fn pool_reports_full_when_all_frames_pinned() {
        let dir = tempdir().expect("tempdir");
        let file = data_file(&dir);
        let pool = BufferPool::new(2);

        let (page_a, a) = pool.insert_new_page(&file, |_| {}).expect("a");
        let (_, b) = pool.insert_new_page(&file, |_| {}).expect("b");
        let err = pool.insert_new_page(&file, |_| {}).unwrap_err();
        assert!(matches!(err, QuiverError::BufferFull));

        // Unpinning alone is not enough while the frame holds uncommitted
        // bytes; once flushed clean it becomes a victim.
        drop(a);
        pool.flush_page(&file, page_a).expect("flush");
        pool.insert_new_page(&file, |_| {}).expect("frees after unpin");
        drop(b);
    }

    #[test]
    fn dirty_frames_survive_eviction_pressure() {
        let dir = tempdir().expect("tempdir");
        let file = data_file(&dir);
        let pool = BufferPool::new(2);

        // One dirty (uncommitted) page and a stream of clean pins through
        // the second frame.
        let (dirty_page, pinned) = pool
            .insert_new_page(&file, |data| data[0] = 7)
            .expect("dirty page");
        drop(pinned);

        for _ in 0..4 {
            let page = file.append_page();
            let pinned = pool.pin(&file, page).expect("clean pin");
            drop(pinned);
        }

        // The dirty page never went to disk and is still resident.
        let pinned = pool.pin(&file, dirty_page).expect("still resident");
        pinned.read(|data| assert_eq!(data[0], 7));
    }

    #[test]
    fn discard_dirty_restores_disk_contents() {
        let dir = tempdir().expect("tempdir");
        let file = data_file(&dir);
        let pool = BufferPool::new(4);

        let (page, pinned) = pool.insert_new_page(&file, |data| data[0] = 1).expect("insert");
        drop(pinned);
        pool.flush_page(&file, page).expect("flush");

        let pinned = pool.pin(&file, page).expect("pin");
        pinned.write(|data| data[0] = 99);
        drop(pinned);

        pool.discard_dirty(&[(file.id(), page)]).expect("discard");
        let pinned = pool.pin(&file, page).expect("re-pin");
        pinned.read(|data| assert_eq!(data[0], 1));
    }
}
