use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::types::{FileId, PageIdx, PAGE_SIZE};

/// Page a frame currently mirrors, or `None` while the frame is free.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameOwner {
    pub file: FileId,
    pub page: PageIdx,
}

/// A fixed-size in-memory buffer mirroring one page.
///
/// Contents are guarded by the `buf` latch; the write side is held during
/// read-in and eviction writeback so concurrent pinners of the same page
/// block until the contents are valid.
pub struct Frame {
    pub buf: RwLock<Box<[u8]>>,
    pub pin_count: AtomicU32,
    /// Second-chance bit for the clock sweep.
    pub referenced: AtomicBool,
}

/// Book-keeping for one frame, guarded by the pool mutex.
#[derive(Default)]
pub struct FrameMeta {
    pub owner: Option<FrameOwner>,
    /// Dirtied by the active write transaction. Not evictable.
    pub dirty: bool,
    /// Dirtied by a committed transaction, awaiting checkpoint. Evictable
    /// once its WAL records are durable.
    pub pending_checkpoint: bool,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            buf: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            referenced: AtomicBool::new(false),
        }
    }

    pub fn pins(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
