//! Fixed-width property columns addressed by dense offset.
//!
//! Every cell starts with a null byte, followed by the type's fixed
//! payload. Variable-length strings keep a length plus either the whole
//! string inline (up to [`INLINE_STRING_LEN`] bytes) or a 4-byte prefix
//! and a pointer into overflow pages. Overflow bytes for one string are
//! written to consecutive pages, so readers can stream across page
//! boundaries.

use std::convert::TryInto;
use std::sync::Arc;

use crate::error::{QuiverError, Result};
use crate::storage::disk_array::{DiskArray, RawDiskArray};
use crate::storage::StorageContext;
use crate::transaction::{Transaction, TransactionKind};
use crate::types::{NodeOffset, PageIdx, TableId, NULL_PAGE_IDX, PAGE_SIZE};
use crate::vector::{LogicalType, Value, ValueVector};

/// Longest string stored fully inside its column cell.
pub const INLINE_STRING_LEN: usize = 12;

/// Header pages a column needs; recorded in the catalog.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ColumnLocator {
    pub data_header: u32,
    pub overflow_header: Option<u32>,
}

/// Allocation cursor of an overflow area: current page and write offset.
struct OverflowAllocator {
    state: DiskArray<u64>,
}

const OVERFLOW_PAGE_SLOT: u64 = 0;
const OVERFLOW_OFFSET_SLOT: u64 = 1;

impl OverflowAllocator {
    fn create(ctx: &StorageContext, tx: &Transaction) -> Result<Self> {
        let state = DiskArray::<u64>::create(
            Arc::clone(&ctx.file),
            Arc::clone(&ctx.pool),
            Arc::clone(&ctx.wal),
            tx,
        )?;
        state.resize(2, u64::from(NULL_PAGE_IDX.0))?;
        state.update(OVERFLOW_OFFSET_SLOT, 0)?;
        Ok(Self { state })
    }

    fn open(ctx: &StorageContext, header: PageIdx) -> Result<Self> {
        Ok(Self {
            state: DiskArray::<u64>::open(
                Arc::clone(&ctx.file),
                Arc::clone(&ctx.pool),
                Arc::clone(&ctx.wal),
                header,
            )?,
        })
    }

    /// Appends `bytes` to the overflow area under the write transaction
    /// and returns the start `(page, offset)`. Multi-page strings occupy
    /// consecutive fresh pages.
    fn append(&self, ctx: &StorageContext, tx: &Transaction, bytes: &[u8]) -> Result<(u32, u32)> {
        let current = self.state.get(OVERFLOW_PAGE_SLOT, TransactionKind::Write)?;
        let offset = self.state.get(OVERFLOW_OFFSET_SLOT, TransactionKind::Write)? as usize;

        let (start_page, start_offset) =
            if current == u64::from(NULL_PAGE_IDX.0) || offset + bytes.len() > PAGE_SIZE {
                (ctx.file.append_page(), 0usize)
            } else {
                (PageIdx(current as u32), offset)
            };

        let mut page = start_page;
        let mut at = start_offset;
        let mut remaining = bytes;
        loop {
            let take = remaining.len().min(PAGE_SIZE - at);
            let pinned = ctx.pool.pin(&ctx.file, page)?;
            let before = pinned.read(|buf| buf.to_vec());
            let after = pinned.write(|buf| {
                buf[at..at + take].copy_from_slice(&remaining[..take]);
                buf.to_vec()
            });
            ctx.wal
                .append_page_update(tx.id(), ctx.file.id(), page, &before, &after)?;
            tx.record_dirty(ctx.file.id(), page);
            remaining = &remaining[take..];
            at += take;
            if remaining.is_empty() {
                break;
            }
            page = ctx.file.append_page();
            at = 0;
        }

        self.state.update(OVERFLOW_PAGE_SLOT, u64::from(page.0))?;
        self.state.update(OVERFLOW_OFFSET_SLOT, at as u64)?;
        Ok((start_page.0, start_offset as u32))
    }

    /// Reads `len` bytes starting at `(page, offset)`, following the
    /// consecutive-page layout.
    fn read(&self, ctx: &StorageContext, page: u32, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut page = PageIdx(page);
        let mut at = offset as usize;
        while out.len() < len {
            let take = (len - out.len()).min(PAGE_SIZE - at);
            let pinned = ctx.pool.pin(&ctx.file, page)?;
            pinned.read(|buf| out.extend_from_slice(&buf[at..at + take]));
            page = PageIdx(page.0 + 1);
            at = 0;
        }
        Ok(out)
    }
}

/// A dense fixed-width column, one cell per table offset.
pub struct Column {
    ctx: StorageContext,
    ty: LogicalType,
    data: Arc<RawDiskArray>,
    overflow: Option<OverflowAllocator>,
}

impl Column {
    pub fn create(ctx: &StorageContext, tx: &Transaction, ty: LogicalType) -> Result<Self> {
        if ty == LogicalType::List {
            return Err(QuiverError::Binder(
                "LIST-typed properties are not supported in columns".into(),
            ));
        }
        let cell = cell_size(&ty);
        let data = Arc::new(RawDiskArray::create(
            Arc::clone(&ctx.file),
            Arc::clone(&ctx.pool),
            Arc::clone(&ctx.wal),
            tx,
            cell,
        )?);
        let overflow = if ty == LogicalType::String {
            Some(OverflowAllocator::create(ctx, tx)?)
        } else {
            None
        };
        Ok(Self {
            ctx: ctx.clone(),
            ty,
            data,
            overflow,
        })
    }

    pub fn open(ctx: &StorageContext, ty: LogicalType, locator: ColumnLocator) -> Result<Self> {
        let data = Arc::new(RawDiskArray::open(
            Arc::clone(&ctx.file),
            Arc::clone(&ctx.pool),
            Arc::clone(&ctx.wal),
            PageIdx(locator.data_header),
            cell_size(&ty),
        )?);
        let overflow = match locator.overflow_header {
            Some(header) => Some(OverflowAllocator::open(ctx, PageIdx(header))?),
            None => None,
        };
        Ok(Self {
            ctx: ctx.clone(),
            ty,
            data,
            overflow,
        })
    }

    pub fn ty(&self) -> &LogicalType {
        &self.ty
    }

    pub fn locator(&self) -> ColumnLocator {
        ColumnLocator {
            data_header: self.data.header_page().0,
            overflow_header: self
                .overflow
                .as_ref()
                .map(|o| o.state.header_page().0),
        }
    }

    /// Transactional resources backing this column, in commit order.
    pub fn resources(&self) -> Vec<Arc<RawDiskArray>> {
        let mut resources = vec![Arc::clone(&self.data)];
        if let Some(overflow) = &self.overflow {
            resources.push(overflow.state.resource());
        }
        resources
    }

    pub fn len(&self, kind: TransactionKind) -> u64 {
        self.data.len(kind)
    }

    pub fn is_empty(&self, kind: TransactionKind) -> bool {
        self.data.is_empty(kind)
    }

    /// Writes `value` at `offset`, growing the column with nulls first if
    /// needed. Long strings go to the overflow area.
    pub fn set_value(&self, tx: &Transaction, offset: NodeOffset, value: &Value) -> Result<()> {
        let cell = cell_size(&self.ty);
        if offset >= self.data.len(TransactionKind::Write) {
            // Unset cells read back as NULL.
            let mut null_cell = vec![0u8; cell];
            null_cell[0] = 1;
            self.data.resize(offset + 1, &null_cell)?;
        }
        let mut buf = vec![0u8; cell];
        self.encode_cell(tx, value, &mut buf)?;
        self.data.update(offset, &buf)
    }

    pub fn get_value(&self, offset: NodeOffset, kind: TransactionKind) -> Result<Value> {
        let mut buf = vec![0u8; cell_size(&self.ty)];
        self.data.get(offset, kind, &mut buf)?;
        self.decode_cell(&buf)
    }

    /// Sequential read path: one pin per covered page, decoded into
    /// `out[0..count]`.
    pub fn scan_into(
        &self,
        start: NodeOffset,
        count: usize,
        kind: TransactionKind,
        out: &mut ValueVector,
    ) -> Result<()> {
        let cell = cell_size(&self.ty);
        let mut buf = vec![0u8; count * cell];
        self.data.read_range(start, count as u64, kind, &mut buf)?;
        for i in 0..count {
            let value = self.decode_cell(&buf[i * cell..(i + 1) * cell])?;
            out.set_value(i, value);
        }
        Ok(())
    }

    /// Positional read path: pin, copy one cell, unpin, per position.
    pub fn lookup_into(
        &self,
        offsets: &[(usize, NodeOffset)],
        kind: TransactionKind,
        out: &mut ValueVector,
    ) -> Result<()> {
        for (pos, offset) in offsets {
            out.set_value(*pos, self.get_value(*offset, kind)?);
        }
        Ok(())
    }

    fn encode_cell(&self, tx: &Transaction, value: &Value, buf: &mut [u8]) -> Result<()> {
        if value.is_null() {
            buf[0] = 1;
            return Ok(());
        }
        buf[0] = 0;
        match (&self.ty, value) {
            (LogicalType::Bool, Value::Bool(b)) => buf[1] = u8::from(*b),
            (LogicalType::Int64, Value::Int64(v)) => buf[1..9].copy_from_slice(&v.to_le_bytes()),
            (LogicalType::Float64, Value::Float64(v)) => {
                buf[1..9].copy_from_slice(&v.to_le_bytes())
            }
            (LogicalType::InternalId, Value::InternalId { table, offset }) => {
                buf[1..5].copy_from_slice(&table.0.to_le_bytes());
                buf[5..13].copy_from_slice(&offset.to_le_bytes());
            }
            (LogicalType::String, Value::String(s)) => {
                let bytes = s.as_bytes();
                buf[1..5].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                if bytes.len() <= INLINE_STRING_LEN {
                    buf[5..5 + bytes.len()].copy_from_slice(bytes);
                } else {
                    let overflow = self.overflow.as_ref().ok_or_else(|| {
                        QuiverError::Internal("string column without overflow area".into())
                    })?;
                    let (page, offset) = overflow.append(&self.ctx, tx, bytes)?;
                    buf[5..9].copy_from_slice(&bytes[..4]);
                    buf[9..13].copy_from_slice(&page.to_le_bytes());
                    buf[13..17].copy_from_slice(&offset.to_le_bytes());
                }
            }
            (ty, value) => {
                return Err(QuiverError::Runtime(format!(
                    "cannot store {value:?} in a {ty} column"
                )))
            }
        }
        Ok(())
    }

    fn decode_cell(&self, buf: &[u8]) -> Result<Value> {
        if buf[0] != 0 {
            return Ok(Value::Null);
        }
        let value = match self.ty {
            LogicalType::Bool => Value::Bool(buf[1] != 0),
            LogicalType::Int64 => {
                Value::Int64(i64::from_le_bytes(buf[1..9].try_into().expect("8 bytes")))
            }
            LogicalType::Float64 => {
                Value::Float64(f64::from_le_bytes(buf[1..9].try_into().expect("8 bytes")))
            }
            LogicalType::InternalId => Value::InternalId {
                table: TableId(u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes"))),
                offset: u64::from_le_bytes(buf[5..13].try_into().expect("8 bytes")),
            },
            LogicalType::String => {
                let len = u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes")) as usize;
                if len <= INLINE_STRING_LEN {
                    let bytes = &buf[5..5 + len];
                    Value::String(String::from_utf8_lossy(bytes).into_owned())
                } else {
                    let overflow = self.overflow.as_ref().ok_or_else(|| {
                        QuiverError::Corruption("string cell points at missing overflow".into())
                    })?;
                    let page = u32::from_le_bytes(buf[9..13].try_into().expect("4 bytes"));
                    let offset = u32::from_le_bytes(buf[13..17].try_into().expect("4 bytes"));
                    let bytes = overflow.read(&self.ctx, page, offset, len)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
            }
            LogicalType::List => {
                return Err(QuiverError::Internal("LIST column cell".into()));
            }
        };
        Ok(value)
    }
}

/// Cell width: null byte plus the type's fixed payload.
fn cell_size(ty: &LogicalType) -> usize {
    1 + ty.cell_size()
}
