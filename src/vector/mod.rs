//! Value vector runtime shared by all physical operators.
//!
//! A [`DataChunk`] carries up to [`VECTOR_CAPACITY`] rows across a set of
//! typed vectors plus one [`ChunkState`]. Filters shrink the selection
//! vector without copying values; a *flat* chunk presents exactly one
//! logically selected position. Operator contracts state whether they
//! consume flat or unflat input, because kernels resolve positions
//! through the state.

use std::fmt;

use crate::error::{QuiverError, Result};
use crate::types::{TableId, VECTOR_CAPACITY};

#[derive(Clone, Eq, PartialEq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum LogicalType {
    Bool,
    Int64,
    Float64,
    String,
    /// Node or rel identity: table id plus dense offset.
    InternalId,
    /// Untyped list; path values use it.
    List,
}

impl LogicalType {
    /// Fixed column cell width in bytes.
    pub fn cell_size(&self) -> usize {
        match self {
            LogicalType::Bool => 1,
            LogicalType::Int64 | LogicalType::Float64 => 8,
            LogicalType::String => 16,
            LogicalType::InternalId => 12,
            LogicalType::List => 16,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Bool => write!(f, "BOOL"),
            LogicalType::Int64 => write!(f, "INT64"),
            LogicalType::Float64 => write!(f, "DOUBLE"),
            LogicalType::String => write!(f, "STRING"),
            LogicalType::InternalId => write!(f, "ID"),
            LogicalType::List => write!(f, "LIST"),
        }
    }
}

/// Runtime value. Kernels dispatch on the tag.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    InternalId { table: TableId, offset: u64 },
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(LogicalType::Bool),
            Value::Int64(_) => Some(LogicalType::Int64),
            Value::Float64(_) => Some(LogicalType::Float64),
            Value::String(_) => Some(LogicalType::String),
            Value::InternalId { .. } => Some(LogicalType::InternalId),
            Value::List(_) => Some(LogicalType::List),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(QuiverError::Internal(format!(
                "expected BOOL, found {other:?}"
            ))),
        }
    }

    pub fn as_int64(&self) -> Result<i64> {
        match self {
            Value::Int64(v) => Ok(*v),
            other => Err(QuiverError::Internal(format!(
                "expected INT64, found {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::InternalId { table, offset } => write!(f, "{}:{}", table.0, offset),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Selection over a chunk: indices of the live rows.
#[derive(Clone, Debug)]
pub struct SelVector {
    /// `None` means the identity selection `0..count`.
    positions: Option<Vec<u32>>,
    count: usize,
}

impl SelVector {
    pub fn identity(count: usize) -> Self {
        Self {
            positions: None,
            count,
        }
    }

    pub fn filtered(positions: Vec<u32>) -> Self {
        Self {
            count: positions.len(),
            positions: Some(positions),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn position(&self, i: usize) -> usize {
        match &self.positions {
            Some(positions) => positions[i] as usize,
            None => i,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(move |i| self.position(i))
    }
}

/// Shared per-chunk state: the selection plus the flatness flag.
#[derive(Clone, Debug)]
pub struct ChunkState {
    pub sel: SelVector,
    /// `Some(pos)` when the chunk is bound to one row.
    pub flat_pos: Option<usize>,
}

impl ChunkState {
    pub fn unflat(count: usize) -> Self {
        Self {
            sel: SelVector::identity(count),
            flat_pos: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.flat_pos.is_some()
    }

    /// Positions of logically selected rows: the single flat position or
    /// the selection vector.
    pub fn selected(&self) -> Vec<usize> {
        match self.flat_pos {
            Some(pos) => vec![pos],
            None => self.sel.iter().collect(),
        }
    }

    pub fn selected_len(&self) -> usize {
        if self.flat_pos.is_some() {
            1
        } else {
            self.sel.len()
        }
    }
}

/// A contiguous typed buffer of up to [`VECTOR_CAPACITY`] entries with a
/// null mask. Null bit and data slot are one-to-one.
#[derive(Clone, Debug)]
pub struct ValueVector {
    pub ty: LogicalType,
    values: Vec<Value>,
    nulls: Vec<bool>,
}

impl ValueVector {
    pub fn new(ty: LogicalType) -> Self {
        Self {
            ty,
            values: vec![Value::Null; VECTOR_CAPACITY],
            nulls: vec![true; VECTOR_CAPACITY],
        }
    }

    pub fn set_value(&mut self, pos: usize, value: Value) {
        self.nulls[pos] = value.is_null();
        self.values[pos] = value;
    }

    pub fn set_null(&mut self, pos: usize) {
        self.nulls[pos] = true;
        self.values[pos] = Value::Null;
    }

    pub fn value(&self, pos: usize) -> &Value {
        &self.values[pos]
    }

    pub fn is_null(&self, pos: usize) -> bool {
        self.nulls[pos]
    }

    /// Re-tags the vector from the first non-null value at `positions`.
    /// Used for kernel output whose element type is only known at
    /// runtime; an all-null vector keeps its declared tag.
    pub fn retag_from_values(&mut self, positions: &[usize]) {
        for &pos in positions {
            if !self.nulls[pos] {
                if let Some(ty) = self.values[pos].logical_type() {
                    self.ty = ty;
                }
                return;
            }
        }
    }
}

/// A batch of rows: typed vectors sharing one state.
#[derive(Clone, Debug)]
pub struct DataChunk {
    pub vectors: Vec<ValueVector>,
    pub state: ChunkState,
}

impl DataChunk {
    pub fn new(types: &[LogicalType]) -> Self {
        Self {
            vectors: types.iter().cloned().map(ValueVector::new).collect(),
            state: ChunkState::unflat(0),
        }
    }

    pub fn width(&self) -> usize {
        self.vectors.len()
    }

    /// Live row count under the current selection.
    pub fn cardinality(&self) -> usize {
        self.state.selected_len()
    }

    pub fn reset(&mut self) {
        self.state = ChunkState::unflat(0);
    }

    /// Copies one selected row out as owned values.
    pub fn row(&self, pos: usize) -> Vec<Value> {
        self.vectors.iter().map(|v| v.value(pos).clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_shrinks_selection_without_copying() {
        let mut chunk = DataChunk::new(&[LogicalType::Int64]);
        for i in 0..8 {
            chunk.vectors[0].set_value(i, Value::Int64(i as i64));
        }
        chunk.state = ChunkState::unflat(8);
        assert_eq!(chunk.cardinality(), 8);

        chunk.state.sel = SelVector::filtered(vec![1, 3, 5]);
        assert_eq!(chunk.cardinality(), 3);
        let selected: Vec<i64> = chunk
            .state
            .selected()
            .into_iter()
            .map(|pos| chunk.vectors[0].value(pos).as_int64().expect("int"))
            .collect();
        assert_eq!(selected, vec![1, 3, 5]);
    }

    #[test]
    fn flat_chunk_presents_one_position() {
        let mut chunk = DataChunk::new(&[LogicalType::Int64]);
        for i in 0..4 {
            chunk.vectors[0].set_value(i, Value::Int64(10 + i as i64));
        }
        chunk.state = ChunkState::unflat(4);
        chunk.state.flat_pos = Some(2);
        assert_eq!(chunk.cardinality(), 1);
        assert_eq!(chunk.state.selected(), vec![2]);
    }

    #[test]
    fn null_mask_tracks_values() {
        let mut vector = ValueVector::new(LogicalType::String);
        vector.set_value(0, Value::String("a".into()));
        vector.set_null(1);
        assert!(!vector.is_null(0));
        assert!(vector.is_null(1));
        assert_eq!(vector.value(1), &Value::Null);
    }
}
