//! Aggregate hash table: open addressing with linear probing.
//!
//! Entries live in a factorized tuple store as packed
//! `[key cells | aggregate states | hash]` rows; a parallel slot array
//! holds `(hash, entry pointer)` pairs with a null pointer marking an
//! empty slot. Var-length key bytes go to a table-local heap and cells
//! store `(len, offset)`. The table doubles when the load factor passes
//! one half. Distinct aggregates carry an auxiliary table keyed by the
//! group keys plus the argument; only first-seen tuples advance the
//! outer state. Workers build partition-local tables that are merged
//! serially through each function's combine step.

use std::convert::TryInto;

use smallvec::SmallVec;

use crate::error::{QuiverError, Result};
use crate::exec::plan::AggregateSpec;
use crate::vector::{LogicalType, Value, ValueVector};

const EMPTY_ENTRY: u32 = 0;
const NULL_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Copy, Clone)]
struct HashSlot {
    hash: u64,
    /// Entry index plus one; zero is the null pointer.
    entry: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AggKind {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One aggregate function instance bound to its argument type.
#[derive(Clone, Debug)]
pub struct AggFunction {
    pub kind: AggKind,
    pub arg_type: Option<LogicalType>,
    pub distinct: bool,
}

impl AggFunction {
    pub fn from_spec(spec: &AggregateSpec, arg_type: Option<LogicalType>) -> Self {
        match spec {
            AggregateSpec::CountStar => Self {
                kind: AggKind::CountStar,
                arg_type: None,
                distinct: false,
            },
            AggregateSpec::Count { distinct, .. } => Self {
                kind: AggKind::Count,
                arg_type,
                distinct: *distinct,
            },
            AggregateSpec::Sum { distinct, .. } => Self {
                kind: AggKind::Sum,
                arg_type,
                distinct: *distinct,
            },
            AggregateSpec::Min { .. } => Self {
                kind: AggKind::Min,
                arg_type,
                distinct: false,
            },
            AggregateSpec::Max { .. } => Self {
                kind: AggKind::Max,
                arg_type,
                distinct: false,
            },
            AggregateSpec::Avg { distinct, .. } => Self {
                kind: AggKind::Avg,
                arg_type,
                distinct: *distinct,
            },
        }
    }

    fn state_size(&self) -> usize {
        match self.kind {
            AggKind::CountStar | AggKind::Count => 8,
            AggKind::Sum => 9,
            AggKind::Min | AggKind::Max => 10,
            AggKind::Avg => 16,
        }
    }

    pub fn result_type(&self) -> LogicalType {
        match self.kind {
            AggKind::CountStar | AggKind::Count => LogicalType::Int64,
            AggKind::Avg => LogicalType::Float64,
            AggKind::Sum | AggKind::Min | AggKind::Max => self
                .arg_type
                .clone()
                .unwrap_or(LogicalType::Int64),
        }
    }
}

/// Fixed key-cell width per type; strings store `(len, heap offset)`.
fn key_cell_size(ty: &LogicalType) -> usize {
    match ty {
        LogicalType::Bool => 2,
        LogicalType::Int64 | LogicalType::Float64 => 9,
        LogicalType::String => 9,
        LogicalType::InternalId => 13,
        LogicalType::List => 9,
    }
}

pub struct AggregateHashTable {
    key_types: Vec<LogicalType>,
    aggs: Vec<AggFunction>,
    key_offsets: Vec<usize>,
    agg_offsets: Vec<usize>,
    hash_offset: usize,
    entry_size: usize,
    /// Factorized tuple store: `entry_size` bytes per entry.
    tuples: Vec<u8>,
    num_entries: usize,
    /// Var-length bytes referenced by key and min/max cells.
    heap: Vec<u8>,
    slots: Vec<HashSlot>,
    /// One auxiliary table per distinct aggregate.
    distinct_tables: Vec<Option<Box<AggregateHashTable>>>,
}

impl AggregateHashTable {
    pub fn new(key_types: Vec<LogicalType>, aggs: Vec<AggFunction>) -> Self {
        let mut key_offsets = Vec::with_capacity(key_types.len());
        let mut at = 0usize;
        for ty in &key_types {
            key_offsets.push(at);
            at += key_cell_size(ty);
        }
        let mut agg_offsets = Vec::with_capacity(aggs.len());
        for agg in &aggs {
            agg_offsets.push(at);
            at += agg.state_size();
        }
        let hash_offset = at;
        let entry_size = at + 8;

        let distinct_tables: Vec<Option<Box<AggregateHashTable>>> = aggs
            .iter()
            .map(|agg| {
                agg.distinct.then(|| {
                    let mut distinct_keys = key_types.clone();
                    if let Some(ty) = &agg.arg_type {
                        distinct_keys.push(ty.clone());
                    }
                    Box::new(AggregateHashTable::new(distinct_keys, Vec::new()))
                })
            })
            .collect();

        Self {
            key_types,
            aggs,
            key_offsets,
            agg_offsets,
            hash_offset,
            entry_size,
            tuples: Vec::new(),
            num_entries: 0,
            heap: Vec::new(),
            slots: vec![
                HashSlot {
                    hash: 0,
                    entry: EMPTY_ENTRY
                };
                64
            ],
            distinct_tables,
        }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Ingests one input batch: `keys` and `args` are position-aligned
    /// vectors, `args[i]` carries aggregate `i`'s argument (absent for
    /// `count(*)`).
    pub fn append(
        &mut self,
        keys: &[&ValueVector],
        args: &[Option<&ValueVector>],
        positions: &[usize],
        multiplicity: u64,
    ) -> Result<()> {
        // One hash per input row, combining the per-column hashes.
        let mut hashes = Vec::with_capacity(positions.len());
        for &pos in positions {
            let mut hash = 0u64;
            for key in keys {
                let column_hash = if key.is_null(pos) {
                    NULL_HASH
                } else {
                    hash_value(key.value(pos))
                };
                hash = combine_hash(hash, column_hash);
            }
            hashes.push(hash);
        }

        for (row, &pos) in positions.iter().enumerate() {
            let row_keys: SmallVec<[Value; 4]> =
                keys.iter().map(|k| k.value(pos).clone()).collect();
            let entry = self.probe_or_insert(&row_keys, hashes[row])?;
            for agg_idx in 0..self.aggs.len() {
                let value = args[agg_idx].map(|v| v.value(pos).clone());
                self.update_state(entry, agg_idx, &row_keys, value.as_ref(), multiplicity)?;
            }
        }
        Ok(())
    }

    /// Membership-style insert used by distinct tables: returns true when
    /// the key tuple was first seen.
    fn insert_distinct(&mut self, keys: &[Value]) -> Result<bool> {
        let mut hash = 0u64;
        for key in keys {
            let column_hash = if key.is_null() {
                NULL_HASH
            } else {
                hash_value(key)
            };
            hash = combine_hash(hash, column_hash);
        }
        let before = self.num_entries;
        self.probe_or_insert(keys, hash)?;
        Ok(self.num_entries > before)
    }

    /// Linear probing from `hash & mask`: follow slots until a match
    /// (hash plus key equality) or an empty slot, which materializes a
    /// new entry with zeroed states.
    fn probe_or_insert(&mut self, keys: &[Value], hash: u64) -> Result<usize> {
        loop {
            let mask = (self.slots.len() - 1) as u64;
            let mut slot_idx = (hash & mask) as usize;
            loop {
                let slot = self.slots[slot_idx];
                if slot.entry == EMPTY_ENTRY {
                    break;
                }
                if slot.hash == hash {
                    let entry = (slot.entry - 1) as usize;
                    if self.keys_equal(entry, keys)? {
                        return Ok(entry);
                    }
                }
                slot_idx = (slot_idx + 1) & mask as usize;
            }
            if (self.num_entries + 1) * 2 > self.slots.len() {
                self.resize(self.slots.len() * 2);
                continue;
            }
            let entry = self.materialize_entry(keys, hash)?;
            self.slots[slot_idx] = HashSlot {
                hash,
                entry: (entry + 1) as u32,
            };
            return Ok(entry);
        }
    }

    /// Doubles the slot array and re-inserts every entry by its stored
    /// hash.
    fn resize(&mut self, new_len: usize) {
        let mask = (new_len - 1) as u64;
        let mut slots = vec![
            HashSlot {
                hash: 0,
                entry: EMPTY_ENTRY
            };
            new_len
        ];
        for entry in 0..self.num_entries {
            let hash = self.entry_hash(entry);
            let mut slot_idx = (hash & mask) as usize;
            while slots[slot_idx].entry != EMPTY_ENTRY {
                slot_idx = (slot_idx + 1) & mask as usize;
            }
            slots[slot_idx] = HashSlot {
                hash,
                entry: (entry + 1) as u32,
            };
        }
        self.slots = slots;
    }

    fn materialize_entry(&mut self, keys: &[Value], hash: u64) -> Result<usize> {
        let entry = self.num_entries;
        self.tuples.resize((entry + 1) * self.entry_size, 0);
        self.num_entries += 1;
        for (idx, key) in keys.iter().enumerate() {
            let cell_at = entry * self.entry_size + self.key_offsets[idx];
            let cell = encode_key_cell(key, &self.key_types[idx], &mut self.heap)?;
            self.tuples[cell_at..cell_at + cell.len()].copy_from_slice(&cell);
        }
        let hash_at = entry * self.entry_size + self.hash_offset;
        self.tuples[hash_at..hash_at + 8].copy_from_slice(&hash.to_le_bytes());
        Ok(entry)
    }

    fn entry_hash(&self, entry: usize) -> u64 {
        let at = entry * self.entry_size + self.hash_offset;
        u64::from_le_bytes(self.tuples[at..at + 8].try_into().expect("8 bytes"))
    }

    fn keys_equal(&self, entry: usize, keys: &[Value]) -> Result<bool> {
        for (idx, key) in keys.iter().enumerate() {
            let stored = self.read_key(entry, idx)?;
            if &stored != key {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn read_key(&self, entry: usize, idx: usize) -> Result<Value> {
        let at = entry * self.entry_size + self.key_offsets[idx];
        decode_key_cell(
            &self.tuples[at..at + key_cell_size(&self.key_types[idx])],
            &self.key_types[idx],
            &self.heap,
        )
    }

    fn update_state(
        &mut self,
        entry: usize,
        agg_idx: usize,
        group_keys: &[Value],
        value: Option<&Value>,
        multiplicity: u64,
    ) -> Result<()> {
        let agg = self.aggs[agg_idx].clone();
        // Distinct gate: only first-seen (group keys, argument) tuples
        // advance the state.
        if agg.distinct {
            let Some(value) = value else {
                return Ok(());
            };
            if value.is_null() {
                return Ok(());
            }
            let mut distinct_keys = group_keys.to_vec();
            distinct_keys.push(value.clone());
            let table = self.distinct_tables[agg_idx]
                .as_mut()
                .ok_or_else(|| QuiverError::Internal("missing distinct table".into()))?;
            if !table.insert_distinct(&distinct_keys)? {
                return Ok(());
            }
        }

        let at = entry * self.entry_size + self.agg_offsets[agg_idx];
        match agg.kind {
            AggKind::CountStar => {
                let count = read_u64(&self.tuples, at) + multiplicity;
                write_u64(&mut self.tuples, at, count);
            }
            AggKind::Count => {
                if let Some(value) = value {
                    if !value.is_null() {
                        let add = if agg.distinct { 1 } else { multiplicity };
                        let count = read_u64(&self.tuples, at) + add;
                        write_u64(&mut self.tuples, at, count);
                    }
                }
            }
            AggKind::Sum => {
                if let Some(value) = value {
                    if !value.is_null() {
                        let times = if agg.distinct { 1 } else { multiplicity };
                        self.sum_into(at, value, times)?;
                    }
                }
            }
            AggKind::Min | AggKind::Max => {
                if let Some(value) = value {
                    if !value.is_null() {
                        self.min_max_into(at, value, agg.kind == AggKind::Min)?;
                    }
                }
            }
            AggKind::Avg => {
                if let Some(value) = value {
                    if !value.is_null() {
                        let times = if agg.distinct { 1 } else { multiplicity };
                        let count = read_u64(&self.tuples, at) + times;
                        write_u64(&mut self.tuples, at, count);
                        let sum = f64::from_le_bytes(
                            self.tuples[at + 8..at + 16].try_into().expect("8 bytes"),
                        ) + numeric_as_f64(value)? * times as f64;
                        self.tuples[at + 8..at + 16].copy_from_slice(&sum.to_le_bytes());
                    }
                }
            }
        }
        Ok(())
    }

    fn sum_into(&mut self, at: usize, value: &Value, times: u64) -> Result<()> {
        self.tuples[at] = 1;
        match value {
            Value::Int64(v) => {
                let current = i64::from_le_bytes(
                    self.tuples[at + 1..at + 9].try_into().expect("8 bytes"),
                );
                let next = current
                    .checked_add(v.checked_mul(times as i64).ok_or_else(overflow)?)
                    .ok_or_else(overflow)?;
                self.tuples[at + 1..at + 9].copy_from_slice(&next.to_le_bytes());
            }
            Value::Float64(v) => {
                let current = f64::from_le_bytes(
                    self.tuples[at + 1..at + 9].try_into().expect("8 bytes"),
                );
                let next = current + v * times as f64;
                self.tuples[at + 1..at + 9].copy_from_slice(&next.to_le_bytes());
            }
            other => {
                return Err(QuiverError::Runtime(format!("cannot sum {other:?}")));
            }
        }
        Ok(())
    }

    fn min_max_into(&mut self, at: usize, value: &Value, is_min: bool) -> Result<()> {
        let ty = value
            .logical_type()
            .ok_or_else(|| QuiverError::Internal("min/max of null".into()))?;
        if matches!(ty, LogicalType::InternalId | LogicalType::List) {
            return Err(QuiverError::Runtime(format!("cannot take min/max of {ty}")));
        }
        if self.tuples[at] != 0 {
            let current = decode_key_cell(&self.tuples[at + 1..at + 10], &ty, &self.heap)?;
            let ordering = crate::function::compare_values(value, &current)?;
            let replace = if is_min {
                ordering == std::cmp::Ordering::Less
            } else {
                ordering == std::cmp::Ordering::Greater
            };
            if !replace {
                return Ok(());
            }
        }
        self.tuples[at] = 1;
        let cell = encode_min_max_cell(value, &mut self.heap)?;
        self.tuples[at + 1..at + 10].copy_from_slice(&cell);
        Ok(())
    }

    /// Probes every source entry into this table, combining states with
    /// each function's combine step. Serial merge after a parallel build.
    pub fn merge(&mut self, other: AggregateHashTable) -> Result<()> {
        for entry in 0..other.num_entries {
            let keys: Vec<Value> = (0..self.key_types.len())
                .map(|idx| other.read_key(entry, idx))
                .collect::<Result<_>>()?;
            let hash = other.entry_hash(entry);
            let dst = self.probe_or_insert(&keys, hash)?;
            for agg_idx in 0..self.aggs.len() {
                self.combine_state(dst, agg_idx, &other, entry)?;
            }
        }
        // Distinct first-seen state merges through the auxiliary tables.
        for (mine, theirs) in self.distinct_tables.iter_mut().zip(other.distinct_tables) {
            if let (Some(mine), Some(theirs)) = (mine.as_mut(), theirs) {
                for entry in 0..theirs.num_entries {
                    let keys: Vec<Value> = (0..theirs.key_types.len())
                        .map(|idx| theirs.read_key(entry, idx))
                        .collect::<Result<_>>()?;
                    mine.insert_distinct(&keys)?;
                }
            }
        }
        Ok(())
    }

    fn combine_state(
        &mut self,
        dst: usize,
        agg_idx: usize,
        other: &AggregateHashTable,
        src: usize,
    ) -> Result<()> {
        let agg = self.aggs[agg_idx].clone();
        let dst_at = dst * self.entry_size + self.agg_offsets[agg_idx];
        let src_at = src * other.entry_size + other.agg_offsets[agg_idx];
        match agg.kind {
            AggKind::CountStar | AggKind::Count => {
                let total = read_u64(&self.tuples, dst_at) + read_u64(&other.tuples, src_at);
                write_u64(&mut self.tuples, dst_at, total);
            }
            AggKind::Sum => {
                if other.tuples[src_at] != 0 {
                    let ty = agg
                        .arg_type
                        .clone()
                        .ok_or_else(|| QuiverError::Internal("sum without arg type".into()))?;
                    let value = match ty {
                        LogicalType::Int64 => Value::Int64(i64::from_le_bytes(
                            other.tuples[src_at + 1..src_at + 9].try_into().expect("8 bytes"),
                        )),
                        LogicalType::Float64 => Value::Float64(f64::from_le_bytes(
                            other.tuples[src_at + 1..src_at + 9].try_into().expect("8 bytes"),
                        )),
                        other => {
                            return Err(QuiverError::Internal(format!("sum of {other}")));
                        }
                    };
                    self.sum_into(dst_at, &value, 1)?;
                }
            }
            AggKind::Min | AggKind::Max => {
                if other.tuples[src_at] != 0 {
                    let ty = agg
                        .arg_type
                        .clone()
                        .ok_or_else(|| QuiverError::Internal("min/max without arg type".into()))?;
                    let value = decode_key_cell(
                        &other.tuples[src_at + 1..src_at + 10],
                        &ty,
                        &other.heap,
                    )?;
                    self.min_max_into(dst_at, &value, agg.kind == AggKind::Min)?;
                }
            }
            AggKind::Avg => {
                let count = read_u64(&self.tuples, dst_at) + read_u64(&other.tuples, src_at);
                write_u64(&mut self.tuples, dst_at, count);
                let sum = f64::from_le_bytes(
                    self.tuples[dst_at + 8..dst_at + 16].try_into().expect("8 bytes"),
                ) + f64::from_le_bytes(
                    other.tuples[src_at + 8..src_at + 16].try_into().expect("8 bytes"),
                );
                self.tuples[dst_at + 8..dst_at + 16].copy_from_slice(&sum.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Converts every entry's states to result values:
    /// `(group keys, aggregate results)` per entry.
    pub fn finalize(&self) -> Result<Vec<(Vec<Value>, Vec<Value>)>> {
        let mut out = Vec::with_capacity(self.num_entries);
        for entry in 0..self.num_entries {
            let keys: Vec<Value> = (0..self.key_types.len())
                .map(|idx| self.read_key(entry, idx))
                .collect::<Result<_>>()?;
            let mut results = Vec::with_capacity(self.aggs.len());
            for (agg_idx, agg) in self.aggs.iter().enumerate() {
                let at = entry * self.entry_size + self.agg_offsets[agg_idx];
                let value = match agg.kind {
                    AggKind::CountStar | AggKind::Count => {
                        Value::Int64(read_u64(&self.tuples, at) as i64)
                    }
                    AggKind::Sum => {
                        if self.tuples[at] == 0 {
                            Value::Null
                        } else {
                            match agg.arg_type.clone() {
                                Some(LogicalType::Float64) => Value::Float64(f64::from_le_bytes(
                                    self.tuples[at + 1..at + 9].try_into().expect("8 bytes"),
                                )),
                                _ => Value::Int64(i64::from_le_bytes(
                                    self.tuples[at + 1..at + 9].try_into().expect("8 bytes"),
                                )),
                            }
                        }
                    }
                    AggKind::Min | AggKind::Max => {
                        if self.tuples[at] == 0 {
                            Value::Null
                        } else {
                            let ty = agg.arg_type.clone().ok_or_else(|| {
                                QuiverError::Internal("min/max without arg type".into())
                            })?;
                            decode_key_cell(&self.tuples[at + 1..at + 10], &ty, &self.heap)?
                        }
                    }
                    AggKind::Avg => {
                        let count = read_u64(&self.tuples, at);
                        if count == 0 {
                            Value::Null
                        } else {
                            let sum = f64::from_le_bytes(
                                self.tuples[at + 8..at + 16].try_into().expect("8 bytes"),
                            );
                            Value::Float64(sum / count as f64)
                        }
                    }
                };
                results.push(value);
            }
            out.push((keys, results));
        }
        Ok(out)
    }
}

fn overflow() -> QuiverError {
    QuiverError::Runtime("integer overflow in sum".into())
}

fn numeric_as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Int64(v) => Ok(*v as f64),
        Value::Float64(v) => Ok(*v),
        other => Err(QuiverError::Runtime(format!("cannot average {other:?}"))),
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().expect("8 bytes"))
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Encodes one key value into its fixed cell, spilling var-len bytes to
/// the heap.
fn encode_key_cell(value: &Value, ty: &LogicalType, heap: &mut Vec<u8>) -> Result<Vec<u8>> {
    let mut cell = vec![0u8; key_cell_size(ty)];
    if value.is_null() {
        cell[0] = 1;
        return Ok(cell);
    }
    match value {
        Value::Bool(b) => cell[1] = u8::from(*b),
        Value::Int64(v) => cell[1..9].copy_from_slice(&v.to_le_bytes()),
        Value::Float64(v) => cell[1..9].copy_from_slice(&v.to_le_bytes()),
        Value::String(s) => {
            let offset = heap.len() as u32;
            heap.extend_from_slice(s.as_bytes());
            cell[1..5].copy_from_slice(&(s.len() as u32).to_le_bytes());
            cell[5..9].copy_from_slice(&offset.to_le_bytes());
        }
        Value::InternalId { table, offset } => {
            cell[1..5].copy_from_slice(&table.0.to_le_bytes());
            cell[5..13].copy_from_slice(&offset.to_le_bytes());
        }
        other => {
            return Err(QuiverError::Runtime(format!(
                "cannot group by {other:?}"
            )))
        }
    }
    Ok(cell)
}

fn encode_min_max_cell(value: &Value, heap: &mut Vec<u8>) -> Result<Vec<u8>> {
    let ty = value
        .logical_type()
        .ok_or_else(|| QuiverError::Internal("min/max cell of null".into()))?;
    let cell = encode_key_cell(value, &ty, heap)?;
    let mut out = vec![0u8; 9];
    let take = cell.len().min(9);
    out[..take].copy_from_slice(&cell[..take]);
    Ok(out)
}

fn decode_key_cell(cell: &[u8], ty: &LogicalType, heap: &[u8]) -> Result<Value> {
    if cell[0] != 0 {
        return Ok(Value::Null);
    }
    let value = match ty {
        LogicalType::Bool => Value::Bool(cell[1] != 0),
        LogicalType::Int64 => {
            Value::Int64(i64::from_le_bytes(cell[1..9].try_into().expect("8 bytes")))
        }
        LogicalType::Float64 => {
            Value::Float64(f64::from_le_bytes(cell[1..9].try_into().expect("8 bytes")))
        }
        LogicalType::String => {
            let len = u32::from_le_bytes(cell[1..5].try_into().expect("4 bytes")) as usize;
            let offset = u32::from_le_bytes(cell[5..9].try_into().expect("4 bytes")) as usize;
            let bytes = heap.get(offset..offset + len).ok_or_else(|| {
                QuiverError::Internal("key cell points past the heap".into())
            })?;
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        LogicalType::InternalId => Value::InternalId {
            table: crate::types::TableId(u32::from_le_bytes(
                cell[1..5].try_into().expect("4 bytes"),
            )),
            offset: u64::from_le_bytes(cell[5..13].try_into().expect("8 bytes")),
        },
        LogicalType::List => {
            return Err(QuiverError::Runtime("cannot group by LIST".into()));
        }
    };
    Ok(value)
}

/// Murmur-style finalizer used for all primitive hashes.
fn murmur64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

pub fn hash_value(value: &Value) -> u64 {
    match value {
        Value::Null => NULL_HASH,
        Value::Bool(b) => murmur64(u64::from(*b)),
        Value::Int64(v) => murmur64(*v as u64),
        Value::Float64(v) => murmur64(v.to_bits()),
        Value::String(s) => {
            let mut hash = 0xcbf2_9ce4_8422_2325u64;
            for byte in s.as_bytes() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            murmur64(hash)
        }
        Value::InternalId { table, offset } => {
            combine_hash(murmur64(u64::from(table.0)), murmur64(*offset))
        }
        Value::List(items) => {
            let mut hash = murmur64(items.len() as u64);
            for item in items {
                hash = combine_hash(hash, hash_value(item));
            }
            hash
        }
    }
}

pub fn combine_hash(a: u64, b: u64) -> u64 {
    a ^ b
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(a << 6)
        .wrapping_add(a >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ValueVector;

    fn int_vector(values: &[Option<i64>]) -> ValueVector {
        let mut v = ValueVector::new(LogicalType::Int64);
        for (i, value) in values.iter().enumerate() {
            match value {
                Some(x) => v.set_value(i, Value::Int64(*x)),
                None => v.set_null(i),
            }
        }
        v
    }

    fn count_table(distinct: bool) -> AggregateHashTable {
        AggregateHashTable::new(
            vec![],
            vec![
                AggFunction {
                    kind: AggKind::Count,
                    arg_type: Some(LogicalType::Int64),
                    distinct,
                },
            ],
        )
    }

    #[test]
    fn count_and_count_distinct() {
        let values = int_vector(&[Some(1), Some(1), Some(2), Some(2), Some(3)]);
        let positions: Vec<usize> = (0..5).collect();

        let mut plain = count_table(false);
        plain.append(&[], &[Some(&values)], &positions, 1).expect("append");
        let results = plain.finalize().expect("finalize");
        assert_eq!(results[0].1, vec![Value::Int64(5)]);

        let mut distinct = count_table(true);
        distinct.append(&[], &[Some(&values)], &positions, 1).expect("append");
        let results = distinct.finalize().expect("finalize");
        assert_eq!(results[0].1, vec![Value::Int64(3)]);
    }

    #[test]
    fn group_by_key_with_sum_and_min() {
        let keys = int_vector(&[Some(1), Some(2), Some(1), Some(2), Some(1)]);
        let values = int_vector(&[Some(10), Some(20), Some(30), Some(40), Some(50)]);
        let positions: Vec<usize> = (0..5).collect();

        let mut table = AggregateHashTable::new(
            vec![LogicalType::Int64],
            vec![
                AggFunction {
                    kind: AggKind::Sum,
                    arg_type: Some(LogicalType::Int64),
                    distinct: false,
                },
                AggFunction {
                    kind: AggKind::Min,
                    arg_type: Some(LogicalType::Int64),
                    distinct: false,
                },
            ],
        );
        table
            .append(&[&keys], &[Some(&values), Some(&values)], &positions, 1)
            .expect("append");
        let mut results = table.finalize().expect("finalize");
        results.sort_by_key(|(keys, _)| match keys[0] {
            Value::Int64(v) => v,
            _ => 0,
        });
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, vec![Value::Int64(1)]);
        assert_eq!(results[0].1, vec![Value::Int64(90), Value::Int64(10)]);
        assert_eq!(results[1].0, vec![Value::Int64(2)]);
        assert_eq!(results[1].1, vec![Value::Int64(60), Value::Int64(20)]);
    }

    #[test]
    fn split_build_then_merge_equals_single_pass() {
        let make = || {
            AggregateHashTable::new(
                vec![LogicalType::Int64],
                vec![
                    AggFunction {
                        kind: AggKind::CountStar,
                        arg_type: None,
                        distinct: false,
                    },
                    AggFunction {
                        kind: AggKind::Sum,
                        arg_type: Some(LogicalType::Int64),
                        distinct: false,
                    },
                ],
            )
        };

        let input: Vec<(i64, i64)> = (0..200).map(|i| (i % 7, i)).collect();
        let keys: Vec<Option<i64>> = input.iter().map(|(k, _)| Some(*k)).collect();
        let vals: Vec<Option<i64>> = input.iter().map(|(_, v)| Some(*v)).collect();
        let keys = int_vector(&keys);
        let vals = int_vector(&vals);

        // X then Y into two tables, merged.
        let first: Vec<usize> = (0..100).collect();
        let second: Vec<usize> = (100..200).collect();
        let mut left = make();
        left.append(&[&keys], &[None, Some(&vals)], &first, 1).expect("x");
        let mut right = make();
        right.append(&[&keys], &[None, Some(&vals)], &second, 1).expect("y");
        left.merge(right).expect("merge");

        // X concatenated with Y in one pass.
        let all: Vec<usize> = (0..200).collect();
        let mut single = make();
        single.append(&[&keys], &[None, Some(&vals)], &all, 1).expect("xy");

        let sort = |mut r: Vec<(Vec<Value>, Vec<Value>)>| {
            r.sort_by_key(|(keys, _)| match keys[0] {
                Value::Int64(v) => v,
                _ => 0,
            });
            r
        };
        assert_eq!(
            sort(left.finalize().expect("merged")),
            sort(single.finalize().expect("single"))
        );
    }

    #[test]
    fn resize_keeps_entries_reachable() {
        let mut table = AggregateHashTable::new(
            vec![LogicalType::Int64],
            vec![AggFunction {
                kind: AggKind::CountStar,
                arg_type: None,
                distinct: false,
            }],
        );
        // Push well past the initial 64-slot table's 0.5 load factor.
        for i in 0..500i64 {
            let keys = int_vector(&[Some(i)]);
            table.append(&[&keys], &[None], &[0], 1).expect("append");
        }
        assert_eq!(table.num_entries(), 500);
        // Re-append the same keys: every group should hit, not grow.
        for i in 0..500i64 {
            let keys = int_vector(&[Some(i)]);
            table.append(&[&keys], &[None], &[0], 1).expect("append");
        }
        assert_eq!(table.num_entries(), 500);
        let results = table.finalize().expect("finalize");
        assert!(results.iter().all(|(_, r)| r[0] == Value::Int64(2)));
    }

    #[test]
    fn null_keys_group_together() {
        let keys = int_vector(&[None, None, Some(1)]);
        let mut table = AggregateHashTable::new(
            vec![LogicalType::Int64],
            vec![AggFunction {
                kind: AggKind::CountStar,
                arg_type: None,
                distinct: false,
            }],
        );
        table.append(&[&keys], &[None], &[0, 1, 2], 1).expect("append");
        assert_eq!(table.num_entries(), 2);
    }
}
