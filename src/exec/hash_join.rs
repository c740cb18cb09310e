//! Hash-join build side: materialized rows bucketed by key hash.
//!
//! The build table is created once by the driver and shared read-only
//! across probe workers; equality is re-checked on the stored key value
//! after the hash bucket narrows the candidates.

use std::collections::HashMap;

use crate::error::Result;
use crate::exec::aggregate::hash_value;
use crate::function::compare_values;
use crate::vector::{LogicalType, Value};

pub struct JoinTable {
    payload_types: Vec<LogicalType>,
    rows: Vec<Vec<Value>>,
    key_column: usize,
    buckets: HashMap<u64, Vec<usize>>,
}

impl JoinTable {
    /// Materializes the build side, keyed on `key_column`. Null keys
    /// never match and are dropped.
    pub fn build(types: Vec<LogicalType>, rows: Vec<Vec<Value>>, key_column: usize) -> Result<Self> {
        let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            let key = &row[key_column];
            if key.is_null() {
                continue;
            }
            buckets.entry(hash_value(key)).or_default().push(idx);
        }
        Ok(Self {
            payload_types: types,
            rows,
            key_column,
            buckets,
        })
    }

    pub fn payload_types(&self) -> &[LogicalType] {
        &self.payload_types
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Build rows whose key equals `key`. A null key matches nothing.
    pub fn probe(&self, key: &Value) -> Result<Vec<&Vec<Value>>> {
        let mut out = Vec::new();
        if key.is_null() {
            return Ok(out);
        }
        if let Some(bucket) = self.buckets.get(&hash_value(key)) {
            for &idx in bucket {
                let candidate = &self.rows[idx][self.key_column];
                if compare_values(key, candidate)? == std::cmp::Ordering::Equal {
                    out.push(&self.rows[idx]);
                }
            }
        }
        Ok(out)
    }
}
