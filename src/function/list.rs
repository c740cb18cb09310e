//! List functions. `list_extract` is 1-based; an index of zero or one
//! past either end aborts the query.

use crate::error::{QuiverError, Result};
use crate::vector::{LogicalType, Value};

use super::{binary_kernel, unary_kernel, FunctionRegistry};

pub(super) fn register(registry: &mut FunctionRegistry) {
    use LogicalType::*;

    // list_extract returns the extracted element, not a re-wrapped
    // list. LIST carries no element type, so the registered LIST tag is
    // only the fallback: the binder pins the result type per call, and
    // an unpinned call has its output vector re-tagged from the values.
    registry.must_register_dynamic(
        "list_extract",
        vec![List, Int64],
        List,
        binary_kernel(|list, idx| match list {
            Value::List(items) => {
                let idx = idx.as_int64()?;
                list_extract(items, idx)
            }
            _ => Err(QuiverError::Internal("list_extract on non-LIST".into())),
        }),
    );
    registry.must_register(
        "list_len",
        vec![List],
        Int64,
        unary_kernel(|list| match list {
            Value::List(items) => Ok(Value::Int64(items.len() as i64)),
            _ => Err(QuiverError::Internal("list_len on non-LIST".into())),
        }),
    );
}

fn list_extract(items: &[Value], idx: i64) -> Result<Value> {
    if idx < 1 || idx as usize > items.len() {
        return Err(QuiverError::Runtime(format!(
            "list_extract index {idx} out of range for list of {} elements",
            items.len()
        )));
    }
    Ok(items[(idx - 1) as usize].clone())
}
